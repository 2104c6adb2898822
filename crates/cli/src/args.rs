use std::path::PathBuf;

use clap::{Parser, Subcommand};
use fastvlm_core::runtime::ExecutionProvider;

#[derive(Parser, Debug)]
#[command(author, version, about = "FastVLM tokenizer and prompt tooling", long_about = None)]
pub struct Args {
    /// Directory holding vocab.json, merges.txt, and the tokenizer config files.
    #[arg(long, value_name = "PATH", help_heading = "Application")]
    pub tokenizer: PathBuf,

    /// Preferred execution provider for host-supplied model backends.
    #[arg(long, value_enum, default_value_t = ExecutionProvider::Cpu, help_heading = "Inference")]
    pub provider: ExecutionProvider,

    /// Suppress informational logging.
    #[arg(long)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Encode text into token ids.
    Encode {
        text: String,

        /// Wrap the text in the chat template before encoding.
        #[arg(long)]
        template: bool,
    },
    /// Decode token ids back into text.
    Decode {
        #[arg(value_name = "ID", required = true)]
        ids: Vec<i64>,
    },
    /// Render the chat prompt for a question and report its token count.
    Prompt { question: String },
}

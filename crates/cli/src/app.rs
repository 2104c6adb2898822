use anyhow::Result;
use fastvlm_core::{conversation::ChatTemplate, tokenizer::BpeTokenizer};
use tracing::info;

use crate::args::{Args, Command};

pub fn run(args: Args) -> Result<()> {
    info!(
        provider = ?args.provider,
        fallback = ?args.provider.fallback_chain(),
        "execution provider selected"
    );
    let tokenizer = BpeTokenizer::from_dir(&args.tokenizer)?;

    match args.command {
        Command::Encode { text, template } => {
            let input = if template {
                ChatTemplate::new().render(&text)
            } else {
                text
            };
            let ids = tokenizer.encode(&input)?;
            info!(tokens = ids.len(), "text encoded");
            let rendered: Vec<String> = ids.iter().map(i64::to_string).collect();
            println!("{}", rendered.join(" "));
        }
        Command::Decode { ids } => {
            println!("{}", tokenizer.decode(&ids));
        }
        Command::Prompt { question } => {
            let prompt = ChatTemplate::new().render(&question);
            let ids = tokenizer.encode(&prompt)?;
            info!(tokens = ids.len(), "prompt rendered");
            print!("{prompt}");
        }
    }
    Ok(())
}

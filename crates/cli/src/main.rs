mod app;
mod args;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use crate::args::Args;

fn main() {
    let args = Args::parse();
    init_logging(args.quiet);
    if let Err(err) = app::run(args) {
        error!(error = %err, "command failed");
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

/// `--quiet` keeps only errors on stderr; otherwise `RUST_LOG` is honored with
/// an `info` default.
fn init_logging(quiet: bool) {
    if quiet {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new("error"))
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }
}

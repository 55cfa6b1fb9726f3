use clap::Parser;
use tracing_subscriber::EnvFilter;

use cloudacme::cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // stdout carries event responses, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            if cli.verbose {
                EnvFilter::new("debug")
            } else {
                EnvFilter::new("info")
            }
        }))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = cli.run().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

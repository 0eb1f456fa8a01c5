//! Compositor CLI — inspect declarations and persisted state.

use clap::Parser;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "compositor",
    version,
    about = "Declarative component composition — dependency-ordered deploys, BLAKE3 fingerprints, persisted snapshots"
)]
struct Cli {
    #[command(subcommand)]
    command: compositor::cli::Commands,
}

fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "compositor=info,warn".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    if let Err(e) = compositor::cli::dispatch(cli.command) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

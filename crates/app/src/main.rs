mod api;
mod cli;
mod config;
mod edge;
mod server;
mod shutdown;
mod telemetry;

use clap::Parser;

fn main() {
    let _ = dotenvy::dotenv();
    let cli = cli::Cli::parse();
    if let Err(err) = cli::dispatch(cli) {
        tracing::error!("{err:#}");
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

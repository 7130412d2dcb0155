use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::{
    config::{EdgeArgs, EdgeConfig, ServerArgs, ServerConfig},
    edge, server, shutdown, telemetry,
};

/// Camera-driven adaptive traffic signal control.
#[derive(Debug, Parser)]
#[command(name = "signalflow", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Capture frames, count vehicles and publish detections for one intersection.
    Edge(EdgeArgs),
    /// Consume detections, drive signal phases and serve the HTTP API.
    Server(ServerArgs),
}

pub fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Edge(args) => {
            let config = EdgeConfig::try_from(args)?;
            let _telemetry = telemetry::init(&config.telemetry);
            edge::run(config, shutdown::install_handler())
        }
        Command::Server(args) => {
            let config = ServerConfig::try_from(args)?;
            let _telemetry = telemetry::init(&config.telemetry);
            server::run(config, shutdown::install_handler())
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn subcommands_parse() {
        let cli = Cli::try_parse_from(["signalflow", "edge", "--intersection-id", "INT-042"]).unwrap();
        assert!(matches!(cli.command, Command::Edge(ref args) if args.intersection_id == "INT-042"));

        let cli = Cli::try_parse_from(["signalflow", "server", "--port", "9000"]).unwrap();
        assert!(matches!(cli.command, Command::Server(ref args) if args.http_port == 9000));
    }
}

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "controlplane", about = "Multi-tenant LLM control plane")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the HTTP server (the default when no subcommand is given).
    Serve {
        /// Override the configured listen port.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Apply the database schema and exit.
    Migrate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_serve_with_port() {
        let cli = Cli::parse_from(["controlplane", "serve", "--port", "9090"]);
        match cli.command {
            Some(Commands::Serve { port }) => assert_eq!(port, Some(9090)),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_defaults_to_no_command() {
        let cli = Cli::parse_from(["controlplane"]);
        assert!(cli.command.is_none());
    }
}

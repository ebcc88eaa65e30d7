//! Onionlink - contact and message exchange over Tor
//!
//! A CLI for running the three peer endpoints as hidden services and for
//! sending contact requests, contact responses and messages to peers.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use commands::{
    CommandExecutor, KeygenCommand, MessageCommand, RequestCommand, RespondCommand, ServeCommand,
};

/// Onionlink - contact and message exchange over Tor
///
/// Peers are reachable only as onion services. A contact request carries a
/// signed public key; responses and messages travel over an encrypted
/// transport. Every outcome is printed as one JSON line.
#[derive(Parser)]
#[command(name = "onionlink")]
#[command(version)]
#[command(about = "Peer contact and message exchange over Tor hidden services")]
#[command(long_about = None)]
struct Cli {
    /// Debug-level logging (overrides RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new key pair
    Keygen(KeygenCommand),

    /// Run the servers and publish them as hidden services
    Serve(ServeCommand),

    /// Send a signed contact request
    Request(RequestCommand),

    /// Answer a contact request
    Respond(RespondCommand),

    /// Send a message
    Message(MessageCommand),
}

/// `--verbose` wins over `RUST_LOG`, which wins over the `info` default.
fn log_filter(verbose: bool) -> EnvFilter {
    if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(log_filter(cli.verbose))
        .init();

    match cli.command {
        Commands::Keygen(cmd) => cmd.execute(),
        Commands::Serve(cmd) => cmd.execute(),
        Commands::Request(cmd) => cmd.execute(),
        Commands::Respond(cmd) => cmd.execute(),
        Commands::Message(cmd) => cmd.execute(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbose_overrides_env() {
        assert_eq!(log_filter(true).to_string(), "debug");
    }
}

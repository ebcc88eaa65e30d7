//! Key generation command.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use onionlink::crypto::Ed25519Agent;

use super::CommandExecutor;

/// Generate a new Ed25519 identity for signing contact requests.
#[derive(Args, Debug)]
pub struct KeygenCommand {
    /// Output path for keys (creates .pub and .key files)
    #[arg(short, long, default_value = "onionlink")]
    pub output: PathBuf,
}

impl CommandExecutor for KeygenCommand {
    fn execute(&self) -> Result<()> {
        let agent = Ed25519Agent::generate();
        agent
            .save_to_files(&self.output)
            .context("Failed to save key pair")?;

        println!("Key pair generated successfully:");
        println!();
        println!("  Public key:  {}.pub", self.output.display());
        println!("  Private key: {}.key", self.output.display());
        if let Some(fingerprint) = agent.fingerprint() {
            println!("  Fingerprint: {}", fingerprint);
        }
        println!();
        println!("The public key travels inside your contact requests.");
        println!("Keep the private key (.key) secret.");
        Ok(())
    }
}

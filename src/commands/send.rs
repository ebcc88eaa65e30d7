//! One-shot client commands: contact request, contact response, message.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;

use onionlink::crypto::Ed25519Agent;
use onionlink::envelope::{
    ContactRequestData, ContactRequestEnvelope, ContactResponseEnvelope, Envelope,
    MessageEnvelope, Nonce,
};
use onionlink::store::JsonNonceHistory;

use super::{dialer, load_config, CommandExecutor, Delivery};

/// Send a signed contact request.
#[derive(Args, Debug)]
pub struct RequestCommand {
    /// Peer's contact-request endpoint (<host>:<port>)
    #[arg(long)]
    pub to: String,

    /// Base path of your key pair (reads <key>.key)
    #[arg(short, long)]
    pub key: PathBuf,

    /// Your onion host, where the peer should send its response
    #[arg(long)]
    pub my_host: String,

    /// Port of your contact-response endpoint (defaults to the configured one)
    #[arg(long)]
    pub my_port: Option<u16>,

    /// Path to config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Connect directly instead of through the Tor SOCKS proxy
    #[arg(long)]
    pub direct: bool,
}

impl CommandExecutor for RequestCommand {
    fn execute(&self) -> Result<()> {
        let config = load_config(self.config.as_deref())?;
        let agent = Ed25519Agent::load_from_files(&self.key)
            .with_context(|| format!("Failed to load key {}", self.key.display()))?;

        let data = ContactRequestData {
            gpg_pub_key: agent.public_key_pem()?,
            address_host: self.my_host.clone(),
            address_port: self.my_port.unwrap_or(config.response_port),
            nonce: Nonce::generate().into_string(),
        };
        let envelope = ContactRequestEnvelope::build(&agent, &data, None)
            .context("Failed to sign contact request")?;
        let history = JsonNonceHistory::open(config.nonce_file()?);

        Delivery {
            target: self.to.clone(),
            envelope: Envelope::ContactRequest(envelope),
            dialer: dialer(&config, self.direct),
            history: Some(Arc::new(history)),
            config,
        }
        .run()
    }
}

/// Answer a contact request.
#[derive(Args, Debug)]
pub struct RespondCommand {
    /// Requester's contact-response endpoint (<host>:<port>)
    #[arg(long)]
    pub to: String,

    /// Nonce from the contact request being answered
    #[arg(long)]
    pub request_nonce: String,

    /// Encrypted response body
    #[arg(long)]
    pub ciphertext: String,

    /// Path to config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Connect directly instead of through the Tor SOCKS proxy
    #[arg(long)]
    pub direct: bool,
}

impl CommandExecutor for RespondCommand {
    fn execute(&self) -> Result<()> {
        let config = load_config(self.config.as_deref())?;
        let envelope = ContactResponseEnvelope {
            ciphertext: self.ciphertext.clone(),
            request_nonce: self.request_nonce.clone(),
            response_nonce: Nonce::generate().into_string(),
        };

        Delivery {
            target: self.to.clone(),
            envelope: Envelope::ContactResponse(envelope),
            dialer: dialer(&config, self.direct),
            history: None,
            config,
        }
        .run()
    }
}

/// Send a message.
#[derive(Args, Debug)]
pub struct MessageCommand {
    /// Peer's message endpoint (<host>:<port>)
    #[arg(long)]
    pub to: String,

    /// Encrypted message body
    #[arg(long)]
    pub ciphertext: String,

    /// Path to config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Connect directly instead of through the Tor SOCKS proxy
    #[arg(long)]
    pub direct: bool,
}

impl CommandExecutor for MessageCommand {
    fn execute(&self) -> Result<()> {
        let config = load_config(self.config.as_deref())?;
        let envelope = MessageEnvelope {
            ciphertext: self.ciphertext.clone(),
            nonce: Nonce::generate().into_string(),
        };

        Delivery {
            target: self.to.clone(),
            envelope: Envelope::Message(envelope),
            dialer: dialer(&config, self.direct),
            history: None,
            config,
        }
        .run()
    }
}

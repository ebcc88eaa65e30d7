//! # Onionlink - contact and message exchange over Tor
//!
//! Onionlink moves small JSON envelopes between peers that are reachable only
//! as Tor hidden services, with no server in between.
//!
//! ## Overview
//!
//! - Every socket carries **one frame each way**: a 7-byte header
//!   (`u32` little-endian length + 3-byte ASCII command) and a JSON payload
//! - A stranger introduces themselves with a **signed contact request**
//! - The answer is a **contact response**, accepted only if it names a
//!   request nonce this node actually issued
//! - After that, peers exchange **messages** over an encrypted transport
//! - Each server endpoint is published as an **ephemeral or persistent**
//!   onion service through the Tor control port
//!
//! ## Security Model
//!
//! - **Silent rejection**: servers never acknowledge a frame that fails to
//!   decode or validate, so probing yields no oracle
//! - **Cheap checks first**: signature verification runs only after the
//!   envelope shape, embedded JSON, nonce and key material are accepted
//! - **Replay defense**: unsolicited contact responses are dropped
//! - **Exact envelopes**: a missing or unknown field rejects the envelope
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use onionlink::envelope::{Envelope, MessageEnvelope, Nonce};
//! use onionlink::transport::{result_queue, ClientRole, Dialer};
//!
//! let (queue, mut events) = result_queue();
//!
//! let envelope = Envelope::Message(MessageEnvelope {
//!     ciphertext: "...".to_string(),
//!     nonce: Nonce::generate().into_string(),
//! });
//! let proxy = "127.0.0.1:9050".parse().unwrap();
//! ClientRole::new("peeraddress.onion", 5002, envelope, Dialer::Socks5 { proxy })
//!     .send(&queue);
//!
//! // Exactly one event per send: a reply or an error.
//! let event = events.recv_blocking().unwrap();
//! println!("{}", event.to_json());
//! ```
//!
//! ## Modules
//!
//! - [`wire`]: Frame header and payload codec, per-connection session
//! - [`envelope`]: Contact request, contact response and message envelopes
//! - [`handshake`]: Envelope validators
//! - [`crypto`]: Key agent interface, Ed25519 agent, encrypted transport
//! - [`store`]: Issued request nonce history
//! - [`transport`]: Client and server roles, SOCKS5 dialer, result queue
//! - [`lifecycle`]: Background thread manager
//! - [`onion`]: Tor control port and hidden-service lifecycle
//! - [`config`]: Node configuration

pub mod config;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod handshake;
pub mod lifecycle;
pub mod onion;
pub mod store;
pub mod transport;
pub mod wire;

// Re-export commonly used types at the crate root
pub use config::{ConfigError, NodeConfig};
pub use crypto::{Ed25519Agent, KeyAgent, SecureStream};
pub use envelope::{
    ContactRequestData, ContactRequestEnvelope, ContactResponseEnvelope, Envelope,
    MessageEnvelope, Nonce,
};
pub use error::PeerError;
pub use handshake::{
    validate_contact_request, validate_contact_response, validate_message, HandshakeError,
};
pub use lifecycle::{ThreadManager, Widget};
pub use onion::{ControlAuth, HiddenService, OnionMode, TorConnector};
pub use store::{JsonNonceHistory, MemoryNonceHistory, NonceHistory};
pub use transport::{
    result_queue, ClientKind, ClientRole, Dialer, ResultEvent, ResultQueue, ResultReceiver,
};
pub use wire::{CommandCode, ProtocolSession};

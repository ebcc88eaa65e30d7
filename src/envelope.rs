//! Application envelopes carried inside frame payloads.
//!
//! Each envelope kind is a closed struct: decoding fails on a missing field
//! and on any field it does not know, before any cryptography runs.

use std::fmt;

use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::crypto::{KeyAgent, SigningError};
use crate::handshake::HandshakeError;
use crate::wire::CommandCode;

/// Hex characters in a generated nonce.
pub const NONCE_HEX_LEN: usize = 40;

/// Random correlation and anti-replay token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Nonce(String);

impl Nonce {
    /// Hash a fresh random integer into a 40-character hex token.
    pub fn generate() -> Self {
        let mut seed = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        let digest = Sha256::digest(u128::from_le_bytes(seed).to_string().as_bytes());
        Nonce(hex::encode(&digest[..NONCE_HEX_LEN / 2]))
    }

    /// Borrow the hex text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Take the hex text.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Nonce> for String {
    fn from(nonce: Nonce) -> Self {
        nonce.0
    }
}

/// The signed half of a contact request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContactRequestData {
    /// Armored public key of the requester.
    pub gpg_pub_key: String,
    /// Onion host the requester listens on for the response.
    pub address_host: String,
    /// Port of that listener.
    pub address_port: u16,
    /// Correlation nonce; the response must echo it back.
    pub nonce: String,
}

/// `{sig, data}`: a detached signature over the `data` JSON string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContactRequestEnvelope {
    /// Detached signature over `data`.
    pub sig: String,
    /// JSON text of a [`ContactRequestData`].
    pub data: String,
}

impl ContactRequestEnvelope {
    /// Serialize `data` and sign it with the local key agent.
    pub fn build(
        agent: &dyn KeyAgent,
        data: &ContactRequestData,
        passphrase: Option<&str>,
    ) -> Result<Self, SigningError> {
        let data = serde_json::to_string(data)
            .map_err(|e| SigningError::Serialization(e.to_string()))?;
        let sig = agent.sign(data.as_bytes(), None, passphrase)?;
        let sig = String::from_utf8(sig).map_err(|_| SigningError::InvalidSignature)?;
        Ok(Self { sig, data })
    }

    /// Decode with exact key-set matching.
    pub fn from_value(value: Value) -> Result<Self, HandshakeError> {
        exact(value, "sig, data")
    }

    /// Nonce embedded in `data`, if it parses.
    pub fn nonce(&self) -> Option<String> {
        let data: Value = serde_json::from_str(&self.data).ok()?;
        data.get("nonce")?.as_str().map(str::to_owned)
    }
}

/// `{ciphertext, request_nonce, response_nonce}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContactResponseEnvelope {
    /// Encrypted response body.
    pub ciphertext: String,
    /// Nonce of the request being answered.
    pub request_nonce: String,
    /// Fresh nonce correlating this response's acknowledgement.
    pub response_nonce: String,
}

impl ContactResponseEnvelope {
    /// Decode with exact key-set matching.
    pub fn from_value(value: Value) -> Result<Self, HandshakeError> {
        exact(value, "ciphertext, request_nonce, response_nonce")
    }
}

/// `{ciphertext, nonce}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MessageEnvelope {
    /// Encrypted message body.
    pub ciphertext: String,
    /// Correlation nonce.
    pub nonce: String,
}

impl MessageEnvelope {
    /// Decode with exact key-set matching.
    pub fn from_value(value: Value) -> Result<Self, HandshakeError> {
        exact(value, "ciphertext, nonce")
    }
}

/// Any envelope a client may send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Envelope {
    /// Contact request.
    ContactRequest(ContactRequestEnvelope),
    /// Contact response.
    ContactResponse(ContactResponseEnvelope),
    /// Message.
    Message(MessageEnvelope),
}

impl Envelope {
    /// Command code this envelope travels under.
    pub fn command(&self) -> CommandCode {
        match self {
            Envelope::ContactRequest(_) => CommandCode::REQUEST,
            Envelope::ContactResponse(_) => CommandCode::RESPONSE,
            Envelope::Message(_) => CommandCode::MESSAGE,
        }
    }

    /// Decode a payload according to the command it arrived under.
    pub fn parse(command: CommandCode, value: Value) -> Result<Self, HandshakeError> {
        match command {
            CommandCode::REQUEST => {
                ContactRequestEnvelope::from_value(value).map(Self::ContactRequest)
            }
            CommandCode::RESPONSE => {
                ContactResponseEnvelope::from_value(value).map(Self::ContactResponse)
            }
            CommandCode::MESSAGE => MessageEnvelope::from_value(value).map(Self::Message),
            other => Err(HandshakeError::Shape(format!("unexpected command {}", other))),
        }
    }

    /// Nonce the acknowledgement for this envelope must carry.
    pub fn correlation_nonce(&self) -> Option<String> {
        match self {
            Envelope::ContactRequest(env) => env.nonce(),
            Envelope::ContactResponse(env) => Some(env.response_nonce.clone()),
            Envelope::Message(env) => Some(env.nonce.clone()),
        }
    }
}

fn exact<T: DeserializeOwned>(value: Value, expected: &str) -> Result<T, HandshakeError> {
    if !value.is_object() {
        return Err(HandshakeError::Shape(format!(
            "expected an object with {{{}}}",
            expected
        )));
    }
    serde_json::from_value(value)
        .map_err(|e| HandshakeError::Shape(format!("expected {{{}}}: {}", expected, e)))
}

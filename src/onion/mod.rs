//! Tor hidden services for the three server endpoints.
//!
//! [`control`] speaks the Tor control protocol; [`service`] drives one
//! endpoint from controller connection through publication to teardown.

pub mod control;
pub mod service;

use std::fmt;
use std::net::SocketAddr;

use thiserror::Error;

pub use control::{ControlAuth, TorConnector, TorControl};
pub use service::{HiddenService, OnionMode, ServiceState};

/// Control-protocol failures.
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Could not reach controller: {0}")]
    Connect(String),

    #[error("Controller authentication failed: {0}")]
    Auth(String),

    #[error("Controller refused command ({code}): {message}")]
    Rejected { code: u16, message: String },

    #[error("Unexpected controller reply: {0}")]
    Protocol(String),

    #[error("Onion key file error: {0}")]
    KeyFile(String),

    #[error("Controller I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Private key of an onion service, as `ADD_ONION` takes and returns it.
#[derive(Clone, PartialEq, Eq)]
pub struct OnionKey {
    /// Key algorithm, e.g. `ED25519-V3`.
    pub key_type: String,
    /// Base64 key blob.
    pub key: String,
}

impl OnionKey {
    /// Parse `"<key_type>:<key>"`.
    pub fn parse(text: &str) -> Result<Self, ControllerError> {
        let (key_type, key) = text
            .trim()
            .split_once(':')
            .ok_or_else(|| ControllerError::KeyFile("expected <type>:<key>".into()))?;
        if key_type.is_empty() || key.is_empty() {
            return Err(ControllerError::KeyFile("empty key type or key".into()));
        }
        Ok(Self {
            key_type: key_type.to_string(),
            key: key.to_string(),
        })
    }
}

impl fmt::Display for OnionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.key_type, self.key)
    }
}

// Never print key material.
impl fmt::Debug for OnionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnionKey")
            .field("key_type", &self.key_type)
            .finish_non_exhaustive()
    }
}

/// A published onion service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnionDescriptor {
    /// Address without the `.onion` suffix.
    pub service_id: String,
    /// Present when the controller generated the key.
    pub private_key: Option<OnionKey>,
}

impl OnionDescriptor {
    pub fn address(&self) -> String {
        format!("{}.onion", self.service_id)
    }
}

/// One `Port=` mapping: onion virtual port to local target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub virtual_port: u16,
    pub target: SocketAddr,
}

impl PortMapping {
    /// Expose `target` under its own port number.
    pub fn same_port(target: SocketAddr) -> Self {
        Self {
            virtual_port: target.port(),
            target,
        }
    }
}

/// An open, possibly unauthenticated, controller connection.
pub trait ControlPort: Send {
    fn authenticate(&mut self) -> Result<(), ControllerError>;

    /// Publish a service under a freshly generated key.
    fn create_ephemeral(
        &mut self,
        ports: &[PortMapping],
    ) -> Result<OnionDescriptor, ControllerError>;

    /// Publish a service under an existing key.
    fn create_from_key(
        &mut self,
        key: &OnionKey,
        ports: &[PortMapping],
    ) -> Result<OnionDescriptor, ControllerError>;

    /// Withdraw a service this connection created.
    fn remove(&mut self, service_id: &str) -> Result<(), ControllerError>;
}

/// Opens controller connections. One per hidden-service run.
pub trait ControlConnector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn ControlPort>, ControllerError>;
}

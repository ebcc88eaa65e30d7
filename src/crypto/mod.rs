//! Cryptographic collaborators.
//!
//! - [`KeyAgent`]: the signing/verification service the handshake consumes
//! - [`Ed25519Agent`]: a local implementation backed by Ed25519 keys
//! - [`SecureStream`]: the encrypted transport wrap used by response and
//!   message connections

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

pub mod secure;
pub mod signing;

pub use secure::SecureStream;
pub use signing::{
    decode_public_key_pem, encode_public_key_pem, fingerprint, Ed25519Agent, SigningError,
};

/// Outcome of checking a detached signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    /// Whether the signature verified.
    pub valid: bool,
    /// Fingerprint of the key that produced the signature, when known.
    pub signer: Option<String>,
    /// Human-readable diagnostic from the verifier.
    pub diagnostic: String,
}

/// Outcome of importing armored key material.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ImportOutcome {
    /// Number of keys imported.
    pub count: usize,
    /// Fingerprints of the imported keys.
    pub fingerprints: Vec<String>,
    /// Human-readable diagnostic from the importer.
    pub diagnostic: String,
}

/// Write key material readable by the owner only.
///
/// On Unix the file is created 0600; an existing file is tightened to 0600
/// before anything is written to it.
pub(crate) fn write_secret_file(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(contents)?;
    file.flush()
}

/// Signing and verification service.
///
/// The handshake never generates or stores keys itself; it goes through this
/// trait so the key backend can be swapped.
pub trait KeyAgent: Send + Sync {
    /// Produce a detached signature over `data`.
    fn sign(
        &self,
        data: &[u8],
        recipient: Option<&str>,
        passphrase: Option<&str>,
    ) -> Result<Vec<u8>, SigningError>;

    /// Check a detached signature over `data` against the keyring.
    fn verify_detached(&self, signature: &[u8], data: &[u8]) -> Verification;

    /// Add armored public key material to the keyring.
    fn import_key(&self, armored: &str) -> ImportOutcome;
}

//! Packet framing for all socket traffic.
//!
//! Every frame is a fixed 7-byte header followed by a JSON payload:
//!
//! ```text
//! <u32 little-endian payload length><3-byte ASCII command><payload bytes>
//! ```
//!
//! The functions here are pure; [`session`] drives them over a socket.

pub mod session;

use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

pub use session::ProtocolSession;

/// Size of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 7;

/// Upper bound on a payload a reader will allocate for.
pub const MAX_PAYLOAD_LEN: usize = 10 * 1024 * 1024;

/// Errors produced while packing or unpacking frames.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum WireError {
    /// Command code was not exactly three ASCII bytes.
    #[error("Command must be exactly 3 ASCII bytes, got {0:?}")]
    InvalidCommand(String),

    /// Fewer than [`HEADER_LEN`] bytes were supplied.
    #[error("Header needs {HEADER_LEN} bytes, got {0}")]
    ShortHeader(usize),

    /// Payload does not fit the u32 length field or the reader limit.
    #[error("Payload length {0} exceeds limit")]
    Oversized(usize),

    /// Payload was not valid UTF-8 JSON.
    #[error("Malformed payload: {0}")]
    Payload(String),
}

/// A 3-byte ASCII tag identifying the logical message kind.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandCode([u8; 3]);

impl CommandCode {
    /// Contact request.
    pub const REQUEST: CommandCode = CommandCode(*b"REQ");
    /// Contact response.
    pub const RESPONSE: CommandCode = CommandCode(*b"RES");
    /// Encrypted message.
    pub const MESSAGE: CommandCode = CommandCode(*b"MSG");
    /// Acknowledgement of a received frame.
    pub const ACK: CommandCode = CommandCode(*b"ACK");

    /// Parse a command from its textual form.
    pub fn new(code: &str) -> Result<Self, WireError> {
        Self::from_bytes(code.as_bytes())
    }

    /// Parse a command from raw header bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() != 3 || !bytes.is_ascii() {
            return Err(WireError::InvalidCommand(
                String::from_utf8_lossy(bytes).into_owned(),
            ));
        }
        Ok(Self([bytes[0], bytes[1], bytes[2]]))
    }

    /// Raw bytes as they appear in the header.
    pub fn as_bytes(&self) -> &[u8; 3] {
        &self.0
    }

    /// Command as text.
    pub fn as_str(&self) -> &str {
        // Construction guarantees ASCII.
        std::str::from_utf8(&self.0).unwrap_or("???")
    }
}

impl fmt::Debug for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommandCode({})", self.as_str())
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PartialEq<&str> for CommandCode {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

/// Serialize a header record.
///
/// `command` is copied as given, never padded; anything other than three
/// ASCII bytes is rejected.
pub fn pack_header(length: u32, command: &str) -> Result<[u8; HEADER_LEN], WireError> {
    let command = CommandCode::new(command)?;
    Ok(pack_header_code(length, command))
}

fn pack_header_code(length: u32, command: CommandCode) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[..4].copy_from_slice(&length.to_le_bytes());
    header[4..].copy_from_slice(command.as_bytes());
    header
}

/// Parse a header record. Only the first [`HEADER_LEN`] bytes are examined.
pub fn unpack_header(bytes: &[u8]) -> Result<(u32, CommandCode), WireError> {
    if bytes.len() < HEADER_LEN {
        return Err(WireError::ShortHeader(bytes.len()));
    }
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&bytes[..4]);
    let command = CommandCode::from_bytes(&bytes[4..HEADER_LEN])?;
    Ok((u32::from_le_bytes(len_bytes), command))
}

/// Build the header describing `payload`.
pub fn build_header(payload: &[u8], command: &str) -> Result<[u8; HEADER_LEN], WireError> {
    let length = u32::try_from(payload.len()).map_err(|_| WireError::Oversized(payload.len()))?;
    pack_header(length, command)
}

/// Encode a value as UTF-8 JSON.
pub fn encode_payload<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, WireError> {
    serde_json::to_vec(value).map_err(|e| WireError::Payload(e.to_string()))
}

/// Decode UTF-8 JSON into a value.
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    serde_json::from_slice(bytes).map_err(|e| WireError::Payload(e.to_string()))
}

/// Header and payload for `value`, concatenated.
pub fn build_frame<T: Serialize + ?Sized>(value: &T, command: &str) -> Result<Vec<u8>, WireError> {
    build_frame_code(value, CommandCode::new(command)?)
}

pub(crate) fn build_frame_code<T: Serialize + ?Sized>(
    value: &T,
    command: CommandCode,
) -> Result<Vec<u8>, WireError> {
    let payload = encode_payload(value)?;
    let length = u32::try_from(payload.len()).map_err(|_| WireError::Oversized(payload.len()))?;
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&pack_header_code(length, command));
    frame.extend_from_slice(&payload);
    Ok(frame)
}

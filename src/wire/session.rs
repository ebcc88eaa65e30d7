//! One request/acknowledge exchange over a connected socket.
//!
//! A session never outlives its connection: clients write one request and
//! read one reply, servers read one frame and write one acknowledgement.

use std::io::{ErrorKind, Read, Write};

use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::PeerError;
use crate::wire::{
    build_frame_code, decode_payload, unpack_header, CommandCode, HEADER_LEN, MAX_PAYLOAD_LEN,
};

/// Frame reader/writer over a single stream.
pub struct ProtocolSession<S> {
    stream: S,
    peer: String,
}

impl<S: Read + Write> ProtocolSession<S> {
    /// Wrap an already-connected stream.
    pub fn new(stream: S) -> Self {
        Self::with_peer(stream, "unknown")
    }

    /// Wrap a stream, remembering the peer label for logs.
    pub fn with_peer(stream: S, peer: impl Into<String>) -> Self {
        Self {
            stream,
            peer: peer.into(),
        }
    }

    /// Peer label given at construction.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Write one frame carrying `value` under `command`.
    pub fn send_request<T: Serialize + ?Sized>(
        &mut self,
        value: &T,
        command: CommandCode,
    ) -> Result<(), PeerError> {
        let frame = build_frame_code(value, command)?;
        self.stream.write_all(&frame)?;
        self.stream.flush()?;
        debug!(peer = %self.peer, %command, bytes = frame.len(), "frame sent");
        Ok(())
    }

    /// Read exactly one frame and return its command and decoded payload.
    pub fn receive_command_frame(&mut self) -> Result<(CommandCode, Value), PeerError> {
        let mut header = [0u8; HEADER_LEN];
        self.read_full(&mut header)?;
        let (length, command) = unpack_header(&header)?;

        let length = length as usize;
        if length > MAX_PAYLOAD_LEN {
            return Err(PeerError::Format(format!(
                "Payload too large: {} bytes",
                length
            )));
        }

        let mut payload = vec![0u8; length];
        self.read_full(&mut payload)?;
        let value = decode_payload(&payload)?;
        debug!(peer = %self.peer, %command, bytes = length, "frame received");
        Ok((command, value))
    }

    /// Read exactly one frame and return its decoded payload.
    pub fn receive_frame(&mut self) -> Result<Value, PeerError> {
        self.receive_command_frame().map(|(_, value)| value)
    }

    /// Write an acknowledgement frame. Objects get `desc: "ACK"` added.
    pub fn send_ack(&mut self, value: Value) -> Result<(), PeerError> {
        let value = match value {
            Value::Object(mut map) => {
                map.insert("desc".to_string(), json!("ACK"));
                Value::Object(map)
            }
            other => other,
        };
        self.send_request(&value, CommandCode::ACK)
    }

    /// Server side: read one frame, or `None` if anything about it was bad.
    ///
    /// The failure is only logged; the caller drops the connection without
    /// replying.
    pub fn process_incoming(&mut self) -> Option<Value> {
        match self.receive_frame() {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(peer = %self.peer, error = %e, "dropping unreadable frame");
                None
            }
        }
    }

    /// Client side: block for the single reply to a request already sent.
    pub fn handle_response(&mut self) -> Result<Value, PeerError> {
        self.receive_frame()
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Recover the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }

    fn read_full(&mut self, buf: &mut [u8]) -> Result<(), PeerError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(PeerError::ConnectionClosed {
                        expected: buf.len(),
                        received: filled,
                    })
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{build_frame, pack_header};
    use std::io::Cursor;

    /// In-memory duplex: reads from `input`, records writes in `output`.
    struct MockStream {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
        chunk: usize,
    }

    impl MockStream {
        fn new(input: Vec<u8>) -> Self {
            Self {
                input: Cursor::new(input),
                output: Vec::new(),
                chunk: usize::MAX,
            }
        }

        fn trickle(input: Vec<u8>) -> Self {
            Self {
                chunk: 1,
                ..Self::new(input)
            }
        }
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = buf.len().min(self.chunk);
            self.input.read(&mut buf[..n])
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_send_request_writes_frame() {
        let mut session = ProtocolSession::new(MockStream::new(Vec::new()));
        session
            .send_request(&json!(["Hello World"]), CommandCode::new("HEL").unwrap())
            .unwrap();
        let expected = build_frame(&json!(["Hello World"]), "HEL").unwrap();
        assert_eq!(session.into_inner().output, expected);
    }

    #[test]
    fn test_receive_frame_decodes_payload() {
        let frame = build_frame(&json!({"nonce": "abc"}), "REQ").unwrap();
        let mut session = ProtocolSession::new(MockStream::new(frame));
        let (command, value) = session.receive_command_frame().unwrap();
        assert_eq!(command, CommandCode::REQUEST);
        assert_eq!(value, json!({"nonce": "abc"}));
    }

    #[test]
    fn test_receive_frame_survives_short_reads() {
        let frame = build_frame(&json!({"ciphertext": "x".repeat(300)}), "MSG").unwrap();
        let mut session = ProtocolSession::new(MockStream::trickle(frame));
        let value = session.receive_frame().unwrap();
        assert_eq!(value["ciphertext"].as_str().unwrap().len(), 300);
    }

    #[test]
    fn test_receive_truncated_payload_is_closed() {
        let mut frame = build_frame(&json!(["Hello World"]), "HEL").unwrap();
        frame.truncate(frame.len() - 4);
        let mut session = ProtocolSession::new(MockStream::new(frame));
        let err = session.receive_frame().unwrap_err();
        assert!(matches!(
            err,
            PeerError::ConnectionClosed {
                expected: 15,
                received: 11
            }
        ));
    }

    #[test]
    fn test_receive_truncated_header_is_closed() {
        let mut session = ProtocolSession::new(MockStream::new(vec![1, 0, 0]));
        let err = session.receive_frame().unwrap_err();
        assert!(matches!(
            err,
            PeerError::ConnectionClosed {
                expected: HEADER_LEN,
                received: 3
            }
        ));
    }

    #[test]
    fn test_receive_rejects_oversized_length() {
        let header = pack_header(u32::MAX, "REQ").unwrap().to_vec();
        let mut session = ProtocolSession::new(MockStream::new(header));
        assert!(matches!(session.receive_frame(), Err(PeerError::Format(_))));
    }

    #[test]
    fn test_receive_bad_json_is_payload_error() {
        let payload = b"{not json";
        let mut bytes = pack_header(payload.len() as u32, "REQ").unwrap().to_vec();
        bytes.extend_from_slice(payload);
        let mut session = ProtocolSession::new(MockStream::new(bytes));
        assert!(matches!(session.receive_frame(), Err(PeerError::Payload(_))));
    }

    #[test]
    fn test_send_ack_tags_object() {
        let mut session = ProtocolSession::new(MockStream::new(Vec::new()));
        session.send_ack(json!({"nonce": "n1"})).unwrap();
        let written = session.into_inner().output;
        let (_, command) = unpack_header(&written).unwrap();
        assert_eq!(command, CommandCode::ACK);
        let value: Value = decode_payload(&written[HEADER_LEN..]).unwrap();
        assert_eq!(value, json!({"nonce": "n1", "desc": "ACK"}));
    }

    #[test]
    fn test_process_incoming_returns_none_on_garbage() {
        let mut session = ProtocolSession::new(MockStream::new(b"garbage!!".to_vec()));
        assert!(session.process_incoming().is_none());
    }

    #[test]
    fn test_process_incoming_returns_value() {
        let frame = build_frame(&json!({"a": 1}), "MSG").unwrap();
        let mut session = ProtocolSession::new(MockStream::new(frame));
        assert_eq!(session.process_incoming(), Some(json!({"a": 1})));
    }

    #[test]
    fn test_handle_response_reads_one_frame() {
        let mut bytes = build_frame(&json!({"nonce": "first"}), "ACK").unwrap();
        bytes.extend(build_frame(&json!({"nonce": "second"}), "ACK").unwrap());
        let mut session = ProtocolSession::new(MockStream::new(bytes));
        assert_eq!(session.handle_response().unwrap()["nonce"], "first");
    }
}

//! Outbound half of every exchange.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::crypto::SecureStream;
use crate::envelope::Envelope;
use crate::error::PeerError;
use crate::lifecycle::Widget;
use crate::store::NonceHistory;
use crate::transport::{Dialer, ResultEvent, ResultQueue};
use crate::wire::{CommandCode, ProtocolSession};

/// Which exchange a client performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientKind {
    ContactRequest,
    ContactResponse,
    Message,
}

impl ClientKind {
    /// Command code the request travels under.
    pub fn command(self) -> CommandCode {
        match self {
            ClientKind::ContactRequest => CommandCode::REQUEST,
            ClientKind::ContactResponse => CommandCode::RESPONSE,
            ClientKind::Message => CommandCode::MESSAGE,
        }
    }

    /// Contact requests go out before any trust exists, so they are the one
    /// exchange that is not wrapped in transport encryption.
    pub fn wraps_transport(self) -> bool {
        !matches!(self, ClientKind::ContactRequest)
    }

    pub fn result_tag(self) -> &'static str {
        match self {
            ClientKind::ContactRequest => "Contact_Request_Client_Res",
            ClientKind::ContactResponse => "Contact_Response_Client_Res",
            ClientKind::Message => "Message_Client_Res",
        }
    }

    pub fn error_tag(self) -> &'static str {
        match self {
            ClientKind::ContactRequest => "Contact_Request_Client_Err",
            ClientKind::ContactResponse => "Contact_Response_Client_Err",
            ClientKind::Message => "Message_Client_Err",
        }
    }

    fn of(envelope: &Envelope) -> Self {
        match envelope {
            Envelope::ContactRequest(_) => ClientKind::ContactRequest,
            Envelope::ContactResponse(_) => ClientKind::ContactResponse,
            Envelope::Message(_) => ClientKind::Message,
        }
    }
}

/// Sends one envelope to one peer and reports exactly one outcome.
pub struct ClientRole {
    kind: ClientKind,
    host: String,
    port: u16,
    envelope: Envelope,
    nonce: String,
    dialer: Dialer,
    correlation: Map<String, Value>,
    history: Option<Arc<dyn NonceHistory>>,
    reply_timeout: Option<Duration>,
    socket: Mutex<Option<TcpStream>>,
    stopped: AtomicBool,
}

impl ClientRole {
    /// A client delivering `envelope` to `host:port`.
    ///
    /// The reply is expected to echo the envelope's correlation nonce: the
    /// signed request nonce, the response nonce or the message nonce.
    pub fn new(host: impl Into<String>, port: u16, envelope: Envelope, dialer: Dialer) -> Self {
        Self {
            kind: ClientKind::of(&envelope),
            host: host.into(),
            port,
            nonce: envelope.correlation_nonce().unwrap_or_default(),
            envelope,
            dialer,
            correlation: Map::new(),
            history: None,
            reply_timeout: None,
            socket: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    /// Extra fields copied into the result event, e.g. a contact id.
    pub fn with_correlation(mut self, correlation: Map<String, Value>) -> Self {
        self.correlation = correlation;
        self
    }

    /// Where a contact request records its nonce before sending.
    pub fn with_history(mut self, history: Arc<dyn NonceHistory>) -> Self {
        self.history = Some(history);
        self
    }

    /// Give up on a reply after `timeout`. Unset means wait forever.
    pub fn with_reply_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub fn kind(&self) -> ClientKind {
        self.kind
    }

    /// Nonce the reply must echo.
    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    /// Run the exchange and post its single outcome to `queue`.
    pub fn send(&self, queue: &ResultQueue) {
        let event = match self.exchange() {
            Ok(reply) => {
                let nonce_valid =
                    reply.get("nonce").and_then(Value::as_str) == Some(self.nonce.as_str());
                if nonce_valid {
                    info!(kind = ?self.kind, host = %self.host, "peer acknowledged");
                } else {
                    warn!(kind = ?self.kind, host = %self.host, "reply nonce does not match");
                }
                ResultEvent::ClientReply {
                    kind: self.kind,
                    result: reply,
                    nonce: self.nonce.clone(),
                    nonce_valid,
                    host: self.host.clone(),
                    port: self.port,
                    correlation: self.correlation.clone(),
                }
            }
            Err(e) => {
                warn!(
                    kind = ?self.kind,
                    host = %self.host,
                    port = self.port,
                    error = %e,
                    "send failed"
                );
                ResultEvent::ClientError {
                    kind: self.kind,
                    error: e.to_string(),
                    host: self.host.clone(),
                    port: self.port,
                    correlation: self.correlation.clone(),
                }
            }
        };
        queue.push(event);
    }

    /// Shut the socket down, failing any blocked read or write.
    pub fn close(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let socket = self
            .socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(socket) = socket {
            let _ = socket.shutdown(Shutdown::Both);
        }
    }

    fn exchange(&self) -> Result<Value, PeerError> {
        if self.kind == ClientKind::ContactRequest {
            if let Some(history) = &self.history {
                history.record_request_nonce(&self.nonce)?;
            }
        }

        let mut stream = self.dialer.open(&self.host, self.port)?;
        self.attach(&stream)?;
        stream.set_read_timeout(self.reply_timeout)?;
        self.dialer.negotiate(&mut stream, &self.host, self.port)?;

        let peer = format!("{}:{}", self.host, self.port);
        debug!(%peer, kind = ?self.kind, "connected");
        if self.kind.wraps_transport() {
            let secure = SecureStream::client(stream)?;
            self.round_trip(ProtocolSession::with_peer(secure, peer))
        } else {
            self.round_trip(ProtocolSession::with_peer(stream, peer))
        }
    }

    fn round_trip<S: Read + Write>(
        &self,
        mut session: ProtocolSession<S>,
    ) -> Result<Value, PeerError> {
        session.send_request(&self.envelope, self.kind.command())?;
        session.handle_response()
    }

    /// Keep a handle for `close`. Refuses if `close` already ran.
    fn attach(&self, stream: &TcpStream) -> Result<(), PeerError> {
        let mut slot = self.socket.lock().unwrap_or_else(PoisonError::into_inner);
        if self.stopped.load(Ordering::SeqCst) {
            let _ = stream.shutdown(Shutdown::Both);
            return Err(PeerError::Connection("client stopped".into()));
        }
        *slot = Some(stream.try_clone()?);
        Ok(())
    }
}

/// A client paired with the queue it reports to.
pub struct ClientWidget {
    role: ClientRole,
    queue: ResultQueue,
}

impl ClientWidget {
    pub fn new(role: ClientRole, queue: ResultQueue) -> Self {
        Self { role, queue }
    }

    pub fn role(&self) -> &ClientRole {
        &self.role
    }
}

impl Widget for ClientWidget {
    fn run(&self) {
        self.role.send(&self.queue);
    }

    fn stop(&self) {
        self.role.close();
    }
}

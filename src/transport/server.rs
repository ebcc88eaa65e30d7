//! Inbound half of every exchange.
//!
//! One thread per accepted connection. A connection carries exactly one
//! frame; anything that fails to decode or validate is dropped without an
//! acknowledgement and without an event, so a probing peer learns nothing.

use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::crypto::{KeyAgent, SecureStream};
use crate::error::PeerError;
use crate::handshake::{
    validate_contact_request, validate_contact_response, validate_message, HandshakeError,
};
use crate::lifecycle::Widget;
use crate::store::NonceHistory;
use crate::transport::{ResultEvent, ResultQueue};
use crate::wire::ProtocolSession;

/// What a server hands back for a frame it accepts.
#[derive(Debug, Clone, PartialEq)]
pub struct Accepted {
    /// Nonce echoed in the acknowledgement.
    pub ack_nonce: String,
    /// Event posted once the acknowledgement is sent.
    pub event: ResultEvent,
}

/// Validity predicate and transport policy of one server endpoint.
pub trait ServerRole: Send + Sync + 'static {
    /// Endpoint name, also used for hidden-service events.
    fn name(&self) -> &'static str;

    /// Whether accepted sockets are wrapped in transport encryption.
    fn wraps_transport(&self) -> bool;

    /// Decide whether a decoded frame is acceptable.
    fn validate(&self, value: Value) -> Result<Accepted, HandshakeError>;
}

/// Accepts signed contact requests from strangers.
pub struct ContactRequestServer {
    agent: Arc<dyn KeyAgent>,
}

impl ContactRequestServer {
    pub fn new(agent: Arc<dyn KeyAgent>) -> Self {
        Self { agent }
    }
}

impl ServerRole for ContactRequestServer {
    fn name(&self) -> &'static str {
        "Contact_Request_Server"
    }

    fn wraps_transport(&self) -> bool {
        false
    }

    fn validate(&self, value: Value) -> Result<Accepted, HandshakeError> {
        let request = validate_contact_request(value, self.agent.as_ref())?;
        Ok(Accepted {
            ack_nonce: request.nonce,
            event: ResultEvent::ContactRequestReceived {
                envelope: request.envelope,
                data: request.data,
            },
        })
    }
}

/// Accepts responses to contact requests this node sent.
pub struct ContactResponseServer {
    history: Arc<dyn NonceHistory>,
}

impl ContactResponseServer {
    pub fn new(history: Arc<dyn NonceHistory>) -> Self {
        Self { history }
    }
}

impl ServerRole for ContactResponseServer {
    fn name(&self) -> &'static str {
        "Contact_Response_Server"
    }

    fn wraps_transport(&self) -> bool {
        true
    }

    fn validate(&self, value: Value) -> Result<Accepted, HandshakeError> {
        let envelope = validate_contact_response(value, self.history.as_ref())?;
        Ok(Accepted {
            ack_nonce: envelope.response_nonce.clone(),
            event: ResultEvent::ContactResponseReceived(envelope),
        })
    }
}

/// Accepts messages. Content is checked further up.
pub struct MessageServer;

impl ServerRole for MessageServer {
    fn name(&self) -> &'static str {
        "Message_Server"
    }

    fn wraps_transport(&self) -> bool {
        true
    }

    fn validate(&self, value: Value) -> Result<Accepted, HandshakeError> {
        let envelope = validate_message(value)?;
        Ok(Accepted {
            ack_nonce: envelope.nonce.clone(),
            event: ResultEvent::MessageReceived(envelope),
        })
    }
}

/// Handle one connection: read, validate, acknowledge.
///
/// Returns `Ok(None)` when the frame was dropped, `Ok(Some(event))` once the
/// acknowledgement went out. An error means the acknowledgement could not be
/// written; no event should be posted then.
pub fn serve_connection<R, S>(
    role: &R,
    session: &mut ProtocolSession<S>,
) -> Result<Option<ResultEvent>, PeerError>
where
    R: ServerRole + ?Sized,
    S: Read + Write,
{
    let Some(value) = session.process_incoming() else {
        return Ok(None);
    };

    let accepted = match role.validate(value) {
        Ok(accepted) => accepted,
        Err(e) => {
            debug!(role = role.name(), peer = %session.peer(), error = %e, "frame rejected");
            return Ok(None);
        }
    };

    session.send_ack(json!({ "nonce": accepted.ack_nonce }))?;
    Ok(Some(accepted.event))
}

fn handle_stream(role: &dyn ServerRole, stream: TcpStream, queue: &ResultQueue) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".into());

    let outcome = if role.wraps_transport() {
        match SecureStream::server(stream) {
            Ok(secure) => {
                serve_connection(role, &mut ProtocolSession::with_peer(secure, peer.clone()))
            }
            Err(e) => {
                debug!(role = role.name(), %peer, error = %e, "transport handshake failed");
                return;
            }
        }
    } else {
        serve_connection(role, &mut ProtocolSession::with_peer(stream, peer.clone()))
    };

    match outcome {
        Ok(Some(event)) => {
            info!(role = role.name(), %peer, desc = event.desc(), "accepted");
            queue.push(event);
        }
        Ok(None) => {}
        Err(e) => debug!(role = role.name(), %peer, error = %e, "acknowledgement failed"),
    }
}

/// TCP accept loop that hands each connection to its own thread.
///
/// The socket is closed as soon as the accept loop ends, or by
/// [`Listener::shutdown`] if the loop never started. On Unix the standard
/// library binds with `SO_REUSEADDR`, so a restarted listener can reclaim
/// its port immediately.
pub struct Listener {
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    shutdown: AtomicBool,
}

impl Listener {
    pub fn bind(addr: impl ToSocketAddrs) -> Result<Self, PeerError> {
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener: Mutex::new(Some(listener)),
            local_addr,
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept until [`Listener::shutdown`] is called, then close the socket.
    ///
    /// Returns at once if the listener was already shut down or served.
    pub fn serve_forever(&self, role: Arc<dyn ServerRole>, queue: &ResultQueue) {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(listener) = listener else {
            debug!(role = role.name(), addr = %self.local_addr, "listener already closed");
            return;
        };
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }

        info!(role = role.name(), addr = %self.local_addr, "listening");
        for conn in listener.incoming() {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            let stream = match conn {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(role = role.name(), error = %e, "accept failed");
                    continue;
                }
            };

            let role = Arc::clone(&role);
            let queue = queue.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-conn", role.name()))
                .spawn(move || handle_stream(role.as_ref(), stream, &queue));
            if let Err(e) = spawned {
                warn!(error = %e, "could not spawn connection thread");
            }
        }
        drop(listener);
        info!(role = role.name(), addr = %self.local_addr, "listener stopped");
    }

    /// Stop accepting. Safe to call more than once.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        let idle = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if idle.is_some() {
            // Never served; dropping it closes the socket.
            return;
        }
        // accept() has no timeout; a throwaway connection wakes it up.
        let _ = TcpStream::connect(self.wake_addr());
    }

    fn wake_addr(&self) -> SocketAddr {
        let ip = match self.local_addr.ip() {
            IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            ip => ip,
        };
        SocketAddr::new(ip, self.local_addr.port())
    }
}

/// A listener, the role it serves and the queue it reports to.
pub struct ServerWidget {
    listener: Listener,
    role: Arc<dyn ServerRole>,
    queue: ResultQueue,
}

impl ServerWidget {
    /// Bind `addr` for `role`. The socket is released once the widget stops.
    pub fn bind(
        addr: impl ToSocketAddrs,
        role: Arc<dyn ServerRole>,
        queue: ResultQueue,
    ) -> Result<Self, PeerError> {
        Ok(Self {
            listener: Listener::bind(addr)?,
            role,
            queue,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn role(&self) -> &dyn ServerRole {
        self.role.as_ref()
    }
}

impl Widget for ServerWidget {
    fn run(&self) {
        self.listener.serve_forever(Arc::clone(&self.role), &self.queue);
    }

    fn stop(&self) {
        self.listener.shutdown();
    }
}

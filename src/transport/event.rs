//! Result events and the multi-producer queue that carries them.

use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::runtime::{Builder, Runtime};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::envelope::{
    ContactRequestData, ContactRequestEnvelope, ContactResponseEnvelope, MessageEnvelope,
};
use crate::transport::ClientKind;

/// Tag for every hidden-service controller failure.
pub const TOR_PROXY_ERROR: &str = "Tor_Proxy_Error";

/// One outcome handed to the rest of the application.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultEvent {
    /// A client exchange completed and the peer replied.
    ClientReply {
        kind: ClientKind,
        /// The reply frame as received.
        result: Value,
        /// Nonce the client expected back.
        nonce: String,
        /// Whether the reply echoed `nonce`.
        nonce_valid: bool,
        host: String,
        port: u16,
        correlation: Map<String, Value>,
    },

    /// A client exchange failed at the socket level.
    ClientError {
        kind: ClientKind,
        error: String,
        host: String,
        port: u16,
        correlation: Map<String, Value>,
    },

    /// A signed contact request was accepted.
    ContactRequestReceived {
        envelope: ContactRequestEnvelope,
        data: ContactRequestData,
    },

    /// A contact response to one of our requests was accepted.
    ContactResponseReceived(ContactResponseEnvelope),

    /// A message was accepted.
    MessageReceived(MessageEnvelope),

    /// A hidden service is reachable at `address`.
    ServicePublished { name: String, address: String },

    /// A hidden-service step failed.
    ControllerError { name: String, error: String },
}

impl ResultEvent {
    /// The `desc` tag downstream consumers route on.
    pub fn desc(&self) -> &str {
        match self {
            ResultEvent::ClientReply { kind, .. } => kind.result_tag(),
            ResultEvent::ClientError { kind, .. } => kind.error_tag(),
            ResultEvent::ContactRequestReceived { .. } => "Contact_Request_Received",
            ResultEvent::ContactResponseReceived(_) => "Contact_Response_Received",
            ResultEvent::MessageReceived(_) => "Message_Received",
            ResultEvent::ServicePublished { name, .. } => name,
            ResultEvent::ControllerError { .. } => TOR_PROXY_ERROR,
        }
    }

    /// The event as a flat `{desc, ...fields}` object.
    pub fn to_json(&self) -> Value {
        let mut map = match self {
            ResultEvent::ClientReply {
                result,
                nonce,
                nonce_valid,
                host,
                port,
                correlation,
                ..
            } => {
                let mut map = correlation.clone();
                map.insert("result".into(), result.clone());
                map.insert("nonce".into(), json!(nonce));
                map.insert("nonce_valid".into(), json!(nonce_valid));
                map.insert("host".into(), json!(host));
                map.insert("port".into(), json!(port));
                map
            }
            ResultEvent::ClientError {
                error,
                host,
                port,
                correlation,
                ..
            } => {
                let mut map = correlation.clone();
                map.insert("error".into(), json!(error));
                map.insert("host".into(), json!(host));
                map.insert("port".into(), json!(port));
                map
            }
            ResultEvent::ContactRequestReceived { envelope, data } => {
                let mut map = object(envelope);
                map.insert("nonce".into(), json!(data.nonce));
                map.insert("data_dict".into(), Value::Object(object(data)));
                map
            }
            ResultEvent::ContactResponseReceived(envelope) => object(envelope),
            ResultEvent::MessageReceived(envelope) => object(envelope),
            ResultEvent::ServicePublished { address, .. } => {
                let mut map = Map::new();
                map.insert("address".into(), json!(address));
                map
            }
            ResultEvent::ControllerError { name, error } => {
                let mut map = Map::new();
                map.insert("name".into(), json!(name));
                map.insert("error".into(), json!(error));
                map
            }
        };
        map.insert("desc".into(), json!(self.desc()));
        Value::Object(map)
    }
}

fn object<T: serde::Serialize>(value: &T) -> Map<String, Value> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

/// Producer half of the result queue. Cheap to clone; never blocks.
#[derive(Debug, Clone)]
pub struct ResultQueue {
    tx: mpsc::UnboundedSender<ResultEvent>,
}

impl ResultQueue {
    /// Enqueue an event. Dropped with a log line if nobody is listening.
    pub fn push(&self, event: ResultEvent) {
        let desc = event.desc().to_string();
        if self.tx.send(event).is_err() {
            debug!(%desc, "result queue closed, event dropped");
        }
    }
}

/// Consumer half of the result queue.
#[derive(Debug)]
pub struct ResultReceiver {
    rx: mpsc::UnboundedReceiver<ResultEvent>,
    /// Timer driver for `recv_timeout`, built on first use.
    timer: Option<Runtime>,
}

impl ResultReceiver {
    /// Wait for the next event from a plain thread.
    ///
    /// Returns `None` once every producer is gone. Must not be called from
    /// inside an async runtime; use [`ResultReceiver::recv`] there.
    pub fn recv_blocking(&mut self) -> Option<ResultEvent> {
        self.rx.blocking_recv()
    }

    /// Wait for the next event from async code.
    pub async fn recv(&mut self) -> Option<ResultEvent> {
        self.rx.recv().await
    }

    /// Take an event if one is ready.
    pub fn try_recv(&mut self) -> Option<ResultEvent> {
        self.rx.try_recv().ok()
    }

    /// Wait up to `timeout` for the next event from a plain thread.
    ///
    /// Sleeps until an event arrives or the deadline passes. Same runtime
    /// restriction as [`ResultReceiver::recv_blocking`].
    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<ResultEvent> {
        if self.timer.is_none() {
            match Builder::new_current_thread().enable_time().build() {
                Ok(runtime) => self.timer = Some(runtime),
                Err(e) => {
                    warn!(error = %e, "timer runtime unavailable");
                    return self.try_recv();
                }
            }
        }
        let Self { rx, timer } = self;
        let timer = timer.as_ref()?;
        timer.block_on(async { tokio::time::timeout(timeout, rx.recv()).await.ok().flatten() })
    }
}

/// Create a connected producer/consumer pair.
pub fn result_queue() -> (ResultQueue, ResultReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ResultQueue { tx }, ResultReceiver { rx, timer: None })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_preserves_order() {
        let (queue, mut rx) = result_queue();
        for i in 0..3 {
            queue.push(ResultEvent::ServicePublished {
                name: format!("svc{}", i),
                address: "x.onion".into(),
            });
        }
        for i in 0..3 {
            assert_eq!(rx.try_recv().unwrap().desc(), format!("svc{}", i));
        }
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn test_push_after_receiver_dropped_is_silent() {
        let (queue, rx) = result_queue();
        drop(rx);
        queue.push(ResultEvent::ControllerError {
            name: "n".into(),
            error: "e".into(),
        });
    }

    #[test]
    fn test_recv_timeout_expires() {
        let (_queue, mut rx) = result_queue();
        assert!(rx.recv_timeout(Duration::from_millis(20)).is_none());
    }

    #[test]
    fn test_recv_timeout_wakes_on_push() {
        let (queue, mut rx) = result_queue();
        let producer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            queue.push(ResultEvent::ServicePublished {
                name: "late".into(),
                address: "x.onion".into(),
            });
        });

        let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(event.desc(), "late");
        producer.join().unwrap();

        // Every producer is gone now
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_none());
    }

    #[test]
    fn test_client_reply_json() {
        let mut correlation = Map::new();
        correlation.insert("contact".into(), json!("alice"));
        let event = ResultEvent::ClientReply {
            kind: ClientKind::Message,
            result: json!({"nonce": "n", "desc": "ACK"}),
            nonce: "n".into(),
            nonce_valid: true,
            host: "abc.onion".into(),
            port: 5002,
            correlation,
        };
        let value = event.to_json();
        assert_eq!(value["desc"], "Message_Client_Res");
        assert_eq!(value["contact"], "alice");
        assert_eq!(value["nonce_valid"], true);
        assert_eq!(value["port"], 5002);
    }

    #[test]
    fn test_published_desc_is_name() {
        let event = ResultEvent::ServicePublished {
            name: "Contact_Request_Server".into(),
            address: "abc.onion".into(),
        };
        assert_eq!(
            event.to_json(),
            json!({"desc": "Contact_Request_Server", "address": "abc.onion"})
        );
    }

    #[test]
    fn test_controller_error_json() {
        let event = ResultEvent::ControllerError {
            name: "Message_Server".into(),
            error: "refused".into(),
        };
        assert_eq!(
            event.to_json(),
            json!({"desc": "Tor_Proxy_Error", "name": "Message_Server", "error": "refused"})
        );
    }

    #[test]
    fn test_message_received_json() {
        let event = ResultEvent::MessageReceived(MessageEnvelope {
            ciphertext: "c".into(),
            nonce: "n".into(),
        });
        assert_eq!(
            event.to_json(),
            json!({"ciphertext": "c", "nonce": "n", "desc": "Message_Received"})
        );
    }
}

//! Validators binding transport exchanges to cryptographic trust.
//!
//! Checks run cheapest first. Signature verification is attempted only after
//! the envelope shape, the embedded JSON, the nonce and the key material have
//! all been accepted.

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::crypto::KeyAgent;
use crate::envelope::{
    ContactRequestData, ContactRequestEnvelope, ContactResponseEnvelope, MessageEnvelope,
};
use crate::store::NonceHistory;

/// Reasons an incoming envelope is refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// Envelope did not decode to exactly its expected key set.
    #[error("Envelope shape mismatch: {0}")]
    Shape(String),

    /// A required field was present but empty.
    #[error("Missing field: {0}")]
    Missing(&'static str),

    /// Embedded `data` JSON did not parse or had the wrong keys.
    #[error("Malformed data: {0}")]
    MalformedData(String),

    /// Embedded public key was not importable.
    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    /// Detached signature did not verify.
    #[error("Signature verification failed: {0}")]
    Authenticity(String),

    /// Response names a request nonce this node never issued.
    #[error("Unsolicited response for nonce {0}")]
    Replay(String),

    /// The nonce history could not be read.
    #[error("Nonce history unavailable: {0}")]
    History(String),
}

/// A contact request whose signature checked out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedRequest {
    /// The envelope as received.
    pub envelope: ContactRequestEnvelope,
    /// Correlation nonce from the signed data.
    pub nonce: String,
    /// The signed data, decoded.
    pub data: ContactRequestData,
}

/// Validate a decoded contact-request payload.
pub fn validate_contact_request(
    value: Value,
    agent: &dyn KeyAgent,
) -> Result<ValidatedRequest, HandshakeError> {
    let envelope = ContactRequestEnvelope::from_value(value)?;
    if envelope.sig.is_empty() {
        return Err(HandshakeError::Missing("sig"));
    }
    if envelope.data.is_empty() {
        return Err(HandshakeError::Missing("data"));
    }

    let data_value: Value = serde_json::from_str(&envelope.data)
        .map_err(|e| HandshakeError::MalformedData(e.to_string()))?;

    let nonce = data_value
        .get("nonce")
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
        .map(str::to_owned)
        .ok_or(HandshakeError::Missing("nonce"))?;

    let data: ContactRequestData = serde_json::from_value(data_value)
        .map_err(|e| HandshakeError::MalformedData(e.to_string()))?;

    let import = agent.import_key(&data.gpg_pub_key);
    if import.count == 0 {
        return Err(HandshakeError::InvalidKey(import.diagnostic));
    }

    let verification = agent.verify_detached(envelope.sig.as_bytes(), envelope.data.as_bytes());
    if !verification.valid {
        return Err(HandshakeError::Authenticity(verification.diagnostic));
    }
    // The data must be signed by the key it carries, not any trusted key.
    if let Some(signer) = &verification.signer {
        if !import.fingerprints.is_empty() && !import.fingerprints.contains(signer) {
            return Err(HandshakeError::Authenticity(format!(
                "signed by {} but carries a different key",
                signer
            )));
        }
    }

    debug!(nonce = %nonce, host = %data.address_host, "contact request verified");
    Ok(ValidatedRequest {
        envelope,
        nonce,
        data,
    })
}

/// Validate a decoded contact-response payload against issued request nonces.
pub fn validate_contact_response(
    value: Value,
    history: &dyn NonceHistory,
) -> Result<ContactResponseEnvelope, HandshakeError> {
    let envelope = ContactResponseEnvelope::from_value(value)?;

    let issued = history
        .fetch_all_request_nonces()
        .map_err(|e| HandshakeError::History(e.to_string()))?;
    if !issued.contains(&envelope.request_nonce) {
        return Err(HandshakeError::Replay(envelope.request_nonce));
    }

    Ok(envelope)
}

/// Validate a decoded message payload. Decryption happens further up.
pub fn validate_message(value: Value) -> Result<MessageEnvelope, HandshakeError> {
    MessageEnvelope::from_value(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Ed25519Agent;
    use crate::envelope::Nonce;
    use crate::store::MemoryNonceHistory;
    use serde_json::json;

    fn request_data(agent: &Ed25519Agent) -> ContactRequestData {
        ContactRequestData {
            gpg_pub_key: agent.public_key_pem().unwrap(),
            address_host: "peerabc.onion".into(),
            address_port: 5001,
            nonce: Nonce::generate().into_string(),
        }
    }

    fn signed_request(agent: &Ed25519Agent) -> (Value, ContactRequestData) {
        let data = request_data(agent);
        let envelope = ContactRequestEnvelope::build(agent, &data, None).unwrap();
        (serde_json::to_value(envelope).unwrap(), data)
    }

    #[test]
    fn test_valid_request_accepted() {
        let sender = Ed25519Agent::generate();
        let receiver = Ed25519Agent::verifier();
        let (value, data) = signed_request(&sender);

        let validated = validate_contact_request(value, &receiver).unwrap();
        assert_eq!(validated.nonce, data.nonce);
        assert_eq!(validated.data, data);
    }

    #[test]
    fn test_request_extra_key_rejected() {
        let sender = Ed25519Agent::generate();
        let (mut value, _) = signed_request(&sender);
        value["extra"] = json!("x");

        let result = validate_contact_request(value, &Ed25519Agent::verifier());
        assert!(matches!(result, Err(HandshakeError::Shape(_))));
    }

    #[test]
    fn test_request_data_extra_key_rejected() {
        let sender = Ed25519Agent::generate();
        let mut data = serde_json::to_value(request_data(&sender)).unwrap();
        data["relay"] = json!("elsewhere.onion");
        let data = data.to_string();
        // Correctly signed, so only the key set can be at fault
        let sig = String::from_utf8(sender.sign(data.as_bytes(), None, None).unwrap()).unwrap();
        let value = json!({"sig": sig.clone(), "data": data.clone()});

        let receiver = Ed25519Agent::verifier();
        let result = validate_contact_request(value, &receiver);
        assert!(matches!(result, Err(HandshakeError::MalformedData(_))));

        // Rejected before the carried key reached the keyring
        assert!(!receiver.verify_detached(sig.as_bytes(), data.as_bytes()).valid);
    }

    #[test]
    fn test_request_empty_sig_rejected() {
        let value = json!({"sig": "", "data": "{}"});
        let result = validate_contact_request(value, &Ed25519Agent::verifier());
        assert_eq!(result, Err(HandshakeError::Missing("sig")));
    }

    #[test]
    fn test_request_bad_data_json_rejected() {
        let value = json!({"sig": "abc", "data": "{not json"});
        let result = validate_contact_request(value, &Ed25519Agent::verifier());
        assert!(matches!(result, Err(HandshakeError::MalformedData(_))));
    }

    #[test]
    fn test_request_missing_nonce_rejected() {
        let data = json!({"gpg_pub_key": "k", "address_host": "h", "address_port": 1}).to_string();
        let value = json!({"sig": "abc", "data": data});
        let result = validate_contact_request(value, &Ed25519Agent::verifier());
        assert_eq!(result, Err(HandshakeError::Missing("nonce")));
    }

    #[test]
    fn test_request_bad_key_rejected_before_signature() {
        let data = json!({
            "gpg_pub_key": "garbage",
            "address_host": "h",
            "address_port": 1,
            "nonce": "n"
        })
        .to_string();
        let value = json!({"sig": "not-even-base64", "data": data});
        let result = validate_contact_request(value, &Ed25519Agent::verifier());
        assert!(matches!(result, Err(HandshakeError::InvalidKey(_))));
    }

    #[test]
    fn test_request_tampered_data_rejected() {
        let sender = Ed25519Agent::generate();
        let (mut value, mut data) = signed_request(&sender);
        data.address_port = 6666;
        value["data"] = json!(serde_json::to_string(&data).unwrap());

        let result = validate_contact_request(value, &Ed25519Agent::verifier());
        assert!(matches!(result, Err(HandshakeError::Authenticity(_))));
    }

    #[test]
    fn test_request_signed_by_other_trusted_key_rejected() {
        let attacker = Ed25519Agent::generate();
        let victim = Ed25519Agent::generate();
        let receiver = Ed25519Agent::verifier();
        receiver.import_key(&attacker.public_key_pem().unwrap());

        // Claims the victim's key but is signed by the attacker.
        let data = request_data(&victim);
        let envelope = ContactRequestEnvelope::build(&attacker, &data, None).unwrap();
        let value = serde_json::to_value(envelope).unwrap();

        let result = validate_contact_request(value, &receiver);
        assert!(matches!(result, Err(HandshakeError::Authenticity(_))));
    }

    #[test]
    fn test_response_requires_issued_nonce() {
        let history = MemoryNonceHistory::new();
        let value = json!({"ciphertext": "c", "request_nonce": "r1", "response_nonce": "s1"});

        let result = validate_contact_response(value.clone(), &history);
        assert_eq!(result, Err(HandshakeError::Replay("r1".into())));

        history.record_request_nonce("r1").unwrap();
        let envelope = validate_contact_response(value, &history).unwrap();
        assert_eq!(envelope.response_nonce, "s1");
    }

    #[test]
    fn test_response_shape_checked_before_history() {
        let history = MemoryNonceHistory::new();
        history.record_request_nonce("r1").unwrap();
        let value = json!({"ciphertext": "c", "request_nonce": "r1"});
        assert!(matches!(
            validate_contact_response(value, &history),
            Err(HandshakeError::Shape(_))
        ));
    }

    #[test]
    fn test_message_shape() {
        assert!(validate_message(json!({"ciphertext": "c", "nonce": "n"})).is_ok());
        assert!(validate_message(json!({"ciphertext": "c", "nonce": "n", "sig": "s"})).is_err());
    }
}

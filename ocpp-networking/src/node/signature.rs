//! Signature policy gate
//!
//! Verification failures replace the response with `SignatureError` and keep
//! the message away from application handlers. Signing failures are only
//! reported; the response still goes out.

use std::collections::HashSet;

use async_trait::async_trait;
use serde_json::Value;

use crate::ocpp::types::Signature;
use crate::ocpp::RequestId;

/// Action-independent view of a message passed through the policy
#[derive(Debug, Clone, Copy)]
pub struct SignedMessage<'a> {
    pub action: &'a str,
    pub request_id: &'a RequestId,
    /// The JSON payload as it travels on the wire
    pub json: &'a Value,
    pub signatures: &'a [Signature],
}

#[async_trait]
pub trait SignaturePolicy: Send + Sync {
    /// `Err(reason)` rejects an inbound request
    async fn verify_request_message(&self, message: SignedMessage<'_>) -> Result<(), String>;

    /// `Err(reason)` rejects an inbound response
    async fn verify_response_message(&self, message: SignedMessage<'_>) -> Result<(), String>;

    /// Signatures to attach to an outbound response
    async fn sign_response_message(
        &self,
        message: SignedMessage<'_>,
    ) -> Result<Vec<Signature>, String>;

    /// Signatures to attach to an outbound request
    async fn sign_request_message(
        &self,
        _message: SignedMessage<'_>,
    ) -> Result<Vec<Signature>, String> {
        Ok(Vec::new())
    }
}

/// Verifies nothing, signs nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAllSignatures;

#[async_trait]
impl SignaturePolicy for AcceptAllSignatures {
    async fn verify_request_message(&self, _message: SignedMessage<'_>) -> Result<(), String> {
        Ok(())
    }

    async fn verify_response_message(&self, _message: SignedMessage<'_>) -> Result<(), String> {
        Ok(())
    }

    async fn sign_response_message(
        &self,
        _message: SignedMessage<'_>,
    ) -> Result<Vec<Signature>, String> {
        Ok(Vec::new())
    }
}

/// Rejects unsigned messages of the configured actions
#[derive(Debug, Clone, Default)]
pub struct RequireSignatures {
    actions: HashSet<String>,
}

impl RequireSignatures {
    pub fn new<I, S>(actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            actions: actions.into_iter().map(Into::into).collect(),
        }
    }

    fn check(&self, message: &SignedMessage<'_>) -> Result<(), String> {
        if self.actions.contains(message.action) && message.signatures.is_empty() {
            return Err(format!(
                "{} message {} carries no signature",
                message.action, message.request_id
            ));
        }
        if let Some(bad) = message.signatures.iter().find(|s| s.value.is_empty()) {
            return Err(format!("Empty signature value for key {}", bad.key_id));
        }
        Ok(())
    }
}

#[async_trait]
impl SignaturePolicy for RequireSignatures {
    async fn verify_request_message(&self, message: SignedMessage<'_>) -> Result<(), String> {
        self.check(&message)
    }

    async fn verify_response_message(&self, message: SignedMessage<'_>) -> Result<(), String> {
        self.check(&message)
    }

    async fn sign_response_message(
        &self,
        _message: SignedMessage<'_>,
    ) -> Result<Vec<Signature>, String> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message<'a>(
        action: &'a str,
        id: &'a RequestId,
        json: &'a Value,
        signatures: &'a [Signature],
    ) -> SignedMessage<'a> {
        SignedMessage {
            action,
            request_id: id,
            json,
            signatures,
        }
    }

    #[tokio::test]
    async fn test_accept_all() {
        let id = RequestId::from("r1");
        let json = json!({});
        let policy = AcceptAllSignatures;

        assert!(policy
            .verify_request_message(message("Reset", &id, &json, &[]))
            .await
            .is_ok());
        assert!(policy
            .sign_response_message(message("Reset", &id, &json, &[]))
            .await
            .unwrap()
            .is_empty());
        assert!(policy
            .sign_request_message(message("Reset", &id, &json, &[]))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_require_signatures() {
        let id = RequestId::from("r1");
        let json = json!({});
        let policy = RequireSignatures::new(["Reset"]);

        let reason = policy
            .verify_request_message(message("Reset", &id, &json, &[]))
            .await
            .unwrap_err();
        assert!(reason.contains("no signature"));

        let signed = [Signature::new("k1", "c2ln")];
        assert!(policy
            .verify_request_message(message("Reset", &id, &json, &signed))
            .await
            .is_ok());

        // Other actions pass unsigned
        assert!(policy
            .verify_response_message(message("Heartbeat", &id, &json, &[]))
            .await
            .is_ok());

        let empty = [Signature::new("k1", "")];
        assert!(policy
            .verify_response_message(message("Heartbeat", &id, &json, &empty))
            .await
            .is_err());
    }
}

//! Provider Adapter contract: per-provider signature verification, parsing,
//! normalization, and reference extraction.
//!
//! One trait, one shipped concrete implementation, `thiserror` error,
//! `#[async_trait]`. `Error` is a concrete enum rather than an associated
//! type: the registry below must hold many different concrete adapters
//! behind one `dyn` pointer, which an associated type would make
//! non-object-safe.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{trace, warn};

use crate::model::{MetadataMap, NormalizedEvent, NormalizedEventType};

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("malformed payload: {0}")]
    Parse(String),

    #[error("could not normalize payload: {0}")]
    Normalize(String),

    #[error("provider-side verification request failed: {0}")]
    VerificationUnreachable(String),
}

/// Provider-side status snapshot returned by `verify_with_provider`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderStatusSnapshot {
    pub provider_ref: String,
    pub normalized_event: NormalizedEventType,
    pub amount: i64,
}

/// The extracted references a delivery carries.
#[derive(Debug, Clone)]
pub struct ExtractedReferences {
    pub provider_ref: String,
    pub application_ref: Option<String>,
}

/// A parsed, not-yet-normalized payload. Adapters are free to parse into
/// their own provider-specific structure internally; `ParsedPayload` is the
/// minimal shape the pipeline needs in order to stay adapter-agnostic.
#[derive(Debug, Clone)]
pub struct ParsedPayload {
    pub raw_event_type: String,
    pub provider_event_id: Option<String>,
    pub transaction_reference: String,
    pub body: serde_json::Value,
}

#[async_trait]
pub trait ProviderAdapter: std::fmt::Debug + Send + Sync {
    /// Must use a constant-time comparison on the computed tag. Tries
    /// `secrets` in order; any single match succeeds. Never panics: an
    /// internal failure is equivalent to returning `false`.
    async fn verify_signature(
        &self,
        raw_body: &[u8],
        headers: &HashMap<String, String>,
        secrets: &[String],
    ) -> bool;

    /// Fails, rather than guesses, on malformed input.
    fn parse_payload(&self, raw_body: &[u8]) -> Result<ParsedPayload, ProviderError>;

    /// Maps provider vocabulary onto the closed `NormalizedEventType` set.
    /// Provider-specific fields not covered by the normalized schema go into
    /// `provider_metadata`; nothing is dropped.
    fn normalize(&self, parsed: &ParsedPayload) -> Result<NormalizedEvent, ProviderError>;

    /// Deterministic, unique per logical provider event. Default
    /// construction: `eventType + ":" + providerEventId`, falling back to
    /// the transaction reference when the provider has no event id of its
    /// own.
    fn extract_idempotency_key(&self, parsed: &ParsedPayload) -> String {
        let id = parsed
            .provider_event_id
            .as_deref()
            .unwrap_or(&parsed.transaction_reference);
        format!("{}:{}", parsed.raw_event_type, id)
    }

    fn extract_references(&self, parsed: &ParsedPayload) -> ExtractedReferences;

    /// `None` if the provider offers no such API, or if the call failed —
    /// callers must treat both the same way; this must never throw on a
    /// network error.
    async fn verify_with_provider(
        &self,
        _provider_ref: &str,
        _timeout: std::time::Duration,
    ) -> Option<ProviderStatusSnapshot> {
        None
    }
}

/// Holds the set of provider adapters the host has registered, keyed by
/// provider name.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown provider: {0}")]
pub struct UnknownProviderError(pub String);

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    pub fn register(&mut self, provider: impl Into<String>, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(provider.into(), adapter);
    }

    pub fn get(&self, provider: &str) -> Result<Arc<dyn ProviderAdapter>, UnknownProviderError> {
        self.adapters
            .get(provider)
            .cloned()
            .ok_or_else(|| UnknownProviderError(provider.to_string()))
    }
}

/// A minimal, deterministic test/mock provider: HMAC-SHA256 over the raw
/// body, a small flat JSON event schema, no real `verify_with_provider`.
#[derive(Debug, Default)]
pub struct MockProviderAdapter;

#[derive(Debug, Deserialize)]
struct MockEventBody {
    event_type: String,
    provider_event_id: String,
    provider_ref: String,
    amount: i64,
    currency: String,
    #[serde(default)]
    application_ref: Option<String>,
    #[serde(default)]
    customer_email: Option<String>,
    #[serde(default)]
    dispute_outcome: Option<String>,
}

type HmacSha256 = Hmac<Sha256>;

impl MockProviderAdapter {
    pub fn new() -> Self {
        Self
    }

    fn event_type_from_str(s: &str) -> Result<NormalizedEventType, ProviderError> {
        match s {
            "payment.successful" => Ok(NormalizedEventType::PaymentSuccessful),
            "payment.failed" => Ok(NormalizedEventType::PaymentFailed),
            "payment.abandoned" => Ok(NormalizedEventType::PaymentAbandoned),
            "refund.successful" => Ok(NormalizedEventType::RefundSuccessful),
            "refund.failed" => Ok(NormalizedEventType::RefundFailed),
            "refund.pending" => Ok(NormalizedEventType::RefundPending),
            "charge.disputed" => Ok(NormalizedEventType::ChargeDisputed),
            "dispute.resolved" => Ok(NormalizedEventType::DisputeResolved),
            other => Err(ProviderError::Normalize(format!(
                "unrecognized event type {other:?}"
            ))),
        }
    }
}

#[async_trait]
impl ProviderAdapter for MockProviderAdapter {
    async fn verify_signature(
        &self,
        raw_body: &[u8],
        headers: &HashMap<String, String>,
        secrets: &[String],
    ) -> bool {
        let Some(signature_hex) = headers.get("x-mock-signature") else {
            trace!("mock adapter: missing signature header");
            return false;
        };
        let Ok(signature_bytes) = hex::decode(signature_hex) else {
            trace!("mock adapter: signature header is not valid hex");
            return false;
        };

        for secret in secrets {
            let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
                continue;
            };
            mac.update(raw_body);
            if mac.verify_slice(&signature_bytes).is_ok() {
                return true;
            }
        }
        false
    }

    fn parse_payload(&self, raw_body: &[u8]) -> Result<ParsedPayload, ProviderError> {
        if raw_body.is_empty() {
            return Err(ProviderError::Parse("empty body".to_string()));
        }
        let body: serde_json::Value = serde_json::from_slice(raw_body)
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        let typed: MockEventBody =
            serde_json::from_value(body.clone()).map_err(|e| ProviderError::Parse(e.to_string()))?;

        Ok(ParsedPayload {
            raw_event_type: typed.event_type,
            provider_event_id: Some(typed.provider_event_id),
            transaction_reference: typed.provider_ref,
            body,
        })
    }

    fn normalize(&self, parsed: &ParsedPayload) -> Result<NormalizedEvent, ProviderError> {
        let typed: MockEventBody = serde_json::from_value(parsed.body.clone())
            .map_err(|e| ProviderError::Normalize(e.to_string()))?;
        let event_type = Self::event_type_from_str(&typed.event_type)?;

        let mut provider_metadata: MetadataMap = HashMap::new();
        if let Some(outcome) = &typed.dispute_outcome {
            provider_metadata.insert(
                "disputeOutcome".to_string(),
                serde_json::Value::String(outcome.clone()),
            );
        }

        Ok(NormalizedEvent {
            event_type,
            provider_ref: typed.provider_ref,
            amount: typed.amount,
            currency: typed.currency,
            provider_event_id: typed.provider_event_id,
            application_ref: typed.application_ref,
            provider_timestamp: None,
            customer_email: typed.customer_email,
            provider_metadata,
        })
    }

    fn extract_references(&self, parsed: &ParsedPayload) -> ExtractedReferences {
        let application_ref = parsed
            .body
            .get("application_ref")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        ExtractedReferences {
            provider_ref: parsed.transaction_reference.clone(),
            application_ref,
        }
    }

    async fn verify_with_provider(
        &self,
        _provider_ref: &str,
        _timeout: std::time::Duration,
    ) -> Option<ProviderStatusSnapshot> {
        warn!("mock adapter has no real provider-side verification endpoint");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    fn headers_with_signature(sig: &str) -> HashMap<String, String> {
        let mut h = HashMap::new();
        h.insert("x-mock-signature".to_string(), sig.to_string());
        h
    }

    #[tokio::test]
    async fn verify_signature_accepts_any_matching_secret_in_order() {
        let adapter = MockProviderAdapter::new();
        let body = br#"{"event_type":"payment.successful"}"#;
        let sig = sign("second-secret", body);
        let headers = headers_with_signature(&sig);
        let secrets = vec!["first-secret".to_string(), "second-secret".to_string()];
        assert!(adapter.verify_signature(body, &headers, &secrets).await);
    }

    #[tokio::test]
    async fn verify_signature_rejects_wrong_secret() {
        let adapter = MockProviderAdapter::new();
        let body = b"{}";
        let sig = sign("right", body);
        let headers = headers_with_signature(&sig);
        let secrets = vec!["wrong".to_string()];
        assert!(!adapter.verify_signature(body, &headers, &secrets).await);
    }

    #[tokio::test]
    async fn verify_signature_rejects_missing_header() {
        let adapter = MockProviderAdapter::new();
        assert!(
            !adapter
                .verify_signature(b"{}", &HashMap::new(), &["s".to_string()])
                .await
        );
    }

    #[test]
    fn parse_payload_rejects_empty_body() {
        let adapter = MockProviderAdapter::new();
        assert!(matches!(
            adapter.parse_payload(b""),
            Err(ProviderError::Parse(_))
        ));
    }

    #[test]
    fn parse_and_normalize_round_trip() {
        let adapter = MockProviderAdapter::new();
        let body = br#"{
            "event_type": "payment.successful",
            "provider_event_id": "evt_1",
            "provider_ref": "pr-1",
            "amount": 10000,
            "currency": "NGN"
        }"#;
        let parsed = adapter.parse_payload(body).unwrap();
        assert_eq!(parsed.raw_event_type, "payment.successful");
        let normalized = adapter.normalize(&parsed).unwrap();
        assert_eq!(normalized.event_type, NormalizedEventType::PaymentSuccessful);
        assert_eq!(normalized.amount, 10000);

        let key = adapter.extract_idempotency_key(&parsed);
        assert_eq!(key, "payment.successful:evt_1");
    }

    #[test]
    fn normalize_rejects_unknown_event_type() {
        let adapter = MockProviderAdapter::new();
        let body = br#"{
            "event_type": "something.else",
            "provider_event_id": "evt_1",
            "provider_ref": "pr-1",
            "amount": 1,
            "currency": "NGN"
        }"#;
        let parsed = adapter.parse_payload(body).unwrap();
        assert!(matches!(
            adapter.normalize(&parsed),
            Err(ProviderError::Normalize(_))
        ));
    }

    #[test]
    fn registry_rejects_unknown_provider() {
        let registry = ProviderRegistry::new();
        assert!(registry.get("nope").is_err());
    }
}

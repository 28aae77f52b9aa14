//! The shared data model: the five persisted entities plus the closed enums
//! that tie them together.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Smallest-unit integer amount (e.g. cents, kobo).
pub type Amount = i64;

/// ISO-4217 currency code, held as the three-letter string.
pub type Currency = String;

/// Opaque host/provider metadata bag.
pub type MetadataMap = HashMap<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Processing,
    Successful,
    Failed,
    Abandoned,
    PartiallyRefunded,
    Refunded,
    Disputed,
    ResolvedWon,
    ResolvedLost,
}

impl TransactionStatus {
    /// Terminal states: no transition ever leaves them.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Failed
                | Self::Abandoned
                | Self::Refunded
                | Self::ResolvedWon
                | Self::ResolvedLost
        )
    }

    /// A transaction is settled once it will never again change status on
    /// its own: any terminal state, plus `partially_refunded`.
    pub fn is_settled(self) -> bool {
        self.is_terminal() || matches!(self, Self::PartiallyRefunded)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Webhook,
    ApiVerification,
    Reconciliation,
    LateMatch,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMethod {
    WebhookOnly,
    ApiVerified,
    Reconciled,
}

impl VerificationMethod {
    /// Confidence ordering used by Stage 6 to decide whether a webhook-only
    /// verification may downgrade an already-stronger one. Higher is
    /// stronger; Stage 6 only ever raises, never lowers, this value.
    fn rank(self) -> u8 {
        match self {
            Self::WebhookOnly => 0,
            Self::Reconciled => 1,
            Self::ApiVerified => 2,
        }
    }

    /// True if `self` should replace `current`.
    pub fn upgrades(self, current: VerificationMethod) -> bool {
        self.rank() > current.rank()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationResult {
    Confirmed,
    Advanced,
    Divergence,
    Error,
}

/// The closed set of normalized, provider-independent event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizedEventType {
    PaymentSuccessful,
    PaymentFailed,
    PaymentAbandoned,
    RefundSuccessful,
    RefundFailed,
    RefundPending,
    ChargeDisputed,
    DisputeResolved,
}

/// The seven claim fates a single inbound delivery is classified into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimFate {
    Processed,
    Duplicate,
    SignatureFailed,
    NormalizationFailed,
    Unmatched,
    TransitionRejected,
    ParseError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboxStatus {
    Pending,
    Processed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchStatus {
    Success,
    Failed,
    Skipped,
}

/// Normalized event schema, stable across providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub event_type: NormalizedEventType,
    pub provider_ref: String,
    pub amount: Amount,
    pub currency: Currency,
    pub provider_event_id: String,
    pub application_ref: Option<String>,
    pub provider_timestamp: Option<DateTime<Utc>>,
    pub customer_email: Option<String>,
    pub provider_metadata: MetadataMap,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub application_ref: String,
    pub provider_ref: Option<String>,
    pub provider: String,
    pub status: TransactionStatus,
    pub amount: Amount,
    pub currency: Currency,
    pub verification_method: VerificationMethod,
    #[serde(default)]
    pub metadata: MetadataMap,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub provider_created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookLog {
    pub id: Uuid,
    pub provider: String,
    pub provider_event_id: String,
    pub transaction_id: Option<Uuid>,
    pub event_type: String,
    pub normalized_event: Option<NormalizedEventType>,
    pub raw_payload: Option<Vec<u8>>,
    pub headers: HashMap<String, String>,
    pub signature_valid: bool,
    pub processing_status: ClaimFate,
    pub received_at: DateTime<Utc>,
    pub processing_duration_ms: i64,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLog {
    pub id: Uuid,
    pub transaction_id: Uuid,
    pub from_status: Option<TransactionStatus>,
    pub to_status: Option<TransactionStatus>,
    pub trigger_type: TriggerType,
    pub webhook_log_id: Option<Uuid>,
    pub reconciliation_result: Option<ReconciliationResult>,
    pub metadata: MetadataMap,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchLog {
    pub id: Uuid,
    pub transaction_id: Uuid,
    pub event_type: NormalizedEventType,
    pub handler_name: String,
    pub status: DispatchStatus,
    pub is_replay: bool,
    pub error_message: Option<String>,
    pub dispatched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub transaction_id: Uuid,
    pub event_type: NormalizedEventType,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Input DTO for `StorageAdapter::create_transaction`.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub application_ref: String,
    pub provider: String,
    pub amount: Amount,
    pub currency: Currency,
    pub metadata: MetadataMap,
}

/// Input DTO for `StorageAdapter::create_webhook_log`.
#[derive(Debug, Clone)]
pub struct NewWebhookLog {
    pub provider: String,
    pub provider_event_id: String,
    pub transaction_id: Option<Uuid>,
    pub event_type: String,
    pub normalized_event: Option<NormalizedEventType>,
    pub raw_payload: Option<Vec<u8>>,
    pub headers: HashMap<String, String>,
    pub signature_valid: bool,
    pub processing_status: ClaimFate,
    pub processing_duration_ms: i64,
    pub error_message: Option<String>,
}

/// Input DTO for `StorageAdapter::create_dispatch_log`.
#[derive(Debug, Clone)]
pub struct NewDispatchLog {
    pub transaction_id: Uuid,
    pub event_type: NormalizedEventType,
    pub handler_name: String,
    pub status: DispatchStatus,
    pub is_replay: bool,
    pub error_message: Option<String>,
}

/// Input DTO for an atomic state transition.
#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub from_status: Option<TransactionStatus>,
    pub to_status: Option<TransactionStatus>,
    pub trigger_type: TriggerType,
    pub webhook_log_id: Option<Uuid>,
    pub reconciliation_result: Option<ReconciliationResult>,
    pub metadata: MetadataMap,
}

#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    pub provider: Option<String>,
    pub status: Option<TransactionStatus>,
}

#[derive(Debug, Clone, Default)]
pub struct WebhookLogFilter {
    pub provider: Option<String>,
    pub processing_status: Option<ClaimFate>,
}

#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}

/// Key used to look up a `Transaction` by one of its three identifying
/// fields.
#[derive(Debug, Clone)]
pub enum TransactionLookup {
    Id(Uuid),
    ApplicationRef(String),
    ProviderRef { provider: String, provider_ref: String },
}

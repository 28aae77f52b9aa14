//! The ingest pipeline: the seven stages chained into a single `process`
//! call per inbound delivery, fate classification, and the
//! redaction/dedup/state-engine machinery those stages share with
//! `service::TransactionService` (which re-enters Stage 6 for late-match).
//!
//! `Pipeline<S, T>` is constructed once per process and reused against every
//! inbound delivery, generic over `StorageAdapter` and `Time` so a host can
//! swap either without touching the stage logic.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, instrument, trace, warn};
use uuid::Uuid;

use crate::dispatcher::{DispatchEvent, EventDispatcher};
use crate::model::{
    ClaimFate, MetadataMap, NewAuditEntry, NewWebhookLog, NormalizedEvent, NormalizedEventType,
    ReconciliationResult, TransactionLookup, TransactionStatus, TriggerType, VerificationMethod,
};
use crate::provider::{ParsedPayload, ProviderAdapter, ProviderRegistry, UnknownProviderError};
use crate::state_machine::{GuardContext, StateMachine};
use crate::storage::{DuplicateOr, NewOutboxEvent, StorageAdapter};
use crate::time::Time;

/// Outcome of one call to `process`. Always produced, never an `Err`, for
/// any delivery whose provider was recognized — every delivery gets a fate,
/// never a silent drop.
#[derive(Debug, Clone)]
pub struct ProcessingResult {
    pub webhook_log_id: Uuid,
    pub fate: ClaimFate,
    pub transaction_id: Option<Uuid>,
    pub normalized_event_type: Option<NormalizedEventType>,
}

/// The only `Err` path out of `process`: either the provider is unknown (no
/// WebhookLog is written) or the storage layer itself is unreachable while
/// persisting the claim — the one case the host must be told about, so the
/// provider can retry delivery.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError<E: std::error::Error + Send + Sync + 'static> {
    #[error(transparent)]
    UnknownProvider(#[from] UnknownProviderError),

    #[error("storage unreachable while persisting claim: {0}")]
    Storage(E),
}

/// Caller-registered, optional, non-failing lifecycle hooks. A hook that
/// panics is not caught — callers are expected to keep their
/// hooks infallible; what *is* guaranteed is that a hook can never alter the
/// fate or truth, since hooks only ever observe state already committed.
#[async_trait::async_trait]
pub trait PipelineHooks: std::fmt::Debug + Send + Sync {
    async fn on_webhook_fate(
        &self,
        _provider: &str,
        _fate: ClaimFate,
        _event_type: Option<NormalizedEventType>,
        _latency: Duration,
        _transaction_id: Option<Uuid>,
    ) {
    }

    async fn on_transition(
        &self,
        _provider: &str,
        _transaction_id: Uuid,
        _from: TransactionStatus,
        _to: TransactionStatus,
        _trigger: TriggerType,
    ) {
    }

    async fn on_dispatch_result(
        &self,
        _event_type: NormalizedEventType,
        _handler_name: &str,
        _status: crate::model::DispatchStatus,
        _is_replay: bool,
        _error: Option<&str>,
    ) {
    }
}

#[derive(Debug, Default)]
pub struct NoopHooks;

#[async_trait::async_trait]
impl PipelineHooks for NoopHooks {}

/// Resolved per-provider signing secrets, tried in order — lets a provider
/// rotate its signing secret without a window where in-flight deliveries
/// signed with the old secret fail verification.
pub type SecretsByProvider = HashMap<String, Vec<String>>;

pub struct Pipeline<S: StorageAdapter, T: Time> {
    storage: Arc<S>,
    providers: ProviderRegistry,
    state_machine: StateMachine,
    dispatcher: Arc<EventDispatcher>,
    hooks: Arc<dyn PipelineHooks>,
    time: T,
    config: crate::config::EngineConfig,
    secrets: SecretsByProvider,
}

impl<S: StorageAdapter, T: Time> std::fmt::Debug for Pipeline<S, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline").finish_non_exhaustive()
    }
}

impl<S: StorageAdapter, T: Time> Pipeline<S, T> {
    pub fn new(
        storage: Arc<S>,
        providers: ProviderRegistry,
        dispatcher: Arc<EventDispatcher>,
        hooks: Arc<dyn PipelineHooks>,
        time: T,
        config: crate::config::EngineConfig,
        secrets: SecretsByProvider,
    ) -> Self {
        Self {
            storage,
            providers,
            state_machine: StateMachine::new(),
            dispatcher,
            hooks,
            time,
            config,
            secrets,
        }
    }

    /// Stage 1–7, run for a single inbound delivery.
    #[instrument(skip(self, raw_body, headers))]
    pub async fn process(
        &self,
        provider: &str,
        raw_body: Vec<u8>,
        headers: HashMap<String, String>,
        deadline: Option<Duration>,
    ) -> Result<ProcessingResult, ProcessError<S::Error>> {
        let received_at = std::time::Instant::now();

        // Stage 1 — Inbound.
        let adapter = self.providers.get(provider)?;

        let deadline_exceeded = || {
            deadline
                .map(|d| self.time.elapsed(received_at) > d)
                .unwrap_or(false)
        };

        // Stage 2 — Verification. Never disabled, never throws: an internal
        // adapter failure is indistinguishable from `false`.
        let secrets = self
            .secrets
            .get(provider)
            .cloned()
            .unwrap_or_default();
        let signature_valid = adapter.verify_signature(&raw_body, &headers, &secrets).await;
        if !signature_valid {
            trace!(provider, "signature verification failed");
        }

        if deadline_exceeded() {
            return self
                .persist_timeout(provider, &raw_body, &headers, signature_valid, received_at)
                .await;
        }

        // Stage 3 — Normalization (skipped entirely when the signature is
        // invalid; the fate is already decided).
        let mut parse_error: Option<String> = None;
        let mut normalize_error: Option<String> = None;
        let mut parsed: Option<ParsedPayload> = None;
        let mut normalized: Option<NormalizedEvent> = None;

        if signature_valid {
            match adapter.parse_payload(&raw_body) {
                Ok(p) => {
                    match adapter.normalize(&p) {
                        Ok(mut n) => {
                            // Stage 6's lookup keys come from the adapter's
                            // own reference-extraction contract, not
                            // whatever `normalize` happened to copy onto the
                            // normalized event.
                            let refs = adapter.extract_references(&p);
                            n.provider_ref = refs.provider_ref;
                            n.application_ref = refs.application_ref;
                            normalized = Some(n);
                        }
                        Err(e) => normalize_error = Some(e.to_string()),
                    }
                    parsed = Some(p);
                }
                Err(e) => parse_error = Some(e.to_string()),
            }
        }

        let event_type_raw = parsed
            .as_ref()
            .map(|p| p.raw_event_type.clone())
            .unwrap_or_default();

        // WebhookLog.provider_event_id *is* the adapter's idempotency key
        // (eventType:providerEventId by default), not the provider's raw
        // event id alone.
        let idempotency_key = parsed
            .as_ref()
            .map(|p| adapter.extract_idempotency_key(p))
            .unwrap_or_else(|| format!("unverified:{}", Uuid::new_v4()));

        // Stage 4 — Persist claim (with redaction per configuration).
        let redacted = self.redact(&raw_body);
        let raw_payload = if self.config.store_raw_payload {
            Some(redacted)
        } else {
            None
        };

        let fate_before_state_engine = if !signature_valid {
            ClaimFate::SignatureFailed
        } else if parse_error.is_some() {
            ClaimFate::ParseError
        } else if normalize_error.is_some() {
            ClaimFate::NormalizationFailed
        } else {
            // Provisional; Stage 6 may still reclassify to `unmatched` or
            // `transition_rejected`.
            ClaimFate::Processed
        };

        let new_log = NewWebhookLog {
            provider: provider.to_string(),
            provider_event_id: idempotency_key.clone(),
            transaction_id: None,
            event_type: event_type_raw.clone(),
            normalized_event: normalized.as_ref().map(|n| n.event_type),
            raw_payload,
            headers: headers.clone(),
            signature_valid,
            processing_status: fate_before_state_engine,
            processing_duration_ms: self.time.elapsed(received_at).as_millis() as i64,
            error_message: parse_error.clone().or_else(|| normalize_error.clone()),
        };

        // Stage 5 — Deduplication is folded into the unique-constraint
        // violation `create_webhook_log` surfaces; see storage::DuplicateOr.
        let webhook_log = match self.storage.create_webhook_log(new_log).await {
            Ok(log) => log,
            Err(DuplicateOr::Duplicate { .. }) => {
                info!(provider, "duplicate delivery");
                // The prior row is kept as-is; we have no id to report back
                // for a row we didn't write, so the caller only sees the fate.
                self.hooks
                    .on_webhook_fate(
                        provider,
                        ClaimFate::Duplicate,
                        normalized.as_ref().map(|n| n.event_type),
                        self.time.elapsed(received_at),
                        None,
                    )
                    .await;
                return Ok(ProcessingResult {
                    webhook_log_id: Uuid::nil(),
                    fate: ClaimFate::Duplicate,
                    transaction_id: None,
                    normalized_event_type: normalized.as_ref().map(|n| n.event_type),
                });
            }
            Err(DuplicateOr::Other(e)) => return Err(ProcessError::Storage(e)),
        };

        if fate_before_state_engine != ClaimFate::Processed {
            self.hooks
                .on_webhook_fate(
                    provider,
                    fate_before_state_engine,
                    None,
                    self.time.elapsed(received_at),
                    None,
                )
                .await;
            return Ok(ProcessingResult {
                webhook_log_id: webhook_log.id,
                fate: fate_before_state_engine,
                transaction_id: None,
                normalized_event_type: None,
            });
        }

        // Stage 6 — State engine.
        let normalized = normalized.expect("fate is Processed only when normalization succeeded");
        let outcome = self
            .run_state_engine(
                provider,
                &normalized,
                webhook_log.id,
                TriggerType::Webhook,
                false,
            )
            .await
            .map_err(ProcessError::Storage)?;

        self.storage
            .update_webhook_log_status(webhook_log.id, outcome.fate, None)
            .await
            .map_err(ProcessError::Storage)?;

        self.hooks
            .on_webhook_fate(
                provider,
                outcome.fate,
                Some(normalized.event_type),
                self.time.elapsed(received_at),
                outcome.transaction_id,
            )
            .await;

        // Stage 7 — Dispatch, strictly after the Stage 6 commit.
        if outcome.fate == ClaimFate::Processed {
            if let (Some(transaction_id), Some(to)) = (outcome.transaction_id, outcome.to_status) {
                self.dispatch_and_log(provider, transaction_id, &normalized, to, false)
                    .await
                    .map_err(ProcessError::Storage)?;
            }
        }

        Ok(ProcessingResult {
            webhook_log_id: webhook_log.id,
            fate: outcome.fate,
            transaction_id: outcome.transaction_id,
            normalized_event_type: Some(normalized.event_type),
        })
    }

    async fn persist_timeout(
        &self,
        provider: &str,
        raw_body: &[u8],
        headers: &HashMap<String, String>,
        signature_valid: bool,
        received_at: std::time::Instant,
    ) -> Result<ProcessingResult, ProcessError<S::Error>> {
        let redacted = self.redact(raw_body);
        let new_log = NewWebhookLog {
            provider: provider.to_string(),
            provider_event_id: Uuid::new_v4().to_string(),
            transaction_id: None,
            event_type: String::new(),
            normalized_event: None,
            raw_payload: if self.config.store_raw_payload {
                Some(redacted)
            } else {
                None
            },
            headers: headers.clone(),
            signature_valid,
            processing_status: ClaimFate::ParseError,
            processing_duration_ms: self.time.elapsed(received_at).as_millis() as i64,
            error_message: Some("processing timed out".to_string()),
        };
        let log = match self.storage.create_webhook_log(new_log).await {
            Ok(log) => log,
            Err(DuplicateOr::Duplicate { .. }) => {
                return Ok(ProcessingResult {
                    webhook_log_id: Uuid::nil(),
                    fate: ClaimFate::Duplicate,
                    transaction_id: None,
                    normalized_event_type: None,
                })
            }
            Err(DuplicateOr::Other(e)) => return Err(ProcessError::Storage(e)),
        };
        warn!(provider, "processing_timeout recorded as parse_error");
        Ok(ProcessingResult {
            webhook_log_id: log.id,
            fate: ClaimFate::ParseError,
            transaction_id: None,
            normalized_event_type: None,
        })
    }

    /// Computes the redacted payload: every configured dotted JSON path is
    /// replaced with the literal `[REDACTED]`. Applied after normalization
    /// already ran against the un-redacted bytes.
    fn redact(&self, raw_body: &[u8]) -> Vec<u8> {
        if self.config.redact_keys.is_empty() {
            return raw_body.to_vec();
        }
        let Ok(mut value) = serde_json::from_slice::<serde_json::Value>(raw_body) else {
            return raw_body.to_vec();
        };
        for path in &self.config.redact_keys {
            redact_path(&mut value, path);
        }
        serde_json::to_vec(&value).unwrap_or_else(|_| raw_body.to_vec())
    }

    /// Maps a normalized event to the transaction status it implies,
    /// including the refund full-vs-partial decision (equal or greater than
    /// the transaction's stored amount is a full refund; strictly less is
    /// partial). Exposed to `service` so `reconcile` can compute the
    /// provider's implied status with the same rule Stage 6 uses.
    pub(crate) fn target_status(
        normalized: &NormalizedEvent,
        transaction_amount: i64,
    ) -> Option<TransactionStatus> {
        use NormalizedEventType::*;
        match normalized.event_type {
            PaymentSuccessful => Some(TransactionStatus::Successful),
            PaymentFailed => Some(TransactionStatus::Failed),
            PaymentAbandoned => Some(TransactionStatus::Abandoned),
            RefundSuccessful => {
                if normalized.amount >= transaction_amount {
                    Some(TransactionStatus::Refunded)
                } else {
                    Some(TransactionStatus::PartiallyRefunded)
                }
            }
            RefundPending | RefundFailed => None,
            ChargeDisputed => Some(TransactionStatus::Disputed),
            // A missing/invalid outcome still attempts `ResolvedWon` so the
            // transition reaches `guard_dispute_outcome_present`, which
            // rejects it; treating this as a no-target informational event
            // instead would skip that rejection entirely.
            DisputeResolved => match normalized
                .provider_metadata
                .get("disputeOutcome")
                .and_then(|v| v.as_str())
            {
                Some("lost") => Some(TransactionStatus::ResolvedLost),
                _ => Some(TransactionStatus::ResolvedWon),
            },
        }
    }

    pub(crate) fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub(crate) fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub(crate) fn hooks(&self) -> &Arc<dyn PipelineHooks> {
        &self.hooks
    }

    pub(crate) fn state_machine(&self) -> &StateMachine {
        &self.state_machine
    }

    pub(crate) fn config(&self) -> &crate::config::EngineConfig {
        &self.config
    }

    /// Stage 6, factored out so `service::TransactionService::reconcile` and
    /// `link_unmatched_webhook` can re-enter it with a different trigger.
    pub(crate) async fn run_state_engine(
        &self,
        provider: &str,
        normalized: &NormalizedEvent,
        webhook_log_id: Uuid,
        trigger: TriggerType,
        reconciliation: bool,
    ) -> Result<StateEngineOutcome, S::Error> {
        // Resolve by provider_ref first; fall back to application_ref only
        // when that lookup itself misses (or there is no provider_ref to
        // look up at all), not merely when provider_ref happens to be blank.
        let by_provider_ref = if normalized.provider_ref.is_empty() {
            None
        } else {
            self.storage
                .find_transaction(TransactionLookup::ProviderRef {
                    provider: provider.to_string(),
                    provider_ref: normalized.provider_ref.clone(),
                })
                .await?
        };

        let transaction = match by_provider_ref {
            Some(t) => t,
            None => {
                let by_application_ref = match &normalized.application_ref {
                    Some(app_ref) => {
                        self.storage
                            .find_transaction(TransactionLookup::ApplicationRef(app_ref.clone()))
                            .await?
                    }
                    None => None,
                };
                match by_application_ref {
                    Some(t) => t,
                    None => {
                        return Ok(StateEngineOutcome {
                            fate: ClaimFate::Unmatched,
                            transaction_id: None,
                            to_status: None,
                        })
                    }
                }
            }
        };

        let Some(target) = Self::target_status(normalized, transaction.amount) else {
            // Informational-only events (refund.pending/failed) dispatch
            // without a transition.
            return Ok(StateEngineOutcome {
                fate: ClaimFate::Processed,
                transaction_id: Some(transaction.id),
                to_status: None,
            });
        };

        let dispute_outcome = normalized
            .provider_metadata
            .get("disputeOutcome")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let guard_ctx = GuardContext {
            from: transaction.status,
            to: target,
            trigger,
            signature_valid: true,
            provider_ref_present: transaction.provider_ref.is_some(),
            dispute_outcome: dispute_outcome.as_deref(),
        };

        match self.state_machine.validate(&guard_ctx) {
            Ok(()) => {
                let verification_method = if VerificationMethod::WebhookOnly
                    .upgrades(transaction.verification_method)
                {
                    VerificationMethod::WebhookOnly
                } else {
                    transaction.verification_method
                };
                let mut metadata = MetadataMap::new();
                metadata.insert(
                    "verificationMethod".to_string(),
                    serde_json::to_value(verification_method).unwrap_or_default(),
                );

                let outbox = if self.config.outbox_enabled {
                    Some(NewOutboxEvent {
                        event_type: normalized.event_type,
                        payload: serde_json::to_value(normalized).unwrap_or_default(),
                    })
                } else {
                    None
                };

                self.storage
                    .update_transaction_status(
                        transaction.id,
                        target,
                        NewAuditEntry {
                            from_status: Some(transaction.status),
                            to_status: Some(target),
                            trigger_type: trigger,
                            webhook_log_id: Some(webhook_log_id),
                            reconciliation_result: if reconciliation {
                                Some(ReconciliationResult::Advanced)
                            } else {
                                None
                            },
                            metadata,
                        },
                        outbox,
                    )
                    .await?;

                self.hooks
                    .on_transition(provider, transaction.id, transaction.status, target, trigger)
                    .await;

                Ok(StateEngineOutcome {
                    fate: ClaimFate::Processed,
                    transaction_id: Some(transaction.id),
                    to_status: Some(target),
                })
            }
            Err(reason) => {
                let mut metadata = MetadataMap::new();
                metadata.insert(
                    "attemptedTransition".to_string(),
                    serde_json::Value::String(format!("{:?}\u{2192}{:?}", transaction.status, target)),
                );
                metadata.insert(
                    "reason".to_string(),
                    serde_json::Value::String(reason.to_string()),
                );

                self.storage
                    .create_audit_log(
                        transaction.id,
                        NewAuditEntry {
                            from_status: Some(transaction.status),
                            to_status: Some(transaction.status),
                            trigger_type: trigger,
                            webhook_log_id: Some(webhook_log_id),
                            reconciliation_result: if reconciliation {
                                Some(ReconciliationResult::Divergence)
                            } else {
                                None
                            },
                            metadata,
                        },
                    )
                    .await?;

                Ok(StateEngineOutcome {
                    fate: ClaimFate::TransitionRejected,
                    transaction_id: Some(transaction.id),
                    to_status: None,
                })
            }
        }
    }

    /// Stage 7 factored out: dispatch the normalized event and write one
    /// DispatchLog row per handler invocation.
    pub(crate) async fn dispatch_and_log(
        &self,
        provider: &str,
        transaction_id: Uuid,
        normalized: &NormalizedEvent,
        to_status: TransactionStatus,
        is_replay: bool,
    ) -> Result<(), S::Error> {
        let _ = to_status;
        let event = DispatchEvent {
            transaction_id,
            event_type: normalized.event_type,
            provider: provider.to_string(),
            amount: normalized.amount,
            currency: normalized.currency.clone(),
            metadata: normalized.provider_metadata.clone(),
            is_replay,
        };

        let outcomes = self.dispatcher.dispatch(&event).await;
        for outcome in outcomes {
            self.storage
                .create_dispatch_log(crate::model::NewDispatchLog {
                    transaction_id,
                    event_type: normalized.event_type,
                    handler_name: outcome.handler_name.clone(),
                    status: outcome.status.clone(),
                    is_replay,
                    error_message: outcome.error_message.clone(),
                })
                .await?;

            self.hooks
                .on_dispatch_result(
                    normalized.event_type,
                    &outcome.handler_name,
                    outcome.status,
                    is_replay,
                    outcome.error_message.as_deref(),
                )
                .await;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub(crate) struct StateEngineOutcome {
    pub fate: ClaimFate,
    pub transaction_id: Option<Uuid>,
    pub to_status: Option<TransactionStatus>,
}

fn redact_path(value: &mut serde_json::Value, path: &str) {
    let parts: Vec<&str> = path.split('.').collect();
    let Some((last, ancestors)) = parts.split_last() else {
        return;
    };
    let mut cursor = value;
    for part in ancestors {
        match cursor.get_mut(*part) {
            Some(next) => cursor = next,
            None => return,
        }
    }
    if let Some(obj) = cursor.as_object_mut() {
        if obj.contains_key(*last) {
            obj.insert(
                (*last).to_string(),
                serde_json::Value::String("[REDACTED]".to_string()),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_path_replaces_nested_leaf() {
        let mut value = serde_json::json!({"customer": {"email": "a@b.com", "name": "A"}});
        redact_path(&mut value, "customer.email");
        assert_eq!(value["customer"]["email"], "[REDACTED]");
        assert_eq!(value["customer"]["name"], "A");
    }

    #[test]
    fn redact_path_is_a_noop_for_missing_path() {
        let mut value = serde_json::json!({"a": 1});
        redact_path(&mut value, "b.c");
        assert_eq!(value, serde_json::json!({"a": 1}));
    }

    #[test]
    fn target_status_refund_full_vs_partial() {
        let mut normalized = NormalizedEvent {
            event_type: NormalizedEventType::RefundSuccessful,
            provider_ref: "pr-1".to_string(),
            amount: 10_000,
            currency: "NGN".to_string(),
            provider_event_id: "evt".to_string(),
            application_ref: None,
            provider_timestamp: None,
            customer_email: None,
            provider_metadata: MetadataMap::new(),
        };
        assert_eq!(
            Pipeline::<crate::storage::InMemoryStorage, crate::time::DefaultTime>::target_status(
                &normalized, 10_000
            ),
            Some(TransactionStatus::Refunded)
        );
        normalized.amount = 4_000;
        assert_eq!(
            Pipeline::<crate::storage::InMemoryStorage, crate::time::DefaultTime>::target_status(
                &normalized, 10_000
            ),
            Some(TransactionStatus::PartiallyRefunded)
        );
    }

    #[test]
    fn target_status_dispute_resolution_reads_outcome_metadata() {
        let mut metadata = MetadataMap::new();
        metadata.insert(
            "disputeOutcome".to_string(),
            serde_json::Value::String("won".to_string()),
        );
        let normalized = NormalizedEvent {
            event_type: NormalizedEventType::DisputeResolved,
            provider_ref: "pr-1".to_string(),
            amount: 1,
            currency: "NGN".to_string(),
            provider_event_id: "evt".to_string(),
            application_ref: None,
            provider_timestamp: None,
            customer_email: None,
            provider_metadata: metadata,
        };
        assert_eq!(
            Pipeline::<crate::storage::InMemoryStorage, crate::time::DefaultTime>::target_status(
                &normalized, 1
            ),
            Some(TransactionStatus::ResolvedWon)
        );
    }

    #[test]
    fn target_status_missing_dispute_outcome_still_attempts_a_transition() {
        // The guard (not a silent skip) is what produces
        // `transition_rejected` for this boundary case.
        let normalized = NormalizedEvent {
            event_type: NormalizedEventType::DisputeResolved,
            provider_ref: "pr-1".to_string(),
            amount: 1,
            currency: "NGN".to_string(),
            provider_event_id: "evt".to_string(),
            application_ref: None,
            provider_timestamp: None,
            customer_email: None,
            provider_metadata: MetadataMap::new(),
        };
        assert_eq!(
            Pipeline::<crate::storage::InMemoryStorage, crate::time::DefaultTime>::target_status(
                &normalized, 1
            ),
            Some(TransactionStatus::ResolvedWon)
        );
    }
}

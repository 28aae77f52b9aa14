//! Transaction Service: the query-first façade over storage that the host
//! calls directly (as opposed to `pipeline::Pipeline`, which only the
//! inbound webhook path drives).
//!
//! One struct generic over the storage/time seams, constructed once, holding
//! everything else (`ProviderRegistry`, `EventDispatcher`) by `Arc` so
//! pipeline and service share state without cloning it.

use std::sync::Arc;
use std::time::Duration;

use tracing::instrument;
use uuid::Uuid;

use crate::model::{
    AuditLog, DispatchLog, MetadataMap, NewAuditEntry, NewTransaction, NormalizedEvent,
    NormalizedEventType, Page, ReconciliationResult, Transaction, TransactionFilter,
    TransactionLookup, TransactionStatus, TriggerType, VerificationMethod, WebhookLog,
    WebhookLogFilter,
};
use crate::pipeline::Pipeline;
use crate::storage::StorageAdapter;
use crate::time::Time;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError<E: std::error::Error + Send + Sync + 'static> {
    #[error("transaction {0} is not pending")]
    NotPending(Uuid),

    #[error("transaction not found")]
    TransactionNotFound,

    #[error("webhook log not found, or not in the unmatched fate")]
    WebhookNotUnmatched,

    #[error(transparent)]
    Storage(E),
}

/// Options for `get_transaction`.
#[derive(Debug, Clone, Default)]
pub struct GetTransactionOptions {
    pub verify: bool,
    pub include_webhooks: bool,
    pub include_audit_trail: bool,
}

/// The enriched view `get_transaction` returns when webhooks/audit trail are
/// requested alongside the bare row.
#[derive(Debug, Clone)]
pub struct TransactionView {
    pub transaction: Transaction,
    pub webhook_logs: Option<Vec<WebhookLog>>,
    pub audit_trail: Option<Vec<AuditLog>>,
}

pub struct TransactionService<S: StorageAdapter, T: Time> {
    pipeline: Arc<Pipeline<S, T>>,
    provider_timeout: Duration,
}

impl<S: StorageAdapter, T: Time> std::fmt::Debug for TransactionService<S, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionService").finish_non_exhaustive()
    }
}

impl<S: StorageAdapter, T: Time> TransactionService<S, T> {
    pub fn new(pipeline: Arc<Pipeline<S, T>>, provider_timeout: Duration) -> Self {
        Self {
            pipeline,
            provider_timeout,
        }
    }

    #[instrument(skip(self, dto))]
    pub async fn create_transaction(
        &self,
        dto: NewTransaction,
    ) -> Result<Transaction, ServiceError<S::Error>> {
        let transaction = self
            .pipeline
            .storage()
            .create_transaction(dto)
            .await
            .map_err(ServiceError::Storage)?;

        self.pipeline
            .storage()
            .create_audit_log(
                transaction.id,
                NewAuditEntry {
                    from_status: None,
                    to_status: Some(TransactionStatus::Pending),
                    trigger_type: TriggerType::Manual,
                    webhook_log_id: None,
                    reconciliation_result: None,
                    metadata: MetadataMap::new(),
                },
            )
            .await
            .map_err(ServiceError::Storage)?;

        Ok(transaction)
    }

    #[instrument(skip(self))]
    pub async fn mark_as_processing(
        &self,
        id: Uuid,
        provider_ref: String,
    ) -> Result<Transaction, ServiceError<S::Error>> {
        let current = self
            .pipeline
            .storage()
            .find_transaction(TransactionLookup::Id(id))
            .await
            .map_err(ServiceError::Storage)?
            .ok_or(ServiceError::TransactionNotFound)?;

        if current.status != TransactionStatus::Pending {
            return Err(ServiceError::NotPending(id));
        }

        self.pipeline
            .storage()
            .mark_as_processing(
                id,
                provider_ref,
                NewAuditEntry {
                    from_status: Some(TransactionStatus::Pending),
                    to_status: Some(TransactionStatus::Processing),
                    trigger_type: TriggerType::Manual,
                    webhook_log_id: None,
                    reconciliation_result: None,
                    metadata: MetadataMap::new(),
                },
            )
            .await
            .map_err(ServiceError::Storage)
    }

    #[instrument(skip(self, options))]
    pub async fn get_transaction(
        &self,
        lookup: TransactionLookup,
        options: GetTransactionOptions,
    ) -> Result<Option<TransactionView>, ServiceError<S::Error>> {
        let Some(mut transaction) = self
            .pipeline
            .storage()
            .find_transaction(lookup)
            .await
            .map_err(ServiceError::Storage)?
        else {
            return Ok(None);
        };

        if options.verify {
            if let Some(provider_ref) = transaction.provider_ref.clone() {
                if let Ok(adapter) = self.pipeline.providers().get(&transaction.provider) {
                    if let Some(snapshot) = adapter
                        .verify_with_provider(&provider_ref, self.provider_timeout)
                        .await
                    {
                        // Status is never mutated from this path — only the
                        // verification method and the provider's evidence for it.
                        if VerificationMethod::ApiVerified.upgrades(transaction.verification_method)
                        {
                            let metadata_patch = MetadataMap::from([(
                                "provider_verification".to_string(),
                                serde_json::to_value(&snapshot)
                                    .unwrap_or(serde_json::Value::Null),
                            )]);
                            transaction = self
                                .pipeline
                                .storage()
                                .update_verification_method(
                                    transaction.id,
                                    VerificationMethod::ApiVerified,
                                    metadata_patch,
                                )
                                .await
                                .map_err(ServiceError::Storage)?;
                        }
                    }
                }
            }
        }

        let webhook_logs = if options.include_webhooks {
            Some(
                self.pipeline
                    .storage()
                    .list_webhook_logs(
                        WebhookLogFilter {
                            provider: Some(transaction.provider.clone()),
                            processing_status: None,
                        },
                        Page::default(),
                    )
                    .await
                    .map_err(ServiceError::Storage)?
                    .into_iter()
                    .filter(|w| w.transaction_id == Some(transaction.id))
                    .collect(),
            )
        } else {
            None
        };

        let audit_trail = if options.include_audit_trail {
            Some(self.get_audit_trail(transaction.id).await?)
        } else {
            None
        };

        Ok(Some(TransactionView {
            transaction,
            webhook_logs,
            audit_trail,
        }))
    }

    pub async fn get_audit_trail(
        &self,
        transaction_id: Uuid,
    ) -> Result<Vec<AuditLog>, ServiceError<S::Error>> {
        self.pipeline
            .storage()
            .get_audit_trail(transaction_id)
            .await
            .map_err(ServiceError::Storage)
    }

    pub async fn list_transactions_by_status(
        &self,
        status: TransactionStatus,
        page: Page,
    ) -> Result<Vec<Transaction>, ServiceError<S::Error>> {
        self.pipeline
            .storage()
            .list_transactions(
                TransactionFilter {
                    provider: None,
                    status: Some(status),
                },
                page,
            )
            .await
            .map_err(ServiceError::Storage)
    }

    /// Pure predicate; no storage access beyond what the caller already
    /// fetched.
    pub fn is_settled(transaction: &Transaction) -> bool {
        transaction.status.is_settled()
    }

    #[instrument(skip(self))]
    pub async fn scan_stale_transactions(
        &self,
        older_than_minutes: i64,
    ) -> Result<Vec<String>, ServiceError<S::Error>> {
        let stale = self
            .pipeline
            .storage()
            .find_stale(older_than_minutes, usize::MAX)
            .await
            .map_err(ServiceError::Storage)?;
        Ok(stale.into_iter().map(|t| t.application_ref).collect())
    }

    #[instrument(skip(self))]
    pub async fn reconcile(
        &self,
        lookup: TransactionLookup,
    ) -> Result<ReconciliationResult, ServiceError<S::Error>> {
        let transaction = self
            .pipeline
            .storage()
            .find_transaction(lookup)
            .await
            .map_err(ServiceError::Storage)?
            .ok_or(ServiceError::TransactionNotFound)?;

        let Some(provider_ref) = transaction.provider_ref.clone() else {
            return self
                .record_reconciliation(transaction.id, ReconciliationResult::Error, MetadataMap::new())
                .await;
        };

        let adapter = match self.pipeline.providers().get(&transaction.provider) {
            Ok(adapter) => adapter,
            Err(_) => {
                return self
                    .record_reconciliation(
                        transaction.id,
                        ReconciliationResult::Error,
                        MetadataMap::new(),
                    )
                    .await
            }
        };

        let Some(snapshot) = adapter
            .verify_with_provider(&provider_ref, self.provider_timeout)
            .await
        else {
            return self
                .record_reconciliation(transaction.id, ReconciliationResult::Error, MetadataMap::new())
                .await;
        };

        let normalized = NormalizedEvent {
            event_type: snapshot.normalized_event,
            provider_ref: provider_ref.clone(),
            amount: snapshot.amount,
            currency: transaction.currency.clone(),
            provider_event_id: format!("reconciliation:{}", transaction.id),
            application_ref: Some(transaction.application_ref.clone()),
            provider_timestamp: None,
            customer_email: None,
            provider_metadata: MetadataMap::new(),
        };

        let implied = Pipeline::<S, T>::target_status(&normalized, transaction.amount);
        if implied.is_none() || implied == Some(transaction.status) {
            // Provider agrees with our current status, or this kind of event
            // carries no status of its own (e.g. refund.pending) — nothing
            // to advance.
            return self
                .record_reconciliation(
                    transaction.id,
                    ReconciliationResult::Confirmed,
                    MetadataMap::new(),
                )
                .await;
        }

        // `run_state_engine(reconciliation: true)` writes the single
        // AuditLog row for this call itself, on both the success and the
        // rejection path, so this branch must not call
        // `record_reconciliation` again afterwards.
        let outcome = self
            .pipeline
            .run_state_engine(
                &transaction.provider,
                &normalized,
                Uuid::nil(),
                TriggerType::Reconciliation,
                true,
            )
            .await
            .map_err(ServiceError::Storage)?;

        match outcome.fate {
            crate::model::ClaimFate::Processed => {
                if let Some(to) = outcome.to_status {
                    self.pipeline
                        .dispatch_and_log(&transaction.provider, transaction.id, &normalized, to, false)
                        .await
                        .map_err(ServiceError::Storage)?;
                }
                Ok(ReconciliationResult::Advanced)
            }
            // Provider is behind, or the advance failed validation: never
            // roll back.
            _ => Ok(ReconciliationResult::Divergence),
        }
    }

    async fn record_reconciliation(
        &self,
        transaction_id: Uuid,
        result: ReconciliationResult,
        metadata: MetadataMap,
    ) -> Result<ReconciliationResult, ServiceError<S::Error>> {
        self.pipeline
            .storage()
            .create_audit_log(
                transaction_id,
                NewAuditEntry {
                    from_status: None,
                    to_status: None,
                    trigger_type: TriggerType::Reconciliation,
                    webhook_log_id: None,
                    reconciliation_result: Some(result),
                    metadata,
                },
            )
            .await
            .map_err(ServiceError::Storage)?;
        Ok(result)
    }

    /// Iterates the audit trail in order and re-dispatches the event
    /// corresponding to each transition. Never writes new AuditLog rows,
    /// never changes Transaction state.
    #[instrument(skip(self))]
    pub async fn replay_events(&self, transaction_id: Uuid) -> Result<usize, ServiceError<S::Error>> {
        let transaction = self
            .pipeline
            .storage()
            .find_transaction(TransactionLookup::Id(transaction_id))
            .await
            .map_err(ServiceError::Storage)?
            .ok_or(ServiceError::TransactionNotFound)?;

        let trail = self.get_audit_trail(transaction_id).await?;
        let mut replayed = 0;

        for entry in trail {
            let Some(to_status) = entry.to_status else {
                continue;
            };
            let Some(event_type) = event_type_for_status(to_status) else {
                continue;
            };

            let normalized = NormalizedEvent {
                event_type,
                provider_ref: transaction.provider_ref.clone().unwrap_or_default(),
                amount: transaction.amount,
                currency: transaction.currency.clone(),
                provider_event_id: format!("replay:{}", entry.id),
                application_ref: Some(transaction.application_ref.clone()),
                provider_timestamp: None,
                customer_email: None,
                provider_metadata: MetadataMap::new(),
            };

            self.pipeline
                .dispatch_and_log(&transaction.provider, transaction_id, &normalized, to_status, true)
                .await
                .map_err(ServiceError::Storage)?;
            replayed += 1;
        }

        Ok(replayed)
    }

    /// Replays Stage 6 with `trigger=late_match` for a webhook that arrived
    /// before its transaction existed.
    #[instrument(skip(self))]
    pub async fn link_unmatched_webhook(
        &self,
        webhook_log_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<(), ServiceError<S::Error>> {
        let webhook_log = self
            .pipeline
            .storage()
            .get_webhook_log(webhook_log_id)
            .await
            .map_err(ServiceError::Storage)?
            .ok_or(ServiceError::WebhookNotUnmatched)?;

        if webhook_log.processing_status != crate::model::ClaimFate::Unmatched {
            return Err(ServiceError::WebhookNotUnmatched);
        }

        let transaction = self
            .pipeline
            .storage()
            .find_transaction(TransactionLookup::Id(transaction_id))
            .await
            .map_err(ServiceError::Storage)?
            .ok_or(ServiceError::TransactionNotFound)?;

        let Some(normalized_type) = webhook_log.normalized_event else {
            return Err(ServiceError::WebhookNotUnmatched);
        };

        let normalized = NormalizedEvent {
            event_type: normalized_type,
            provider_ref: transaction.provider_ref.clone().unwrap_or_default(),
            amount: transaction.amount,
            currency: transaction.currency.clone(),
            provider_event_id: webhook_log.provider_event_id.clone(),
            application_ref: Some(transaction.application_ref.clone()),
            provider_timestamp: None,
            customer_email: None,
            provider_metadata: MetadataMap::new(),
        };

        let outcome = self
            .pipeline
            .run_state_engine(
                &transaction.provider,
                &normalized,
                webhook_log_id,
                TriggerType::LateMatch,
                false,
            )
            .await
            .map_err(ServiceError::Storage)?;

        self.pipeline
            .storage()
            .link_webhook_to_transaction(webhook_log_id, transaction_id)
            .await
            .map_err(ServiceError::Storage)?;
        self.pipeline
            .storage()
            .update_webhook_log_status(webhook_log_id, outcome.fate, None)
            .await
            .map_err(ServiceError::Storage)?;

        if outcome.fate == crate::model::ClaimFate::Processed {
            if let Some(to) = outcome.to_status {
                self.pipeline
                    .dispatch_and_log(&transaction.provider, transaction_id, &normalized, to, false)
                    .await
                    .map_err(ServiceError::Storage)?;
            }
            Ok(())
        } else {
            Err(ServiceError::WebhookNotUnmatched)
        }
    }

    pub async fn list_unmatched_webhooks(
        &self,
        provider: Option<String>,
        page: Page,
    ) -> Result<Vec<WebhookLog>, ServiceError<S::Error>> {
        self.pipeline
            .storage()
            .list_unmatched(provider, page)
            .await
            .map_err(ServiceError::Storage)
    }

    #[instrument(skip(self))]
    pub async fn purge_expired_logs(
        &self,
        webhook_log_days: i64,
        dispatch_log_days: i64,
    ) -> Result<PurgeSummary, ServiceError<S::Error>> {
        let now = chrono::Utc::now();
        let webhook_logs_deleted = self
            .pipeline
            .storage()
            .purge_webhook_logs_older_than(now - chrono::Duration::days(webhook_log_days))
            .await
            .map_err(ServiceError::Storage)?;
        let dispatch_logs_deleted = self
            .pipeline
            .storage()
            .purge_dispatch_logs_older_than(now - chrono::Duration::days(dispatch_log_days))
            .await
            .map_err(ServiceError::Storage)?;
        Ok(PurgeSummary {
            webhook_logs_deleted,
            dispatch_logs_deleted,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurgeSummary {
    pub webhook_logs_deleted: usize,
    pub dispatch_logs_deleted: usize,
}

/// Inverse of Stage 6's target-status mapping, used by `replay_events` to
/// recover the event corresponding to each transition from an AuditLog row
/// that only recorded the resulting status.
fn event_type_for_status(status: TransactionStatus) -> Option<NormalizedEventType> {
    use NormalizedEventType::*;
    match status {
        TransactionStatus::Successful => Some(PaymentSuccessful),
        TransactionStatus::Failed => Some(PaymentFailed),
        TransactionStatus::Abandoned => Some(PaymentAbandoned),
        TransactionStatus::Refunded => Some(RefundSuccessful),
        TransactionStatus::PartiallyRefunded => Some(RefundSuccessful),
        TransactionStatus::Disputed => Some(ChargeDisputed),
        TransactionStatus::ResolvedWon | TransactionStatus::ResolvedLost => Some(DisputeResolved),
        TransactionStatus::Pending | TransactionStatus::Processing => None,
    }
}


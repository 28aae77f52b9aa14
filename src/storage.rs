//! Storage Adapter contract: all persistence, row locks, and atomic
//! multi-row writes, behind one trait with an associated `Error` and one
//! concrete adapter shipped alongside it, over a five-table model
//! (transactions, webhook_logs, audit_logs, dispatch_logs, outbox_events).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::model::{
    AuditLog, ClaimFate, DispatchLog, MetadataMap, NewAuditEntry, NewDispatchLog, NewTransaction,
    NewWebhookLog, OutboxEvent, OutboxStatus, Page, Transaction, TransactionFilter,
    TransactionLookup, TransactionStatus, VerificationMethod, WebhookLog, WebhookLogFilter,
};

#[async_trait]
pub trait StorageAdapter: std::fmt::Debug + Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn create_transaction(&self, dto: NewTransaction) -> Result<Transaction, Self::Error>;

    async fn find_transaction(
        &self,
        lookup: TransactionLookup,
    ) -> Result<Option<Transaction>, Self::Error>;

    async fn list_transactions(
        &self,
        filter: TransactionFilter,
        page: Page,
    ) -> Result<Vec<Transaction>, Self::Error>;

    async fn count_transactions(&self, filter: TransactionFilter) -> Result<usize, Self::Error>;

    /// Transactions in `processing` whose `updated_at` predates the cutoff.
    async fn find_stale(
        &self,
        older_than_minutes: i64,
        limit: usize,
    ) -> Result<Vec<Transaction>, Self::Error>;

    /// `SELECT … FOR UPDATE` + status write + AuditLog insert, atomically.
    /// `outbox` is included in the same transaction when present.
    async fn update_transaction_status(
        &self,
        id: Uuid,
        new_status: TransactionStatus,
        audit_entry: NewAuditEntry,
        outbox: Option<NewOutboxEvent>,
    ) -> Result<Transaction, Self::Error>;

    /// As above, additionally setting `provider_ref`. Must fail cleanly on a
    /// `(provider, provider_ref)` uniqueness violation.
    async fn mark_as_processing(
        &self,
        id: Uuid,
        provider_ref: String,
        audit_entry: NewAuditEntry,
    ) -> Result<Transaction, Self::Error>;

    /// Persists an upgraded `verification_method` outside of a status
    /// transition (no audit row: the method is metadata, not a fact),
    /// merging `metadata_patch` into `Transaction.metadata` so the
    /// verification evidence itself (not just the upgraded method) survives.
    async fn update_verification_method(
        &self,
        id: Uuid,
        method: VerificationMethod,
        metadata_patch: MetadataMap,
    ) -> Result<Transaction, Self::Error>;

    /// Must surface a `(provider, provider_event_id)` unique-constraint
    /// violation as [`DuplicateEventError`] so the pipeline can classify the
    /// delivery as `duplicate` rather than treating it as an infra failure.
    async fn create_webhook_log(
        &self,
        dto: NewWebhookLog,
    ) -> Result<WebhookLog, DuplicateOr<Self::Error>>;

    async fn update_webhook_log_status(
        &self,
        id: Uuid,
        status: ClaimFate,
        error: Option<String>,
    ) -> Result<(), Self::Error>;

    async fn link_webhook_to_transaction(
        &self,
        webhook_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<(), Self::Error>;

    async fn get_webhook_log(&self, id: Uuid) -> Result<Option<WebhookLog>, Self::Error>;

    async fn list_webhook_logs(
        &self,
        filter: WebhookLogFilter,
        page: Page,
    ) -> Result<Vec<WebhookLog>, Self::Error>;

    async fn list_unmatched(
        &self,
        provider: Option<String>,
        page: Page,
    ) -> Result<Vec<WebhookLog>, Self::Error>;

    /// Chronological.
    async fn get_audit_trail(&self, transaction_id: Uuid) -> Result<Vec<AuditLog>, Self::Error>;

    /// Writes a standalone AuditLog row outside an atomic transition, used
    /// by `create_transaction` (creation row) and `reconcile` (every
    /// outcome, including the no-op `confirmed`/`divergence`/`error` ones).
    async fn create_audit_log(
        &self,
        transaction_id: Uuid,
        entry: NewAuditEntry,
    ) -> Result<AuditLog, Self::Error>;

    async fn create_dispatch_log(&self, dto: NewDispatchLog) -> Result<DispatchLog, Self::Error>;

    async fn list_pending_outbox(&self, page: Page) -> Result<Vec<OutboxEvent>, Self::Error>;

    async fn mark_outbox_processed(&self, id: Uuid) -> Result<(), Self::Error>;

    async fn mark_outbox_failed(&self, id: Uuid, error: String) -> Result<(), Self::Error>;

    /// Never purges AuditLog or Transaction rows.
    async fn purge_webhook_logs_older_than(&self, cutoff: DateTime<Utc>)
        -> Result<usize, Self::Error>;

    async fn purge_dispatch_logs_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, Self::Error>;
}

/// Input DTO for an OutboxEvent written in the same transaction as a state
/// change.
#[derive(Debug, Clone)]
pub struct NewOutboxEvent {
    pub event_type: crate::model::NormalizedEventType,
    pub payload: serde_json::Value,
}

/// Wraps a storage error so `create_webhook_log` callers can distinguish
/// "this is a duplicate delivery" from every other failure mode without the
/// adapter needing a variant in its own error enum for it.
#[derive(Debug, thiserror::Error)]
pub enum DuplicateOr<E: std::error::Error + Send + Sync + 'static> {
    #[error("duplicate webhook event: provider={provider:?} provider_event_id={provider_event_id:?}")]
    Duplicate {
        provider: String,
        provider_event_id: String,
    },
    #[error(transparent)]
    Other(#[from] E),
}

#[derive(Debug, thiserror::Error)]
pub enum InMemoryStorageError {
    #[error("transaction {0} not found")]
    TransactionNotFound(Uuid),

    #[error("webhook log {0} not found")]
    WebhookLogNotFound(Uuid),

    #[error("outbox event {0} not found")]
    OutboxEventNotFound(Uuid),

    #[error("application_ref {0:?} already exists")]
    DuplicateApplicationRef(String),

    #[error("(provider, provider_ref) already exists: {0:?}/{1:?}")]
    DuplicateProviderRef(String, String),
}

#[derive(Debug, Default)]
struct Tables {
    transactions: HashMap<Uuid, Transaction>,
    by_application_ref: HashMap<String, Uuid>,
    by_provider_ref: HashMap<(String, String), Uuid>,

    webhook_logs: HashMap<Uuid, WebhookLog>,
    by_idempotency_key: HashMap<(String, String), Uuid>,

    audit_logs: Vec<AuditLog>,
    dispatch_logs: Vec<DispatchLog>,
    outbox: HashMap<Uuid, OutboxEvent>,
}

/// Reference storage adapter. Holds its tables behind a single
/// `tokio::sync::Mutex` and realizes row-level locking by taking that same
/// lock for the duration of each atomic write, which serializes concurrent
/// transitions against the same transaction (and, conservatively, against
/// every other transaction too — acceptable for a single-process reference
/// adapter, where a SQL-backed adapter would instead take a per-row lock).
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    tables: Mutex<Tables>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn page<T: Clone>(items: Vec<T>, page: Page) -> Vec<T> {
        items
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .collect()
    }
}

#[async_trait]
impl StorageAdapter for InMemoryStorage {
    type Error = InMemoryStorageError;

    async fn create_transaction(&self, dto: NewTransaction) -> Result<Transaction, Self::Error> {
        let mut tables = self.tables.lock().await;
        if tables.by_application_ref.contains_key(&dto.application_ref) {
            return Err(InMemoryStorageError::DuplicateApplicationRef(
                dto.application_ref,
            ));
        }

        let now = Utc::now();
        let transaction = Transaction {
            id: Uuid::new_v4(),
            application_ref: dto.application_ref.clone(),
            provider_ref: None,
            provider: dto.provider,
            status: TransactionStatus::Pending,
            amount: dto.amount,
            currency: dto.currency,
            verification_method: crate::model::VerificationMethod::WebhookOnly,
            metadata: dto.metadata,
            created_at: now,
            updated_at: now,
            provider_created_at: None,
        };

        tables
            .by_application_ref
            .insert(dto.application_ref, transaction.id);
        tables.transactions.insert(transaction.id, transaction.clone());
        Ok(transaction)
    }

    async fn find_transaction(
        &self,
        lookup: TransactionLookup,
    ) -> Result<Option<Transaction>, Self::Error> {
        let tables = self.tables.lock().await;
        let id = match lookup {
            TransactionLookup::Id(id) => Some(id),
            TransactionLookup::ApplicationRef(r) => tables.by_application_ref.get(&r).copied(),
            TransactionLookup::ProviderRef {
                provider,
                provider_ref,
            } => tables
                .by_provider_ref
                .get(&(provider, provider_ref))
                .copied(),
        };
        Ok(id.and_then(|id| tables.transactions.get(&id).cloned()))
    }

    async fn list_transactions(
        &self,
        filter: TransactionFilter,
        page: Page,
    ) -> Result<Vec<Transaction>, Self::Error> {
        let tables = self.tables.lock().await;
        let mut items: Vec<Transaction> = tables
            .transactions
            .values()
            .filter(|t| filter.provider.as_deref().map_or(true, |p| p == t.provider))
            .filter(|t| filter.status.map_or(true, |s| s == t.status))
            .cloned()
            .collect();
        items.sort_by_key(|t| t.created_at);
        Ok(Self::page(items, page))
    }

    async fn count_transactions(&self, filter: TransactionFilter) -> Result<usize, Self::Error> {
        let tables = self.tables.lock().await;
        Ok(tables
            .transactions
            .values()
            .filter(|t| filter.provider.as_deref().map_or(true, |p| p == t.provider))
            .filter(|t| filter.status.map_or(true, |s| s == t.status))
            .count())
    }

    async fn find_stale(
        &self,
        older_than_minutes: i64,
        limit: usize,
    ) -> Result<Vec<Transaction>, Self::Error> {
        let tables = self.tables.lock().await;
        let cutoff = Utc::now() - chrono::Duration::minutes(older_than_minutes);
        let mut items: Vec<Transaction> = tables
            .transactions
            .values()
            .filter(|t| t.status == TransactionStatus::Processing && t.updated_at < cutoff)
            .cloned()
            .collect();
        items.sort_by_key(|t| t.updated_at);
        items.truncate(limit);
        Ok(items)
    }

    async fn update_transaction_status(
        &self,
        id: Uuid,
        new_status: TransactionStatus,
        audit_entry: NewAuditEntry,
        outbox: Option<NewOutboxEvent>,
    ) -> Result<Transaction, Self::Error> {
        let mut tables = self.tables.lock().await;
        let transaction = tables
            .transactions
            .get_mut(&id)
            .ok_or(InMemoryStorageError::TransactionNotFound(id))?;

        transaction.status = new_status;
        transaction.updated_at = Utc::now();
        let updated = transaction.clone();

        tables.audit_logs.push(AuditLog {
            id: Uuid::new_v4(),
            transaction_id: id,
            from_status: audit_entry.from_status,
            to_status: audit_entry.to_status,
            trigger_type: audit_entry.trigger_type,
            webhook_log_id: audit_entry.webhook_log_id,
            reconciliation_result: audit_entry.reconciliation_result,
            metadata: audit_entry.metadata,
            created_at: Utc::now(),
        });

        if let Some(outbox) = outbox {
            let event = OutboxEvent {
                id: Uuid::new_v4(),
                transaction_id: id,
                event_type: outbox.event_type,
                payload: outbox.payload,
                status: OutboxStatus::Pending,
                created_at: Utc::now(),
                processed_at: None,
            };
            tables.outbox.insert(event.id, event);
        }

        Ok(updated)
    }

    async fn mark_as_processing(
        &self,
        id: Uuid,
        provider_ref: String,
        audit_entry: NewAuditEntry,
    ) -> Result<Transaction, Self::Error> {
        let mut tables = self.tables.lock().await;

        let provider = tables
            .transactions
            .get(&id)
            .ok_or(InMemoryStorageError::TransactionNotFound(id))?
            .provider
            .clone();

        let key = (provider, provider_ref.clone());
        if tables.by_provider_ref.contains_key(&key) {
            return Err(InMemoryStorageError::DuplicateProviderRef(
                key.0,
                provider_ref,
            ));
        }

        let transaction = tables.transactions.get_mut(&id).expect("checked above");
        transaction.provider_ref = Some(provider_ref.clone());
        transaction.status = TransactionStatus::Processing;
        transaction.updated_at = Utc::now();
        let updated = transaction.clone();

        tables.by_provider_ref.insert(key, id);
        tables.audit_logs.push(AuditLog {
            id: Uuid::new_v4(),
            transaction_id: id,
            from_status: audit_entry.from_status,
            to_status: audit_entry.to_status,
            trigger_type: audit_entry.trigger_type,
            webhook_log_id: audit_entry.webhook_log_id,
            reconciliation_result: audit_entry.reconciliation_result,
            metadata: audit_entry.metadata,
            created_at: Utc::now(),
        });

        Ok(updated)
    }

    async fn update_verification_method(
        &self,
        id: Uuid,
        method: VerificationMethod,
        metadata_patch: MetadataMap,
    ) -> Result<Transaction, Self::Error> {
        let mut tables = self.tables.lock().await;
        let transaction = tables
            .transactions
            .get_mut(&id)
            .ok_or(InMemoryStorageError::TransactionNotFound(id))?;
        transaction.verification_method = method;
        transaction.metadata.extend(metadata_patch);
        transaction.updated_at = Utc::now();
        Ok(transaction.clone())
    }

    async fn create_webhook_log(
        &self,
        dto: NewWebhookLog,
    ) -> Result<WebhookLog, DuplicateOr<Self::Error>> {
        let mut tables = self.tables.lock().await;
        let key = (dto.provider.clone(), dto.provider_event_id.clone());
        if tables.by_idempotency_key.contains_key(&key) {
            return Err(DuplicateOr::Duplicate {
                provider: key.0,
                provider_event_id: key.1,
            });
        }

        let log = WebhookLog {
            id: Uuid::new_v4(),
            provider: dto.provider,
            provider_event_id: dto.provider_event_id,
            transaction_id: dto.transaction_id,
            event_type: dto.event_type,
            normalized_event: dto.normalized_event,
            raw_payload: dto.raw_payload,
            headers: dto.headers,
            signature_valid: dto.signature_valid,
            processing_status: dto.processing_status,
            received_at: Utc::now(),
            processing_duration_ms: dto.processing_duration_ms,
            error_message: dto.error_message,
        };

        tables.by_idempotency_key.insert(key, log.id);
        tables.webhook_logs.insert(log.id, log.clone());
        Ok(log)
    }

    async fn update_webhook_log_status(
        &self,
        id: Uuid,
        status: ClaimFate,
        error: Option<String>,
    ) -> Result<(), Self::Error> {
        let mut tables = self.tables.lock().await;
        let log = tables
            .webhook_logs
            .get_mut(&id)
            .ok_or(InMemoryStorageError::WebhookLogNotFound(id))?;
        log.processing_status = status;
        log.error_message = error;
        Ok(())
    }

    async fn link_webhook_to_transaction(
        &self,
        webhook_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<(), Self::Error> {
        let mut tables = self.tables.lock().await;
        let log = tables
            .webhook_logs
            .get_mut(&webhook_id)
            .ok_or(InMemoryStorageError::WebhookLogNotFound(webhook_id))?;
        log.transaction_id = Some(transaction_id);
        Ok(())
    }

    async fn get_webhook_log(&self, id: Uuid) -> Result<Option<WebhookLog>, Self::Error> {
        let tables = self.tables.lock().await;
        Ok(tables.webhook_logs.get(&id).cloned())
    }

    async fn list_webhook_logs(
        &self,
        filter: WebhookLogFilter,
        page: Page,
    ) -> Result<Vec<WebhookLog>, Self::Error> {
        let tables = self.tables.lock().await;
        let mut items: Vec<WebhookLog> = tables
            .webhook_logs
            .values()
            .filter(|w| filter.provider.as_deref().map_or(true, |p| p == w.provider))
            .filter(|w| {
                filter
                    .processing_status
                    .map_or(true, |s| s == w.processing_status)
            })
            .cloned()
            .collect();
        items.sort_by_key(|w| w.received_at);
        Ok(Self::page(items, page))
    }

    async fn list_unmatched(
        &self,
        provider: Option<String>,
        page: Page,
    ) -> Result<Vec<WebhookLog>, Self::Error> {
        let tables = self.tables.lock().await;
        let mut items: Vec<WebhookLog> = tables
            .webhook_logs
            .values()
            .filter(|w| w.processing_status == ClaimFate::Unmatched)
            .filter(|w| provider.as_deref().map_or(true, |p| p == w.provider))
            .cloned()
            .collect();
        items.sort_by_key(|w| w.received_at);
        Ok(Self::page(items, page))
    }

    async fn get_audit_trail(&self, transaction_id: Uuid) -> Result<Vec<AuditLog>, Self::Error> {
        let tables = self.tables.lock().await;
        let mut items: Vec<AuditLog> = tables
            .audit_logs
            .iter()
            .filter(|a| a.transaction_id == transaction_id)
            .cloned()
            .collect();
        items.sort_by_key(|a| a.created_at);
        Ok(items)
    }

    async fn create_audit_log(
        &self,
        transaction_id: Uuid,
        entry: NewAuditEntry,
    ) -> Result<AuditLog, Self::Error> {
        let mut tables = self.tables.lock().await;
        let log = AuditLog {
            id: Uuid::new_v4(),
            transaction_id,
            from_status: entry.from_status,
            to_status: entry.to_status,
            trigger_type: entry.trigger_type,
            webhook_log_id: entry.webhook_log_id,
            reconciliation_result: entry.reconciliation_result,
            metadata: entry.metadata,
            created_at: Utc::now(),
        };
        tables.audit_logs.push(log.clone());
        Ok(log)
    }

    async fn create_dispatch_log(&self, dto: NewDispatchLog) -> Result<DispatchLog, Self::Error> {
        let mut tables = self.tables.lock().await;
        let log = DispatchLog {
            id: Uuid::new_v4(),
            transaction_id: dto.transaction_id,
            event_type: dto.event_type,
            handler_name: dto.handler_name,
            status: dto.status,
            is_replay: dto.is_replay,
            error_message: dto.error_message,
            dispatched_at: Utc::now(),
        };
        tables.dispatch_logs.push(log.clone());
        Ok(log)
    }

    async fn list_pending_outbox(&self, page: Page) -> Result<Vec<OutboxEvent>, Self::Error> {
        let tables = self.tables.lock().await;
        let mut items: Vec<OutboxEvent> = tables
            .outbox
            .values()
            .filter(|e| e.status == OutboxStatus::Pending)
            .cloned()
            .collect();
        items.sort_by_key(|e| e.created_at);
        Ok(Self::page(items, page))
    }

    async fn mark_outbox_processed(&self, id: Uuid) -> Result<(), Self::Error> {
        let mut tables = self.tables.lock().await;
        let event = tables
            .outbox
            .get_mut(&id)
            .ok_or(InMemoryStorageError::OutboxEventNotFound(id))?;
        event.status = OutboxStatus::Processed;
        event.processed_at = Some(Utc::now());
        Ok(())
    }

    async fn mark_outbox_failed(&self, id: Uuid, _error: String) -> Result<(), Self::Error> {
        let mut tables = self.tables.lock().await;
        let event = tables
            .outbox
            .get_mut(&id)
            .ok_or(InMemoryStorageError::OutboxEventNotFound(id))?;
        event.status = OutboxStatus::Failed;
        Ok(())
    }

    async fn purge_webhook_logs_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, Self::Error> {
        let mut tables = self.tables.lock().await;
        let before = tables.webhook_logs.len();
        tables.webhook_logs.retain(|_, w| w.received_at >= cutoff);
        tables
            .by_idempotency_key
            .retain(|_, id| tables.webhook_logs.contains_key(id));
        Ok(before - tables.webhook_logs.len())
    }

    async fn purge_dispatch_logs_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, Self::Error> {
        let mut tables = self.tables.lock().await;
        let before = tables.dispatch_logs.len();
        tables.dispatch_logs.retain(|d| d.dispatched_at >= cutoff);
        Ok(before - tables.dispatch_logs.len())
    }
}

/// A scoped write, executed while holding the single top-level table lock:
/// commits (applies) on `Ok`, leaves no trace on `Err` since nothing was
/// mutated outside the closure's own calls into `self`. Kept as an inherent
/// method rather than a trait method since callers hold a concrete
/// `Arc<InMemoryStorage>` wherever it's used (pipeline/service construction),
/// without forcing every adapter implementation to reason about a fully
/// generic async closure signature.
impl InMemoryStorage {
    pub async fn with_transaction<F, Fut, T>(self: &Arc<Self>, f: F) -> Result<T, InMemoryStorageError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, InMemoryStorageError>>,
    {
        let _guard = self.tables.lock().await;
        f().await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::{MetadataMap, TriggerType};

    fn new_tx(application_ref: &str) -> NewTransaction {
        NewTransaction {
            application_ref: application_ref.to_string(),
            provider: "mock".to_string(),
            amount: 10_000,
            currency: "NGN".to_string(),
            metadata: MetadataMap::new(),
        }
    }

    #[tokio::test]
    async fn create_transaction_rejects_duplicate_application_ref() {
        let storage = InMemoryStorage::new();
        storage.create_transaction(new_tx("ord-1")).await.unwrap();
        let err = storage.create_transaction(new_tx("ord-1")).await.unwrap_err();
        assert!(matches!(err, InMemoryStorageError::DuplicateApplicationRef(_)));
    }

    #[tokio::test]
    async fn mark_as_processing_rejects_duplicate_provider_ref() {
        let storage = InMemoryStorage::new();
        let t1 = storage.create_transaction(new_tx("ord-1")).await.unwrap();
        let t2 = storage.create_transaction(new_tx("ord-2")).await.unwrap();

        let audit = NewAuditEntry {
            from_status: Some(TransactionStatus::Pending),
            to_status: Some(TransactionStatus::Processing),
            trigger_type: TriggerType::Manual,
            webhook_log_id: None,
            reconciliation_result: None,
            metadata: MetadataMap::new(),
        };

        storage
            .mark_as_processing(t1.id, "pr-1".to_string(), audit.clone())
            .await
            .unwrap();

        let err = storage
            .mark_as_processing(t2.id, "pr-1".to_string(), audit)
            .await
            .unwrap_err();
        assert!(matches!(err, InMemoryStorageError::DuplicateProviderRef(_, _)));
    }

    #[tokio::test]
    async fn create_webhook_log_surfaces_duplicate_as_typed_variant() {
        let storage = InMemoryStorage::new();
        let dto = |id: &str| NewWebhookLog {
            provider: "mock".to_string(),
            provider_event_id: id.to_string(),
            transaction_id: None,
            event_type: "payment.successful".to_string(),
            normalized_event: None,
            raw_payload: Some(b"{}".to_vec()),
            headers: HashMap::new(),
            signature_valid: true,
            processing_status: ClaimFate::Processed,
            processing_duration_ms: 1,
            error_message: None,
        };

        storage.create_webhook_log(dto("evt_1")).await.unwrap();
        let err = storage.create_webhook_log(dto("evt_1")).await.unwrap_err();
        assert!(matches!(err, DuplicateOr::Duplicate { .. }));
    }

    #[tokio::test]
    async fn update_transaction_status_writes_audit_row_atomically() {
        let storage = InMemoryStorage::new();
        let t = storage.create_transaction(new_tx("ord-1")).await.unwrap();

        storage
            .update_transaction_status(
                t.id,
                TransactionStatus::Successful,
                NewAuditEntry {
                    from_status: Some(TransactionStatus::Processing),
                    to_status: Some(TransactionStatus::Successful),
                    trigger_type: TriggerType::Webhook,
                    webhook_log_id: None,
                    reconciliation_result: None,
                    metadata: MetadataMap::new(),
                },
                None,
            )
            .await
            .unwrap();

        let trail = storage.get_audit_trail(t.id).await.unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].to_status, Some(TransactionStatus::Successful));
    }

    #[tokio::test]
    async fn purge_webhook_logs_respects_cutoff() {
        let storage = InMemoryStorage::new();
        let dto = NewWebhookLog {
            provider: "mock".to_string(),
            provider_event_id: "evt_1".to_string(),
            transaction_id: None,
            event_type: "payment.successful".to_string(),
            normalized_event: None,
            raw_payload: None,
            headers: HashMap::new(),
            signature_valid: true,
            processing_status: ClaimFate::Processed,
            processing_duration_ms: 1,
            error_message: None,
        };
        storage.create_webhook_log(dto).await.unwrap();

        let future_cutoff = Utc::now() + chrono::Duration::days(1);
        let deleted = storage
            .purge_webhook_logs_older_than(future_cutoff)
            .await
            .unwrap();
        assert_eq!(deleted, 1);
    }
}

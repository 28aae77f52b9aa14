//! The transaction state machine: a pure, immutable, in-memory transition
//! table plus guards. Built once at construction time and held by the
//! owning `Pipeline`/`TransactionService`, never a global singleton, so
//! tests can construct independent instances without shared state.

use std::collections::HashMap;

use crate::model::{TransactionStatus, TriggerType};

/// Context a guard is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct GuardContext<'a> {
    pub from: TransactionStatus,
    pub to: TransactionStatus,
    pub trigger: TriggerType,
    pub signature_valid: bool,
    pub provider_ref_present: bool,
    pub dispute_outcome: Option<&'a str>,
}

/// Why `validate` rejected a transition, in the order `validate` checks
/// them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("source state {0:?} is terminal")]
    TerminalSource(TransactionStatus),
    #[error("no edge from {from:?} to {to:?}")]
    NoSuchEdge {
        from: TransactionStatus,
        to: TransactionStatus,
    },
    #[error("trigger {trigger:?} is not allowed on this edge")]
    TriggerNotAllowed { trigger: TriggerType },
    #[error("guard rejected: {reason}")]
    GuardRejected { reason: String },
}

type Guard = fn(&GuardContext) -> Result<(), String>;

struct Edge {
    triggers: Vec<TriggerType>,
    guards: Vec<Guard>,
}

/// Immutable transition table. Cheap to clone (all guards are `fn` pointers);
/// intended to be built once and shared behind an `Arc`.
#[derive(Clone)]
pub struct StateMachine {
    edges: HashMap<(TransactionStatus, TransactionStatus), std::sync::Arc<Edge>>,
}

impl std::fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field("edges", &self.edges.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn guard_webhook_requires_signature(ctx: &GuardContext) -> Result<(), String> {
    if ctx.trigger == TriggerType::Webhook && !ctx.signature_valid {
        return Err("webhook trigger requires a valid signature".to_string());
    }
    Ok(())
}

fn guard_processing_requires_provider_ref(ctx: &GuardContext) -> Result<(), String> {
    if ctx.to == TransactionStatus::Processing && !ctx.provider_ref_present {
        return Err("transition to processing requires provider_ref".to_string());
    }
    Ok(())
}

fn guard_dispute_outcome_present(ctx: &GuardContext) -> Result<(), String> {
    match ctx.dispute_outcome {
        Some("won") if ctx.to == TransactionStatus::ResolvedWon => Ok(()),
        Some("lost") if ctx.to == TransactionStatus::ResolvedLost => Ok(()),
        Some(other) => Err(format!(
            "dispute outcome {other:?} does not match target status {:?}",
            ctx.to
        )),
        None => Err("dispute resolution requires an outcome".to_string()),
    }
}

impl StateMachine {
    /// Builds the eleven declarative transition edges and their guards.
    pub fn new() -> Self {
        use TransactionStatus::*;
        use TriggerType::*;

        let mut edges = HashMap::new();

        let mut add = |from: TransactionStatus,
                        to: TransactionStatus,
                        triggers: Vec<TriggerType>,
                        guards: Vec<Guard>| {
            edges.insert(
                (from, to),
                std::sync::Arc::new(Edge { triggers, guards }),
            );
        };

        add(
            Pending,
            Processing,
            vec![Manual],
            vec![guard_processing_requires_provider_ref],
        );
        add(
            Processing,
            Successful,
            vec![Webhook, ApiVerification, Reconciliation, LateMatch],
            vec![guard_webhook_requires_signature],
        );
        add(
            Processing,
            Failed,
            vec![Webhook, ApiVerification, Reconciliation, LateMatch],
            vec![guard_webhook_requires_signature],
        );
        add(Processing, Abandoned, vec![Manual, Reconciliation], vec![]);
        add(
            Successful,
            PartiallyRefunded,
            vec![Webhook, ApiVerification, Reconciliation],
            vec![guard_webhook_requires_signature],
        );
        add(
            Successful,
            Refunded,
            vec![Webhook, ApiVerification, Reconciliation],
            vec![guard_webhook_requires_signature],
        );
        add(
            Successful,
            Disputed,
            vec![Webhook, ApiVerification, Reconciliation],
            vec![guard_webhook_requires_signature],
        );
        add(
            PartiallyRefunded,
            Refunded,
            vec![Webhook, ApiVerification, Reconciliation],
            vec![guard_webhook_requires_signature],
        );
        add(
            PartiallyRefunded,
            Disputed,
            vec![Webhook, ApiVerification, Reconciliation],
            vec![guard_webhook_requires_signature],
        );
        add(
            Disputed,
            ResolvedWon,
            vec![Webhook, ApiVerification, Reconciliation],
            vec![guard_webhook_requires_signature, guard_dispute_outcome_present],
        );
        add(
            Disputed,
            ResolvedLost,
            vec![Webhook, ApiVerification, Reconciliation],
            vec![guard_webhook_requires_signature, guard_dispute_outcome_present],
        );

        Self { edges }
    }

    /// Validates a proposed transition: terminal-source check, then edge
    /// lookup, then trigger-type match, then guard evaluation.
    pub fn validate(&self, ctx: &GuardContext) -> Result<(), ValidationError> {
        if ctx.from.is_terminal() {
            return Err(ValidationError::TerminalSource(ctx.from));
        }

        let edge = self
            .edges
            .get(&(ctx.from, ctx.to))
            .ok_or(ValidationError::NoSuchEdge {
                from: ctx.from,
                to: ctx.to,
            })?;

        if !edge.triggers.contains(&ctx.trigger) {
            return Err(ValidationError::TriggerNotAllowed {
                trigger: ctx.trigger,
            });
        }

        for guard in &edge.guards {
            guard(ctx).map_err(|reason| ValidationError::GuardRejected { reason })?;
        }

        Ok(())
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(from: TransactionStatus, to: TransactionStatus, trigger: TriggerType) -> GuardContext<'static> {
        GuardContext {
            from,
            to,
            trigger,
            signature_valid: true,
            provider_ref_present: true,
            dispute_outcome: None,
        }
    }

    #[test]
    fn pending_to_processing_requires_manual_and_provider_ref() {
        let sm = StateMachine::new();
        assert!(sm
            .validate(&ctx(TransactionStatus::Pending, TransactionStatus::Processing, TriggerType::Manual))
            .is_ok());

        let mut bad = ctx(TransactionStatus::Pending, TransactionStatus::Processing, TriggerType::Manual);
        bad.provider_ref_present = false;
        assert!(matches!(
            sm.validate(&bad),
            Err(ValidationError::GuardRejected { .. })
        ));

        assert!(matches!(
            sm.validate(&ctx(TransactionStatus::Pending, TransactionStatus::Processing, TriggerType::Webhook)),
            Err(ValidationError::TriggerNotAllowed { .. })
        ));
    }

    #[test]
    fn terminal_states_reject_everything() {
        let sm = StateMachine::new();
        for terminal in [
            TransactionStatus::Failed,
            TransactionStatus::Abandoned,
            TransactionStatus::Refunded,
            TransactionStatus::ResolvedWon,
            TransactionStatus::ResolvedLost,
        ] {
            let c = ctx(terminal, TransactionStatus::Successful, TriggerType::Webhook);
            assert!(matches!(
                sm.validate(&c),
                Err(ValidationError::TerminalSource(_))
            ));
        }
    }

    #[test]
    fn signature_invalid_rejects_webhook_trigger() {
        let sm = StateMachine::new();
        let mut c = ctx(TransactionStatus::Processing, TransactionStatus::Successful, TriggerType::Webhook);
        c.signature_valid = false;
        assert!(matches!(
            sm.validate(&c),
            Err(ValidationError::GuardRejected { .. })
        ));
    }

    #[test]
    fn dispute_resolution_requires_matching_outcome() {
        let sm = StateMachine::new();
        let mut c = ctx(TransactionStatus::Disputed, TransactionStatus::ResolvedWon, TriggerType::Webhook);
        assert!(matches!(
            sm.validate(&c),
            Err(ValidationError::GuardRejected { .. })
        ));
        c.dispute_outcome = Some("won");
        assert!(sm.validate(&c).is_ok());
        c.dispute_outcome = Some("lost");
        assert!(matches!(
            sm.validate(&c),
            Err(ValidationError::GuardRejected { .. })
        ));
    }

    #[test]
    fn no_back_edge_to_processing_from_any_terminal_or_successful_state() {
        let sm = StateMachine::new();
        for from in [
            TransactionStatus::Successful,
            TransactionStatus::PartiallyRefunded,
            TransactionStatus::Disputed,
        ] {
            let c = ctx(from, TransactionStatus::Processing, TriggerType::Manual);
            assert!(sm.validate(&c).is_err());
        }
    }
}

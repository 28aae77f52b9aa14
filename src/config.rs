//! Typed configuration, resolved from CLI/env via `clap`, split into a raw
//! `EngineEnvCliConfig` (everything optional, as CLI/env naturally is) and a
//! resolved `EngineConfig` with defaults applied.

use clap::Parser;
use std::fmt::Debug;

#[derive(Clone, Parser)]
#[command(name = "txhook_config")]
#[command(about = "Configuration for the transaction truth engine")]
pub struct EngineEnvCliConfig {
    /// Whether to retain the raw webhook body in WebhookLog.
    #[arg(long, env)]
    pub txhook_store_raw_payload: Option<bool>,

    /// Comma-separated dotted JSON paths to redact from the stored payload.
    #[arg(long, env)]
    pub txhook_redact_keys: Option<String>,

    /// Retention window, in days, for webhook_logs rows.
    #[arg(long, env)]
    pub txhook_retention_webhook_log_days: Option<i64>,

    /// Retention window, in days, for dispatch_logs rows.
    #[arg(long, env)]
    pub txhook_retention_dispatch_log_days: Option<i64>,

    /// Whether Stage 6 writes an OutboxEvent alongside each transition.
    #[arg(long, env)]
    pub txhook_outbox_enabled: Option<bool>,

    /// Default per-handler dispatch timeout, in milliseconds.
    #[arg(long, env)]
    pub txhook_handler_timeout_ms: Option<u64>,
}

/// Resolved configuration. `secrets` is deliberately absent: per-provider
/// secret material is supplied programmatically at `ProviderRegistry`
/// construction time, never via env/CLI.
#[derive(Clone)]
pub struct EngineConfig {
    pub store_raw_payload: bool,
    pub redact_keys: Vec<String>,
    pub retention_webhook_log_days: i64,
    pub retention_dispatch_log_days: i64,
    pub outbox_enabled: bool,
    pub handler_timeout_ms: Option<u64>,
}

impl Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("store_raw_payload", &self.store_raw_payload)
            .field("redact_keys", &self.redact_keys)
            .field(
                "retention_webhook_log_days",
                &self.retention_webhook_log_days,
            )
            .field(
                "retention_dispatch_log_days",
                &self.retention_dispatch_log_days,
            )
            .field("outbox_enabled", &self.outbox_enabled)
            .field("handler_timeout_ms", &self.handler_timeout_ms)
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("txhook_retention_webhook_log_days must be positive, got {0}")]
    NonPositiveWebhookRetention(i64),

    #[error("txhook_retention_dispatch_log_days must be positive, got {0}")]
    NonPositiveDispatchRetention(i64),
}

pub type Result<T> = std::result::Result<T, Error>;

const DEFAULT_STORE_RAW_PAYLOAD: bool = true;
const DEFAULT_RETENTION_WEBHOOK_LOG_DAYS: i64 = 90;
const DEFAULT_RETENTION_DISPATCH_LOG_DAYS: i64 = 90;
const DEFAULT_OUTBOX_ENABLED: bool = false;

impl EngineConfig {
    pub fn initialize_from_args() -> Result<Self> {
        let env_cli_config = EngineEnvCliConfig::parse();
        Self::initialize(env_cli_config)
    }

    pub fn initialize(env_cli_config: EngineEnvCliConfig) -> Result<Self> {
        let store_raw_payload = env_cli_config
            .txhook_store_raw_payload
            .unwrap_or(DEFAULT_STORE_RAW_PAYLOAD);

        let redact_keys = env_cli_config
            .txhook_redact_keys
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let retention_webhook_log_days = env_cli_config
            .txhook_retention_webhook_log_days
            .unwrap_or(DEFAULT_RETENTION_WEBHOOK_LOG_DAYS);
        if retention_webhook_log_days <= 0 {
            return Err(Error::NonPositiveWebhookRetention(
                retention_webhook_log_days,
            ));
        }

        let retention_dispatch_log_days = env_cli_config
            .txhook_retention_dispatch_log_days
            .unwrap_or(DEFAULT_RETENTION_DISPATCH_LOG_DAYS);
        if retention_dispatch_log_days <= 0 {
            return Err(Error::NonPositiveDispatchRetention(
                retention_dispatch_log_days,
            ));
        }

        let outbox_enabled = env_cli_config
            .txhook_outbox_enabled
            .unwrap_or(DEFAULT_OUTBOX_ENABLED);

        Ok(Self {
            store_raw_payload,
            redact_keys,
            retention_webhook_log_days,
            retention_dispatch_log_days,
            outbox_enabled,
            handler_timeout_ms: env_cli_config.txhook_handler_timeout_ms,
        })
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_raw_payload: DEFAULT_STORE_RAW_PAYLOAD,
            redact_keys: Vec::new(),
            retention_webhook_log_days: DEFAULT_RETENTION_WEBHOOK_LOG_DAYS,
            retention_dispatch_log_days: DEFAULT_RETENTION_DISPATCH_LOG_DAYS,
            outbox_enabled: DEFAULT_OUTBOX_ENABLED,
            handler_timeout_ms: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(redact: Option<&str>) -> EngineEnvCliConfig {
        EngineEnvCliConfig {
            txhook_store_raw_payload: None,
            txhook_redact_keys: redact.map(str::to_string),
            txhook_retention_webhook_log_days: None,
            txhook_retention_dispatch_log_days: None,
            txhook_outbox_enabled: None,
            txhook_handler_timeout_ms: None,
        }
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = EngineConfig::initialize(cli(None)).unwrap();
        assert!(config.store_raw_payload);
        assert!(config.redact_keys.is_empty());
        assert!(!config.outbox_enabled);
    }

    #[test]
    fn redact_keys_split_on_comma_and_trimmed() {
        let config = EngineConfig::initialize(cli(Some("a.b, c.d ,e"))).unwrap();
        assert_eq!(config.redact_keys, vec!["a.b", "c.d", "e"]);
    }

    #[test]
    fn rejects_non_positive_retention() {
        let mut c = cli(None);
        c.txhook_retention_webhook_log_days = Some(0);
        assert!(matches!(
            EngineConfig::initialize(c),
            Err(Error::NonPositiveWebhookRetention(0))
        ));
    }
}

use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ConnectorConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    pub enable_tracing: bool,
    /// Stable identity of this connector party
    pub participant_id: String,
    /// Endpoint where counterparties reach this connector
    pub endpoint: String,
    #[serde(default)]
    pub negotiation: NegotiationConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    /// PostgreSQL connection URL for the persistent store backend
    #[serde(default)]
    pub postgres_url: Option<String>,
    /// Data directory for the filesystem store backend
    #[serde(default)]
    pub data_dir: Option<String>,
}

/// Tuning for the contract negotiation state machine
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NegotiationConfig {
    /// Offer/counter-offer rounds before TERMINATED(MAX_ROUNDS_EXCEEDED)
    pub max_rounds: u32,
    /// Bounded re-sends of a protocol message before giving up on the counterparty
    pub send_retry_limit: u32,
    /// Validity window length stamped onto newly created agreements
    pub agreement_validity_secs: u64,
    /// How long a record waiting on the counterparty sleeps between checks
    pub recheck_interval_ms: u64,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            max_rounds: 8,
            send_retry_limit: 5,
            agreement_validity_secs: 3600,
            recheck_interval_ms: 5_000,
        }
    }
}

impl NegotiationConfig {
    pub fn recheck_interval(&self) -> Duration {
        Duration::from_millis(self.recheck_interval_ms)
    }

    pub fn agreement_validity(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.agreement_validity_secs as i64)
    }
}

/// Tuning for the transfer process state machine
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TransferConfig {
    /// Deprovisioning is best-effort and retries on this longer backoff
    pub deprovision_backoff_ms: u64,
    /// How long an IN_PROGRESS record sleeps between completion checks
    pub recheck_interval_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            deprovision_backoff_ms: 60_000,
            recheck_interval_ms: 5_000,
        }
    }
}

impl TransferConfig {
    pub fn deprovision_backoff(&self) -> Duration {
        Duration::from_millis(self.deprovision_backoff_ms)
    }

    pub fn recheck_interval(&self) -> Duration {
        Duration::from_millis(self.recheck_interval_ms)
    }
}

/// Retry bounds and exponential backoff shared by both managers.
///
/// A retryable failure leaves the record in place with `retry_count`
/// incremented and the next attempt pushed out by `delay(retry_count)`;
/// exceeding `max_retries` forces TERMINATED(RETRIES_EXHAUSTED).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff: base * 2^retry_count, capped at the configured max
    pub fn delay(&self, retry_count: u32) -> Duration {
        let exp = retry_count.min(16);
        let ms = self
            .backoff_base_ms
            .saturating_mul(1u64 << exp)
            .min(self.backoff_max_ms);
        Duration::from_millis(ms)
    }

    pub fn exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_retries
    }
}

/// Tuning for the dispatcher loop
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DispatcherConfig {
    /// Pause between ticks
    pub tick_interval_ms: u64,
    /// Records leased per (store, state) per tick
    pub batch_size: usize,
    /// Lease granted to a worker per leased record; expires on its own if the
    /// worker crashes so the record is never permanently stranded
    pub lease_duration_ms: u64,
    /// Inbound protocol messages drained per tick
    pub inbound_batch: usize,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 500,
            batch_size: 32,
            lease_duration_ms: 30_000,
            inbound_batch: 64,
            retry: RetryPolicy::default(),
        }
    }
}

impl DispatcherConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }
}

impl ConnectorConfig {
    pub fn load(env: &str) -> Self {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .unwrap_or_else(|_| panic!("Failed to read config file: {}", config_path));
        serde_yaml::from_str(&content).expect("Failed to parse config yaml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(1_000));
        assert_eq!(policy.delay(1), Duration::from_millis(2_000));
        assert_eq!(policy.delay(2), Duration::from_millis(4_000));
        assert_eq!(policy.delay(10), Duration::from_millis(60_000));
        assert_eq!(policy.delay(64), Duration::from_millis(60_000));
    }

    #[test]
    fn test_retry_policy_exhaustion() {
        let policy = RetryPolicy::default();
        assert!(!policy.exhausted(4));
        assert!(policy.exhausted(5));
        assert!(policy.exhausted(6));
    }

    #[test]
    fn test_dispatcher_defaults() {
        let config = DispatcherConfig::default();
        assert_eq!(config.tick_interval(), Duration::from_millis(500));
        assert_eq!(config.lease_duration(), Duration::from_millis(30_000));
        assert_eq!(config.batch_size, 32);
    }

    #[test]
    fn test_config_sections_parse_with_defaults() {
        let yaml = r#"
log_level: "info"
log_dir: "./logs"
log_file: "connector.log"
use_json: false
rotation: "daily"
enable_tracing: true
participant_id: "provider-1"
endpoint: "provider-1.internal"
negotiation:
  max_rounds: 3
  send_retry_limit: 2
  agreement_validity_secs: 600
  recheck_interval_ms: 100
"#;
        let config: ConnectorConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.negotiation.max_rounds, 3);
        // Unspecified sections fall back to defaults
        assert_eq!(config.dispatcher.batch_size, 32);
        assert_eq!(config.transfer.deprovision_backoff_ms, 60_000);
        assert!(config.postgres_url.is_none());
    }
}

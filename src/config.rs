//! Runtime configuration, loaded from the environment with documented defaults.
//!
//! Defaults match the literal timing values documented for this system, so the
//! documented behavior is exactly what you get with no environment configured.

use std::time::Duration;

/// Environment variable prefix used for every setting (`CELLWATCH_POLL_INTERVAL_MS`, …).
const ENV_PREFIX: &str = "CELLWATCH";

/// Error returned when the environment holds a value `config` cannot deserialize
/// into [`Config`] (wrong type, not a valid duration/bool/etc).
#[derive(Debug, thiserror::Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(#[from] config::ConfigError);

/// All tunables the orchestrator needs, with every field defaulted to its
/// documented value.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the external tower simulator's request/response API.
    pub tower_base_url: String,
    /// URL of the tower simulator's long-lived streaming channel.
    pub tower_stream_url: String,
    /// Tower Bridge polling-fallback interval.
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,
    /// Tower Bridge "quiet stream" warning threshold.
    #[serde(with = "duration_millis")]
    pub quiet_threshold: Duration,
    /// Tower Bridge reconnect backoff base.
    #[serde(with = "duration_millis")]
    pub reconnect_backoff_base: Duration,
    /// Tower Bridge reconnect backoff cap.
    #[serde(with = "duration_millis")]
    pub reconnect_backoff_max: Duration,
    /// Tower Client per-request timeout.
    #[serde(with = "duration_millis")]
    pub tower_request_timeout: Duration,
    /// Tower Client retry attempt count (beyond the first).
    pub tower_request_retries: usize,
    /// Tower Client retry spacing.
    #[serde(with = "duration_millis")]
    pub tower_request_retry_spacing: Duration,
    /// Agent A correlation window.
    #[serde(with = "duration_millis")]
    pub correlation_window: Duration,
    /// Agent B boot-settle sleep after `power.on`.
    #[serde(with = "duration_millis")]
    pub boot_settle: Duration,
    /// Agent B per-attempt recheck sleep in the radio-heal loop.
    #[serde(with = "duration_millis")]
    pub heal_recheck_interval: Duration,
    /// Agent B inter-step sleep between plan actions.
    #[serde(with = "duration_millis")]
    pub inter_step_delay: Duration,
    /// Agent B radio-heal loop attempt budget.
    pub heal_max_attempts: usize,
    /// Agent B sweep budget after the initial plan.
    pub sweep_max_passes: usize,
    /// Supervisor duplicate-event ledger TTL.
    #[serde(with = "duration_millis")]
    pub ledger_ttl: Duration,
    /// Supervisor duplicate-event ledger size before eviction runs.
    pub ledger_max_entries: usize,
    /// Supervisor / agent log ring capacity.
    pub log_ring_capacity: usize,
    /// Incident Bus ring buffer capacity.
    pub bus_ring_capacity: usize,
    /// Incident Bus hydration backfill count on subscribe.
    pub bus_hydration_count: usize,
    /// Agent C dedup window for near-identical consecutive cases.
    #[serde(with = "duration_millis")]
    pub case_dedup_window: Duration,
    /// Whether Delta Emitter emits synthetic `alarm.raised` events on first ingest.
    pub bootstrap_emit: bool,
    /// Whether Supervisor performs the cold-start sweep on `start()`.
    pub cold_start_sweep: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tower_base_url: "http://localhost:4000".to_string(),
            tower_stream_url: "http://localhost:4000/stream".to_string(),
            poll_interval: Duration::from_secs(5),
            quiet_threshold: Duration::from_secs(15),
            reconnect_backoff_base: Duration::from_secs(1),
            reconnect_backoff_max: Duration::from_secs(10),
            tower_request_timeout: Duration::from_secs(3),
            tower_request_retries: 2,
            tower_request_retry_spacing: Duration::from_secs(1),
            correlation_window: Duration::from_secs(5 * 60),
            boot_settle: Duration::from_millis(2_500),
            heal_recheck_interval: Duration::from_millis(1_200),
            inter_step_delay: Duration::from_millis(500),
            heal_max_attempts: 3,
            sweep_max_passes: 3,
            ledger_ttl: Duration::from_secs(60),
            ledger_max_entries: 5_000,
            log_ring_capacity: 2_000,
            bus_ring_capacity: 100,
            bus_hydration_count: 5,
            case_dedup_window: Duration::from_secs(10),
            bootstrap_emit: true,
            cold_start_sweep: true,
        }
    }
}

impl Config {
    /// Load configuration from the process environment, falling back to
    /// [`Config::default`] for anything unset. Variables are named
    /// `CELLWATCH_<FIELD_NAME_UPPERCASE>`, e.g. `CELLWATCH_POLL_INTERVAL`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = config::Config::try_from(&Self::default())?;
        let built = config::Config::builder()
            .add_source(defaults)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("_")
                    .try_parsing(true),
            )
            .build()?;
        Ok(built.try_deserialize()?)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_literals() {
        let cfg = Config::default();
        assert_eq!(cfg.poll_interval, Duration::from_secs(5));
        assert_eq!(cfg.reconnect_backoff_base, Duration::from_secs(1));
        assert_eq!(cfg.reconnect_backoff_max, Duration::from_secs(10));
        assert_eq!(cfg.tower_request_retries, 2);
        assert_eq!(cfg.correlation_window, Duration::from_secs(300));
        assert_eq!(cfg.boot_settle, Duration::from_millis(2_500));
        assert_eq!(cfg.heal_max_attempts, 3);
        assert_eq!(cfg.ledger_ttl, Duration::from_secs(60));
        assert_eq!(cfg.bus_ring_capacity, 100);
        assert_eq!(cfg.case_dedup_window, Duration::from_secs(10));
        assert!(cfg.bootstrap_emit);
    }

    #[test]
    fn from_env_without_overrides_matches_default() {
        // config::Environment silently ignores unset vars; with none of our
        // CELLWATCH_* vars set this should reproduce the defaults exactly.
        let cfg = Config::from_env().expect("defaults alone must deserialize");
        assert_eq!(cfg.bus_ring_capacity, Config::default().bus_ring_capacity);
    }
}

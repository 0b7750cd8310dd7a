//! Client configuration surface.
//!
//! A single [`Config`] is validated once, in [`Config::validate`], rather
//! than on every operation -- the hot path never re-checks option shape.

use crate::error::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaseMode {
    Required,
    Optional,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReaperErrorMode {
    Swallow,
    Throw,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeartbeatErrorMode {
    Reconnect,
    Swallow,
    Throw,
}

/// Whether `reaper_run_probability` gates the per-connect reap pass before
/// the cooldown check is consulted.
///
/// The documented probability knob and a plausible "reap unconditionally,
/// let cooldown throttle it" reading of the behavior disagree. Defaults to
/// [`ProbabilityGating::BeforeCooldown`] (honoring the name) but exposes the
/// choice so a caller who depends on the legacy behavior can opt back in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbabilityGating {
    BeforeCooldown,
    Ignored,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub coordination_secret: Option<Vec<u8>>,
    pub service_name: String,
    pub instance_id: String,
    pub lease_mode: LeaseMode,

    pub reaper: bool,
    pub reaper_run_probability: f64,
    pub reaper_probability_gating: ProbabilityGating,
    pub reaper_cooldown_ms: i64,
    pub reaper_error_mode: ReaperErrorMode,
    pub min_connection_idle_time_sec: i64,
    pub max_idle_connections_to_kill: usize,

    pub lease_ttl_ms: i64,
    pub heartbeat_soft_remaining_ms: i64,
    pub heartbeat_hard_wait_remaining_ms: i64,
    pub heartbeat_timeout_ms: i64,
    pub heartbeat_error_mode: HeartbeatErrorMode,

    pub retries: u32,
    pub min_backoff_ms: i64,
    pub max_backoff_ms: i64,
    pub max_connect_retry_time_ms: i64,
    pub max_query_retry_time_ms: i64,
    pub default_query_timeout_ms: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            coordination_secret: None,
            service_name: "default".to_string(),
            instance_id: "instance".to_string(),
            lease_mode: LeaseMode::Required,

            reaper: true,
            reaper_run_probability: 1.0,
            reaper_probability_gating: ProbabilityGating::BeforeCooldown,
            reaper_cooldown_ms: 30_000,
            reaper_error_mode: ReaperErrorMode::Swallow,
            min_connection_idle_time_sec: 30,
            max_idle_connections_to_kill: 5,

            lease_ttl_ms: 60_000,
            heartbeat_soft_remaining_ms: 30_000,
            heartbeat_hard_wait_remaining_ms: 5_000,
            heartbeat_timeout_ms: 2_000,
            heartbeat_error_mode: HeartbeatErrorMode::Reconnect,

            retries: 3,
            min_backoff_ms: 100,
            max_backoff_ms: 2_000,
            max_connect_retry_time_ms: 10_000,
            max_query_retry_time_ms: 10_000,
            default_query_timeout_ms: 30_000,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Validate the configuration once, before any connection is attempted.
    pub fn validate(&self) -> Result<(), Error> {
        if self.lease_mode == LeaseMode::Required {
            let len = self
                .coordination_secret
                .as_ref()
                .map(|s| s.len())
                .unwrap_or(0);
            if len < 16 {
                return Err(Error::Configuration(
                    "coordination_secret must be at least 16 bytes when lease_mode is Required"
                        .to_string(),
                ));
            }
        }
        if !(0.0..=1.0).contains(&self.reaper_run_probability) {
            return Err(Error::Configuration(
                "reaper_run_probability must be within [0, 1]".to_string(),
            ));
        }
        if self.min_backoff_ms > self.max_backoff_ms {
            return Err(Error::Configuration(
                "min_backoff_ms must not exceed max_backoff_ms".to_string(),
            ));
        }
        if self.service_name.is_empty() {
            return Err(Error::Configuration(
                "service_name must not be empty".to_string(),
            ));
        }
        if self.heartbeat_hard_wait_remaining_ms > self.heartbeat_soft_remaining_ms {
            return Err(Error::Configuration(
                "heartbeat_hard_wait_remaining_ms must not exceed heartbeat_soft_remaining_ms"
                    .to_string(),
            ));
        }
        if self.max_idle_connections_to_kill == 0 {
            return Err(Error::Configuration(
                "max_idle_connections_to_kill must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn leasing_enabled(&self) -> bool {
        self.coordination_secret.is_some()
    }
}

#[derive(Clone, Debug, Default)]
pub struct ConfigBuilder {
    config: ConfigOverlay,
}

/// Holds only the fields a caller has actually set; applied over
/// [`Config::default`] in [`ConfigBuilder::build`].
#[derive(Clone, Debug, Default)]
struct ConfigOverlay {
    coordination_secret: Option<Vec<u8>>,
    service_name: Option<String>,
    instance_id: Option<String>,
    lease_mode: Option<LeaseMode>,
    reaper: Option<bool>,
    reaper_run_probability: Option<f64>,
    reaper_probability_gating: Option<ProbabilityGating>,
    reaper_cooldown_ms: Option<i64>,
    reaper_error_mode: Option<ReaperErrorMode>,
    min_connection_idle_time_sec: Option<i64>,
    max_idle_connections_to_kill: Option<usize>,
    lease_ttl_ms: Option<i64>,
    heartbeat_soft_remaining_ms: Option<i64>,
    heartbeat_hard_wait_remaining_ms: Option<i64>,
    heartbeat_timeout_ms: Option<i64>,
    heartbeat_error_mode: Option<HeartbeatErrorMode>,
    retries: Option<u32>,
    min_backoff_ms: Option<i64>,
    max_backoff_ms: Option<i64>,
    max_connect_retry_time_ms: Option<i64>,
    max_query_retry_time_ms: Option<i64>,
    default_query_timeout_ms: Option<i64>,
}

macro_rules! builder_setter {
    ($name:ident, $ty:ty) => {
        pub fn $name(mut self, value: $ty) -> Self {
            self.config.$name = Some(value);
            self
        }
    };
}

impl ConfigBuilder {
    pub fn coordination_secret(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.config.coordination_secret = Some(value.into());
        self
    }

    pub fn service_name(mut self, value: impl Into<String>) -> Self {
        self.config.service_name = Some(value.into());
        self
    }

    pub fn instance_id(mut self, value: impl Into<String>) -> Self {
        self.config.instance_id = Some(value.into());
        self
    }

    builder_setter!(lease_mode, LeaseMode);
    builder_setter!(reaper, bool);
    builder_setter!(reaper_run_probability, f64);
    builder_setter!(reaper_probability_gating, ProbabilityGating);
    builder_setter!(reaper_cooldown_ms, i64);
    builder_setter!(reaper_error_mode, ReaperErrorMode);
    builder_setter!(min_connection_idle_time_sec, i64);
    builder_setter!(max_idle_connections_to_kill, usize);
    builder_setter!(lease_ttl_ms, i64);
    builder_setter!(heartbeat_soft_remaining_ms, i64);
    builder_setter!(heartbeat_hard_wait_remaining_ms, i64);
    builder_setter!(heartbeat_timeout_ms, i64);
    builder_setter!(heartbeat_error_mode, HeartbeatErrorMode);
    builder_setter!(retries, u32);
    builder_setter!(min_backoff_ms, i64);
    builder_setter!(max_backoff_ms, i64);
    builder_setter!(max_connect_retry_time_ms, i64);
    builder_setter!(max_query_retry_time_ms, i64);
    builder_setter!(default_query_timeout_ms, i64);

    /// Build and validate the configuration.
    pub fn build(self) -> Result<Config, Error> {
        let defaults = Config::default();
        let overlay = self.config;
        let config = Config {
            coordination_secret: overlay
                .coordination_secret
                .or(defaults.coordination_secret),
            service_name: overlay.service_name.unwrap_or(defaults.service_name),
            instance_id: overlay.instance_id.unwrap_or(defaults.instance_id),
            lease_mode: overlay.lease_mode.unwrap_or(defaults.lease_mode),
            reaper: overlay.reaper.unwrap_or(defaults.reaper),
            reaper_run_probability: overlay
                .reaper_run_probability
                .unwrap_or(defaults.reaper_run_probability),
            reaper_probability_gating: overlay
                .reaper_probability_gating
                .unwrap_or(defaults.reaper_probability_gating),
            reaper_cooldown_ms: overlay
                .reaper_cooldown_ms
                .unwrap_or(defaults.reaper_cooldown_ms),
            reaper_error_mode: overlay
                .reaper_error_mode
                .unwrap_or(defaults.reaper_error_mode),
            min_connection_idle_time_sec: overlay
                .min_connection_idle_time_sec
                .unwrap_or(defaults.min_connection_idle_time_sec),
            max_idle_connections_to_kill: overlay
                .max_idle_connections_to_kill
                .unwrap_or(defaults.max_idle_connections_to_kill),
            lease_ttl_ms: overlay.lease_ttl_ms.unwrap_or(defaults.lease_ttl_ms),
            heartbeat_soft_remaining_ms: overlay
                .heartbeat_soft_remaining_ms
                .unwrap_or(defaults.heartbeat_soft_remaining_ms),
            heartbeat_hard_wait_remaining_ms: overlay
                .heartbeat_hard_wait_remaining_ms
                .unwrap_or(defaults.heartbeat_hard_wait_remaining_ms),
            heartbeat_timeout_ms: overlay
                .heartbeat_timeout_ms
                .unwrap_or(defaults.heartbeat_timeout_ms),
            heartbeat_error_mode: overlay
                .heartbeat_error_mode
                .unwrap_or(defaults.heartbeat_error_mode),
            retries: overlay.retries.unwrap_or(defaults.retries),
            min_backoff_ms: overlay.min_backoff_ms.unwrap_or(defaults.min_backoff_ms),
            max_backoff_ms: overlay.max_backoff_ms.unwrap_or(defaults.max_backoff_ms),
            max_connect_retry_time_ms: overlay
                .max_connect_retry_time_ms
                .unwrap_or(defaults.max_connect_retry_time_ms),
            max_query_retry_time_ms: overlay
                .max_query_retry_time_ms
                .unwrap_or(defaults.max_query_retry_time_ms),
            default_query_timeout_ms: overlay
                .default_query_timeout_ms
                .unwrap_or(defaults.default_query_timeout_ms),
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid_when_leasing_disabled() {
        let mut config = Config::default();
        config.lease_mode = LeaseMode::Optional;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn required_lease_mode_rejects_short_secret() {
        let config = Config::builder()
            .coordination_secret(b"short".to_vec())
            .build();
        assert!(matches!(config, Err(Error::Configuration(_))));
    }

    #[test]
    fn builder_accepts_sufficient_secret() {
        let config = Config::builder()
            .coordination_secret(b"0123456789abcdef".to_vec())
            .service_name("svc")
            .build()
            .unwrap();
        assert_eq!(config.service_name, "svc");
        assert!(config.leasing_enabled());
    }

    #[test]
    fn rejects_inverted_backoff_bounds() {
        let config = Config::builder()
            .coordination_secret(b"0123456789abcdef".to_vec())
            .min_backoff_ms(5_000)
            .max_backoff_ms(100)
            .build();
        assert!(matches!(config, Err(Error::Configuration(_))));
    }

    #[test]
    fn rejects_probability_out_of_range() {
        let config = Config::builder()
            .coordination_secret(b"0123456789abcdef".to_vec())
            .reaper_run_probability(1.5)
            .build();
        assert!(matches!(config, Err(Error::Configuration(_))));
    }
}

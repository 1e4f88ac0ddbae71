//! Pipeline and runtime configuration.
//!
//! Raw deserialized input is resolved into validated runtime config, so a
//! bad TOML value fails loudly at startup instead of producing a scheduler
//! with a zero rate or a negative weight.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("rate limit must be positive and finite, got {0}")]
    InvalidRate(f64),
    #[error("default server weight must be positive and finite, got {0}")]
    InvalidDefaultWeight(f64),
    #[error("reserved system fraction must be within (0, 1), got {0}")]
    InvalidReservedFraction(f64),
    #[error("burst window must be nonzero")]
    ZeroBurstWindow,
    #[error("max promotions per tick must be nonzero")]
    ZeroPromotionBound,
    #[error("config parse error: {0}")]
    Parse(String),
}

/// How sourceless system traffic shares the outer-stage budget.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum SystemTrafficPolicy {
    /// System messages join the destination's ordinary flow and share its
    /// byte budget, competing only at server granularity.
    #[default]
    Shared,
    /// System messages get a dedicated outer stage that is offered this
    /// fraction of each tick's budget first. Unused reserve spills back to
    /// the main stage, so the split is work-conserving.
    Reserved { fraction: f64 },
}

/// Validated pipeline configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Global outbound rate limit in bytes per second. Mutable at runtime;
    /// changes take effect on the next service tick.
    pub bytes_per_sec: f64,
    /// Upper bound on inner→outer promotions per tick, bounding drain-phase
    /// work against an unbounded client backlog.
    pub max_promotions_per_tick: usize,
    /// Weight assigned to server flows registered lazily during the drain
    /// phase, until an explicit `register_server` overrides it.
    pub default_server_weight: f64,
    /// Cap on budget carry-over: at most `bytes_per_sec × burst_window`
    /// bytes may be banked across idle ticks. Must comfortably exceed the
    /// largest message size at the configured rate, or an oversized message
    /// can never fit a tick's budget.
    pub burst_window: Duration,
    pub system_traffic: SystemTrafficPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            bytes_per_sec: 1_048_576.0,
            max_promotions_per_tick: 1024,
            default_server_weight: 1.0,
            burst_window: Duration::from_millis(500),
            system_traffic: SystemTrafficPolicy::Shared,
        }
    }
}

/// Raw config as parsed from TOML; every field optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PipelineConfigInput {
    pub bytes_per_sec: Option<f64>,
    pub max_promotions_per_tick: Option<usize>,
    pub default_server_weight: Option<f64>,
    pub burst_window_ms: Option<u64>,
    /// Present ⇒ `SystemTrafficPolicy::Reserved` with this fraction.
    pub system_reserved_fraction: Option<f64>,
}

impl PipelineConfigInput {
    pub fn resolve(self) -> Result<PipelineConfig, ConfigError> {
        let defaults = PipelineConfig::default();

        let bytes_per_sec = self.bytes_per_sec.unwrap_or(defaults.bytes_per_sec);
        if !bytes_per_sec.is_finite() || bytes_per_sec <= 0.0 {
            return Err(ConfigError::InvalidRate(bytes_per_sec));
        }

        let max_promotions_per_tick = self
            .max_promotions_per_tick
            .unwrap_or(defaults.max_promotions_per_tick);
        if max_promotions_per_tick == 0 {
            return Err(ConfigError::ZeroPromotionBound);
        }

        let default_server_weight = self
            .default_server_weight
            .unwrap_or(defaults.default_server_weight);
        if !default_server_weight.is_finite() || default_server_weight <= 0.0 {
            return Err(ConfigError::InvalidDefaultWeight(default_server_weight));
        }

        let burst_window = match self.burst_window_ms {
            Some(0) => return Err(ConfigError::ZeroBurstWindow),
            Some(ms) => Duration::from_millis(ms),
            None => defaults.burst_window,
        };

        let system_traffic = match self.system_reserved_fraction {
            Some(fraction) => {
                if !fraction.is_finite() || fraction <= 0.0 || fraction >= 1.0 {
                    return Err(ConfigError::InvalidReservedFraction(fraction));
                }
                SystemTrafficPolicy::Reserved { fraction }
            }
            None => SystemTrafficPolicy::Shared,
        };

        Ok(PipelineConfig {
            bytes_per_sec,
            max_promotions_per_tick,
            default_server_weight,
            burst_window,
            system_traffic,
        })
    }

    pub fn from_toml(text: &str) -> Result<PipelineConfig, ConfigError> {
        let input: PipelineConfigInput =
            toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        input.resolve()
    }
}

/// Configuration for the worker-thread runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Service tick period.
    pub tick: Duration,
    /// Capacity of the hot-path message ring between producers and the
    /// worker.
    pub message_ring_capacity: usize,
    /// Capacity of the outbound event channel; events beyond this are
    /// dropped with a log line rather than blocking the worker.
    pub event_capacity: usize,
    pub pipeline: PipelineConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            tick: Duration::from_millis(25),
            message_ring_capacity: 4096,
            event_capacity: 256,
            pipeline: PipelineConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_resolves_to_defaults() {
        let config = PipelineConfigInput::default().resolve().unwrap();
        assert_eq!(config, PipelineConfig::default());
    }

    #[test]
    fn rejects_out_of_range_values() {
        let input = PipelineConfigInput {
            bytes_per_sec: Some(0.0),
            ..Default::default()
        };
        assert_eq!(input.resolve(), Err(ConfigError::InvalidRate(0.0)));

        let input = PipelineConfigInput {
            system_reserved_fraction: Some(1.0),
            ..Default::default()
        };
        assert_eq!(
            input.resolve(),
            Err(ConfigError::InvalidReservedFraction(1.0))
        );

        let input = PipelineConfigInput {
            burst_window_ms: Some(0),
            ..Default::default()
        };
        assert_eq!(input.resolve(), Err(ConfigError::ZeroBurstWindow));
    }

    #[test]
    fn parses_toml_front_end() {
        let config = PipelineConfigInput::from_toml(
            r#"
            bytes_per_sec = 250000.0
            max_promotions_per_tick = 64
            system_reserved_fraction = 0.25
            "#,
        )
        .unwrap();
        assert_eq!(config.bytes_per_sec, 250_000.0);
        assert_eq!(config.max_promotions_per_tick, 64);
        assert_eq!(
            config.system_traffic,
            SystemTrafficPolicy::Reserved { fraction: 0.25 }
        );

        assert!(matches!(
            PipelineConfigInput::from_toml("bytes_per_sec = \"fast\""),
            Err(ConfigError::Parse(_))
        ));
    }
}

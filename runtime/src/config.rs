//! Reservation configuration.
//!
//! Loads from environment variables with sensible defaults, or is built
//! programmatically:
//!
//! | field | env var | default |
//! |---|---|---|
//! | `hold_ttl` | `TICKETHOLD_HOLD_TTL_SECS` | 900 s |
//! | `sweep_interval` | `TICKETHOLD_SWEEP_INTERVAL_SECS` | 60 s |
//! | `warning_capacity` | `TICKETHOLD_WARNING_CAPACITY` | 64 |

use crate::error::ContextError;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Environment variable for the hold TTL, in seconds
pub const HOLD_TTL_ENV: &str = "TICKETHOLD_HOLD_TTL_SECS";
/// Environment variable for the sweep interval, in seconds
pub const SWEEP_INTERVAL_ENV: &str = "TICKETHOLD_SWEEP_INTERVAL_SECS";
/// Environment variable for the warning broadcast buffer size
pub const WARNING_CAPACITY_ENV: &str = "TICKETHOLD_WARNING_CAPACITY";

const DEFAULT_HOLD_TTL: Duration = Duration::from_secs(15 * 60);
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_WARNING_CAPACITY: usize = 64;

/// Tunables of a [`ReservationContext`](crate::context::ReservationContext).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationConfig {
    /// How long a hold lives without being released
    pub hold_ttl: Duration,
    /// How often the backstop sweep scans for expired holds
    pub sweep_interval: Duration,
    /// Buffer size of the gateway warning broadcast; slow subscribers lag
    /// past this many warnings
    pub warning_capacity: usize,
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            hold_ttl: DEFAULT_HOLD_TTL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            warning_capacity: DEFAULT_WARNING_CAPACITY,
        }
    }
}

impl ReservationConfig {
    /// Load configuration from environment variables.
    ///
    /// Missing or unparsable values fall back to their defaults.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    ///
    /// Same rules as [`from_env`](Self::from_env); lets tests avoid mutating
    /// the process environment.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            hold_ttl: lookup(HOLD_TTL_ENV)
                .and_then(|s| s.trim().parse().ok())
                .map_or(defaults.hold_ttl, Duration::from_secs),
            sweep_interval: lookup(SWEEP_INTERVAL_ENV)
                .and_then(|s| s.trim().parse().ok())
                .map_or(defaults.sweep_interval, Duration::from_secs),
            warning_capacity: lookup(WARNING_CAPACITY_ENV)
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(defaults.warning_capacity),
        }
    }

    /// Create a new configuration builder.
    #[must_use]
    pub const fn builder() -> ReservationConfigBuilder {
        ReservationConfigBuilder {
            hold_ttl: None,
            sweep_interval: None,
            warning_capacity: None,
        }
    }

    /// Check that every value is usable.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::InvalidConfig`] if a duration or the warning
    /// capacity is zero.
    pub fn validate(&self) -> Result<(), ContextError> {
        if self.hold_ttl.is_zero() {
            return Err(ContextError::InvalidConfig(
                "hold_ttl must be greater than zero".to_string(),
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(ContextError::InvalidConfig(
                "sweep_interval must be greater than zero".to_string(),
            ));
        }
        // tokio's broadcast channel panics on a zero capacity
        if self.warning_capacity == 0 {
            return Err(ContextError::InvalidConfig(
                "warning_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`ReservationConfig`].
#[derive(Debug, Clone)]
pub struct ReservationConfigBuilder {
    hold_ttl: Option<Duration>,
    sweep_interval: Option<Duration>,
    warning_capacity: Option<usize>,
}

impl ReservationConfigBuilder {
    /// Set the hold TTL.
    #[must_use]
    pub const fn hold_ttl(mut self, ttl: Duration) -> Self {
        self.hold_ttl = Some(ttl);
        self
    }

    /// Set the sweep interval.
    #[must_use]
    pub const fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    /// Set the warning broadcast buffer size.
    #[must_use]
    pub const fn warning_capacity(mut self, capacity: usize) -> Self {
        self.warning_capacity = Some(capacity);
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> ReservationConfig {
        ReservationConfig {
            hold_ttl: self.hold_ttl.unwrap_or(DEFAULT_HOLD_TTL),
            sweep_interval: self.sweep_interval.unwrap_or(DEFAULT_SWEEP_INTERVAL),
            warning_capacity: self.warning_capacity.unwrap_or(DEFAULT_WARNING_CAPACITY),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ReservationConfig::default();
        assert_eq!(config.hold_ttl, Duration::from_secs(900));
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.warning_capacity, 64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup_reads_values() {
        let config = ReservationConfig::from_lookup(lookup(&[
            (HOLD_TTL_ENV, "300"),
            (SWEEP_INTERVAL_ENV, " 15 "),
            (WARNING_CAPACITY_ENV, "8"),
        ]));
        assert_eq!(config.hold_ttl, Duration::from_secs(300));
        assert_eq!(config.sweep_interval, Duration::from_secs(15));
        assert_eq!(config.warning_capacity, 8);
    }

    #[test]
    fn test_from_lookup_falls_back_on_garbage() {
        let config = ReservationConfig::from_lookup(lookup(&[
            (HOLD_TTL_ENV, "fifteen minutes"),
            (SWEEP_INTERVAL_ENV, "-1"),
        ]));
        assert_eq!(config, ReservationConfig::default());
    }

    #[test]
    fn test_builder_overrides_defaults() {
        let config = ReservationConfig::builder()
            .hold_ttl(Duration::from_secs(120))
            .build();
        assert_eq!(config.hold_ttl, Duration::from_secs(120));
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_validate_rejects_zero_durations() {
        let zero_ttl = ReservationConfig::builder().hold_ttl(Duration::ZERO).build();
        assert!(matches!(zero_ttl.validate(), Err(ContextError::InvalidConfig(_))));

        let zero_sweep = ReservationConfig::builder()
            .sweep_interval(Duration::ZERO)
            .build();
        assert!(matches!(zero_sweep.validate(), Err(ContextError::InvalidConfig(_))));

        let zero_buffer = ReservationConfig::builder().warning_capacity(0).build();
        assert!(zero_buffer.validate().is_err());
    }
}

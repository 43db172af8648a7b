use std::env;

use medication_reminder_core::ScheduleError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::Duration;

pub const MAX_IN_FLIGHT_ENV: &str = "MEDREM_MAX_IN_FLIGHT";
pub const SNOOZE_MINUTES_ENV: &str = "MEDREM_SNOOZE_MINUTES";

const MAX_SNOOZE_MINUTES: u32 = 24 * 60;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upper bound on lifecycle jobs running at once.
    pub max_in_flight: usize,
    pub snooze_minutes: u32,
}

impl SchedulerConfig {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            max_in_flight: 4,
            snooze_minutes: 10,
        }
    }

    /// # Errors
    /// Returns [`ScheduleError::Configuration`] when a bound is out of range.
    pub fn validate(&self) -> Result<(), ScheduleError> {
        if self.max_in_flight == 0 {
            return Err(ScheduleError::Configuration(
                "max_in_flight MUST be >= 1".to_string(),
            ));
        }

        if self.snooze_minutes == 0 || self.snooze_minutes > MAX_SNOOZE_MINUTES {
            return Err(ScheduleError::Configuration(format!(
                "snooze_minutes MUST be in [1, {MAX_SNOOZE_MINUTES}]"
            )));
        }

        Ok(())
    }

    /// # Errors
    /// Returns [`ScheduleError::Configuration`] when decoding or validation fails.
    pub fn from_json(value: &Value) -> Result<Self, ScheduleError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            ScheduleError::Configuration(format!("invalid scheduler config JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `MEDREM_MAX_IN_FLIGHT` and `MEDREM_SNOOZE_MINUTES`.
    ///
    /// # Errors
    /// Returns [`ScheduleError::Configuration`] when a variable is set but not
    /// a valid number, or the result fails validation.
    pub fn from_env() -> Result<Self, ScheduleError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Like [`SchedulerConfig::from_env`], reading values through `lookup`.
    ///
    /// # Errors
    /// See [`SchedulerConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ScheduleError> {
        let mut config = Self::v1();
        if let Some(value) = env_number(&lookup, MAX_IN_FLIGHT_ENV)? {
            config.max_in_flight = value;
        }
        if let Some(value) = env_number(&lookup, SNOOZE_MINUTES_ENV)? {
            config.snooze_minutes = value;
        }
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn snooze_duration(&self) -> Duration {
        Duration::minutes(i64::from(self.snooze_minutes))
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::v1()
    }
}

fn env_number<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ScheduleError> {
    let Some(raw) = lookup(key).filter(|value| !value.trim().is_empty()) else {
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|_| ScheduleError::Configuration(format!("{key} must be a number, got {raw:?}")))
}

use crate::fleet::battery::{DEFAULT_AVERAGE_SPEED_KMH, DEFAULT_CHARGE_POWER_KW};
use crate::fleet::{TransitionRules, Weather};
use crate::replacement::ReplacementPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_SECONDS_PER_TICK: u64 = 1;
pub const DEFAULT_TURBO_SECONDS_PER_TICK: u64 = 120;
const DEFAULT_TICK_INTERVAL_MS: u64 = 1000;
const DEFAULT_TCP_PORT: u16 = 8080;
const DEFAULT_DEMO_FLEET_SIZE: usize = 80;
const DEFAULT_DEMO_GARAGE_COUNT: usize = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Everything the simulator host needs to build and drive a fleet.
///
/// Every field has a default, so a config file only has to name what it
/// changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Simulated seconds per tick in normal mode.
    pub seconds_per_tick: u64,
    /// Simulated seconds per tick in turbo mode.
    pub turbo_seconds_per_tick: u64,
    pub turbo: bool,
    pub average_speed_kmh: f64,
    pub charge_power_kw: f64,
    pub weather: Weather,
    pub rules: TransitionRules,
    pub replacement: ReplacementPolicy,
    /// Wall-clock period between ticks in the server loop.
    pub tick_interval_ms: u64,
    pub tcp_port: u16,
    /// `id;year;route;level;status;last_update_ms;model` records. Falls back
    /// to the demo fleet when unset.
    pub fleet_file: Option<String>,
    /// `name;description;distance_km;minutes` records.
    pub routes_file: Option<String>,
    pub demo_fleet_size: usize,
    pub demo_garage_count: usize,
    pub demo_seed: Option<u64>,
    pub autostart: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seconds_per_tick: DEFAULT_SECONDS_PER_TICK,
            turbo_seconds_per_tick: DEFAULT_TURBO_SECONDS_PER_TICK,
            turbo: false,
            average_speed_kmh: DEFAULT_AVERAGE_SPEED_KMH,
            charge_power_kw: DEFAULT_CHARGE_POWER_KW,
            weather: Weather::default(),
            rules: TransitionRules::default(),
            replacement: ReplacementPolicy::default(),
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            tcp_port: DEFAULT_TCP_PORT,
            fleet_file: None,
            routes_file: None,
            demo_fleet_size: DEFAULT_DEMO_FLEET_SIZE,
            demo_garage_count: DEFAULT_DEMO_GARAGE_COUNT,
            demo_seed: None,
            autostart: true,
        }
    }
}

impl SimulationConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.seconds_per_tick == 0 || self.turbo_seconds_per_tick == 0 {
            return Err(ConfigError::Invalid("seconds per tick must be positive".into()));
        }
        if !(self.average_speed_kmh.is_finite() && self.average_speed_kmh > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "average speed must be positive, got {}",
                self.average_speed_kmh
            )));
        }
        if !(self.charge_power_kw.is_finite() && self.charge_power_kw > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "charge power must be positive, got {}",
                self.charge_power_kw
            )));
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid("tick interval must be positive".into()));
        }
        if self.demo_garage_count > self.demo_fleet_size {
            return Err(ConfigError::Invalid(format!(
                "demo garage count {} exceeds fleet size {}",
                self.demo_garage_count, self.demo_fleet_size
            )));
        }
        if self.replacement.candidate_min_battery_percent <= self.replacement.low_battery_percent {
            return Err(ConfigError::Invalid(
                "replacement candidates must sit above the low-battery line".into(),
            ));
        }
        Ok(())
    }

    pub fn active_seconds_per_tick(&self) -> u64 {
        if self.turbo {
            self.turbo_seconds_per_tick
        } else {
            self.seconds_per_tick
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::Month;

    #[test]
    fn test_defaults_are_valid() {
        let config = SimulationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.active_seconds_per_tick(), 1);
        assert_eq!(config.tcp_port, 8080);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = SimulationConfig::from_json_str(
            r#"{"turbo": true, "weather": {"month": "July", "raining": true}}"#,
        )
        .unwrap();
        assert_eq!(config.active_seconds_per_tick(), 120);
        assert_eq!(config.weather, Weather::new(Month::July, true));
        assert_eq!(config.demo_fleet_size, 80);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            SimulationConfig::from_json_str(r#"{"seconds_per_tick": 0}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            SimulationConfig::from_json_str(r#"{"charge_power_kw": -1.0}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            SimulationConfig::from_json_str("{not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}

//! Throttle ladder
//!
//! Each pressure source maps to one rung; simultaneous conditions take the
//! highest rung, they never add up.

use crate::config::ThresholdConfig;
use crate::models::SystemMetrics;
use serde::{Deserialize, Serialize};

/// Discrete throttle level, in percent of added delay
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ThrottleLevel {
    #[default]
    Normal,
    /// Memory pressure or elevated error rate
    Light,
    /// Thermal pressure
    Medium,
    /// Memory emergency or critical error rate
    Heavy,
    /// Critical temperature
    Maximum,
}

impl ThrottleLevel {
    pub fn percent(self) -> u8 {
        match self {
            ThrottleLevel::Normal => 0,
            ThrottleLevel::Light => 25,
            ThrottleLevel::Medium => 50,
            ThrottleLevel::Heavy => 75,
            ThrottleLevel::Maximum => 90,
        }
    }

    /// Factor applied to the base delay: `1 + percent / 100`
    pub fn delay_factor(self) -> f64 {
        1.0 + f64::from(self.percent()) / 100.0
    }
}

impl std::fmt::Display for ThrottleLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.percent())
    }
}

/// Compute the throttle level for a telemetry snapshot
pub fn compute_throttle_level(metrics: &SystemMetrics, thresholds: &ThresholdConfig) -> ThrottleLevel {
    let memory = if metrics.memory_percent > thresholds.memory_emergency {
        ThrottleLevel::Heavy
    } else if metrics.memory_percent > thresholds.memory_warn {
        ThrottleLevel::Light
    } else {
        ThrottleLevel::Normal
    };

    let thermal = if metrics.cpu_temperature_c > thresholds.thermal_critical_c {
        ThrottleLevel::Maximum
    } else if metrics.cpu_temperature_c > thresholds.thermal_warn_c {
        ThrottleLevel::Medium
    } else {
        ThrottleLevel::Normal
    };

    let error_rate = metrics.error_rate();
    let errors = if error_rate > thresholds.error_rate_critical {
        ThrottleLevel::Heavy
    } else if error_rate > thresholds.error_rate_warn {
        ThrottleLevel::Light
    } else {
        ThrottleLevel::Normal
    };

    memory.max(thermal).max(errors)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(memory_percent: f64, temp: f64, successes: u64, errors: u64) -> SystemMetrics {
        SystemMetrics {
            memory_percent,
            cpu_temperature_c: temp,
            success_count: successes,
            error_count: errors,
            ..Default::default()
        }
    }

    #[test]
    fn test_normal_when_idle() {
        let level = compute_throttle_level(&metrics(0.1, 40.0, 0, 0), &ThresholdConfig::default());
        assert_eq!(level, ThrottleLevel::Normal);
        assert_eq!(level.delay_factor(), 1.0);
    }

    #[test]
    fn test_memory_pressure_is_light() {
        let level = compute_throttle_level(&metrics(0.85, 50.0, 99, 1), &ThresholdConfig::default());
        assert_eq!(level.percent(), 25);
    }

    #[test]
    fn test_memory_emergency_is_heavy() {
        let level = compute_throttle_level(&metrics(0.95, 0.0, 0, 0), &ThresholdConfig::default());
        assert_eq!(level, ThrottleLevel::Heavy);
    }

    #[test]
    fn test_critical_temperature_is_maximum() {
        let level = compute_throttle_level(&metrics(0.40, 82.0, 0, 0), &ThresholdConfig::default());
        assert_eq!(level.percent(), 90);
        assert!((level.delay_factor() - 1.9).abs() < 1e-9);
    }

    #[test]
    fn test_error_rate_levels() {
        let thresholds = ThresholdConfig::default();
        // 3% errors
        assert_eq!(
            compute_throttle_level(&metrics(0.1, 40.0, 97, 3), &thresholds),
            ThrottleLevel::Light
        );
        // 10% errors
        assert_eq!(
            compute_throttle_level(&metrics(0.1, 40.0, 90, 10), &thresholds),
            ThrottleLevel::Heavy
        );
    }

    #[test]
    fn test_conditions_combine_with_max() {
        // memory light + thermal medium -> medium, not 75
        let level = compute_throttle_level(&metrics(0.75, 65.0, 0, 0), &ThresholdConfig::default());
        assert_eq!(level, ThrottleLevel::Medium);

        // everything at once -> maximum, never above 90
        let level = compute_throttle_level(&metrics(0.99, 95.0, 1, 99), &ThresholdConfig::default());
        assert_eq!(level.percent(), 90);
    }
}

//! Localization configuration
//!
//! Immutable once handed to `start`; a new configuration requires a
//! stop followed by a fresh start.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{VpsError, VpsResult};

/// Upper bound on localization requests sent to the service
pub const MAX_REQUESTS_PER_SECOND: f32 = 1.0;

/// Longest timeout, wait or request interval a configuration may ask for
pub const MAX_WAIT_S: f32 = 86_400.0;

/// Localization configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalizationConfig {
    /// Give up localizing after this long
    pub localization_timeout_s: f32,
    /// Per-request time limit on the service side
    pub request_time_limit_s: f32,
    /// Localization request rate (at most 1.0)
    pub requests_per_second: f32,
    /// Pose resolutions per second across all anchors; `None` is unbounded
    pub max_resolutions_per_second: Option<f32>,
    /// Wait for good device tracking before the first request
    pub good_tracking_wait_s: f32,
    /// Keep re-localizing after the first fix to counter drift
    pub continuous_localization_enabled: bool,
}

impl Default for LocalizationConfig {
    fn default() -> Self {
        LocalizationConfig {
            localization_timeout_s: 30.0,
            request_time_limit_s: 10.0,
            requests_per_second: 1.0,
            max_resolutions_per_second: Some(10.0),
            good_tracking_wait_s: 0.5,
            continuous_localization_enabled: false,
        }
    }
}

impl LocalizationConfig {
    /// Configuration for battery-constrained devices
    pub fn low_power() -> Self {
        LocalizationConfig {
            localization_timeout_s: 45.0,
            request_time_limit_s: 15.0,
            requests_per_second: 0.25,
            max_resolutions_per_second: Some(2.0),
            good_tracking_wait_s: 1.0,
            continuous_localization_enabled: false,
        }
    }

    /// Configuration that keeps correcting drift after the first fix
    pub fn continuous() -> Self {
        LocalizationConfig {
            continuous_localization_enabled: true,
            max_resolutions_per_second: None,
            ..Self::default()
        }
    }

    /// Parse and validate a JSON document; missing fields take defaults
    pub fn from_json(json: &str) -> VpsResult<Self> {
        let config: LocalizationConfig =
            serde_json::from_str(json).map_err(|e| VpsError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> VpsResult<()> {
        if !(self.localization_timeout_s > 0.0 && self.localization_timeout_s <= MAX_WAIT_S) {
            return Err(VpsError::InvalidConfig(format!(
                "localization_timeout_s must be in (0, {}], got {}",
                MAX_WAIT_S, self.localization_timeout_s
            )));
        }
        if !(self.request_time_limit_s > 0.0 && self.request_time_limit_s <= MAX_WAIT_S) {
            return Err(VpsError::InvalidConfig(format!(
                "request_time_limit_s must be in (0, {}], got {}",
                MAX_WAIT_S, self.request_time_limit_s
            )));
        }
        if !(self.requests_per_second >= 1.0 / MAX_WAIT_S
            && self.requests_per_second <= MAX_REQUESTS_PER_SECOND)
        {
            return Err(VpsError::InvalidConfig(format!(
                "requests_per_second must be in [1/{}, {}], got {}",
                MAX_WAIT_S, MAX_REQUESTS_PER_SECOND, self.requests_per_second
            )));
        }
        if let Some(rate) = self.max_resolutions_per_second {
            if !(rate.is_finite() && rate > 0.0) {
                return Err(VpsError::InvalidConfig(format!(
                    "max_resolutions_per_second must be positive, got {}",
                    rate
                )));
            }
        }
        if !(self.good_tracking_wait_s >= 0.0 && self.good_tracking_wait_s <= MAX_WAIT_S) {
            return Err(VpsError::InvalidConfig(format!(
                "good_tracking_wait_s must be in [0, {}], got {}",
                MAX_WAIT_S, self.good_tracking_wait_s
            )));
        }
        Ok(())
    }

    pub fn localization_timeout(&self) -> Duration {
        seconds(self.localization_timeout_s)
    }

    pub fn request_time_limit(&self) -> Duration {
        seconds(self.request_time_limit_s)
    }

    pub fn good_tracking_wait(&self) -> Duration {
        seconds(self.good_tracking_wait_s)
    }

    /// Minimum spacing between localization requests
    pub fn request_interval(&self) -> Duration {
        seconds(1.0 / self.requests_per_second)
    }
}

/// Saturating conversion; NaN and negative values map to zero
fn seconds(value: f32) -> Duration {
    if value.is_nan() || value <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f32(value).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(LocalizationConfig::default().validate().is_ok());
        assert!(LocalizationConfig::low_power().validate().is_ok());
        assert!(LocalizationConfig::continuous().validate().is_ok());
    }

    #[test]
    fn test_request_rate_capped_at_one() {
        let config = LocalizationConfig {
            requests_per_second: 2.0,
            ..LocalizationConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(VpsError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_zero_resolution_rate_rejected() {
        let config = LocalizationConfig {
            max_resolutions_per_second: Some(0.0),
            ..LocalizationConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unrepresentable_waits_rejected() {
        for config in [
            LocalizationConfig {
                localization_timeout_s: 1.0e30,
                ..LocalizationConfig::default()
            },
            LocalizationConfig {
                request_time_limit_s: f32::INFINITY,
                ..LocalizationConfig::default()
            },
            LocalizationConfig {
                good_tracking_wait_s: f32::NAN,
                ..LocalizationConfig::default()
            },
            LocalizationConfig {
                requests_per_second: 1.0e-30,
                ..LocalizationConfig::default()
            },
        ] {
            assert!(
                matches!(config.validate(), Err(VpsError::InvalidConfig(_))),
                "{:?}",
                config
            );
        }
    }

    #[test]
    fn test_durations_saturate_instead_of_panicking() {
        let config = LocalizationConfig {
            localization_timeout_s: 1.0e30,
            good_tracking_wait_s: -1.0,
            requests_per_second: 0.0,
            ..LocalizationConfig::default()
        };
        assert_eq!(config.localization_timeout(), Duration::MAX);
        assert_eq!(config.good_tracking_wait(), Duration::ZERO);
        assert_eq!(config.request_interval(), Duration::MAX);
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = LocalizationConfig::from_json(
            r#"{ "continuous_localization_enabled": true, "max_resolutions_per_second": null }"#,
        )
        .unwrap();
        assert!(config.continuous_localization_enabled);
        assert_eq!(config.max_resolutions_per_second, None);
        assert_eq!(config.localization_timeout_s, 30.0);
    }

    #[test]
    fn test_from_json_rejects_invalid() {
        let err = LocalizationConfig::from_json(r#"{ "requests_per_second": 5.0 }"#).unwrap_err();
        assert!(err.is_call_scoped());
    }

    #[test]
    fn test_request_interval() {
        let config = LocalizationConfig::low_power();
        assert_eq!(config.request_interval(), Duration::from_secs(4));
    }
}

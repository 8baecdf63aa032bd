use serde::{Deserialize, Serialize};

use strider_flow::{DetectConfig, FlowConfig};

use crate::optimizer::OptimizerConfig;
use crate::{Error, Result};

fn default_num_features() -> usize {
    150
}
fn default_num_features_init() -> usize {
    100
}
fn default_num_features_tracking() -> usize {
    50
}
fn default_num_features_tracking_bad() -> usize {
    20
}
fn default_num_features_needed_for_keyframe() -> usize {
    80
}
fn default_num_active_keyframes() -> usize {
    7
}
fn default_mask_half_size() -> u32 {
    10
}

/// All tunable parameters of the tracking frontend.
///
/// The defaults are the ones the system is validated with; configuration
/// files only need to list the values they change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackingConfig {
    /// Target number of corners per detection pass.
    #[serde(default = "default_num_features")]
    pub num_features: usize,
    /// Minimum stereo matches required for map initialization.
    #[serde(default = "default_num_features_init")]
    pub num_features_init: usize,
    /// Inlier count above which tracking is considered good.
    #[serde(default = "default_num_features_tracking")]
    pub num_features_tracking: usize,
    /// Inlier count above which tracking is merely bad (below: lost).
    #[serde(default = "default_num_features_tracking_bad")]
    pub num_features_tracking_bad: usize,
    /// Inlier count under which the current frame becomes a keyframe.
    #[serde(default = "default_num_features_needed_for_keyframe")]
    pub num_features_needed_for_keyframe: usize,
    /// Size of the keyframe window kept for local bundle adjustment.
    #[serde(default = "default_num_active_keyframes")]
    pub num_active_keyframes: usize,
    /// Half side length of the exclusion box painted around each tracked
    /// feature before detection.
    #[serde(default = "default_mask_half_size")]
    pub mask_half_size: u32,
    #[serde(default)]
    pub flow: FlowConfig,
    #[serde(default)]
    pub detect: DetectConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            num_features: default_num_features(),
            num_features_init: default_num_features_init(),
            num_features_tracking: default_num_features_tracking(),
            num_features_tracking_bad: default_num_features_tracking_bad(),
            num_features_needed_for_keyframe: default_num_features_needed_for_keyframe(),
            num_active_keyframes: default_num_active_keyframes(),
            mask_half_size: default_mask_half_size(),
            flow: FlowConfig::default(),
            detect: DetectConfig::default(),
            optimizer: OptimizerConfig::default(),
        }
    }
}

impl TrackingConfig {
    /// Load a configuration from a YAML file.
    pub fn from_yaml_path<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let buf = std::fs::read_to_string(path)?;
        let cfg: Self = serde_yaml::from_str(&buf)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check internal consistency of the thresholds.
    pub fn validate(&self) -> Result<()> {
        if self.num_features_tracking_bad >= self.num_features_tracking {
            return Err(Error::InvalidConfiguration(
                "num_features_tracking_bad must be below num_features_tracking".into(),
            ));
        }
        if self.num_features_init == 0 || self.num_features == 0 {
            return Err(Error::InvalidConfiguration(
                "feature counts must be positive".into(),
            ));
        }
        if self.num_active_keyframes < 2 {
            return Err(Error::InvalidConfiguration(
                "num_active_keyframes must be at least 2".into(),
            ));
        }
        if self.flow.levels == 0 || self.flow.window < 3 {
            return Err(Error::InvalidConfiguration(
                "optical flow needs at least one pyramid level and a 3px window".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid_and_roundtrip() {
        let cfg = TrackingConfig::default();
        cfg.validate().unwrap();
        let buf = serde_yaml::to_string(&cfg).unwrap();
        let back: TrackingConfig = serde_yaml::from_str(&buf).unwrap();
        assert_eq!(cfg, back);
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let cfg: TrackingConfig = serde_yaml::from_str("num_features: 42\n").unwrap();
        assert_eq!(cfg.num_features, 42);
        assert_eq!(cfg.num_features_init, 100);
        assert_eq!(cfg.flow.window, 11);
    }

    #[test]
    fn inconsistent_thresholds_are_rejected() {
        let cfg = TrackingConfig {
            num_features_tracking_bad: 60,
            ..TrackingConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn loads_from_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "num_features_init: 55").unwrap();
        let cfg = TrackingConfig::from_yaml_path(f.path()).unwrap();
        assert_eq!(cfg.num_features_init, 55);
    }
}

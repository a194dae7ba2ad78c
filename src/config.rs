//! Pipeline configuration.
//!
//! A single immutable record describing how a checkpoint is packed and served.
//! It is passed explicitly to every operation that needs it; nothing reads
//! settings from global state.
//!
//! # Example
//!
//! ```rust
//! use groupq_rs::PipelineConfig;
//!
//! let config = PipelineConfig::from_yaml_str(
//!     r#"
//! model_name: gpt-j-6b
//! quantization:
//!   group_size: 64
//! compute_dtype: bf16
//! target_modules: [q_proj, v_proj]
//! "#,
//! )
//! .unwrap();
//! assert_eq!(config.group_size(), 64);
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{GroupQuantError, Result};
use crate::quantization::{ComputeDType, QuantizationConfig, RangeSelection};

/// Configuration shared by checkpoint packing and inference sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Model name, recorded in packed checkpoint files.
    #[serde(default = "default_model_name")]
    pub model_name: String,

    /// Codec settings. A group size of `0` keeps every weight dense.
    #[serde(default)]
    pub quantization: QuantizationConfig,

    /// Data type the dequantized weights are computed in.
    #[serde(default)]
    pub compute_dtype: ComputeDType,

    /// Substrings selecting which 2-D weights are packed. Empty packs all of them.
    #[serde(default)]
    pub target_modules: Vec<String>,

    /// Keep dequantized weights resident instead of dequantizing per forward pass.
    #[serde(default)]
    pub cache_dequantized: bool,
}

fn default_model_name() -> String {
    "groupq-model".to_string()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model_name: default_model_name(),
            quantization: QuantizationConfig::default(),
            compute_dtype: ComputeDType::F32,
            target_modules: Vec::new(),
            cache_dequantized: false,
        }
    }
}

impl PipelineConfig {
    /// Preset packing every 2-D weight at the given group size.
    #[must_use]
    pub fn preset_group(group_size: usize) -> Self {
        Self {
            quantization: QuantizationConfig::with_group_size(group_size),
            ..Default::default()
        }
    }

    /// Preset that serves the checkpoint in full precision.
    #[must_use]
    pub fn preset_dense() -> Self {
        Self {
            quantization: QuantizationConfig::disabled(),
            ..Default::default()
        }
    }

    /// Preset for inference: BF16 compute with dequantized weights cached.
    #[must_use]
    pub fn preset_inference(group_size: usize) -> Self {
        Self {
            compute_dtype: ComputeDType::BF16,
            cache_dequantized: true,
            ..Self::preset_group(group_size)
        }
    }

    /// Parse a YAML document.
    ///
    /// # Errors
    /// Returns `Yaml` if parsing fails, or any error from [`Self::validate`].
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file.
    ///
    /// # Errors
    /// Returns `Io` if the file cannot be read, otherwise as [`Self::from_yaml_str`].
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }

    /// Serialize to YAML.
    ///
    /// # Errors
    /// Returns `Yaml` if serialization fails.
    pub fn to_yaml_string(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Group size, `0` when quantization is disabled.
    #[must_use]
    pub fn group_size(&self) -> usize {
        self.quantization.group_size
    }

    /// Copy of this configuration with another group size.
    #[must_use]
    pub fn with_group_size(&self, group_size: usize) -> Self {
        let mut config = self.clone();
        config.quantization.group_size = group_size;
        config
    }

    /// Whether a tensor with this name is selected for packing.
    #[must_use]
    pub fn is_target(&self, tensor_name: &str) -> bool {
        self.target_modules.is_empty() || self.target_modules.iter().any(|t| tensor_name.contains(t))
    }

    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns `InvalidGroupSize` or `InvalidConfig` for unusable settings.
    pub fn validate(&self) -> Result<()> {
        self.quantization.validate()?;
        if self.model_name.is_empty() {
            return Err(GroupQuantError::InvalidConfig("model name must not be empty".into()));
        }
        if self.target_modules.iter().any(String::is_empty) {
            return Err(GroupQuantError::InvalidConfig(
                "target module patterns must not be empty".into(),
            ));
        }
        if self.quantization.is_disabled() && self.quantization.range != RangeSelection::MinMax {
            tracing::warn!("percentile range selection has no effect with quantization disabled");
        }
        if matches!(self.quantization.range, RangeSelection::Percentile { .. }) {
            tracing::warn!(
                "percentile range selection clips outliers; check clipped_outlier_loss in reports"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.group_size(), 64);
        assert!(!config.cache_dequantized);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets() {
        assert_eq!(PipelineConfig::preset_group(128).group_size(), 128);
        assert!(PipelineConfig::preset_dense().quantization.is_disabled());

        let inference = PipelineConfig::preset_inference(32);
        assert!(inference.cache_dequantized);
        assert_eq!(inference.compute_dtype, ComputeDType::BF16);
        assert_eq!(inference.group_size(), 32);
    }

    #[test]
    fn test_yaml_minimal() {
        let config = PipelineConfig::from_yaml_str("quantization:\n  group_size: 0\n").unwrap();
        assert!(config.quantization.is_disabled());
        assert_eq!(config.model_name, "groupq-model");
        assert!(config.quantization.parallel);
    }

    #[test]
    fn test_yaml_full() {
        let yaml = r"
model_name: test
quantization:
  group_size: 16
  range: !percentile
    lower: 0.5
    upper: 99.5
  parallel: false
compute_dtype: f16
target_modules: [attn]
cache_dequantized: true
";
        let config = PipelineConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.group_size(), 16);
        assert_eq!(
            config.quantization.range,
            RangeSelection::Percentile {
                lower: 0.5,
                upper: 99.5
            }
        );
        assert_eq!(config.compute_dtype, ComputeDType::F16);
        assert!(config.is_target("layers.0.attn.q"));
        assert!(!config.is_target("layers.0.mlp.fc1"));
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = PipelineConfig::preset_inference(128);
        let yaml = config.to_yaml_string().unwrap();
        assert_eq!(PipelineConfig::from_yaml_str(&yaml).unwrap(), config);
    }

    #[test]
    fn test_yaml_rejects_bad_group_size() {
        let err = PipelineConfig::from_yaml_str("quantization:\n  group_size: 6\n").unwrap_err();
        assert!(err.is_invalid_group_size());
    }

    #[test]
    fn test_yaml_rejects_garbage() {
        let err = PipelineConfig::from_yaml_str("quantization: [1, 2").unwrap_err();
        assert!(matches!(err, GroupQuantError::Yaml(_)));
    }

    #[test]
    fn test_empty_targets_match_everything() {
        let config = PipelineConfig::default();
        assert!(config.is_target("anything"));
    }

    #[test]
    fn test_with_group_size_leaves_original() {
        let base = PipelineConfig::preset_group(64);
        let other = base.with_group_size(16);
        assert_eq!(base.group_size(), 64);
        assert_eq!(other.group_size(), 16);
    }

    #[test]
    fn test_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.yaml");
        std::fs::write(&path, "model_name: from-file\n").unwrap();
        let config = PipelineConfig::from_path(&path).unwrap();
        assert_eq!(config.model_name, "from-file");
        assert!(PipelineConfig::from_path(dir.path().join("missing.yaml")).is_err());
    }
}

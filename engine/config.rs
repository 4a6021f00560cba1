//! Run configuration, loadable from TOML.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::embedding::OutputLayout;
use crate::randomized::RandomizedParams;
use crate::standardize::ZeroVariancePolicy;
use crate::table::{MissingPolicy, TableOptions};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    /// Sketch, project and factor; output does not depend on chunking.
    #[default]
    Randomized,
    /// Single streaming pass; output depends on chunk order and size.
    Incremental,
}

/// Where the incremental path gets its standardizer from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IncrementalScaler {
    /// Fit on the leading rows only, buffering chunks until there are max(k, 2).
    #[default]
    Bootstrap,
    /// Fit on a full moment pass before fitting the model.
    FullPass,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML config file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("chunk_size must be at least 1")]
    ZeroChunkSize,
    #[error("components must be at least 1")]
    ZeroComponents,
    #[error("variance_epsilon must be finite and non-negative, got {0}")]
    InvalidEpsilon(f64),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReduceConfig {
    pub chunk_size: usize,
    pub components: usize,
    pub oversampling: usize,
    pub power_iterations: usize,
    pub seed: u64,
    pub variance_epsilon: f64,
    pub zero_variance: ZeroVariancePolicy,
    pub missing: MissingPolicy,
    pub algorithm: Algorithm,
    pub incremental_scaler: IncrementalScaler,
    pub id_column: Option<String>,
    pub feature_filter: Option<String>,
    pub layout: OutputLayout,
}

impl Default for ReduceConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            components: 72,
            oversampling: 10,
            power_iterations: 0,
            seed: 42,
            variance_epsilon: 1e-12,
            zero_variance: ZeroVariancePolicy::ZeroFill,
            missing: MissingPolicy::Fail,
            algorithm: Algorithm::Randomized,
            incremental_scaler: IncrementalScaler::Bootstrap,
            id_column: None,
            feature_filter: None,
            layout: OutputLayout::Plink,
        }
    }
}

impl ReduceConfig {
    /// Reads a TOML file; absent keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }
        if self.components == 0 {
            return Err(ConfigError::ZeroComponents);
        }
        if !self.variance_epsilon.is_finite() || self.variance_epsilon < 0.0 {
            return Err(ConfigError::InvalidEpsilon(self.variance_epsilon));
        }
        Ok(())
    }

    pub fn table_options(&self) -> TableOptions {
        TableOptions {
            id_column: self.id_column.clone(),
            feature_filter: self.feature_filter.clone(),
            missing: self.missing,
        }
    }

    pub fn randomized_params(&self) -> RandomizedParams {
        RandomizedParams {
            components: self.components,
            oversampling: self.oversampling,
            power_iterations: self.power_iterations,
            seed: self.seed,
        }
    }
}

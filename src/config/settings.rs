//! Analysis settings
//!
//! Every field carries a serde default so partial JSON documents load:
//!
//! ```rust
//! use trueno_ab::config::{AnalysisSettings, EngineKind};
//!
//! let settings = AnalysisSettings::from_json(r#"{"engine": "bayesian", "alpha": 0.1}"#)?;
//! assert_eq!(settings.engine, EngineKind::Bayesian);
//! assert_eq!(settings.min_sample_size, 30);
//! # Ok::<(), trueno_ab::Error>(())
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Inference engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// z-test intervals and p-values (optionally sequential)
    #[default]
    Frequentist,
    /// Normal-normal posterior, chance to win and risk
    Bayesian,
}

/// Always-valid inference for repeated looks
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequentialSettings {
    /// Sample size at which the confidence sequence is tightest
    pub tuning_parameter: f64,
    /// The caller will look exactly once: report the fixed-horizon interval
    pub single_look: bool,
}

impl Default for SequentialSettings {
    fn default() -> Self {
        Self {
            tuning_parameter: 5000.0,
            single_look: false,
        }
    }
}

/// Prior on the relative effect for the Bayesian engine
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorSettings {
    /// Use the prior; otherwise the flat prior (posterior = likelihood)
    pub proper: bool,
    /// Prior mean of the relative effect
    pub mean: f64,
    /// Prior standard deviation of the relative effect
    pub stddev: f64,
}

impl Default for PriorSettings {
    fn default() -> Self {
        Self {
            proper: false,
            mean: 0.0,
            stddev: 0.3,
        }
    }
}

/// Quantile metric handling
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantileSettings {
    /// Use the dialect's native quantile function when it has one.
    /// Native summaries cannot be merged across partial batches.
    pub prefer_native: bool,
    /// Relative accuracy of the log-bucket sketch
    pub relative_accuracy: f64,
    /// Quantile-level offset used to estimate the density at the quantile
    pub density_bandwidth: f64,
}

impl Default for QuantileSettings {
    fn default() -> Self {
        Self {
            prefer_native: false,
            relative_accuracy: 0.01,
            density_bandwidth: 0.05,
        }
    }
}

/// Knobs for statistics, diagnostics and execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisSettings {
    /// Inference engine
    pub engine: EngineKind,
    /// Two-sided significance level
    pub alpha: f64,
    /// Minimum units per arm before effects are reported
    pub min_sample_size: u64,
    /// Sequential testing (frequentist engine)
    pub sequential: Option<SequentialSettings>,
    /// Bayesian prior
    pub prior: PriorSettings,
    /// Chance-to-win above which a Bayesian result is called
    pub chance_to_win_threshold: f64,
    /// SRM p-value below which the split is flagged
    pub srm_threshold: f64,
    /// Multiple-exposure fraction above which a warning is raised
    pub multiple_exposure_threshold: f64,
    /// Maximum warehouse queries in flight
    pub max_concurrency: usize,
    /// Quantile metric handling
    pub quantile: QuantileSettings,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            engine: EngineKind::Frequentist,
            alpha: 0.05,
            min_sample_size: 30,
            sequential: None,
            prior: PriorSettings::default(),
            chance_to_win_threshold: 0.95,
            srm_threshold: 0.001,
            multiple_exposure_threshold: 0.01,
            max_concurrency: 4,
            quantile: QuantileSettings::default(),
        }
    }
}

impl AnalysisSettings {
    /// Parse settings from JSON, filling unspecified fields with defaults
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigValidation`] if the document is malformed or
    /// the resulting settings are out of range
    pub fn from_json(json: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(json)
            .map_err(|e| Error::config("analysis settings", e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Switch to the Bayesian engine
    #[must_use]
    pub const fn bayesian(mut self) -> Self {
        self.engine = EngineKind::Bayesian;
        self
    }

    /// Enable sequential testing
    #[must_use]
    pub const fn with_sequential(mut self, sequential: SequentialSettings) -> Self {
        self.sequential = Some(sequential);
        self
    }

    /// Set the minimum units per arm
    #[must_use]
    pub const fn with_min_sample_size(mut self, n: u64) -> Self {
        self.min_sample_size = n;
        self
    }

    /// Set the warehouse concurrency bound
    #[must_use]
    pub const fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n;
        self
    }

    /// Check ranges
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigValidation`] naming the first out-of-range field
    pub fn validate(&self) -> Result<()> {
        let object = "analysis settings";
        let open_unit = |name: &str, v: f64| -> Result<()> {
            if v.is_finite() && v > 0.0 && v < 1.0 {
                Ok(())
            } else {
                Err(Error::config(object, format!("{name} must be in (0, 1), got {v}")))
            }
        };
        open_unit("alpha", self.alpha)?;
        open_unit("chance_to_win_threshold", self.chance_to_win_threshold)?;
        open_unit("srm_threshold", self.srm_threshold)?;
        open_unit("multiple_exposure_threshold", self.multiple_exposure_threshold)?;
        open_unit("quantile.relative_accuracy", self.quantile.relative_accuracy)?;
        if !(self.quantile.density_bandwidth > 0.0 && self.quantile.density_bandwidth < 0.5) {
            return Err(Error::config(object, "quantile.density_bandwidth must be in (0, 0.5)"));
        }
        if self.max_concurrency == 0 {
            return Err(Error::config(object, "max_concurrency must be at least 1"));
        }
        if let Some(seq) = &self.sequential {
            if !(seq.tuning_parameter.is_finite() && seq.tuning_parameter > 0.0) {
                return Err(Error::config(object, "sequential.tuning_parameter must be positive"));
            }
        }
        if self.prior.proper && !(self.prior.stddev.is_finite() && self.prior.stddev > 0.0) {
            return Err(Error::config(object, "prior.stddev must be positive for a proper prior"));
        }
        if !self.prior.mean.is_finite() {
            return Err(Error::config(object, "prior.mean must be finite"));
        }
        Ok(())
    }
}

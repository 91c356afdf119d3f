//! Statistics engine
//!
//! Consumes merged [`crate::warehouse::AggregateRow`]s and produces one
//! [`crate::results::AnalysisResult`] per (metric, dimension, variation).
//!
//! Toyota Way Principles:
//! - Jidoka: a failing cell stops itself, never the run
//! - Poka-Yoke: zero variance, zero denominators and thin arms resolve to
//!   insufficient data before any division happens
//!
//! ```rust
//! use trueno_ab::stats::{ArmEstimate, Difference, Moments};
//!
//! let control = ArmEstimate::mean(&Moments::from_sums(1000, 500.0, 500.0).unwrap(), 1000);
//! let treatment = ArmEstimate::mean(&Moments::from_sums(1000, 560.0, 560.0).unwrap(), 1000);
//! let diff = Difference::between(&control, &treatment).unwrap();
//! assert!((diff.relative - 0.12).abs() < 1e-12);
//! ```

pub mod bayesian;
pub mod distributions;
mod engine;
pub mod frequentist;
mod moments;
mod quantile;
pub mod sequential;

pub use engine::{analyze, StatsEngine};
pub use frequentist::Difference;
pub use moments::{covariance, cuped_adjust, ArmEstimate, CupedArm, Moments};
pub use quantile::{LogSketch, QuantileSample, QuantileSummary};

//! Metric definitions

use serde::{Deserialize, Serialize};

/// How a metric's per-unit value is extracted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Number of qualifying events per unit
    Count,
    /// Sum of a numeric column per unit
    Sum,
    /// Per-unit numerator over per-unit denominator, aggregated as a ratio of means
    Ratio,
    /// Whether the unit had any qualifying event
    Binary,
    /// A quantile of per-unit sums
    Quantile,
    /// Seconds from first exposure to first qualifying event (converting units only)
    Duration,
}

/// Which value of a fact table row feeds the metric
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnSelector {
    /// Each row counts as 1
    Rows,
    /// A numeric column
    Column(String),
}

/// Reference to a value on a fact table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRef {
    /// Fact table id
    pub fact_table: String,
    /// Value selector
    pub column: ColumnSelector,
    /// Ids of the fact table's row filters to apply
    #[serde(default)]
    pub filters: Vec<String>,
}

impl ColumnRef {
    /// Count rows of `fact_table`
    #[must_use]
    pub fn rows(fact_table: impl Into<String>) -> Self {
        Self {
            fact_table: fact_table.into(),
            column: ColumnSelector::Rows,
            filters: Vec::new(),
        }
    }

    /// Use numeric `column` of `fact_table`
    #[must_use]
    pub fn column(fact_table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            fact_table: fact_table.into(),
            column: ColumnSelector::Column(column.into()),
            filters: Vec::new(),
        }
    }

    /// Apply a row filter
    #[must_use]
    pub fn with_filter(mut self, filter_id: impl Into<String>) -> Self {
        self.filters.push(filter_id.into());
        self
    }
}

/// Outlier cap applied to per-unit values before aggregation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapPolicy {
    /// Clamp values above a fixed threshold
    Absolute {
        /// Maximum per-unit value
        value: f64,
    },
    /// Clamp values above the `p`-th percentile of per-unit values
    Percentile {
        /// Percentile in `(0, 1]`
        p: f64,
        /// Compute the percentile over non-zero units only
        #[serde(default)]
        ignore_zeros: bool,
    },
}

/// Window after first exposure in which events count
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConversionWindow {
    /// Hours after exposure before events start counting
    #[serde(default)]
    pub delay_hours: f64,
    /// Length of the window; `None` counts until the analysis end
    #[serde(default)]
    pub duration_hours: Option<f64>,
}

impl Default for ConversionWindow {
    fn default() -> Self {
        Self {
            delay_hours: 0.0,
            duration_hours: None,
        }
    }
}

/// Pre-exposure covariate for CUPED: the metric's own value over a lookback
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Covariate {
    /// Hours before first exposure to look back
    pub lookback_hours: f64,
}

/// Quantile metric parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantileSpec {
    /// Quantile level in `(0, 1)`
    pub q: f64,
    /// Exclude units whose value is zero
    #[serde(default)]
    pub ignore_zeros: bool,
}

/// Metric to analyze. Immutable for the duration of an analysis run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDefinition {
    /// Unique identifier
    pub id: String,
    /// Value extraction kind
    pub kind: MetricKind,
    /// Main value (numerator for ratios)
    pub numerator: ColumnRef,
    /// Denominator (ratio metrics only)
    #[serde(default)]
    pub denominator: Option<ColumnRef>,
    /// Outlier cap
    #[serde(default)]
    pub cap: Option<CapPolicy>,
    /// Conversion window
    #[serde(default)]
    pub window: ConversionWindow,
    /// CUPED covariate
    #[serde(default)]
    pub covariate: Option<Covariate>,
    /// Quantile parameters (quantile metrics only)
    #[serde(default)]
    pub quantile: Option<QuantileSpec>,
    /// Lower values are better
    #[serde(default)]
    pub inverse: bool,
}

impl MetricDefinition {
    fn base(id: impl Into<String>, kind: MetricKind, numerator: ColumnRef) -> Self {
        Self {
            id: id.into(),
            kind,
            numerator,
            denominator: None,
            cap: None,
            window: ConversionWindow::default(),
            covariate: None,
            quantile: None,
            inverse: false,
        }
    }

    /// Count of events per unit
    #[must_use]
    pub fn count(id: impl Into<String>, fact_table: impl Into<String>) -> Self {
        Self::base(id, MetricKind::Count, ColumnRef::rows(fact_table))
    }

    /// Sum of `column` per unit
    #[must_use]
    pub fn sum(id: impl Into<String>, fact_table: impl Into<String>, column: impl Into<String>) -> Self {
        Self::base(id, MetricKind::Sum, ColumnRef::column(fact_table, column))
    }

    /// Conversion (any event) per unit
    #[must_use]
    pub fn binary(id: impl Into<String>, fact_table: impl Into<String>) -> Self {
        Self::base(id, MetricKind::Binary, ColumnRef::rows(fact_table))
    }

    /// Ratio of two per-unit values
    #[must_use]
    pub fn ratio(id: impl Into<String>, numerator: ColumnRef, denominator: ColumnRef) -> Self {
        let mut metric = Self::base(id, MetricKind::Ratio, numerator);
        metric.denominator = Some(denominator);
        metric
    }

    /// Quantile `q` of per-unit sums of `column`
    #[must_use]
    pub fn quantile(
        id: impl Into<String>,
        fact_table: impl Into<String>,
        column: impl Into<String>,
        q: f64,
    ) -> Self {
        let mut metric = Self::base(id, MetricKind::Quantile, ColumnRef::column(fact_table, column));
        metric.quantile = Some(QuantileSpec {
            q,
            ignore_zeros: false,
        });
        metric
    }

    /// Seconds from first exposure to first event
    #[must_use]
    pub fn duration(id: impl Into<String>, fact_table: impl Into<String>) -> Self {
        Self::base(id, MetricKind::Duration, ColumnRef::rows(fact_table))
    }

    /// Set an outlier cap
    #[must_use]
    pub const fn with_cap(mut self, cap: CapPolicy) -> Self {
        self.cap = Some(cap);
        self
    }

    /// Set the conversion window
    #[must_use]
    pub const fn with_window(mut self, delay_hours: f64, duration_hours: Option<f64>) -> Self {
        self.window = ConversionWindow {
            delay_hours,
            duration_hours,
        };
        self
    }

    /// Enable CUPED with a pre-exposure lookback
    #[must_use]
    pub const fn with_covariate(mut self, lookback_hours: f64) -> Self {
        self.covariate = Some(Covariate { lookback_hours });
        self
    }

    /// Mark lower values as better
    #[must_use]
    pub const fn inverse(mut self) -> Self {
        self.inverse = true;
        self
    }

    /// Apply a row filter to the numerator
    #[must_use]
    pub fn with_filter(mut self, filter_id: impl Into<String>) -> Self {
        self.numerator.filters.push(filter_id.into());
        self
    }

    /// SQL-safe form of the id, used in generated column and relation names
    #[must_use]
    pub fn slug(&self) -> String {
        self.id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
            .collect()
    }

    /// Whether values are unbounded per unit (eligible for capping)
    #[must_use]
    pub const fn is_cappable(&self) -> bool {
        !matches!(self.kind, MetricKind::Binary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slug_is_sql_safe() {
        let metric = MetricDefinition::count("Checkout-Rate v2", "orders");
        assert_eq!(metric.slug(), "checkout_rate_v2");
    }

    #[test]
    fn test_constructors_set_kind_specific_fields() {
        let ratio = MetricDefinition::ratio(
            "aov",
            ColumnRef::column("orders", "amount"),
            ColumnRef::rows("orders"),
        );
        assert_eq!(ratio.kind, MetricKind::Ratio);
        assert!(ratio.denominator.is_some());

        let p90 = MetricDefinition::quantile("p90", "orders", "amount", 0.9);
        assert_eq!(p90.quantile.map(|q| q.q), Some(0.9));
    }

    #[test]
    fn test_metric_deserializes_with_defaults() {
        let json = r#"{
            "id": "purchases",
            "kind": "count",
            "numerator": {"fact_table": "orders", "column": "rows"}
        }"#;
        let metric: MetricDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(metric.window, ConversionWindow::default());
        assert!(metric.cap.is_none());
        assert!(!metric.inverse);
    }
}

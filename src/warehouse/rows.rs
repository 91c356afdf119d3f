//! Aggregate rows decoded from warehouse batches
//!
//! Column names come from [`crate::fragment::columns`], the same constants
//! the aggregation builder aliases its output with. Numeric columns are
//! accepted in whatever width the warehouse returns them.

use crate::config::{MetricDefinition, MetricKind};
use crate::fragment::columns;
use crate::results::DimensionKey;
use crate::stats::{LogSketch, QuantileSummary};
use crate::{Error, Result};
use arrow::array::{
    Array, ArrayRef, Decimal128Array, Float32Array, Float64Array, Int32Array, Int64Array,
    LargeStringArray, StringArray, UInt64Array,
};
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Ratio sufficient statistics; always present together with the numerator sums
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RatioSums {
    /// Σ denominator
    pub denominator_sum: f64,
    /// Σ denominator²
    pub denominator_sum_squares: f64,
    /// Σ numerator·denominator
    pub main_denominator_sum_product: f64,
}

/// CUPED covariate sufficient statistics
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CovariateSums {
    /// Σ covariate
    pub covariate_sum: f64,
    /// Σ covariate²
    pub covariate_sum_squares: f64,
    /// Σ value·covariate
    pub main_covariate_sum_product: f64,
}

/// Sufficient statistics for one (metric, variation, dimension)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRow {
    /// Metric id
    pub metric_id: String,
    /// Variation id
    pub variation: String,
    /// Dimension slice
    pub dimension: DimensionKey,
    /// Units contributing a value
    pub units: u64,
    /// Σ value
    pub main_sum: f64,
    /// Σ value²
    pub main_sum_squares: f64,
    /// Ratio sums (ratio metrics)
    pub ratio: Option<RatioSums>,
    /// Covariate sums (CUPED metrics)
    pub covariate: Option<CovariateSums>,
    /// Quantile summary (quantile metrics)
    pub quantile: Option<QuantileSummary>,
}

impl AggregateRow {
    /// Row with the main sums only
    #[must_use]
    pub fn new(
        metric_id: impl Into<String>,
        variation: impl Into<String>,
        dimension: DimensionKey,
        units: u64,
        main_sum: f64,
        main_sum_squares: f64,
    ) -> Self {
        Self {
            metric_id: metric_id.into(),
            variation: variation.into(),
            dimension,
            units,
            main_sum,
            main_sum_squares,
            ratio: None,
            covariate: None,
            quantile: None,
        }
    }

    /// Attach ratio sums
    #[must_use]
    pub const fn with_ratio(mut self, ratio: RatioSums) -> Self {
        self.ratio = Some(ratio);
        self
    }

    /// Attach covariate sums
    #[must_use]
    pub const fn with_covariate(mut self, covariate: CovariateSums) -> Self {
        self.covariate = Some(covariate);
        self
    }

    /// Attach a quantile summary
    #[must_use]
    pub fn with_quantile(mut self, quantile: QuantileSummary) -> Self {
        self.quantile = Some(quantile);
        self
    }

    /// Merge a partial row for the same key by addition
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] if the keys differ or one side carries sums
    /// the other lacks, and propagates summary merge failures
    pub fn merge(&mut self, other: &Self) -> Result<()> {
        if self.metric_id != other.metric_id || self.variation != other.variation || self.dimension != other.dimension {
            return Err(Error::Decode(format!(
                "cannot merge rows for ({}, {}, {}) and ({}, {}, {})",
                self.metric_id, self.variation, self.dimension, other.metric_id, other.variation, other.dimension
            )));
        }
        let shape_mismatch =
            || Error::Decode(format!("partial rows for metric '{}' have different shapes", self.metric_id));

        self.ratio = match (self.ratio, other.ratio) {
            (None, None) => None,
            (Some(a), Some(b)) => Some(RatioSums {
                denominator_sum: a.denominator_sum + b.denominator_sum,
                denominator_sum_squares: a.denominator_sum_squares + b.denominator_sum_squares,
                main_denominator_sum_product: a.main_denominator_sum_product + b.main_denominator_sum_product,
            }),
            _ => return Err(shape_mismatch()),
        };
        self.covariate = match (self.covariate, other.covariate) {
            (None, None) => None,
            (Some(a), Some(b)) => Some(CovariateSums {
                covariate_sum: a.covariate_sum + b.covariate_sum,
                covariate_sum_squares: a.covariate_sum_squares + b.covariate_sum_squares,
                main_covariate_sum_product: a.main_covariate_sum_product + b.main_covariate_sum_product,
            }),
            _ => return Err(shape_mismatch()),
        };
        match (&mut self.quantile, &other.quantile) {
            (None, None) => {}
            (Some(a), Some(b)) => a.merge(b)?,
            _ => return Err(shape_mismatch()),
        }
        self.units += other.units;
        self.main_sum += other.main_sum;
        self.main_sum_squares += other.main_sum_squares;
        Ok(())
    }
}

/// Units per (variation, dimension), sentinel variation included
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficRow {
    /// Variation id (or the multiple-exposure sentinel)
    pub variation: String,
    /// Dimension slice
    pub dimension: DimensionKey,
    /// Units
    pub units: u64,
}

fn column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a ArrayRef> {
    let schema = batch.schema();
    let index = schema
        .fields()
        .iter()
        .position(|f| f.name() == name)
        .ok_or_else(|| Error::Decode(format!("Column not found: {name}")))?;
    Ok(batch.column(index))
}

fn downcast<'a, T: 'static>(array: &'a ArrayRef, type_name: &str) -> Result<&'a T> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| Error::Decode(format!("Failed to downcast to {type_name}")))
}

fn collect<A, F>(array: &A, get: F) -> Vec<Option<f64>>
where
    A: Array,
    F: Fn(usize) -> f64,
{
    (0..array.len())
        .map(|i| if array.is_null(i) { None } else { Some(get(i)) })
        .collect()
}

#[allow(clippy::cast_precision_loss)]
fn float_column(batch: &RecordBatch, name: &str) -> Result<Vec<Option<f64>>> {
    let array = column(batch, name)?;
    let values = match array.data_type() {
        DataType::Float64 => {
            let a = downcast::<Float64Array>(array, "Float64Array")?;
            collect(a, |i| a.value(i))
        }
        DataType::Float32 => {
            let a = downcast::<Float32Array>(array, "Float32Array")?;
            collect(a, |i| f64::from(a.value(i)))
        }
        DataType::Int64 => {
            let a = downcast::<Int64Array>(array, "Int64Array")?;
            collect(a, |i| a.value(i) as f64)
        }
        DataType::Int32 => {
            let a = downcast::<Int32Array>(array, "Int32Array")?;
            collect(a, |i| f64::from(a.value(i)))
        }
        DataType::UInt64 => {
            let a = downcast::<UInt64Array>(array, "UInt64Array")?;
            collect(a, |i| a.value(i) as f64)
        }
        DataType::Decimal128(_, scale) => {
            let a = downcast::<Decimal128Array>(array, "Decimal128Array")?;
            let divisor = 10f64.powi(i32::from(*scale));
            collect(a, |i| a.value(i) as f64 / divisor)
        }
        other => {
            return Err(Error::Decode(format!(
                "column '{name}' has non-numeric type {other}"
            )))
        }
    };
    Ok(values)
}

fn count_column(batch: &RecordBatch, name: &str) -> Result<Vec<u64>> {
    float_column(batch, name)?
        .into_iter()
        .map(|v| match v {
            None => Ok(0),
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            Some(v) if v.is_finite() && v >= 0.0 && v.fract() == 0.0 => Ok(v as u64),
            Some(v) => Err(Error::Decode(format!("column '{name}' holds invalid count {v}"))),
        })
        .collect()
}

fn string_column(batch: &RecordBatch, name: &str) -> Result<Vec<Option<String>>> {
    let array = column(batch, name)?;
    let values = match array.data_type() {
        DataType::Utf8 => {
            let a = downcast::<StringArray>(array, "StringArray")?;
            (0..a.len())
                .map(|i| (!a.is_null(i)).then(|| a.value(i).to_string()))
                .collect()
        }
        DataType::LargeUtf8 => {
            let a = downcast::<LargeStringArray>(array, "LargeStringArray")?;
            (0..a.len())
                .map(|i| (!a.is_null(i)).then(|| a.value(i).to_string()))
                .collect()
        }
        other => {
            return Err(Error::Decode(format!("column '{name}' has non-string type {other}")))
        }
    };
    Ok(values)
}

fn required(value: Option<String>, name: &str) -> Result<String> {
    value.ok_or_else(|| Error::Decode(format!("column '{name}' is null")))
}

/// Key columns shared by metric and traffic rows
struct Keys {
    variation: Vec<Option<String>>,
    dimension_name: Vec<Option<String>>,
    dimension_value: Vec<Option<String>>,
}

impl Keys {
    fn read(batch: &RecordBatch) -> Result<Self> {
        Ok(Self {
            variation: string_column(batch, columns::VARIATION)?,
            dimension_name: string_column(batch, columns::DIMENSION_NAME)?,
            dimension_value: string_column(batch, columns::DIMENSION_VALUE)?,
        })
    }

    fn take(&mut self, row: usize) -> Result<(String, DimensionKey)> {
        let variation = required(self.variation[row].take(), columns::VARIATION)?;
        let name = required(self.dimension_name[row].take(), columns::DIMENSION_NAME)?;
        let value = required(self.dimension_value[row].take(), columns::DIMENSION_VALUE)?;
        Ok((variation, DimensionKey::new(name, value)))
    }
}

fn sum(values: &[Option<f64>], row: usize) -> f64 {
    values[row].unwrap_or(0.0)
}

/// Decode one metric step's batches into merged rows, sorted by key
pub(crate) fn decode_metric_rows(
    metric: &MetricDefinition,
    batches: &[RecordBatch],
    relative_accuracy: f64,
) -> Result<Vec<AggregateRow>> {
    let mut merged: BTreeMap<(DimensionKey, String), AggregateRow> = BTreeMap::new();
    for batch in batches {
        if batch.num_rows() == 0 {
            continue;
        }
        let mut keys = Keys::read(batch)?;
        let users = count_column(batch, columns::USERS)?;
        let main_sum = float_column(batch, columns::MAIN_SUM)?;
        let main_sum_squares = float_column(batch, columns::MAIN_SUM_SQUARES)?;

        let ratio = if metric.kind == MetricKind::Ratio {
            Some((
                float_column(batch, columns::DENOMINATOR_SUM)?,
                float_column(batch, columns::DENOMINATOR_SUM_SQUARES)?,
                float_column(batch, columns::MAIN_DENOMINATOR_SUM_PRODUCT)?,
            ))
        } else {
            None
        };
        let covariate = if metric.covariate.is_some() {
            Some((
                float_column(batch, columns::COVARIATE_SUM)?,
                float_column(batch, columns::COVARIATE_SUM_SQUARES)?,
                float_column(batch, columns::MAIN_COVARIATE_SUM_PRODUCT)?,
            ))
        } else {
            None
        };
        let native = batch.schema().fields().iter().any(|f| f.name() == columns::QUANTILE_VALUE);
        let quantile_columns = match (metric.kind, native) {
            (MetricKind::Quantile, true) => Some(QuantileColumns::Native(
                float_column(batch, columns::QUANTILE_VALUE)?,
                float_column(batch, columns::QUANTILE_LOWER)?,
                float_column(batch, columns::QUANTILE_UPPER)?,
            )),
            (MetricKind::Quantile, false) => Some(QuantileColumns::Buckets(
                float_column(batch, columns::BUCKET_SIGN)?,
                float_column(batch, columns::BUCKET_INDEX)?,
            )),
            _ => None,
        };

        for row in 0..batch.num_rows() {
            let (variation, dimension) = keys.take(row)?;
            let mut aggregate = AggregateRow::new(
                &metric.id,
                variation,
                dimension,
                users[row],
                sum(&main_sum, row),
                sum(&main_sum_squares, row),
            );
            if let Some((d, dd, nd)) = &ratio {
                aggregate = aggregate.with_ratio(RatioSums {
                    denominator_sum: sum(d, row),
                    denominator_sum_squares: sum(dd, row),
                    main_denominator_sum_product: sum(nd, row),
                });
            }
            if let Some((c, cc, nc)) = &covariate {
                aggregate = aggregate.with_covariate(CovariateSums {
                    covariate_sum: sum(c, row),
                    covariate_sum_squares: sum(cc, row),
                    main_covariate_sum_product: sum(nc, row),
                });
            }
            match &quantile_columns {
                Some(QuantileColumns::Native(value, lower, upper)) => {
                    if let (Some(value), Some(lower), Some(upper)) = (value[row], lower[row], upper[row]) {
                        aggregate = aggregate.with_quantile(QuantileSummary::Native { value, lower, upper });
                    }
                }
                Some(QuantileColumns::Buckets(sign, index)) => {
                    let mut sketch = LogSketch::new(relative_accuracy);
                    #[allow(clippy::cast_possible_truncation)]
                    let (sign, index) = (sum(sign, row) as i8, sum(index, row) as i32);
                    sketch.add_bucket(sign, index, users[row]);
                    aggregate = aggregate.with_quantile(QuantileSummary::Sketch(sketch));
                }
                None => {}
            }

            let key = (aggregate.dimension.clone(), aggregate.variation.clone());
            match merged.get_mut(&key) {
                Some(existing) => existing.merge(&aggregate)?,
                None => {
                    merged.insert(key, aggregate);
                }
            }
        }
    }
    Ok(merged.into_values().collect())
}

enum QuantileColumns {
    Native(Vec<Option<f64>>, Vec<Option<f64>>, Vec<Option<f64>>),
    Buckets(Vec<Option<f64>>, Vec<Option<f64>>),
}

/// Decode the traffic step's batches, summing duplicate keys
pub(crate) fn decode_traffic_rows(batches: &[RecordBatch]) -> Result<Vec<TrafficRow>> {
    let mut merged: BTreeMap<(DimensionKey, String), u64> = BTreeMap::new();
    for batch in batches {
        if batch.num_rows() == 0 {
            continue;
        }
        let mut keys = Keys::read(batch)?;
        let units = count_column(batch, columns::UNITS)?;
        for (row, &n) in units.iter().enumerate() {
            let (variation, dimension) = keys.take(row)?;
            *merged.entry((dimension, variation)).or_insert(0) += n;
        }
    }
    Ok(merged
        .into_iter()
        .map(|((dimension, variation), units)| TrafficRow {
            variation,
            dimension,
            units,
        })
        .collect())
}

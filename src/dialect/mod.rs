//! Dialect capability table
//!
//! Every warehouse difference the fragment builders care about lives in one
//! `const` row per dialect: function templates, type names, quoting rules and
//! table-replacement strategy. Builders never branch on the dialect id; they
//! render through the capabilities they are handed.
//!
//! Templates use `{name}` placeholders filled by [`render_template`] in a
//! single pass, so substituted text is never re-scanned.
//!
//! ## Supported dialects
//!
//! | Dialect    | Native quantile           | Replace table          |
//! |------------|---------------------------|------------------------|
//! | Postgres   | -                         | drop + create          |
//! | Redshift   | `APPROXIMATE PERCENTILE`  | drop + create          |
//! | Snowflake  | `APPROX_PERCENTILE`       | `CREATE OR REPLACE`    |
//! | BigQuery   | `APPROX_QUANTILES`        | `CREATE OR REPLACE`    |
//! | DuckDB     | `APPROX_QUANTILE`         | `CREATE OR REPLACE`    |
//! | Databricks | `PERCENTILE_APPROX`       | `CREATE OR REPLACE`    |
//! | ClickHouse | `quantile`                | `CREATE OR REPLACE`    |

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Warehouse dialect identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialectId {
    /// PostgreSQL
    Postgres,
    /// Amazon Redshift
    Redshift,
    /// Snowflake
    Snowflake,
    /// Google `BigQuery`
    BigQuery,
    /// `DuckDB`
    DuckDb,
    /// Databricks SQL / Spark SQL
    Databricks,
    /// `ClickHouse`
    ClickHouse,
}

impl DialectId {
    /// All dialects in the capability table
    pub const ALL: [Self; 7] = [
        Self::Postgres,
        Self::Redshift,
        Self::Snowflake,
        Self::BigQuery,
        Self::DuckDb,
        Self::Databricks,
        Self::ClickHouse,
    ];

    /// Canonical lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Redshift => "redshift",
            Self::Snowflake => "snowflake",
            Self::BigQuery => "bigquery",
            Self::DuckDb => "duckdb",
            Self::Databricks => "databricks",
            Self::ClickHouse => "clickhouse",
        }
    }

    /// Capabilities for this dialect
    #[must_use]
    pub const fn capabilities(self) -> &'static DialectCapabilities {
        match self {
            Self::Postgres => &POSTGRES,
            Self::Redshift => &REDSHIFT,
            Self::Snowflake => &SNOWFLAKE,
            Self::BigQuery => &BIGQUERY,
            Self::DuckDb => &DUCKDB,
            Self::Databricks => &DATABRICKS,
            Self::ClickHouse => &CLICKHOUSE,
        }
    }
}

impl fmt::Display for DialectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DialectId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "redshift" => Ok(Self::Redshift),
            "snowflake" => Ok(Self::Snowflake),
            "bigquery" => Ok(Self::BigQuery),
            "duckdb" => Ok(Self::DuckDb),
            "databricks" | "spark" => Ok(Self::Databricks),
            "clickhouse" => Ok(Self::ClickHouse),
            _ => Err(Error::UnsupportedDialect(s.to_string())),
        }
    }
}

/// Look up the capability row for a dialect name
///
/// # Errors
///
/// Returns [`Error::UnsupportedDialect`] for names not in the table
pub fn capabilities_for(dialect: &str) -> Result<&'static DialectCapabilities> {
    dialect.parse::<DialectId>().map(DialectId::capabilities)
}

/// How single quotes inside string literals are escaped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuoteEscape {
    /// `'it''s'`
    Double,
    /// `'it\'s'` (backslashes escaped as well)
    Backslash,
}

/// Read-only description of what a warehouse can express
#[derive(Debug, Clone, PartialEq)]
pub struct DialectCapabilities {
    /// Dialect this row describes
    pub id: DialectId,
    /// Character used to quote identifiers that are not plain
    pub identifier_quote: char,
    /// String literal escaping
    pub quote_escape: QuoteEscape,
    /// Double precision type name
    pub float_type: &'static str,
    /// 64-bit integer type name
    pub integer_type: &'static str,
    /// String type name
    pub string_type: &'static str,
    /// Timestamp literal template: `{value}`
    pub timestamp_literal: &'static str,
    /// Interval arithmetic template: `{ts}`, `{minutes}`
    pub add_minutes: &'static str,
    /// Elapsed seconds template: `{start}`, `{end}`
    pub seconds_between: &'static str,
    /// Day truncation template: `{ts}`
    pub date_trunc_day: &'static str,
    /// Whether the dialect has native array types and indexing
    pub supports_arrays: bool,
    /// Percentile template used for outlier caps: `{expr}`, `{p}`, `{per_mille}`
    pub percentile: &'static str,
    /// Native approximate quantile template for quantile metrics, if any
    pub approx_quantile: Option<&'static str>,
    /// Nominal rank error of `approx_quantile` (0 for exact functions)
    pub approx_quantile_rank_error: f64,
    /// Table materialization template: `{name}`, `{body}`
    pub create_table_as: &'static str,
    /// Whether `create_table_as` must be preceded by `DROP TABLE IF EXISTS`
    pub drop_before_create: bool,
}

const POSTGRES: DialectCapabilities = DialectCapabilities {
    id: DialectId::Postgres,
    identifier_quote: '"',
    quote_escape: QuoteEscape::Double,
    float_type: "DOUBLE PRECISION",
    integer_type: "BIGINT",
    string_type: "VARCHAR",
    timestamp_literal: "TIMESTAMP '{value}'",
    add_minutes: "({ts} + INTERVAL '{minutes} minutes')",
    seconds_between: "EXTRACT(EPOCH FROM ({end} - {start}))",
    date_trunc_day: "DATE_TRUNC('day', {ts})",
    supports_arrays: true,
    percentile: "PERCENTILE_CONT({p}) WITHIN GROUP (ORDER BY {expr})",
    approx_quantile: None,
    approx_quantile_rank_error: 0.0,
    create_table_as: "CREATE TABLE {name} AS {body}",
    drop_before_create: true,
};

const REDSHIFT: DialectCapabilities = DialectCapabilities {
    id: DialectId::Redshift,
    identifier_quote: '"',
    quote_escape: QuoteEscape::Double,
    float_type: "DOUBLE PRECISION",
    integer_type: "BIGINT",
    string_type: "VARCHAR",
    timestamp_literal: "TIMESTAMP '{value}'",
    add_minutes: "DATEADD(minute, {minutes}, {ts})",
    seconds_between: "DATEDIFF(second, {start}, {end})",
    date_trunc_day: "DATE_TRUNC('day', {ts})",
    supports_arrays: false,
    percentile: "APPROXIMATE PERCENTILE_DISC({p}) WITHIN GROUP (ORDER BY {expr})",
    approx_quantile: Some("APPROXIMATE PERCENTILE_DISC({p}) WITHIN GROUP (ORDER BY {expr})"),
    approx_quantile_rank_error: 0.01,
    create_table_as: "CREATE TABLE {name} AS {body}",
    drop_before_create: true,
};

const SNOWFLAKE: DialectCapabilities = DialectCapabilities {
    id: DialectId::Snowflake,
    identifier_quote: '"',
    quote_escape: QuoteEscape::Double,
    float_type: "DOUBLE",
    integer_type: "BIGINT",
    string_type: "VARCHAR",
    timestamp_literal: "TO_TIMESTAMP('{value}')",
    add_minutes: "DATEADD(minute, {minutes}, {ts})",
    seconds_between: "DATEDIFF(second, {start}, {end})",
    date_trunc_day: "DATE_TRUNC('day', {ts})",
    supports_arrays: true,
    percentile: "APPROX_PERCENTILE({expr}, {p})",
    approx_quantile: Some("APPROX_PERCENTILE({expr}, {p})"),
    approx_quantile_rank_error: 0.01,
    create_table_as: "CREATE OR REPLACE TABLE {name} AS {body}",
    drop_before_create: false,
};

const BIGQUERY: DialectCapabilities = DialectCapabilities {
    id: DialectId::BigQuery,
    identifier_quote: '`',
    quote_escape: QuoteEscape::Backslash,
    float_type: "FLOAT64",
    integer_type: "INT64",
    string_type: "STRING",
    timestamp_literal: "TIMESTAMP '{value}'",
    add_minutes: "TIMESTAMP_ADD({ts}, INTERVAL {minutes} MINUTE)",
    seconds_between: "TIMESTAMP_DIFF({end}, {start}, SECOND)",
    date_trunc_day: "TIMESTAMP_TRUNC({ts}, DAY)",
    supports_arrays: true,
    percentile: "APPROX_QUANTILES({expr}, 1000)[OFFSET({per_mille})]",
    approx_quantile: Some("APPROX_QUANTILES({expr}, 1000)[OFFSET({per_mille})]"),
    approx_quantile_rank_error: 0.001,
    create_table_as: "CREATE OR REPLACE TABLE {name} AS {body}",
    drop_before_create: false,
};

const DUCKDB: DialectCapabilities = DialectCapabilities {
    id: DialectId::DuckDb,
    identifier_quote: '"',
    quote_escape: QuoteEscape::Double,
    float_type: "DOUBLE",
    integer_type: "BIGINT",
    string_type: "VARCHAR",
    timestamp_literal: "TIMESTAMP '{value}'",
    add_minutes: "({ts} + INTERVAL '{minutes} minutes')",
    seconds_between: "DATE_DIFF('second', {start}, {end})",
    date_trunc_day: "DATE_TRUNC('day', {ts})",
    supports_arrays: true,
    percentile: "QUANTILE_CONT({expr}, {p})",
    approx_quantile: Some("APPROX_QUANTILE({expr}, {p})"),
    approx_quantile_rank_error: 0.01,
    create_table_as: "CREATE OR REPLACE TABLE {name} AS {body}",
    drop_before_create: false,
};

const DATABRICKS: DialectCapabilities = DialectCapabilities {
    id: DialectId::Databricks,
    identifier_quote: '`',
    quote_escape: QuoteEscape::Backslash,
    float_type: "DOUBLE",
    integer_type: "BIGINT",
    string_type: "STRING",
    timestamp_literal: "TIMESTAMP '{value}'",
    add_minutes: "TIMESTAMPADD(MINUTE, {minutes}, {ts})",
    seconds_between: "TIMESTAMPDIFF(SECOND, {start}, {end})",
    date_trunc_day: "DATE_TRUNC('DAY', {ts})",
    supports_arrays: true,
    percentile: "PERCENTILE_APPROX({expr}, {p})",
    approx_quantile: Some("PERCENTILE_APPROX({expr}, {p}, 10000)"),
    approx_quantile_rank_error: 0.0001,
    create_table_as: "CREATE OR REPLACE TABLE {name} AS {body}",
    drop_before_create: false,
};

const CLICKHOUSE: DialectCapabilities = DialectCapabilities {
    id: DialectId::ClickHouse,
    identifier_quote: '`',
    quote_escape: QuoteEscape::Backslash,
    float_type: "Float64",
    integer_type: "Int64",
    string_type: "String",
    timestamp_literal: "toDateTime('{value}')",
    add_minutes: "addMinutes({ts}, {minutes})",
    seconds_between: "dateDiff('second', {start}, {end})",
    date_trunc_day: "toStartOfDay({ts})",
    supports_arrays: true,
    percentile: "quantile({p})({expr})",
    approx_quantile: Some("quantile({p})({expr})"),
    approx_quantile_rank_error: 0.01,
    create_table_as: "CREATE OR REPLACE TABLE {name} ENGINE = MergeTree ORDER BY tuple() AS {body}",
    drop_before_create: false,
};

/// Fill `{name}` placeholders in a template in one left-to-right pass
///
/// Unknown placeholders are left untouched so that literal braces inside
/// user-facing SQL survive.
#[must_use]
pub fn render_template(template: &str, args: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len() + 32);
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let replaced = after.find('}').and_then(|close| {
            let key = &after[..close];
            args.iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| (close, *value))
        });
        match replaced {
            Some((close, value)) => {
                out.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Format a float as a SQL numeric literal
///
/// Integral values keep a trailing `.0` so every dialect treats them as
/// floating point; output is deterministic for identical input.
#[must_use]
pub fn float_literal(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{value:.1}")
    } else {
        format!("{value}")
    }
}

fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl DialectCapabilities {
    /// Quote an identifier when it is not a plain `[A-Za-z_][A-Za-z0-9_]*` name
    ///
    /// Plain names are left bare so case-folding warehouses resolve them the
    /// same way the user's own SQL does.
    #[must_use]
    pub fn quote_ident(&self, name: &str) -> String {
        if is_plain_identifier(name) {
            return name.to_string();
        }
        let q = self.identifier_quote;
        let escaped = name.replace(q, &format!("{q}{q}"));
        format!("{q}{escaped}{q}")
    }

    /// Quote a possibly qualified relation name (`schema.table`)
    #[must_use]
    pub fn quote_relation(&self, name: &str) -> String {
        name.split('.')
            .map(|part| self.quote_ident(part))
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Render a string literal
    #[must_use]
    pub fn string_literal(&self, value: &str) -> String {
        let escaped = match self.quote_escape {
            QuoteEscape::Double => value.replace('\'', "''"),
            QuoteEscape::Backslash => value.replace('\\', "\\\\").replace('\'', "\\'"),
        };
        format!("'{escaped}'")
    }

    /// Render a UTC timestamp literal
    #[must_use]
    pub fn timestamp_literal(&self, ts: &chrono::DateTime<chrono::Utc>) -> String {
        let value = ts.format("%Y-%m-%d %H:%M:%S").to_string();
        render_template(self.timestamp_literal, &[("value", &value)])
    }

    /// `ts + minutes` (minutes may be negative)
    #[must_use]
    pub fn add_minutes(&self, ts: &str, minutes: i64) -> String {
        if minutes == 0 {
            return ts.to_string();
        }
        let minutes = minutes.to_string();
        render_template(self.add_minutes, &[("ts", ts), ("minutes", &minutes)])
    }

    /// Elapsed seconds from `start` to `end`
    #[must_use]
    pub fn seconds_between(&self, start: &str, end: &str) -> String {
        render_template(self.seconds_between, &[("start", start), ("end", end)])
    }

    /// Truncate a timestamp to its day
    #[must_use]
    pub fn date_trunc_day(&self, ts: &str) -> String {
        render_template(self.date_trunc_day, &[("ts", ts)])
    }

    /// Cast to the dialect's double type
    #[must_use]
    pub fn cast_float(&self, expr: &str) -> String {
        format!("CAST({expr} AS {})", self.float_type)
    }

    /// Cast to the dialect's 64-bit integer type
    #[must_use]
    pub fn cast_integer(&self, expr: &str) -> String {
        format!("CAST({expr} AS {})", self.integer_type)
    }

    /// Cast to the dialect's string type
    #[must_use]
    pub fn cast_string(&self, expr: &str) -> String {
        format!("CAST({expr} AS {})", self.string_type)
    }

    /// Percentile aggregate used for outlier caps
    #[must_use]
    pub fn percentile(&self, expr: &str, p: f64) -> String {
        render_quantile(self.percentile, expr, p)
    }

    /// Native quantile aggregate for quantile metrics, if the dialect has one
    #[must_use]
    pub fn approx_quantile(&self, expr: &str, q: f64) -> Option<String> {
        self.approx_quantile
            .map(|template| render_quantile(template, expr, q))
    }

    /// Statements that (re)create `name` from `body`, in execution order
    #[must_use]
    pub fn create_table_as(&self, name: &str, body: &str) -> Vec<String> {
        let relation = self.quote_relation(name);
        let create = render_template(self.create_table_as, &[("name", &relation), ("body", body)]);
        if self.drop_before_create {
            vec![format!("DROP TABLE IF EXISTS {relation}"), create]
        } else {
            vec![create]
        }
    }
}

fn render_quantile(template: &str, expr: &str, p: f64) -> String {
    let level = float_literal(p);
    // Rounded in f64 first; the clamp keeps the cast in range
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let per_mille = ((p * 1000.0).round().clamp(0.0, 1000.0) as u32).to_string();
    render_template(
        template,
        &[("expr", expr), ("p", &level), ("per_mille", &per_mille)],
    )
}

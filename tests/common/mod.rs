//! Shared fixtures for integration tests
//!
//! One experiment over an `exposures` table and an `orders` fact table,
//! with one metric of every kind.

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use trueno_ab::config::{
    AnalysisInput, AssignmentSource, CapPolicy, ColumnRef, ColumnType, DimensionSpec,
    ExecutionMode, ExperimentSpec, FactTableDefinition, IdentityConfig, MetricDefinition,
    Relation, Variation,
};

pub const UNITS_TABLE: &str = "units_checkout_test";

pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

pub fn end() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap()
}

pub fn experiment(mode: ExecutionMode) -> ExperimentSpec {
    ExperimentSpec {
        id: "checkout_test".into(),
        variations: vec![
            Variation { id: "control".into(), weight: 1.0 },
            Variation { id: "treatment".into(), weight: 1.0 },
        ],
        assignment: AssignmentSource {
            source: Relation::Table("exposures".into()),
            timestamp_column: "event_time".into(),
            variation_column: "variation".into(),
            id_columns: [("user_id".to_string(), "user_id".to_string())].into_iter().collect(),
        },
        identity: IdentityConfig::ordered(["user_id"]),
        dimensions: vec![DimensionSpec::Column {
            name: "browser".into(),
            column: "browser".into(),
        }],
        start: start(),
        end: end(),
        segment: None,
        mode,
    }
}

pub fn incremental() -> ExecutionMode {
    ExecutionMode::Incremental {
        units_table: UNITS_TABLE.into(),
    }
}

pub fn orders() -> FactTableDefinition {
    FactTableDefinition::new("orders", Relation::Table("orders".into()), "event_time")
        .with_id_column("user_id", "user_id")
        .with_column("amount", ColumnType::Number)
        .with_column("status", ColumnType::String)
        .with_filter("paid", "status = 'paid'")
}

/// One metric of every kind
pub fn metrics() -> Vec<MetricDefinition> {
    vec![
        MetricDefinition::count("purchases", "orders"),
        MetricDefinition::sum("revenue", "orders", "amount")
            .with_cap(CapPolicy::Percentile { p: 0.99, ignore_zeros: true })
            .with_covariate(24.0 * 7.0),
        MetricDefinition::binary("converted", "orders").with_filter("paid"),
        MetricDefinition::ratio(
            "aov",
            ColumnRef::column("orders", "amount"),
            ColumnRef::rows("orders"),
        ),
        MetricDefinition::quantile("p50_revenue", "orders", "amount", 0.5),
        MetricDefinition::duration("time_to_purchase", "orders").inverse(),
    ]
}

pub fn input(mode: ExecutionMode) -> AnalysisInput {
    AnalysisInput::new(experiment(mode), metrics(), vec![orders()])
}

/// Route `tracing` output through the test harness; honours `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

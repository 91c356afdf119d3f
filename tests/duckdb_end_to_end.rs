//! End-to-end runs against an in-memory DuckDB warehouse
//!
//! Generated SQL is executed for real; the resulting statistics are checked
//! against counts computed directly from the synthetic data, and single-pass
//! and incremental execution are checked against each other.
//!
//! Toyota Way: Genchi Genbutsu (go and see the actual rows)

mod common;

use arrow::array::{ArrayRef, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use chrono::{Duration, NaiveDateTime};
use duckdb::types::Value;
use duckdb::Connection;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use trueno_ab::config::{AnalysisInput, ExecutionMode};
use trueno_ab::dialect::DialectId;
use trueno_ab::results::{AnalysisReport, DimensionKey, SrmVerdict};
use trueno_ab::runner::{AnalysisRunner, CancellationToken};
use trueno_ab::warehouse::{WarehouseAdapter, WarehouseFailure};

// ============================================================================
// DuckDB adapter
// ============================================================================

/// Runs statements on one DuckDB connection, converting rows to Arrow
struct DuckDbWarehouse {
    conn: Mutex<Connection>,
    log: Mutex<Vec<String>>,
}

fn failure(e: duckdb::Error) -> WarehouseFailure {
    WarehouseFailure::permanent(e.to_string())
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Kind {
    Null,
    Int,
    Float,
    Text,
}

fn kind(value: &Value) -> Kind {
    match value {
        Value::Null => Kind::Null,
        Value::Boolean(_)
        | Value::TinyInt(_)
        | Value::SmallInt(_)
        | Value::Int(_)
        | Value::BigInt(_)
        | Value::UTinyInt(_)
        | Value::USmallInt(_)
        | Value::UInt(_)
        | Value::UBigInt(_) => Kind::Int,
        Value::HugeInt(_) | Value::Float(_) | Value::Double(_) => Kind::Float,
        _ => Kind::Text,
    }
}

fn as_i64(value: &Value) -> Option<i64> {
    match *value {
        Value::Boolean(b) => Some(i64::from(b)),
        Value::TinyInt(v) => Some(i64::from(v)),
        Value::SmallInt(v) => Some(i64::from(v)),
        Value::Int(v) => Some(i64::from(v)),
        Value::BigInt(v) => Some(v),
        Value::UTinyInt(v) => Some(i64::from(v)),
        Value::USmallInt(v) => Some(i64::from(v)),
        Value::UInt(v) => Some(i64::from(v)),
        Value::UBigInt(v) => i64::try_from(v).ok(),
        _ => None,
    }
}

#[allow(clippy::cast_precision_loss)]
fn as_f64(value: &Value) -> Option<f64> {
    match *value {
        Value::HugeInt(v) => Some(v as f64),
        Value::Float(v) => Some(f64::from(v)),
        Value::Double(v) => Some(v),
        _ => as_i64(value).map(|v| v as f64),
    }
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Text(s) => Some(s.clone()),
        other => Some(format!("{other:?}")),
    }
}

fn to_batch(names: &[String], rows: &[Vec<Value>]) -> RecordBatch {
    let mut fields = Vec::with_capacity(names.len());
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(names.len());
    for (i, name) in names.iter().enumerate() {
        let column_kind = rows.iter().map(|r| kind(&r[i])).max().unwrap_or(Kind::Null);
        match column_kind {
            Kind::Int => {
                fields.push(Field::new(name, DataType::Int64, true));
                arrays.push(Arc::new(Int64Array::from(
                    rows.iter().map(|r| as_i64(&r[i])).collect::<Vec<_>>(),
                )));
            }
            Kind::Null | Kind::Float => {
                fields.push(Field::new(name, DataType::Float64, true));
                arrays.push(Arc::new(Float64Array::from(
                    rows.iter().map(|r| as_f64(&r[i])).collect::<Vec<_>>(),
                )));
            }
            Kind::Text => {
                fields.push(Field::new(name, DataType::Utf8, true));
                arrays.push(Arc::new(StringArray::from(
                    rows.iter().map(|r| as_text(&r[i])).collect::<Vec<_>>(),
                )));
            }
        }
    }
    RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays).unwrap()
}

impl DuckDbWarehouse {
    fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            log: Mutex::new(Vec::new()),
        }
    }

    fn statements(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn clear_log(&self) {
        self.log.lock().unwrap().clear();
    }

    fn batch_execute(&self, sql: &str) {
        self.conn.lock().unwrap().execute_batch(sql).unwrap();
    }

    fn run(&self, sql: &str) -> Result<Vec<RecordBatch>, WarehouseFailure> {
        self.log.lock().unwrap().push(sql.to_string());
        let conn = self
            .conn
            .lock()
            .map_err(|_| WarehouseFailure::permanent("connection lock poisoned"))?;
        let head = sql.trim_start().to_ascii_uppercase();
        if head.starts_with("CREATE") || head.starts_with("DROP") {
            conn.execute_batch(sql).map_err(failure)?;
            return Ok(Vec::new());
        }

        let mut stmt = conn.prepare(sql).map_err(failure)?;
        let mut names: Vec<String> = Vec::new();
        let mut values: Vec<Vec<Value>> = Vec::new();
        let mut rows = stmt.query([]).map_err(failure)?;
        while let Some(row) = rows.next().map_err(failure)? {
            if names.is_empty() {
                let statement: &duckdb::Statement<'_> = row.as_ref();
                names = statement.column_names();
            }
            let mut record = Vec::with_capacity(names.len());
            for i in 0..names.len() {
                record.push(row.get::<_, Value>(i).map_err(failure)?);
            }
            values.push(record);
        }
        if values.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![to_batch(&names, &values)])
    }
}

// Borrowed so one connection can serve several runners
impl WarehouseAdapter for &DuckDbWarehouse {
    async fn execute(&self, query: &str, _dialect: DialectId) -> Result<Vec<RecordBatch>, WarehouseFailure> {
        self.run(query)
    }
}

// ============================================================================
// Synthetic experiment data
// ============================================================================

struct Exposure {
    user: String,
    variation: &'static str,
    at: NaiveDateTime,
    browser: &'static str,
}

struct Order {
    user: String,
    at: NaiveDateTime,
    amount: f64,
    status: &'static str,
}

/// What the SQL should find, computed from the generated rows
#[derive(Default)]
struct Expected {
    users: HashMap<&'static str, u64>,
    purchases: HashMap<&'static str, f64>,
    converted: HashMap<&'static str, f64>,
    multiple: u64,
}

struct Dataset {
    exposures: Vec<Exposure>,
    orders: Vec<Order>,
    first_exposure: HashMap<String, (NaiveDateTime, &'static str)>,
    multiple: HashSet<String>,
}

const BROWSERS: [&str; 3] = ["chrome", "firefox", "safari"];
const USERS: usize = 1500;

fn ts(at: &NaiveDateTime) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn random_amount(rng: &mut StdRng) -> f64 {
    (rng.gen_range(5.0..200.0_f64) * 100.0).round() / 100.0
}

fn generate(seed: u64) -> Dataset {
    let mut rng = StdRng::seed_from_u64(seed);
    let start = common::start().naive_utc();
    let mut data = Dataset {
        exposures: Vec::new(),
        orders: Vec::new(),
        first_exposure: HashMap::new(),
        multiple: HashSet::new(),
    };

    for i in 0..USERS {
        let user = format!("u{i:05}");
        let variation = if rng.gen_bool(0.5) { "control" } else { "treatment" };
        let browser = BROWSERS[rng.gen_range(0..BROWSERS.len())];
        let first = start + Duration::minutes(rng.gen_range(0..10 * 24 * 60));
        data.exposures.push(Exposure { user: user.clone(), variation, at: first, browser });
        data.first_exposure.insert(user.clone(), (first, variation));

        if rng.gen_bool(0.2) {
            let again = first + Duration::hours(rng.gen_range(1..48));
            data.exposures.push(Exposure { user: user.clone(), variation, at: again, browser });
        }
        if i % 100 == 0 {
            let other = if variation == "control" { "treatment" } else { "control" };
            data.exposures.push(Exposure {
                user: user.clone(),
                variation: other,
                at: first + Duration::hours(1),
                browser,
            });
            data.multiple.insert(user.clone());
        }

        for _ in 0..rng.gen_range(0..3) {
            let at = first - Duration::minutes(rng.gen_range(1..6 * 24 * 60));
            let status = if rng.gen_bool(0.8) { "paid" } else { "refunded" };
            let amount = random_amount(&mut rng);
            data.orders.push(Order { user: user.clone(), at, amount, status });
        }
        let max_orders = if variation == "treatment" { 4 } else { 3 };
        for _ in 0..rng.gen_range(0..max_orders) {
            let at = first + Duration::minutes(rng.gen_range(1..3 * 24 * 60));
            let status = if rng.gen_bool(0.8) { "paid" } else { "refunded" };
            let amount = random_amount(&mut rng);
            data.orders.push(Order { user: user.clone(), at, amount, status });
        }
    }
    data
}

impl Dataset {
    fn expected(&self) -> Expected {
        let mut expected = Expected {
            multiple: self.multiple.len() as u64,
            ..Expected::default()
        };
        for (user, (_, variation)) in &self.first_exposure {
            if self.multiple.contains(user) {
                continue;
            }
            *expected.users.entry(*variation).or_insert(0) += 1;
        }
        let mut paid_converters: HashSet<&str> = HashSet::new();
        for order in &self.orders {
            let Some((first, variation)) = self.first_exposure.get(&order.user) else {
                continue;
            };
            if self.multiple.contains(&order.user) || order.at < *first {
                continue;
            }
            *expected.purchases.entry(*variation).or_insert(0.0) += 1.0;
            if order.status == "paid" && paid_converters.insert(order.user.as_str()) {
                *expected.converted.entry(*variation).or_insert(0.0) += 1.0;
            }
        }
        expected
    }
}

fn order_values(orders: &[Order]) -> String {
    orders
        .iter()
        .map(|o| format!("('{}', TIMESTAMP '{}', {:.2}, '{}')", o.user, ts(&o.at), o.amount, o.status))
        .collect::<Vec<_>>()
        .join(",\n")
}

fn load(data: &Dataset) -> DuckDbWarehouse {
    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch(
        "CREATE TABLE exposures (user_id VARCHAR, variation VARCHAR, event_time TIMESTAMP, browser VARCHAR);
         CREATE TABLE orders (user_id VARCHAR, event_time TIMESTAMP, amount DOUBLE, status VARCHAR);",
    )
    .unwrap();
    let exposures = data
        .exposures
        .iter()
        .map(|e| format!("('{}', '{}', TIMESTAMP '{}', '{}')", e.user, e.variation, ts(&e.at), e.browser))
        .collect::<Vec<_>>()
        .join(",\n");
    conn.execute_batch(&format!("INSERT INTO exposures VALUES\n{exposures};")).unwrap();
    conn.execute_batch(&format!("INSERT INTO orders VALUES\n{};", order_values(&data.orders)))
        .unwrap();
    DuckDbWarehouse::new(conn)
}

// ============================================================================
// Helpers
// ============================================================================

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1.0)
}

fn assert_reports_match(a: &AnalysisReport, b: &AnalysisReport) {
    assert_eq!(a.len(), b.len());
    for (x, y) in a.results().iter().zip(b.results()) {
        assert_eq!(x.key(), y.key());
        assert_eq!(x.status(), y.status(), "status differs for {:?}", x.key());
        assert_eq!(x.sample_size(), y.sample_size(), "sample size differs for {:?}", x.key());
        match (x.point_estimate(), y.point_estimate()) {
            (Some(p), Some(q)) => assert!(close(p, q), "point estimate {p} vs {q} for {:?}", x.key()),
            (p, q) => assert_eq!(p, q),
        }
        match (x.effect(), y.effect()) {
            (Some(e), Some(f)) => {
                assert!(close(e.relative, f.relative), "relative {} vs {}", e.relative, f.relative);
                assert!(close(e.relative_standard_error, f.relative_standard_error));
                assert_eq!(e.decision, f.decision);
                assert_eq!(e.cuped_applied, f.cuped_applied);
            }
            (e, f) => assert_eq!(e.is_some(), f.is_some()),
        }
    }
    assert_eq!(a.health().srm.observed, b.health().srm.observed);
    assert_eq!(a.health().multiple_exposures.count, b.health().multiple_exposures.count);
}

async fn run(warehouse: &DuckDbWarehouse, input: &AnalysisInput) -> AnalysisReport {
    let runner = AnalysisRunner::new(warehouse, DialectId::DuckDb);
    runner.run(input, &CancellationToken::new()).await.unwrap()
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_single_pass_matches_hand_counts() {
    common::init_tracing();
    let data = generate(7);
    let expected = data.expected();
    let warehouse = load(&data);
    let report = run(&warehouse, &common::input(ExecutionMode::SinglePass)).await;

    for variation in ["control", "treatment"] {
        let users = expected.users[variation];
        let purchases = report.overall("purchases", variation).unwrap();
        assert!(purchases.status().is_ok(), "{:?}", purchases.status());
        assert_eq!(purchases.sample_size(), users);
        #[allow(clippy::cast_precision_loss)]
        let mean = expected.purchases[variation] / users as f64;
        assert!(close(purchases.point_estimate().unwrap(), mean));

        let converted = report.overall("converted", variation).unwrap();
        #[allow(clippy::cast_precision_loss)]
        let rate = expected.converted[variation] / users as f64;
        assert!(close(converted.point_estimate().unwrap(), rate));
    }

    let health = report.health();
    assert_eq!(health.multiple_exposures.count, expected.multiple);
    assert_eq!(health.srm.observed, vec![expected.users["control"], expected.users["treatment"]]);
    assert_ne!(health.srm.verdict, SrmVerdict::InsufficientData);
}

#[tokio::test]
async fn test_every_metric_has_overall_and_dimension_cells() {
    common::init_tracing();
    let data = generate(11);
    let warehouse = load(&data);
    let input = common::input(ExecutionMode::SinglePass);
    let report = run(&warehouse, &input).await;

    for metric in &input.metrics {
        for browser in BROWSERS {
            let key = DimensionKey::new("browser", browser);
            assert!(report.get(&metric.id, "control", &key).is_some(), "{} {browser}", metric.id);
            assert!(report.get(&metric.id, "treatment", &key).is_some(), "{} {browser}", metric.id);
        }
        let baseline = report.overall(&metric.id, "control").unwrap();
        assert!(baseline.is_baseline());
        assert!(baseline.effect().is_none());
        let treatment = report.overall(&metric.id, "treatment").unwrap();
        assert!(treatment.status().is_ok(), "{}: {:?}", metric.id, treatment.status());
        assert!(treatment.effect().is_some());
    }

    let revenue = report.overall("revenue", "treatment").unwrap();
    assert!(revenue.effect().unwrap().cuped_applied);
    let p50 = report.overall("p50_revenue", "treatment").unwrap();
    assert!(p50.quantile().is_some());
    assert_eq!(report.health().srm_by_dimension.len(), BROWSERS.len());
}

#[tokio::test]
async fn test_incremental_matches_single_pass() {
    common::init_tracing();
    let data = generate(23);
    let warehouse = load(&data);

    let single = run(&warehouse, &common::input(ExecutionMode::SinglePass)).await;
    let incremental = run(&warehouse, &common::input(common::incremental())).await;
    assert_reports_match(&single, &incremental);

    let created = warehouse
        .statements()
        .iter()
        .filter(|s| s.starts_with("CREATE OR REPLACE TABLE units_checkout_test"))
        .count();
    assert_eq!(created, 1);
}

#[tokio::test]
async fn test_refresh_sees_new_events_without_rematerializing() {
    common::init_tracing();
    let data = generate(31);
    let warehouse = load(&data);
    let input = common::input(common::incremental());
    let first = run(&warehouse, &input).await;

    let late: Vec<Order> = data
        .first_exposure
        .iter()
        .filter(|(user, (_, variation))| *variation == "treatment" && !data.multiple.contains(*user))
        .take(200)
        .map(|(user, (at, _))| Order {
            user: user.clone(),
            at: *at + Duration::hours(2),
            amount: 50.0,
            status: "paid",
        })
        .collect();
    warehouse.batch_execute(&format!("INSERT INTO orders VALUES\n{};", order_values(&late)));
    warehouse.clear_log();

    let runner = AnalysisRunner::new(&warehouse, DialectId::DuckDb);
    let refreshed = runner.refresh(&input, &CancellationToken::new()).await.unwrap();
    assert!(warehouse.statements().iter().all(|s| !s.starts_with("CREATE")));

    let before = first.overall("purchases", "treatment").unwrap().point_estimate().unwrap();
    let after = refreshed.overall("purchases", "treatment").unwrap().point_estimate().unwrap();
    assert!(after > before);

    let fresh = run(&warehouse, &common::input(ExecutionMode::SinglePass)).await;
    assert_reports_match(&refreshed, &fresh);
}

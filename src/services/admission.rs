// Admission control
//
// Decides whether a query may run at all by projecting its result size
// before execution. Preference order: cached dataset statistics, then an
// analytic grid calculation from the dataset's extents and the query's
// WHERE constraints, then a real count query routed end-to-end like any
// other query. Count fallbacks are bounded by a semaphore so pathological
// constraint inputs cannot stampede the backends.

use std::sync::Arc;
use std::sync::LazyLock;

use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::api::middleware::AppError;
use crate::models::{DatasetStats, QueryAnalysis, SizeProjection, SizeProvenance};
use crate::services::delegator::ExecutionDelegator;
use crate::services::dialect;
use crate::services::resolver;
use crate::services::topology::TopologySnapshot;

/// One axis of the WHERE-clause constraint scan. Values are kept raw
/// (quotes stripped); interpretation happens in the estimator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AxisRange {
    pub min: Option<String>,
    pub max: Option<String>,
}

impl AxisRange {
    fn set_min(&mut self, value: &str) {
        self.min = Some(value.to_string());
    }

    fn set_max(&mut self, value: &str) {
        self.max = Some(value.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }
}

/// Range constraints per queryable axis.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConstraintSet {
    pub time: AxisRange,
    pub lat: AxisRange,
    pub lon: AxisRange,
    pub depth: AxisRange,
}

impl ConstraintSet {
    fn axis_mut(&mut self, name: &str) -> &mut AxisRange {
        match name {
            "time" => &mut self.time,
            "lat" => &mut self.lat,
            "lon" => &mut self.lon,
            _ => &mut self.depth,
        }
    }
}

const VALUE: &str = r"'[^']*'|[-+]?[0-9]+(?:\.[0-9]+)?(?:[eE][-+]?[0-9]+)?";

static BETWEEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\b(time|lat|lon|depth)\s+between\s+({VALUE})\s+and\s+({VALUE})"
    ))
    .expect("valid regex")
});

static AXIS_LEFT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?i)\b(time|lat|lon|depth)\s*(<=|>=|<|>|=)\s*({VALUE})"))
        .expect("valid regex")
});

static AXIS_RIGHT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?i)({VALUE})\s*(<=|>=|<|>|=)\s*(time|lat|lon|depth)\b"))
        .expect("valid regex")
});

/// Scan query text for range constraints on the time/lat/lon/depth axes.
///
/// Handles BETWEEN and single comparisons in both orientations, tracking
/// which side of the comparison is the bound. Run this on comment-stripped
/// text only.
pub fn extract_constraints(sql: &str) -> ConstraintSet {
    let mut constraints = ConstraintSet::default();

    for caps in BETWEEN_RE.captures_iter(sql) {
        let axis = constraints.axis_mut(&caps[1].to_lowercase());
        axis.set_min(unquote(&caps[2]));
        axis.set_max(unquote(&caps[3]));
    }

    for caps in AXIS_LEFT_RE.captures_iter(sql) {
        let value = unquote(&caps[3]).to_string();
        let axis = constraints.axis_mut(&caps[1].to_lowercase());
        match &caps[2] {
            ">" | ">=" => axis.set_min(&value),
            "<" | "<=" => axis.set_max(&value),
            _ => {
                axis.set_min(&value);
                axis.set_max(&value);
            }
        }
    }

    for caps in AXIS_RIGHT_RE.captures_iter(sql) {
        let value = unquote(&caps[1]).to_string();
        let axis = constraints.axis_mut(&caps[3].to_lowercase());
        // the axis sits on the right, so the comparison flips
        match &caps[2] {
            ">" | ">=" => axis.set_max(&value),
            "<" | "<=" => axis.set_min(&value),
            _ => {
                axis.set_min(&value);
                axis.set_max(&value);
            }
        }
    }

    constraints
}

fn unquote(raw: &str) -> &str {
    raw.trim_matches('\'')
}

pub struct AdmissionController {
    delegator: Arc<ExecutionDelegator>,
    max_rows: i64,
    count_permits: Arc<Semaphore>,
}

impl AdmissionController {
    pub fn new(delegator: Arc<ExecutionDelegator>, max_rows: i64, count_permits: usize) -> Self {
        Self {
            delegator,
            max_rows,
            count_permits: Arc::new(Semaphore::new(count_permits.max(1))),
        }
    }

    /// Project the result size of an analyzed query and decide admission.
    pub async fn check(
        &self,
        raw_query: &str,
        analysis: &QueryAnalysis,
        snapshot: &TopologySnapshot,
        token: CancellationToken,
    ) -> Result<SizeProjection, AppError> {
        // Curated procedures subset server-side and cannot be wrapped in a
        // count query; there is nothing meaningful to project.
        if analysis.is_stored_procedure() {
            return Ok(SizeProjection::exempt(self.max_rows));
        }

        let matched = resolver::match_tables(analysis, snapshot);

        // Nothing to size
        if matched.datasets.is_empty() {
            return Ok(SizeProjection::exempt(self.max_rows));
        }

        // Joins across datasets have no analytic model; measure for real
        if matched.datasets.len() >= 2 {
            return self.count_query(raw_query, analysis, snapshot, token).await;
        }

        let dataset_id = matched.datasets[0].1;
        match snapshot.dataset_stats(dataset_id) {
            Some(stats) if stats.is_gridded() => {
                if let Some(rows) = stats.row_count {
                    if rows > 0 && rows <= self.max_rows {
                        // the whole dataset fits; no need to look closer
                        return Ok(SizeProjection::new(
                            rows,
                            SizeProvenance::TableStats,
                            self.max_rows,
                        ));
                    }
                }

                let constraints = extract_constraints(&dialect::prepare_for_analysis(raw_query));
                match estimate_gridded(stats, &constraints) {
                    Some(estimate) if estimate > 0 => Ok(SizeProjection::new(
                        estimate,
                        SizeProvenance::AnalyticCalculation,
                        self.max_rows,
                    )),
                    // degenerate (e.g. single-point constraint): measure
                    _ => self.count_query(raw_query, analysis, snapshot, token).await,
                }
            }
            // Irregular or unknown datasets cannot be sized analytically
            _ => self.count_query(raw_query, analysis, snapshot, token).await,
        }
    }

    /// Wrap the original query in `select count(*) from (..) x` and run it
    /// end-to-end through resolution and delegation; it retries and fails
    /// like any other query.
    async fn count_query(
        &self,
        raw_query: &str,
        analysis: &QueryAnalysis,
        snapshot: &TopologySnapshot,
        token: CancellationToken,
    ) -> Result<SizeProjection, AppError> {
        let _permit = self
            .count_permits
            .acquire()
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;

        let candidates = resolver::resolve_candidates(analysis, snapshot)?;
        let inner = dialect::prepare_for_analysis(raw_query);
        let inner = inner.trim_end_matches(';').trim();
        let wrapped = format!("select count(*) from ({}) x", inner);

        tracing::debug!("issuing count query: {}", wrapped);
        let rows = self
            .delegator
            .execute_scalar(&wrapped, &candidates, token)
            .await?;

        Ok(SizeProjection::new(
            rows,
            SizeProvenance::CountQuery,
            self.max_rows,
        ))
    }
}

/// Analytic size estimate for a gridded dataset: total rows scaled by the
/// fraction of each axis's full extent actually requested. Returns `None`
/// when the dataset carries no usable row count.
fn estimate_gridded(stats: &DatasetStats, constraints: &ConstraintSet) -> Option<i64> {
    let total = stats.row_count.filter(|&n| n > 0)? as f64;

    let time_frac = time_fraction(&constraints.time, stats.time_min, stats.time_max);
    let lat_frac = numeric_fraction(&constraints.lat, stats.lat_min, stats.lat_max);
    let lon_frac = numeric_fraction(&constraints.lon, stats.lon_min, stats.lon_max);

    let depth_frac = if stats.has_fixed_depths() && !constraints.depth.is_empty() {
        // a depth slice of a fixed-depth table still selects whole levels
        let raw = numeric_fraction(&constraints.depth, stats.depth_min, stats.depth_max);
        let levels = stats.depth_levels.unwrap_or(1).max(1) as f64;
        raw.max(1.0 / levels)
    } else {
        numeric_fraction(&constraints.depth, stats.depth_min, stats.depth_max)
    };

    let estimate = total * time_frac * lat_frac * lon_frac * depth_frac;
    Some(estimate.round() as i64)
}

fn numeric_fraction(range: &AxisRange, full_min: Option<f64>, full_max: Option<f64>) -> f64 {
    if range.is_empty() {
        return 1.0;
    }
    let (full_min, full_max) = match (full_min, full_max) {
        (Some(lo), Some(hi)) if hi > lo => (lo, hi),
        // unknown or degenerate extent: the constraint cannot narrow it
        _ => return 1.0,
    };

    let req_min = range
        .min
        .as_deref()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(full_min)
        .max(full_min);
    let req_max = range
        .max
        .as_deref()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(full_max)
        .min(full_max);

    ((req_max - req_min) / (full_max - full_min)).clamp(0.0, 1.0)
}

fn time_fraction(
    range: &AxisRange,
    full_min: Option<NaiveDateTime>,
    full_max: Option<NaiveDateTime>,
) -> f64 {
    if range.is_empty() {
        return 1.0;
    }
    let (full_min, full_max) = match (full_min, full_max) {
        (Some(lo), Some(hi)) if hi > lo => (lo, hi),
        _ => return 1.0,
    };

    let full_lo = full_min.and_utc().timestamp() as f64;
    let full_hi = full_max.and_utc().timestamp() as f64;

    let req_lo = range
        .min
        .as_deref()
        .and_then(parse_time)
        .map(|t| t.and_utc().timestamp() as f64)
        .unwrap_or(full_lo)
        .max(full_lo);
    let req_hi = range
        .max
        .as_deref()
        .and_then(parse_time)
        .map(|t| t.and_utc().timestamp() as f64)
        .unwrap_or(full_hi)
        .min(full_hi);

    ((req_hi - req_lo) / (full_hi - full_lo)).clamp(0.0, 1.0)
}

fn parse_time(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim();
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(ts);
        }
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeSet, HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::models::{Backend, QueryAnalysis};
    use crate::services::execution::{BackendExecutor, ExecutionError, QueryStream};

    struct CountingScalarExecutor {
        backend: Backend,
        value: i64,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BackendExecutor for CountingScalarExecutor {
        fn backend(&self) -> Backend {
            self.backend
        }

        async fn begin_stream(
            &self,
            _sql: &str,
            _token: CancellationToken,
        ) -> Result<QueryStream, ExecutionError> {
            Err(ExecutionError::terminal(self.backend, "not a streaming test"))
        }

        async fn fetch_scalar(
            &self,
            _sql: &str,
            _token: CancellationToken,
        ) -> Result<i64, ExecutionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.value)
        }
    }

    fn controller_with_count(
        value: i64,
        max_rows: i64,
    ) -> (AdmissionController, Arc<CountingScalarExecutor>) {
        let executor = Arc::new(CountingScalarExecutor {
            backend: Backend::Rainier,
            value,
            calls: AtomicUsize::new(0),
        });
        let mut executors: HashMap<Backend, Arc<dyn BackendExecutor>> = HashMap::new();
        executors.insert(Backend::Rainier, executor.clone());
        let delegator = Arc::new(ExecutionDelegator::new(executors));
        (AdmissionController::new(delegator, max_rows, 4), executor)
    }

    fn snapshot_with_stats(stats: Vec<DatasetStats>) -> TopologySnapshot {
        let mut tables = HashSet::new();
        let mut dataset_ids = HashMap::new();
        let mut locations = HashMap::new();
        let mut stat_map = HashMap::new();
        for s in stats {
            let table = format!("tblds{}", s.dataset_id);
            tables.insert(table.clone());
            dataset_ids.insert(table, s.dataset_id);
            locations.insert(s.dataset_id, vec![Backend::Rainier]);
            stat_map.insert(s.dataset_id, s);
        }
        TopologySnapshot::new(tables, dataset_ids, locations, HashSet::new(), stat_map)
    }

    fn analysis_of(tables: &[&str]) -> QueryAnalysis {
        let set: BTreeSet<String> = tables.iter().map(|s| s.to_string()).collect();
        QueryAnalysis::ad_hoc(set.clone(), set)
    }

    fn gridded_stats(dataset_id: i64, row_count: i64) -> DatasetStats {
        DatasetStats {
            dataset_id,
            row_count: Some(row_count),
            time_min: parse_time("2010-01-01"),
            time_max: parse_time("2020-01-01"),
            lat_min: Some(-90.0),
            lat_max: Some(90.0),
            lon_min: Some(-180.0),
            lon_max: Some(180.0),
            depth_min: Some(0.0),
            depth_max: Some(5000.0),
            temporal_resolution: Some("Daily".to_string()),
            spatial_resolution: Some("1/4 degree".to_string()),
            depth_levels: None,
        }
    }

    fn irregular_stats(dataset_id: i64, row_count: i64) -> DatasetStats {
        DatasetStats {
            dataset_id,
            row_count: Some(row_count),
            temporal_resolution: Some("Irregular".to_string()),
            spatial_resolution: Some("Irregular".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_constraint_extraction_between() {
        let set = extract_constraints(
            "SELECT * FROM tblds1 WHERE time BETWEEN '2015-01-01' AND '2015-02-01' AND lat BETWEEN -10 AND 10",
        );
        assert_eq!(set.time.min.as_deref(), Some("2015-01-01"));
        assert_eq!(set.time.max.as_deref(), Some("2015-02-01"));
        assert_eq!(set.lat.min.as_deref(), Some("-10"));
        assert_eq!(set.lat.max.as_deref(), Some("10"));
        assert!(set.lon.is_empty());
        assert!(set.depth.is_empty());
    }

    #[test]
    fn test_constraint_extraction_comparisons_both_sides() {
        let set = extract_constraints("WHERE lat >= -5 AND 20 >= lat AND depth < 100");
        assert_eq!(set.lat.min.as_deref(), Some("-5"));
        assert_eq!(set.lat.max.as_deref(), Some("20"));
        assert_eq!(set.depth.max.as_deref(), Some("100"));
        assert!(set.depth.min.is_none());
    }

    #[test]
    fn test_constraint_extraction_equality_pins_both() {
        let set = extract_constraints("WHERE depth = 10");
        assert_eq!(set.depth.min.as_deref(), Some("10"));
        assert_eq!(set.depth.max.as_deref(), Some("10"));
    }

    #[test]
    fn test_estimate_scales_by_axis_fractions() {
        let stats = gridded_stats(1, 1_000_000);
        // half the latitude band, everything else unconstrained
        let constraints = extract_constraints("WHERE lat BETWEEN -45 AND 45");
        let estimate = estimate_gridded(&stats, &constraints).unwrap();
        assert_eq!(estimate, 500_000);
    }

    #[test]
    fn test_estimate_single_point_degenerates_to_zero() {
        let stats = gridded_stats(1, 1_000_000);
        let constraints = extract_constraints("WHERE lat = 10 AND lon = 20");
        assert_eq!(estimate_gridded(&stats, &constraints), Some(0));
    }

    #[test]
    fn test_fixed_depth_fraction_floored_at_one_level() {
        let mut stats = gridded_stats(1, 1_000_000);
        stats.depth_levels = Some(50);
        let constraints = extract_constraints("WHERE depth = 0");
        let estimate = estimate_gridded(&stats, &constraints).unwrap();
        // one level out of fifty
        assert_eq!(estimate, 20_000);
    }

    #[tokio::test]
    async fn test_no_dataset_tables_is_exempt() {
        let (controller, executor) = controller_with_count(0, 2_000_000);
        let snapshot = snapshot_with_stats(vec![]);
        let projection = controller
            .check(
                "SELECT 1",
                &analysis_of(&[]),
                &snapshot,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(projection.allowed);
        assert_eq!(projection.provenance, SizeProvenance::Exempt);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cached_stats_allow_without_query() {
        let (controller, executor) = controller_with_count(0, 2_000_000);
        let snapshot = snapshot_with_stats(vec![gridded_stats(1, 500_000)]);
        let projection = controller
            .check(
                "SELECT * FROM tblds1",
                &analysis_of(&["tblds1"]),
                &snapshot,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(projection.allowed);
        assert_eq!(projection.provenance, SizeProvenance::TableStats);
        assert_eq!(projection.estimated_rows, 500_000);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_irregular_dataset_always_counts() {
        let (controller, executor) = controller_with_count(1234, 2_000_000);
        // cached row count is small but the dataset is irregular
        let snapshot = snapshot_with_stats(vec![irregular_stats(1, 500)]);
        let projection = controller
            .check(
                "SELECT * FROM tblds1",
                &analysis_of(&["tblds1"]),
                &snapshot,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(projection.provenance, SizeProvenance::CountQuery);
        assert_eq!(projection.estimated_rows, 1234);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_multi_dataset_join_counts() {
        let (controller, executor) = controller_with_count(99, 2_000_000);
        let snapshot = snapshot_with_stats(vec![gridded_stats(1, 100), gridded_stats(2, 100)]);
        let projection = controller
            .check(
                "SELECT * FROM tblds1 a JOIN tblds2 b ON a.id = b.id",
                &analysis_of(&["tblds1", "tblds2"]),
                &snapshot,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(projection.provenance, SizeProvenance::CountQuery);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_large_gridded_dataset_uses_analytic_estimate() {
        let (controller, executor) = controller_with_count(0, 2_000_000);
        let snapshot = snapshot_with_stats(vec![gridded_stats(1, 10_000_000)]);
        let projection = controller
            .check(
                "SELECT * FROM tblds1 WHERE lat BETWEEN -9 AND 9",
                &analysis_of(&["tblds1"]),
                &snapshot,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(projection.provenance, SizeProvenance::AnalyticCalculation);
        // a tenth of the latitude band
        assert_eq!(projection.estimated_rows, 1_000_000);
        assert!(projection.allowed);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_degenerate_estimate_falls_back_to_count() {
        let (controller, executor) = controller_with_count(7, 2_000_000);
        let snapshot = snapshot_with_stats(vec![gridded_stats(1, 10_000_000)]);
        let projection = controller
            .check(
                "SELECT * FROM tblds1 WHERE lat = 10",
                &analysis_of(&["tblds1"]),
                &snapshot,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(projection.provenance, SizeProvenance::CountQuery);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_over_threshold_count_disallows() {
        let (controller, _) = controller_with_count(3_000_000, 2_000_000);
        let snapshot = snapshot_with_stats(vec![irregular_stats(1, 0)]);
        let projection = controller
            .check(
                "SELECT * FROM tblds1",
                &analysis_of(&["tblds1"]),
                &snapshot,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(!projection.allowed);
    }
}

use serde::Serialize;

/// Where a size estimate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeProvenance {
    /// Cached per-dataset row count was conclusive on its own.
    TableStats,
    /// Analytic grid calculation from dataset extents and query constraints.
    AnalyticCalculation,
    /// A real `count(*)` query was executed against a backend.
    CountQuery,
    /// The query references no dataset tables; there is nothing to size.
    Exempt,
}

/// Admission-control decision for one query.
#[derive(Debug, Clone, Serialize)]
pub struct SizeProjection {
    pub estimated_rows: i64,
    pub provenance: SizeProvenance,
    pub allowed: bool,
    pub threshold: i64,
}

impl SizeProjection {
    pub fn new(estimated_rows: i64, provenance: SizeProvenance, threshold: i64) -> Self {
        Self {
            estimated_rows,
            provenance,
            allowed: estimated_rows <= threshold,
            threshold,
        }
    }

    pub fn exempt(threshold: i64) -> Self {
        Self {
            estimated_rows: 0,
            provenance: SizeProvenance::Exempt,
            allowed: true,
            threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_decision() {
        let under = SizeProjection::new(500_000, SizeProvenance::TableStats, 2_000_000);
        assert!(under.allowed);

        let over = SizeProjection::new(2_000_001, SizeProvenance::CountQuery, 2_000_000);
        assert!(!over.allowed);
    }

    #[test]
    fn test_exempt_is_always_allowed() {
        let projection = SizeProjection::exempt(100);
        assert!(projection.allowed);
        assert_eq!(projection.provenance, SizeProvenance::Exempt);
    }
}

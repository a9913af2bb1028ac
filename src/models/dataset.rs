use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Per-dataset summary statistics fetched from the canonical backend.
///
/// Extents and resolutions drive the admission controller: a dataset with
/// defined, non-"irregular" temporal and spatial resolution is "gridded"
/// and can be sized analytically without touching a backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatasetStats {
    pub dataset_id: i64,
    pub row_count: Option<i64>,
    pub time_min: Option<NaiveDateTime>,
    pub time_max: Option<NaiveDateTime>,
    pub lat_min: Option<f64>,
    pub lat_max: Option<f64>,
    pub lon_min: Option<f64>,
    pub lon_max: Option<f64>,
    pub depth_min: Option<f64>,
    pub depth_max: Option<f64>,
    pub temporal_resolution: Option<String>,
    pub spatial_resolution: Option<String>,
    /// Number of discrete depth levels for fixed-depth datasets.
    pub depth_levels: Option<i32>,
}

impl DatasetStats {
    /// A gridded dataset has both resolutions defined and neither marked
    /// "irregular", which makes an analytic size estimate well-defined.
    pub fn is_gridded(&self) -> bool {
        fn regular(res: &Option<String>) -> bool {
            match res {
                Some(r) => !r.trim().eq_ignore_ascii_case("irregular"),
                None => false,
            }
        }
        regular(&self.temporal_resolution) && regular(&self.spatial_resolution)
    }

    /// Fixed-depth datasets store one row per depth level per grid point.
    pub fn has_fixed_depths(&self) -> bool {
        self.depth_levels.is_some_and(|n| n > 1)
    }
}

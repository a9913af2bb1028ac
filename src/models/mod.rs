pub mod analysis;
pub mod backend;
pub mod dataset;
pub mod projection;
pub mod query;

pub use analysis::{QueryAnalysis, QueryKind};
pub use backend::{Backend, CandidateSet};
pub use dataset::DatasetStats;
pub use projection::{SizeProjection, SizeProvenance};
pub use query::QueryRequest;

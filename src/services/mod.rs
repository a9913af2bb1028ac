pub mod admission;
pub mod analyzer;
pub mod connection_pool;
pub mod delegator;
pub mod dialect;
pub mod execution; // per-backend streaming executors
pub mod resolver;
pub mod router;
pub mod topology;

pub use admission::AdmissionController;
pub use connection_pool::ConnectionPoolManager;
pub use delegator::ExecutionDelegator;
pub use router::QueryRouter;
pub use topology::{PgTopologyProvider, TopologyCache, TopologyProvider, TopologySnapshot};

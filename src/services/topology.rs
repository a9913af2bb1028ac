// Topology cache
//
// TTL-cached, read-mostly view of where data physically lives: the table
// catalog, the dataset <-> table mapping, the dataset -> server location
// index, the data-retrieval procedure allowlist, and per-dataset stats.
// Everything is fetched from the canonical backend and shared across all
// concurrent requests; the router only ever reads snapshots.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use deadpool_postgres::Pool;
use tokio::sync::RwLock;

use crate::api::middleware::AppError;
use crate::models::{Backend, DatasetStats};

/// Immutable view of the topology at one point in time.
///
/// Classification invariant: a known table with a dataset mapping is a
/// dataset table; any other known table is a core table; never both.
#[derive(Debug, Clone, Default)]
pub struct TopologySnapshot {
    tables: HashSet<String>,
    dataset_ids: HashMap<String, i64>,
    locations: HashMap<i64, Vec<Backend>>,
    procedures: HashSet<String>,
    stats: HashMap<i64, DatasetStats>,
}

impl TopologySnapshot {
    pub fn new(
        tables: HashSet<String>,
        dataset_ids: HashMap<String, i64>,
        locations: HashMap<i64, Vec<Backend>>,
        procedures: HashSet<String>,
        stats: HashMap<i64, DatasetStats>,
    ) -> Self {
        Self {
            tables,
            dataset_ids,
            locations,
            procedures,
            stats,
        }
    }

    pub fn is_known_table(&self, name: &str) -> bool {
        self.tables.contains(&name.to_lowercase())
    }

    pub fn dataset_id(&self, table: &str) -> Option<i64> {
        self.dataset_ids.get(&table.to_lowercase()).copied()
    }

    pub fn is_dataset_table(&self, name: &str) -> bool {
        self.dataset_ids.contains_key(&name.to_lowercase())
    }

    pub fn is_core_table(&self, name: &str) -> bool {
        self.is_known_table(name) && !self.is_dataset_table(name)
    }

    /// Backends known to host the dataset. An absent entry means "no known
    /// location", never "no data".
    pub fn locations(&self, dataset_id: i64) -> Option<&[Backend]> {
        self.locations.get(&dataset_id).map(|v| v.as_slice())
    }

    pub fn is_data_retrieval_procedure(&self, name: &str) -> bool {
        self.procedures.contains(&name.to_lowercase())
    }

    pub fn dataset_stats(&self, dataset_id: i64) -> Option<&DatasetStats> {
        self.stats.get(&dataset_id)
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }
}

/// Source of topology data, injected so the cache (and everything above
/// it) can be exercised without a live canonical server.
#[async_trait]
pub trait TopologyProvider: Send + Sync {
    async fn fetch_snapshot(&self) -> Result<TopologySnapshot, AppError>;
}

/// Fetches topology from the canonical backend's metadata tables.
pub struct PgTopologyProvider {
    pool: Pool,
}

impl PgTopologyProvider {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TopologyProvider for PgTopologyProvider {
    async fn fetch_snapshot(&self) -> Result<TopologySnapshot, AppError> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| AppError::Backend(format!("canonical connection failed: {}", e)))?;

        let mut tables = HashSet::new();
        for row in client
            .query(
                "SELECT table_name FROM information_schema.tables WHERE table_schema = 'public'",
                &[],
            )
            .await
            .map_err(|e| AppError::Backend(e.to_string()))?
        {
            let name: String = row.try_get(0).map_err(|e| AppError::Backend(e.to_string()))?;
            tables.insert(name.to_lowercase());
        }

        let mut dataset_ids = HashMap::new();
        for row in client
            .query(
                "SELECT DISTINCT table_name, dataset_id FROM tblVariables",
                &[],
            )
            .await
            .map_err(|e| AppError::Backend(e.to_string()))?
        {
            let table: String = row.try_get(0).map_err(|e| AppError::Backend(e.to_string()))?;
            let id: i64 = row.try_get(1).map_err(|e| AppError::Backend(e.to_string()))?;
            dataset_ids.insert(table.to_lowercase(), id);
        }

        let mut locations: HashMap<i64, Vec<Backend>> = HashMap::new();
        for row in client
            .query(
                "SELECT dataset_id, server_alias FROM tblDataset_Servers",
                &[],
            )
            .await
            .map_err(|e| AppError::Backend(e.to_string()))?
        {
            let id: i64 = row.try_get(0).map_err(|e| AppError::Backend(e.to_string()))?;
            let alias: String = row.try_get(1).map_err(|e| AppError::Backend(e.to_string()))?;
            match Backend::from_alias(&alias) {
                Some(backend) => locations.entry(id).or_default().push(backend),
                None => tracing::warn!("unknown server alias '{}' for dataset {}", alias, id),
            }
        }

        let mut procedures = HashSet::new();
        for row in client
            .query("SELECT procedure_name FROM tblData_Retrieval_Procedures", &[])
            .await
            .map_err(|e| AppError::Backend(e.to_string()))?
        {
            let name: String = row.try_get(0).map_err(|e| AppError::Backend(e.to_string()))?;
            procedures.insert(name.to_lowercase());
        }

        let mut stats = HashMap::new();
        for row in client
            .query(
                "SELECT dataset_id, row_count, time_min, time_max, lat_min, lat_max, \
                 lon_min, lon_max, depth_min, depth_max, temporal_resolution, \
                 spatial_resolution, depth_levels FROM tblDataset_Stats",
                &[],
            )
            .await
            .map_err(|e| AppError::Backend(e.to_string()))?
        {
            let dataset_id: i64 = row.try_get(0).map_err(|e| AppError::Backend(e.to_string()))?;
            stats.insert(
                dataset_id,
                DatasetStats {
                    dataset_id,
                    row_count: row.try_get(1).ok(),
                    time_min: row.try_get(2).ok(),
                    time_max: row.try_get(3).ok(),
                    lat_min: row.try_get(4).ok(),
                    lat_max: row.try_get(5).ok(),
                    lon_min: row.try_get(6).ok(),
                    lon_max: row.try_get(7).ok(),
                    depth_min: row.try_get(8).ok(),
                    depth_max: row.try_get(9).ok(),
                    temporal_resolution: row.try_get(10).ok(),
                    spatial_resolution: row.try_get(11).ok(),
                    depth_levels: row.try_get(12).ok(),
                },
            );
        }

        tracing::info!(
            "topology refreshed: {} tables, {} dataset mappings, {} located datasets, {} procedures",
            tables.len(),
            dataset_ids.len(),
            locations.len(),
            procedures.len()
        );

        Ok(TopologySnapshot::new(
            tables,
            dataset_ids,
            locations,
            procedures,
            stats,
        ))
    }
}

struct CacheState {
    snapshot: Arc<TopologySnapshot>,
    fetched_at: Option<Instant>,
}

/// TTL cache over a [`TopologyProvider`].
///
/// A fetch failure serves the stale snapshot and leaves the expiry in the
/// past so the next call retries.
pub struct TopologyCache {
    provider: Arc<dyn TopologyProvider>,
    ttl: Duration,
    state: RwLock<CacheState>,
}

impl TopologyCache {
    pub fn new(provider: Arc<dyn TopologyProvider>, ttl: Duration) -> Self {
        Self {
            provider,
            ttl,
            state: RwLock::new(CacheState {
                snapshot: Arc::new(TopologySnapshot::default()),
                fetched_at: None,
            }),
        }
    }

    /// Current snapshot, refreshing on TTL expiry.
    pub async fn snapshot(&self) -> Arc<TopologySnapshot> {
        // Fast path: fresh cache under a read lock
        {
            let state = self.state.read().await;
            if let Some(fetched_at) = state.fetched_at {
                if fetched_at.elapsed() < self.ttl {
                    return state.snapshot.clone();
                }
            }
        }

        let mut state = self.state.write().await;

        // Double-check in case another task refreshed while we waited
        if let Some(fetched_at) = state.fetched_at {
            if fetched_at.elapsed() < self.ttl {
                return state.snapshot.clone();
            }
        }

        match self.provider.fetch_snapshot().await {
            Ok(snapshot) => {
                state.snapshot = Arc::new(snapshot);
                state.fetched_at = Some(Instant::now());
            }
            Err(e) => {
                // Stale data beats no data; expiry stays in the past so the
                // next call retries the fetch.
                tracing::warn!("topology refresh failed, serving stale snapshot: {}", e);
            }
        }

        state.snapshot.clone()
    }

    /// Force the next `snapshot()` call to refetch.
    pub async fn invalidate(&self) {
        let mut state = self.state.write().await;
        state.fetched_at = None;
    }
}

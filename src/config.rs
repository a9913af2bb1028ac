use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub backends: BackendsConfig,
    pub cluster: ClusterConfig,
    pub router: RouterConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Connection URLs for the on-prem replicas. Rainier is canonical.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendsConfig {
    pub rainier_url: String,
    pub mariana_url: String,
    pub rossby_url: String,
}

/// Cloud warehouse statement API endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    pub base_url: String,
    pub api_token: Option<String>,
    pub page_size: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    /// Admission-control row threshold.
    pub max_rows: i64,
    /// Topology cache TTL in seconds.
    pub topology_ttl_secs: u64,
    /// Concurrent count-query fallbacks allowed.
    pub count_query_permits: usize,
    /// Rows coalesced per CSV output chunk.
    pub row_batch: usize,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 3000)?
            .set_default(
                "backends.rainier_url",
                "postgresql://localhost:5432/ocean",
            )?
            .set_default(
                "backends.mariana_url",
                "postgresql://localhost:5433/ocean",
            )?
            .set_default(
                "backends.rossby_url",
                "postgresql://localhost:5434/ocean",
            )?
            .set_default("cluster.base_url", "http://localhost:8080")?
            .set_default("cluster.api_token", None::<String>)?
            .set_default("cluster.page_size", 5000)?
            .set_default("router.max_rows", 2_000_000)?
            .set_default("router.topology_ttl_secs", 3600)?
            .set_default("router.count_query_permits", 4)?
            .set_default("router.row_batch", 512)?;

        // Load from environment variables
        if let Ok(host) = env::var("HOST") {
            builder = builder.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            builder = builder.set_override("server.port", port.parse::<u16>().unwrap_or(3000))?;
        }

        if let Ok(url) = env::var("RAINIER_URL") {
            builder = builder.set_override("backends.rainier_url", url)?;
        }

        if let Ok(url) = env::var("MARIANA_URL") {
            builder = builder.set_override("backends.mariana_url", url)?;
        }

        if let Ok(url) = env::var("ROSSBY_URL") {
            builder = builder.set_override("backends.rossby_url", url)?;
        }

        if let Ok(url) = env::var("CLUSTER_BASE_URL") {
            builder = builder.set_override("cluster.base_url", url)?;
        }

        if let Ok(token) = env::var("CLUSTER_API_TOKEN") {
            builder = builder.set_override("cluster.api_token", Some(token))?;
        }

        if let Ok(size) = env::var("CLUSTER_PAGE_SIZE") {
            builder = builder.set_override("cluster.page_size", size.parse::<u32>().unwrap_or(5000))?;
        }

        if let Ok(max_rows) = env::var("MAX_ROWS") {
            builder =
                builder.set_override("router.max_rows", max_rows.parse::<i64>().unwrap_or(2_000_000))?;
        }

        if let Ok(ttl) = env::var("TOPOLOGY_TTL_SECS") {
            builder =
                builder.set_override("router.topology_ttl_secs", ttl.parse::<u64>().unwrap_or(3600))?;
        }

        if let Ok(permits) = env::var("COUNT_QUERY_PERMITS") {
            builder = builder
                .set_override("router.count_query_permits", permits.parse::<usize>().unwrap_or(4) as u64)?;
        }

        if let Ok(batch) = env::var("ROW_BATCH") {
            builder =
                builder.set_override("router.row_batch", batch.parse::<usize>().unwrap_or(512) as u64)?;
        }

        // Try to load from .env file
        let _ = dotenv::dotenv();

        builder.build()?.try_deserialize()
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        env::remove_var("HOST");
        env::remove_var("PORT");
        env::remove_var("MAX_ROWS");

        let config = Config::from_env();
        assert!(config.is_ok());

        let config = config.unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.router.max_rows, 2_000_000);
        assert_eq!(config.router.topology_ttl_secs, 3600);
    }
}

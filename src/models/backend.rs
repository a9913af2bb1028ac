use serde::{Deserialize, Serialize};

use super::analysis::QueryKind;

/// Physical database servers capable of executing queries.
///
/// Three on-prem relational replicas plus the cloud analytical warehouse.
/// Rainier is the canonical server: the only backend holding core
/// (administrative/metadata) tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Rainier,
    Mariana,
    Rossby,
    Cluster,
}

impl Backend {
    /// The only backend where core/metadata tables live.
    pub const CANONICAL: Backend = Backend::Rainier;

    /// Parse a server alias as stored in the topology tables.
    pub fn from_alias(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "rainier" => Some(Backend::Rainier),
            "mariana" => Some(Backend::Mariana),
            "rossby" => Some(Backend::Rossby),
            "cluster" => Some(Backend::Cluster),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Rainier => "rainier",
            Backend::Mariana => "mariana",
            Backend::Rossby => "rossby",
            Backend::Cluster => "cluster",
        }
    }

    pub fn is_on_prem(&self) -> bool {
        !matches!(self, Backend::Cluster)
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered, backend-unique list of servers eligible to answer one query.
///
/// Ordering contract: when the cluster appears alongside on-prem members it
/// is demoted to the end; a cluster-only set keeps it as the sole target.
/// Relative order among on-prem members carries no meaning; the delegator
/// picks uniformly at random per attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateSet {
    pub backends: Vec<Backend>,
    pub kind: QueryKind,
}

impl CandidateSet {
    pub fn new(backends: Vec<Backend>, kind: QueryKind) -> Self {
        Self { backends, kind }
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// True when the warehouse is the only eligible target, which disables
    /// retries entirely.
    pub fn cluster_only(&self) -> bool {
        self.backends == [Backend::Cluster]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alias_round_trip() {
        for backend in [
            Backend::Rainier,
            Backend::Mariana,
            Backend::Rossby,
            Backend::Cluster,
        ] {
            assert_eq!(Backend::from_alias(backend.as_str()), Some(backend));
        }
        assert_eq!(Backend::from_alias("RAINIER"), Some(Backend::Rainier));
        assert_eq!(Backend::from_alias("unknown-server"), None);
    }

    #[test]
    fn test_canonical_is_on_prem() {
        assert!(Backend::CANONICAL.is_on_prem());
        assert!(!Backend::Cluster.is_on_prem());
    }

    #[test]
    fn test_cluster_only() {
        let set = CandidateSet::new(vec![Backend::Cluster], QueryKind::AdHoc);
        assert!(set.cluster_only());

        let mixed = CandidateSet::new(vec![Backend::Mariana, Backend::Cluster], QueryKind::AdHoc);
        assert!(!mixed.cluster_only());
    }
}

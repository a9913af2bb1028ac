// Candidate resolver
//
// Pure function from (query analysis, topology snapshot) to the ordered
// list of backends able to answer the query. No I/O: the snapshot is
// injected by the caller, so resolution is trivially testable.

use std::collections::HashSet;

use thiserror::Error;

use crate::models::{Backend, CandidateSet, QueryAnalysis};
use crate::services::topology::TopologySnapshot;

#[derive(Debug, Error, PartialEq)]
pub enum ResolveError {
    #[error("no real tables referenced in query")]
    NoRealTables,

    #[error(
        "datasets in tables {tables:?} are not co-located on any single server; \
         a cross-server join is not supported. Download each dataset separately \
         and join them client-side."
    )]
    NotColocated { tables: Vec<String> },
}

/// Primary table names partitioned against the known catalog.
#[derive(Debug, Default)]
pub struct MatchedTables {
    pub core: Vec<String>,
    pub datasets: Vec<(String, i64)>,
    pub omitted: Vec<String>,
}

/// Case-insensitive match of the analysis' primary (alias-free) table names
/// against known core and dataset tables. Unknown names are omitted with a
/// warning; omission is only fatal when nothing at all matched.
pub fn match_tables(analysis: &QueryAnalysis, snapshot: &TopologySnapshot) -> MatchedTables {
    let mut matched = MatchedTables::default();
    for table in &analysis.primary_referenced_tables {
        if let Some(id) = snapshot.dataset_id(table) {
            matched.datasets.push((table.clone(), id));
        } else if snapshot.is_core_table(table) {
            matched.core.push(table.clone());
        } else {
            tracing::warn!("table '{}' matches no known core or dataset table, omitting", table);
            matched.omitted.push(table.clone());
        }
    }
    matched
}

/// Resolve the ordered candidate set for an analyzed query.
///
/// Core-table references pin the query to the canonical server regardless
/// of dataset locations. Otherwise a backend qualifies only if it hosts
/// every referenced dataset (intersection, not union). The cluster is
/// demoted behind on-prem members when both qualify.
pub fn resolve_candidates(
    analysis: &QueryAnalysis,
    snapshot: &TopologySnapshot,
) -> Result<CandidateSet, ResolveError> {
    let matched = match_tables(analysis, snapshot);

    if !analysis.primary_referenced_tables.is_empty()
        && matched.core.is_empty()
        && matched.datasets.is_empty()
    {
        return Err(ResolveError::NoRealTables);
    }

    // Joins against core tables are only valid on the canonical server.
    if !matched.core.is_empty() {
        tracing::debug!(
            "core tables {:?} referenced, routing to {}",
            matched.core,
            Backend::CANONICAL
        );
        return Ok(CandidateSet::new(vec![Backend::CANONICAL], analysis.kind));
    }

    let mut intersection: Option<HashSet<Backend>> = None;
    let mut located = 0usize;
    for (table, dataset_id) in &matched.datasets {
        match snapshot.locations(*dataset_id) {
            Some(backends) => {
                located += 1;
                let hosts: HashSet<Backend> = backends.iter().copied().collect();
                intersection = Some(match intersection {
                    Some(current) => current.intersection(&hosts).copied().collect(),
                    None => hosts,
                });
            }
            None => {
                tracing::warn!(
                    "dataset {} (table '{}') has no known location, skipping",
                    dataset_id,
                    table
                );
            }
        }
    }

    let members = intersection.unwrap_or_default();
    if located > 0 && members.is_empty() {
        return Err(ResolveError::NotColocated {
            tables: matched.datasets.into_iter().map(|(t, _)| t).collect(),
        });
    }

    // Stable order with the cluster last; on-prem order carries no meaning
    // because the delegator randomizes the pick per attempt.
    let ordered: Vec<Backend> = [
        Backend::Rainier,
        Backend::Mariana,
        Backend::Rossby,
        Backend::Cluster,
    ]
    .into_iter()
    .filter(|b| members.contains(b))
    .collect();

    Ok(CandidateSet::new(ordered, analysis.kind))
}

use std::collections::BTreeSet;

use serde::Serialize;

/// Command classification for an inbound query string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    StoredProcedure,
    AdHoc,
}

/// Normalized description of a query, produced by the analyzer.
///
/// `referenced_tables` is the union of AST-derived and text-scanned names
/// and may contain query aliases (CTE names); filtering against real known
/// tables happens in the candidate resolver. `primary_referenced_tables`
/// holds only the text-scanned names, which never include aliases, and is
/// what table matching uses.
#[derive(Debug, Clone, Serialize)]
pub struct QueryAnalysis {
    pub kind: QueryKind,
    pub referenced_tables: BTreeSet<String>,
    pub primary_referenced_tables: BTreeSet<String>,
    /// Lowercased procedure name when `kind` is `StoredProcedure`.
    pub procedure: Option<String>,
}

impl QueryAnalysis {
    pub fn ad_hoc(
        referenced_tables: BTreeSet<String>,
        primary_referenced_tables: BTreeSet<String>,
    ) -> Self {
        Self {
            kind: QueryKind::AdHoc,
            referenced_tables,
            primary_referenced_tables,
            procedure: None,
        }
    }

    pub fn stored_procedure(procedure: String, tables: BTreeSet<String>) -> Self {
        Self {
            kind: QueryKind::StoredProcedure,
            referenced_tables: tables.clone(),
            primary_referenced_tables: tables,
            procedure: Some(procedure),
        }
    }

    pub fn is_stored_procedure(&self) -> bool {
        self.kind == QueryKind::StoredProcedure
    }
}

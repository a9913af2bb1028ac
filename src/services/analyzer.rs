// Query analyzer
//
// Classifies an inbound query string (stored-procedure call vs. ad-hoc) and
// extracts the set of referenced table names. Ad-hoc extraction runs two
// independent passes and unions them: an AST walk, and a grammatical text
// scan that tolerates dialect extensions the parser rejects. The text-scan
// result is also kept separately because it never contains query aliases.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use sqlparser::ast::{
    Expr, ObjectNamePart, Query, SelectItem, SetExpr, Statement, TableFactor, TableWithJoins,
};
use sqlparser::dialect::MsSqlDialect;
use sqlparser::parser::Parser;

use crate::models::QueryAnalysis;
use crate::services::dialect;

/// Dataset tables follow a fixed naming convention: a `tbl` prefix.
const DATASET_TABLE_PREFIX: &str = "tbl";

/// Data-retrieval stored procedures carry the `usp` prefix.
const PROCEDURE_PREFIX: &str = "usp";

static TABLE_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\btbl[a-z0-9_]+").expect("valid regex"));

/// Analyze a raw query string into a normalized description.
///
/// Never fails: a completely empty query yields an empty table set, and an
/// AST parse failure falls back to the text scan alone.
pub fn analyze(raw: &str) -> QueryAnalysis {
    let normalized = dialect::prepare_for_analysis(raw);
    if normalized.is_empty() {
        return QueryAnalysis::ad_hoc(BTreeSet::new(), BTreeSet::new());
    }

    if let Some((procedure, tables)) = classify_stored_procedure(&normalized) {
        return QueryAnalysis::stored_procedure(procedure, tables);
    }

    let scanned = scan_table_names(&normalized);
    let from_ast = match extract_ast_tables(&normalized) {
        Ok(tables) => tables,
        Err(e) => {
            // Non-fatal: exotic constructs (backticks, nested TOP) defeat
            // the parser but not the text scan.
            tracing::warn!("AST table extraction failed, using text scan only: {}", e);
            BTreeSet::new()
        }
    };

    let mut union = scanned.clone();
    union.extend(from_ast);
    QueryAnalysis::ad_hoc(union, scanned)
}

/// Detect an `EXEC`/`EXECUTE` call to a procedure following the naming
/// convention, and pull out its table-name string arguments.
///
/// Arguments are string literals, not parseable table references, so they
/// are recovered by tokenizing and keeping anything that matches the
/// dataset-table convention once quotes/brackets/commas are stripped.
fn classify_stored_procedure(normalized: &str) -> Option<(String, BTreeSet<String>)> {
    let lowered = normalized.to_lowercase();
    let mut tokens = lowered.split_whitespace();

    let keyword = tokens.next()?;
    if keyword != "exec" && keyword != "execute" {
        return None;
    }

    let procedure = tokens.next()?.trim_matches(|c| c == '\'' || c == '"');
    if !procedure.starts_with(PROCEDURE_PREFIX) {
        return None;
    }

    let tables = tokens
        .map(|token| token.trim_matches(|c: char| "'\"[],()".contains(c)).to_string())
        .filter(|token| is_dataset_table_name(token))
        .collect();

    Some((procedure.to_string(), tables))
}

pub fn is_dataset_table_name(name: &str) -> bool {
    name.len() > DATASET_TABLE_PREFIX.len()
        && name[..DATASET_TABLE_PREFIX.len()].eq_ignore_ascii_case(DATASET_TABLE_PREFIX)
}

/// Grammatical text scan for names matching the dataset-table convention.
fn scan_table_names(normalized: &str) -> BTreeSet<String> {
    TABLE_NAME_RE
        .find_iter(normalized)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

/// Collect every table reference in the query AST, including CTE bodies,
/// joins, derived tables, and subqueries in predicates. References to CTE
/// names come back as table references too; alias filtering is the
/// resolver's job.
fn extract_ast_tables(sql: &str) -> Result<BTreeSet<String>, sqlparser::parser::ParserError> {
    let dialect = MsSqlDialect {};
    let statements = Parser::parse_sql(&dialect, sql)?;

    let mut tables = BTreeSet::new();
    for statement in &statements {
        if let Statement::Query(query) = statement {
            collect_query(query, &mut tables);
        }
    }
    Ok(tables)
}

fn collect_query(query: &Query, tables: &mut BTreeSet<String>) {
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            collect_query(&cte.query, tables);
        }
    }
    collect_set_expr(&query.body, tables);
}

fn collect_set_expr(body: &SetExpr, tables: &mut BTreeSet<String>) {
    match body {
        SetExpr::Select(select) => {
            for table in &select.from {
                collect_table_with_joins(table, tables);
            }
            for item in &select.projection {
                match item {
                    SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => {
                        collect_expr(expr, tables);
                    }
                    _ => {}
                }
            }
            if let Some(selection) = &select.selection {
                collect_expr(selection, tables);
            }
            if let Some(having) = &select.having {
                collect_expr(having, tables);
            }
        }
        SetExpr::Query(inner) => collect_query(inner, tables),
        SetExpr::SetOperation { left, right, .. } => {
            collect_set_expr(left, tables);
            collect_set_expr(right, tables);
        }
        _ => {}
    }
}

fn collect_table_with_joins(table: &TableWithJoins, tables: &mut BTreeSet<String>) {
    collect_table_factor(&table.relation, tables);
    for join in &table.joins {
        collect_table_factor(&join.relation, tables);
    }
}

fn collect_table_factor(factor: &TableFactor, tables: &mut BTreeSet<String>) {
    match factor {
        TableFactor::Table { name, .. } => {
            // keep only the bare table identifier, dropping any schema parts
            // and quoting
            if let Some(ObjectNamePart::Identifier(ident)) = name.0.last() {
                tables.insert(ident.value.to_lowercase());
            }
        }
        TableFactor::Derived { subquery, .. } => collect_query(subquery, tables),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => collect_table_with_joins(table_with_joins, tables),
        _ => {}
    }
}

fn collect_expr(expr: &Expr, tables: &mut BTreeSet<String>) {
    match expr {
        Expr::BinaryOp { left, right, .. } => {
            collect_expr(left, tables);
            collect_expr(right, tables);
        }
        Expr::UnaryOp { expr, .. } | Expr::Nested(expr) => collect_expr(expr, tables),
        Expr::Between {
            expr, low, high, ..
        } => {
            collect_expr(expr, tables);
            collect_expr(low, tables);
            collect_expr(high, tables);
        }
        Expr::InSubquery { expr, subquery, .. } => {
            collect_expr(expr, tables);
            collect_query(subquery, tables);
        }
        Expr::Subquery(query) => collect_query(query, tables),
        Expr::Exists { subquery, .. } => collect_query(subquery, tables),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::QueryKind;

    #[test]
    fn test_empty_query() {
        let analysis = analyze("   ");
        assert_eq!(analysis.kind, QueryKind::AdHoc);
        assert!(analysis.referenced_tables.is_empty());
        assert!(analysis.primary_referenced_tables.is_empty());
    }

    #[test]
    fn test_stored_procedure_detection() {
        let analysis = analyze("EXEC uspSpaceTime 'tblArgoMerge_REP', 'temperature'");
        assert_eq!(analysis.kind, QueryKind::StoredProcedure);
        assert_eq!(analysis.procedure.as_deref(), Some("uspspacetime"));
        assert!(analysis
            .referenced_tables
            .contains("tblargomerge_rep"));
    }

    #[test]
    fn test_execute_keyword_variant() {
        let analysis = analyze("execute uspCruiseTrajectory 'tblCruise_Trajectory'");
        assert_eq!(analysis.kind, QueryKind::StoredProcedure);
    }

    #[test]
    fn test_exec_of_unconventional_procedure_is_ad_hoc() {
        // only the usp convention marks a stored-procedure call
        let analysis = analyze("EXEC sp_helpdb");
        assert_eq!(analysis.kind, QueryKind::AdHoc);
    }

    #[test]
    fn test_commented_out_exec_is_ad_hoc() {
        let analysis = analyze("-- EXEC uspSpaceTime\nSELECT lat FROM tblArgo");
        assert_eq!(analysis.kind, QueryKind::AdHoc);
        assert!(analysis.referenced_tables.contains("tblargo"));
    }

    #[test]
    fn test_ad_hoc_union_of_ast_and_scan() {
        let analysis =
            analyze("SELECT a.lat FROM tblArgo a JOIN dbo.tblCruise c ON a.id = c.id");
        assert!(analysis.referenced_tables.contains("tblargo"));
        assert!(analysis.referenced_tables.contains("tblcruise"));
        assert!(analysis.primary_referenced_tables.contains("tblargo"));
        assert!(analysis.primary_referenced_tables.contains("tblcruise"));
    }

    #[test]
    fn test_cte_names_not_filtered_here() {
        let sql = "WITH best AS (SELECT lat FROM tblArgo) SELECT * FROM best";
        let analysis = analyze(sql);
        // the CTE alias shows up from the AST; the real table from both
        assert!(analysis.referenced_tables.contains("best"));
        assert!(analysis.referenced_tables.contains("tblargo"));
        // but the alias never appears in the text-scan-only set
        assert!(!analysis.primary_referenced_tables.contains("best"));
    }

    #[test]
    fn test_parser_failure_falls_back_to_scan() {
        // backticks defeat the MsSql parser; the scan still finds the table
        let analysis = analyze("SELECT `x` FROM tblPisces WHERE `y` > 0");
        assert!(analysis.referenced_tables.contains("tblpisces"));
    }

    #[test]
    fn test_subquery_tables_collected() {
        let sql = "SELECT lat FROM tblArgo WHERE id IN (SELECT id FROM tblCruise)";
        let analysis = analyze(sql);
        assert!(analysis.referenced_tables.contains("tblcruise"));
    }

    #[test]
    fn test_dataset_table_name_convention() {
        assert!(is_dataset_table_name("tblArgo"));
        assert!(is_dataset_table_name("TBLARGO"));
        assert!(!is_dataset_table_name("tbl"));
        assert!(!is_dataset_table_name("mytable"));
    }
}

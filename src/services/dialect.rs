// SQL dialect utilities
//
// Stateless text/AST transforms shared by the analyzer, the admission
// controller, and the cluster executor. Comment stripping must run before
// any keyword sniffing elsewhere in the crate, so both preparation
// pipelines apply it first.

use std::sync::LazyLock;

use regex::Regex;
use sqlparser::ast::{
    Expr, LimitClause, Query, SelectItem, SetExpr, Statement, TableFactor, TableWithJoins, Top,
    TopQuantity, Value, Values,
};
use sqlparser::dialect::MsSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DialectError {
    #[error("SQL parsing error: {0}")]
    Parse(#[from] sqlparser::parser::ParserError),

    #[error("empty SQL statement")]
    Empty,

    #[error("TOP n PERCENT has no LIMIT equivalent; use an absolute row count")]
    PercentTop,

    #[error("TOP n WITH TIES has no LIMIT equivalent; use an absolute row count")]
    WithTiesTop,
}

static SCHEMA_PREFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\[?dbo\]?\.").expect("valid regex"));

static STDEV_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(stdevp|stdev)\s*\(").expect("valid regex"));

static TOP_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\btop\b").expect("valid regex"));

/// Remove `--` line comments and `/* */` block comments (nesting-aware),
/// leaving string literals untouched. Idempotent.
pub fn strip_comments(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if c == '\'' {
                // doubled quote is an escaped quote inside the literal
                if chars.peek() == Some(&'\'') {
                    if let Some(next) = chars.next() {
                        out.push(next);
                    }
                } else {
                    in_string = false;
                }
            }
            continue;
        }

        match c {
            '\'' => {
                in_string = true;
                out.push(c);
            }
            '-' if chars.peek() == Some(&'-') => {
                chars.next();
                while let Some(&next) = chars.peek() {
                    if next == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut depth = 1u32;
                while depth > 0 {
                    match chars.next() {
                        Some('*') if chars.peek() == Some(&'/') => {
                            chars.next();
                            depth -= 1;
                        }
                        Some('/') if chars.peek() == Some(&'*') => {
                            chars.next();
                            depth += 1;
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
                // keep token separation where the comment sat
                out.push(' ');
            }
            _ => out.push(c),
        }
    }

    out
}

/// Remove `[` `]` identifier quoting outside string literals.
pub fn strip_brackets(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut in_string = false;
    for c in sql.chars() {
        if c == '\'' {
            in_string = !in_string;
        }
        if !in_string && (c == '[' || c == ']') {
            continue;
        }
        out.push(c);
    }
    out
}

/// Drop `dbo.` schema qualification; the warehouse has no schema prefixes.
pub fn strip_schema_prefix(sql: &str) -> String {
    SCHEMA_PREFIX_RE.replace_all(sql, "").into_owned()
}

/// Translate the on-prem standard-deviation functions to the warehouse
/// equivalents: STDEV -> STDDEV, STDEVP -> STDDEV_POP.
pub fn translate_stddev(sql: &str) -> String {
    STDEV_RE
        .replace_all(sql, |caps: &regex::Captures| {
            if caps[1].eq_ignore_ascii_case("stdevp") {
                "STDDEV_POP(".to_string()
            } else {
                "STDDEV(".to_string()
            }
        })
        .into_owned()
}

/// Rewrite every `TOP n` clause, including those in nested subqueries, into
/// an equivalent `LIMIT n` by parsing to AST, walking each query node, and
/// re-serializing. `TOP n PERCENT` and `TOP n WITH TIES` are hard errors:
/// neither has a LIMIT equivalent and silently dropping the modifier would
/// change the result set.
pub fn top_to_limit(sql: &str) -> Result<String, DialectError> {
    let dialect = MsSqlDialect {};
    let mut statements = Parser::parse_sql(&dialect, sql)?;
    if statements.is_empty() {
        return Err(DialectError::Empty);
    }

    for statement in &mut statements {
        if let Statement::Query(query) = statement {
            rewrite_query(query)?;
        }
    }

    Ok(statements
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join("; "))
}

fn rewrite_query(query: &mut Query) -> Result<(), DialectError> {
    if let Some(with) = query.with.as_mut() {
        for cte in &mut with.cte_tables {
            rewrite_query(&mut cte.query)?;
        }
    }
    rewrite_set_expr(&mut query.body, Some(&mut query.limit_clause))
}

fn rewrite_set_expr(
    body: &mut SetExpr,
    limit_slot: Option<&mut Option<LimitClause>>,
) -> Result<(), DialectError> {
    let pending = match body {
        SetExpr::Select(select) => {
            for table in &mut select.from {
                rewrite_table_with_joins(table)?;
            }
            for item in &mut select.projection {
                match item {
                    SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => {
                        rewrite_expr(expr)?;
                    }
                    _ => {}
                }
            }
            if let Some(selection) = select.selection.as_mut() {
                rewrite_expr(selection)?;
            }
            if let Some(having) = select.having.as_mut() {
                rewrite_expr(having)?;
            }
            match select.top.take() {
                Some(top) => convert_top(top)?,
                None => None,
            }
        }
        SetExpr::Query(inner) => {
            rewrite_query(inner)?;
            None
        }
        SetExpr::SetOperation { left, right, .. } => {
            rewrite_set_expr(left, None)?;
            rewrite_set_expr(right, None)?;
            None
        }
        _ => None,
    };

    if let Some(limit) = pending {
        match limit_slot {
            // hoist onto the enclosing query when it has no limit of its own
            Some(slot) if slot.is_none() => *slot = Some(limit),
            // no slot available (set-operation branch): wrap the select in
            // its own parenthesized query carrying the limit
            _ => wrap_with_limit(body, limit),
        }
    }
    Ok(())
}

fn rewrite_table_with_joins(table: &mut TableWithJoins) -> Result<(), DialectError> {
    rewrite_table_factor(&mut table.relation)?;
    for join in &mut table.joins {
        rewrite_table_factor(&mut join.relation)?;
    }
    Ok(())
}

fn rewrite_table_factor(factor: &mut TableFactor) -> Result<(), DialectError> {
    match factor {
        TableFactor::Derived { subquery, .. } => rewrite_query(subquery),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => rewrite_table_with_joins(table_with_joins),
        _ => Ok(()),
    }
}

fn rewrite_expr(expr: &mut Expr) -> Result<(), DialectError> {
    match expr {
        Expr::BinaryOp { left, right, .. } => {
            rewrite_expr(left)?;
            rewrite_expr(right)
        }
        Expr::UnaryOp { expr, .. } | Expr::Nested(expr) => rewrite_expr(expr),
        Expr::Between {
            expr, low, high, ..
        } => {
            rewrite_expr(expr)?;
            rewrite_expr(low)?;
            rewrite_expr(high)
        }
        Expr::InSubquery { expr, subquery, .. } => {
            rewrite_expr(expr)?;
            rewrite_query(subquery)
        }
        Expr::Subquery(query) => rewrite_query(query),
        Expr::Exists { subquery, .. } => rewrite_query(subquery),
        _ => Ok(()),
    }
}

fn convert_top(top: Top) -> Result<Option<LimitClause>, DialectError> {
    if top.percent {
        return Err(DialectError::PercentTop);
    }
    if top.with_ties {
        return Err(DialectError::WithTiesTop);
    }
    let quantity = match top.quantity {
        Some(TopQuantity::Constant(n)) => Expr::Value(Value::Number(n.to_string(), false).into()),
        Some(TopQuantity::Expr(expr)) => expr,
        None => return Ok(None),
    };
    Ok(Some(LimitClause::LimitOffset {
        limit: Some(quantity),
        offset: None,
        limit_by: vec![],
    }))
}

fn wrap_with_limit(body: &mut SetExpr, limit: LimitClause) {
    let inner = std::mem::replace(
        body,
        SetExpr::Values(Values {
            explicit_row: false,
            value_keyword: false,
            rows: vec![],
        }),
    );
    *body = SetExpr::Query(Box::new(Query {
        with: None,
        body: Box::new(inner),
        order_by: None,
        limit_clause: Some(limit),
        fetch: None,
        locks: vec![],
        for_clause: None,
        settings: None,
        format_clause: None,
        pipe_operators: vec![],
    }));
}

/// Full preparation pipeline for warehouse execution. Order matters:
/// comments first (so later stages never react to commented-out SQL),
/// then quoting, schema prefixes, function names, and the TOP rewrite.
pub fn prepare_for_cluster(sql: &str) -> Result<String, DialectError> {
    let cleaned = strip_comments(sql);
    let cleaned = strip_brackets(&cleaned);
    let cleaned = strip_schema_prefix(&cleaned);
    let cleaned = translate_stddev(&cleaned);

    // Only involve the parser when a TOP clause is actually present; the
    // warehouse accepts the text as-is otherwise.
    if TOP_RE.is_match(&cleaned) {
        top_to_limit(&cleaned)
    } else {
        Ok(cleaned.trim().to_string())
    }
}

/// Preparation pipeline for analysis: comments out, whitespace collapsed.
pub fn prepare_for_analysis(sql: &str) -> String {
    strip_comments(sql)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_line_comments() {
        let sql = "SELECT * FROM tblArgo -- trailing note\nWHERE lat > 0";
        let stripped = strip_comments(sql);
        assert!(!stripped.contains("trailing"));
        assert!(stripped.contains("WHERE lat > 0"));
    }

    #[test]
    fn test_strip_block_comments_nested() {
        let sql = "SELECT /* outer /* inner */ still outer */ col FROM tblArgo";
        let stripped = strip_comments(sql);
        assert!(!stripped.contains("outer"));
        assert!(!stripped.contains("inner"));
        assert!(stripped.contains("col FROM tblArgo"));
    }

    #[test]
    fn test_strip_comments_idempotent() {
        let sql = "SELECT a /* c1 */ FROM t -- c2\nWHERE b = '-- not a comment /* either */'";
        let once = strip_comments(sql);
        let twice = strip_comments(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_strip_comments_preserves_string_literals() {
        let sql = "SELECT '--keep' AS a, '/*keep*/' AS b FROM tblArgo";
        let stripped = strip_comments(sql);
        assert!(stripped.contains("'--keep'"));
        assert!(stripped.contains("'/*keep*/'"));
    }

    #[test]
    fn test_strip_comments_escaped_quote() {
        let sql = "SELECT 'it''s -- fine' FROM tblArgo -- real comment";
        let stripped = strip_comments(sql);
        assert!(stripped.contains("'it''s -- fine'"));
        assert!(!stripped.contains("real comment"));
    }

    #[test]
    fn test_strip_brackets() {
        let sql = "SELECT [lat], [lon] FROM [dbo].[tblArgo]";
        assert_eq!(strip_brackets(sql), "SELECT lat, lon FROM dbo.tblArgo");
    }

    #[test]
    fn test_strip_schema_prefix() {
        assert_eq!(
            strip_schema_prefix("SELECT * FROM dbo.tblArgo JOIN DBO.tblCruise ON 1=1"),
            "SELECT * FROM tblArgo JOIN tblCruise ON 1=1"
        );
    }

    #[test]
    fn test_translate_stddev() {
        let sql = "SELECT STDEV(temp), stdevp(sal) FROM tblArgo";
        let translated = translate_stddev(sql);
        assert!(translated.contains("STDDEV(temp)"));
        assert!(translated.contains("STDDEV_POP(sal)"));
    }

    #[test]
    fn test_stddev_leaves_other_identifiers() {
        let sql = "SELECT stdev_score FROM tblArgo";
        assert_eq!(translate_stddev(sql), sql);
    }

    #[test]
    fn test_top_to_limit_top_level() {
        let rewritten = top_to_limit("SELECT TOP 10 lat FROM tblArgo ORDER BY lat").unwrap();
        assert!(!rewritten.to_uppercase().contains("TOP"));
        assert!(rewritten.to_uppercase().contains("LIMIT 10"));
    }

    #[test]
    fn test_top_to_limit_nested_subquery() {
        let sql = "SELECT TOP 5 * FROM (SELECT TOP 100 lat FROM tblArgo) x";
        let rewritten = top_to_limit(sql).unwrap();
        assert!(!rewritten.to_uppercase().contains("TOP"));
        assert!(rewritten.contains("LIMIT 5"));
        assert!(rewritten.contains("LIMIT 100"));
    }

    #[test]
    fn test_top_percent_is_an_error() {
        let result = top_to_limit("SELECT TOP 10 PERCENT lat FROM tblArgo");
        assert!(matches!(result, Err(DialectError::PercentTop)));
    }

    #[test]
    fn test_top_expression_quantity() {
        let rewritten = top_to_limit("SELECT TOP (25) lat FROM tblArgo").unwrap();
        assert!(rewritten.contains("LIMIT"));
    }

    #[test]
    fn test_prepare_for_cluster_pipeline() {
        let sql = "SELECT TOP 3 [lat], STDEV(temp) /* note */ FROM [dbo].[tblArgo]";
        let prepared = prepare_for_cluster(sql).unwrap();
        assert!(!prepared.contains('['));
        assert!(!prepared.to_lowercase().contains("dbo."));
        assert!(prepared.contains("STDDEV"));
        assert!(prepared.to_uppercase().contains("LIMIT 3"));
    }

    #[test]
    fn test_prepare_for_cluster_without_top_skips_parser() {
        // backticks would fail the parser; without a TOP clause the text
        // passes through untouched apart from the string transforms
        let sql = "SELECT `odd` FROM tblArgo -- comment";
        let prepared = prepare_for_cluster(sql).unwrap();
        assert!(prepared.contains("`odd`"));
        assert!(!prepared.contains("comment"));
    }

    #[test]
    fn test_prepare_for_analysis_collapses_whitespace() {
        let sql = "SELECT   *\n\tFROM tblArgo /* gone */ WHERE 1=1";
        assert_eq!(
            prepare_for_analysis(sql),
            "SELECT * FROM tblArgo WHERE 1=1"
        );
    }
}

use sqlparser::ast::Statement;
use sqlparser::dialect::MsSqlDialect;
use sqlparser::parser::Parser;

use crate::api::middleware::AppError;
use crate::services::dialect;

/// Read-only gate applied before any analysis or routing.
pub struct SqlValidator;

impl SqlValidator {
    /// Reject anything that is not a read: ad-hoc statements must parse to
    /// query statements only. `EXEC`-style procedure calls bypass the AST
    /// check; the analyzer classifies them and non-conventional procedures
    /// simply never route. A parse failure is not a rejection, because the
    /// analyzer (and the backends) tolerate dialect extensions the parser
    /// does not.
    pub fn validate_read_only(sql: &str) -> Result<(), AppError> {
        let normalized = dialect::prepare_for_analysis(sql);
        if normalized.is_empty() {
            return Err(AppError::Validation("SQL query cannot be empty".to_string()));
        }

        let lowered = normalized.to_lowercase();
        if lowered.starts_with("exec ") || lowered.starts_with("execute ") {
            return Ok(());
        }

        let dialect = MsSqlDialect {};
        let ast = match Parser::parse_sql(&dialect, &normalized) {
            Ok(ast) => ast,
            Err(e) => {
                tracing::debug!("read-only validation could not parse query, allowing: {}", e);
                return Ok(());
            }
        };

        for stmt in ast {
            match stmt {
                Statement::Query(_) => {
                    // Valid read query
                }
                Statement::Insert { .. } => {
                    return Err(AppError::Validation(
                        "INSERT statements are not allowed. Only read queries are permitted.".to_string(),
                    ));
                }
                Statement::Update { .. } => {
                    return Err(AppError::Validation(
                        "UPDATE statements are not allowed. Only read queries are permitted.".to_string(),
                    ));
                }
                Statement::Delete { .. } => {
                    return Err(AppError::Validation(
                        "DELETE statements are not allowed. Only read queries are permitted.".to_string(),
                    ));
                }
                Statement::Drop { .. } => {
                    return Err(AppError::Validation(
                        "DROP statements are not allowed. Only read queries are permitted.".to_string(),
                    ));
                }
                Statement::CreateTable { .. } => {
                    return Err(AppError::Validation(
                        "CREATE TABLE statements are not allowed. Only read queries are permitted.".to_string(),
                    ));
                }
                Statement::AlterTable { .. } => {
                    return Err(AppError::Validation(
                        "ALTER TABLE statements are not allowed. Only read queries are permitted.".to_string(),
                    ));
                }
                other => {
                    return Err(AppError::Validation(format!(
                        "Only read queries are permitted. Found: {:?}",
                        other
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_is_allowed() {
        assert!(SqlValidator::validate_read_only("SELECT lat FROM tblArgo").is_ok());
    }

    #[test]
    fn test_writes_are_rejected() {
        assert!(SqlValidator::validate_read_only("INSERT INTO tblArgo VALUES (1)").is_err());
        assert!(SqlValidator::validate_read_only("UPDATE tblArgo SET lat = 0").is_err());
        assert!(SqlValidator::validate_read_only("DELETE FROM tblArgo").is_err());
        assert!(SqlValidator::validate_read_only("DROP TABLE tblArgo").is_err());
    }

    #[test]
    fn test_exec_bypasses_ast_validation() {
        assert!(SqlValidator::validate_read_only("EXEC uspSpaceTime 'tblArgo'").is_ok());
    }

    #[test]
    fn test_empty_query_rejected() {
        assert!(SqlValidator::validate_read_only("  -- just a comment").is_err());
    }

    #[test]
    fn test_unparseable_read_is_allowed() {
        // backticks defeat the parser; the backend gets the final say
        assert!(SqlValidator::validate_read_only("SELECT `lat` FROM tblArgo").is_ok());
    }

    #[test]
    fn test_write_hidden_behind_comment_still_rejected() {
        let sql = "/* harmless */ DELETE FROM tblArgo";
        assert!(SqlValidator::validate_read_only(sql).is_err());
    }
}

//! Identifier quoting delegated to the server's own `sys.quote_identifier`,
//! so edge cases (embedded backticks, reserved words, exotic charsets) are
//! handled by the exact rules of the server being targeted rather than a
//! local reimplementation.

use std::future::Future;

use mysql_async::prelude::*;
use mysql_async::{Conn, Row};

use crate::error::{RegrantError, Result};

/// Source of safely quoted identifiers.
///
/// Implemented for a live connection; tests substitute a local fake so
/// statement construction stays exercisable without a server.
pub trait IdentifierQuoter {
    fn quote(&mut self, ident: &str) -> impl Future<Output = Result<String>> + Send;

    /// Quote a batch in one round trip. Implementations fail the whole batch
    /// on any error; callers never receive a partially quoted list.
    fn quote_all(&mut self, idents: &[String])
        -> impl Future<Output = Result<Vec<String>>> + Send;
}

impl IdentifierQuoter for Conn {
    fn quote(&mut self, ident: &str) -> impl Future<Output = Result<String>> + Send {
        async move {
            let quoted: Option<String> = self
                .exec_first("SELECT sys.quote_identifier(?)", (ident,))
                .await
                .map_err(|e| RegrantError::connection_failed(e.to_string()))?;
            quoted.ok_or_else(|| {
                RegrantError::connection_failed(format!(
                    "quoting identifier `{ident}` returned no row"
                ))
            })
        }
    }

    fn quote_all(
        &mut self,
        idents: &[String],
    ) -> impl Future<Output = Result<Vec<String>>> + Send {
        async move {
            if idents.is_empty() {
                return Ok(Vec::new());
            }

            let sql = batch_quote_sql(idents.len());
            let params: Vec<mysql_async::Value> =
                idents.iter().map(|ident| ident.as_str().into()).collect();
            let row: Option<Row> = self
                .exec_first(sql, params)
                .await
                .map_err(|e| RegrantError::connection_failed(e.to_string()))?;
            let mut row = row.ok_or_else(|| {
                RegrantError::connection_failed("quoting identifiers returned no row")
            })?;

            let mut quoted = Vec::with_capacity(idents.len());
            for (i, ident) in idents.iter().enumerate() {
                let value: String = row
                    .take_opt(i)
                    .and_then(|v| v.ok())
                    .ok_or_else(|| {
                        RegrantError::connection_failed(format!(
                            "quoting identifier `{ident}` returned no value"
                        ))
                    })?;
                quoted.push(value);
            }
            Ok(quoted)
        }
    }
}

/// One `SELECT` with one `sys.quote_identifier(?)` column per identifier
fn batch_quote_sql(count: usize) -> String {
    let mut sql = String::from("SELECT ");
    for i in 0..count {
        if i > 0 {
            sql.push(',');
        }
        sql.push_str("sys.quote_identifier(?)");
    }
    sql
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_quote_sql_shape() {
        assert_eq!(batch_quote_sql(1), "SELECT sys.quote_identifier(?)");
        assert_eq!(
            batch_quote_sql(3),
            "SELECT sys.quote_identifier(?),sys.quote_identifier(?),sys.quote_identifier(?)"
        );
    }
}

//! Reconciliation
//!
//! The outward-facing engine: observe what the server has, diff against what
//! the caller wants, and execute the plan as revokes followed by grants.
//!
//! Execution is convergent, not transactional. MySQL commits each DDL
//! statement on its own, so a failure partway leaves the earlier statements
//! applied; the error reports which statement failed and a later run
//! re-observes and finishes the remaining distance. Observation runs on the
//! same connection that executes, so a plan is never built from one server
//! state and applied to another through a different pool member.

mod privilege;
mod role;

use mysql_async::prelude::*;
use mysql_async::Conn;

use crate::conn::{ConnectSettings, ConnectionManager, ServerVersion};
use crate::error::{RegrantError, Result};
use crate::stmt::SqlStatement;

/// Drives privilege, role and default-role convergence against one server.
pub struct Reconciler {
    manager: ConnectionManager,
    settings: ConnectSettings,
}

impl Reconciler {
    #[must_use]
    pub fn new(settings: ConnectSettings) -> Self {
        Self { manager: ConnectionManager::new(), settings }
    }

    #[must_use]
    pub fn settings(&self) -> &ConnectSettings {
        &self.settings
    }

    /// Version of the server this reconciler targets
    pub async fn server_version(&self) -> Result<ServerVersion> {
        self.manager.server_version(&self.settings).await
    }

    /// Disconnect the underlying pools
    pub async fn shutdown(self) -> Result<()> {
        self.manager.shutdown().await
    }

    async fn connection(&self) -> Result<Conn> {
        let (conn, _) = self.manager.acquire(&self.settings).await?;
        Ok(conn)
    }
}

/// Interpolate and run one statement over the text protocol
async fn execute(conn: &mut Conn, stmt: &SqlStatement) -> Result<()> {
    let sql = stmt.interpolate()?;
    tracing::debug!(statement = %stmt.sql, params = ?stmt.params, "executing statement");
    conn.query_drop(sql.as_str())
        .await
        .map_err(|e| RegrantError::execution_failed(sql, e.to_string()))
}

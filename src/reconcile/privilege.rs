//! Privilege reconciliation: `SHOW GRANTS` observation, diffing and the
//! revoke-then-grant application path.

use mysql_async::prelude::*;
use mysql_async::Conn;

use super::{execute, Reconciler};
use crate::diff::{diff_privileges, PrivilegeDiff};
use crate::error::{RegrantError, Result};
use crate::parse::parse_grant_line;
use crate::state::{Principal, PrivilegeGrantState, PrivilegeLevel};
use crate::stmt::{build_grant, build_revoke, SqlStatement};

impl Reconciler {
    /// Converge one privilege scope onto the desired state and return its
    /// grant id.
    ///
    /// Revokes run before grants so a column replacement never leaves the
    /// union of old and new behind. Both directions carry the desired
    /// grant-option flag: the revoke drops an option the server holds, the
    /// grant re-establishes it when wanted.
    pub async fn reconcile_privileges(&self, desired: &PrivilegeGrantState) -> Result<String> {
        desired.validate()?;
        let mut conn = self.connection().await?;
        let observed = observe_on(&mut conn, &desired.level, &desired.principal).await?;

        let plan = diff_privileges(desired, &observed);
        if plan.is_empty() {
            tracing::debug!(grant_id = %desired.grant_id(), "privileges already converged");
            return Ok(desired.grant_id());
        }

        apply_plan(&mut conn, &plan, desired).await?;
        tracing::info!(
            grant_id = %desired.grant_id(),
            granted = plan.to_grant.len(),
            revoked = plan.to_revoke.len(),
            "applied privilege changes"
        );
        Ok(desired.grant_id())
    }

    /// Read the server's current privilege state for one scope.
    ///
    /// A principal with no matching grant lines observes as an empty state,
    /// not an error.
    pub async fn observe_privileges(
        &self,
        principal: &Principal,
        level: &PrivilegeLevel,
    ) -> Result<PrivilegeGrantState> {
        principal.validate()?;
        let mut conn = self.connection().await?;
        observe_on(&mut conn, level, principal).await
    }

    /// Revoke everything the desired state describes. An empty desired state
    /// has nothing to tear down and is a no-op.
    pub async fn destroy_privileges(&self, desired: &PrivilegeGrantState) -> Result<()> {
        desired.validate()?;
        if desired.entries().is_empty() {
            return Ok(());
        }
        let mut conn = self.connection().await?;
        let stmt = build_revoke(
            &mut conn,
            desired.entries(),
            &desired.level,
            &desired.principal,
            desired.grant_option,
        )
        .await?;
        execute(&mut conn, &stmt).await
    }
}

async fn apply_plan(
    conn: &mut Conn,
    plan: &PrivilegeDiff,
    desired: &PrivilegeGrantState,
) -> Result<()> {
    if !plan.to_revoke.is_empty() {
        let stmt = build_revoke(
            conn,
            &plan.to_revoke,
            &desired.level,
            &desired.principal,
            desired.grant_option,
        )
        .await?;
        execute(conn, &stmt).await?;
    }
    if !plan.to_grant.is_empty() {
        let stmt = build_grant(
            conn,
            &plan.to_grant,
            &desired.level,
            &desired.principal,
            desired.grant_option,
        )
        .await?;
        execute(conn, &stmt).await?;
    }
    Ok(())
}

async fn observe_on(
    conn: &mut Conn,
    level: &PrivilegeLevel,
    principal: &Principal,
) -> Result<PrivilegeGrantState> {
    let show = SqlStatement {
        sql: "SHOW GRANTS FOR ?@?".to_string(),
        params: vec![principal.name.clone(), principal.host_or_wildcard().to_string()],
    };
    let sql = show.interpolate()?;
    tracing::debug!(statement = %show.sql, params = ?show.params, "observing grants");
    let lines: Vec<String> = conn
        .query(sql.as_str())
        .await
        .map_err(|e| RegrantError::execution_failed(sql, e.to_string()))?;
    fold_grant_lines(&lines, level, principal)
}

/// Fold the matching `SHOW GRANTS` lines into one observed state.
///
/// The server may spread a scope over several lines; entries merge per
/// keyword and the grant-option flag is set if any matching line carries it.
fn fold_grant_lines(
    lines: &[String],
    level: &PrivilegeLevel,
    principal: &Principal,
) -> Result<PrivilegeGrantState> {
    let observed_principal =
        Principal::new(principal.name.clone(), principal.host_or_wildcard());
    let mut state = PrivilegeGrantState::new(observed_principal, level.clone());

    for line in lines {
        if let Some(parsed) = parse_grant_line(line, level, principal)? {
            for entry in parsed.entries() {
                state.add_entry(entry.clone());
            }
            state.grant_option = state.grant_option || parsed.grant_option;
        }
    }
    Ok(state)
}

//! Role and default-role reconciliation.
//!
//! Role membership is observed from `mysql.role_edges` rather than parsed
//! out of `SHOW GRANTS`, so observed roles always carry the concrete host of
//! the edge that exists. Default roles have no diff at all: the server
//! replaces the whole set in one `ALTER USER`, so reconciliation is a single
//! statement.

use mysql_async::prelude::*;
use mysql_async::Conn;

use super::{execute, Reconciler};
use crate::diff::diff_roles;
use crate::error::{RegrantError, Result};
use crate::state::{DefaultRoleState, Principal, RoleGrantState};
use crate::stmt::{build_default_roles, build_grant_roles, build_revoke_roles};

const ROLE_EDGES_QUERY: &str = "SELECT FROM_USER, FROM_HOST, WITH_ADMIN_OPTION \
     FROM mysql.role_edges WHERE TO_USER = ? AND TO_HOST = ?";

const DEFAULT_ROLES_QUERY: &str = "SELECT DEFAULT_ROLE_USER, DEFAULT_ROLE_HOST \
     FROM mysql.default_roles WHERE USER = ? AND HOST = ?";

impl Reconciler {
    /// Converge a grantee's role memberships and return the grant id.
    ///
    /// Revokes name the edges that actually exist, with their observed
    /// hosts; grants name the roles as configured, letting the server apply
    /// its own `%` default when a host is unpinned.
    pub async fn reconcile_roles(&self, desired: &RoleGrantState) -> Result<String> {
        desired.validate()?;
        let mut conn = self.connection().await?;
        let observed = observe_roles_on(&mut conn, &desired.grantee).await?;

        let plan = diff_roles(desired, &observed);
        if plan.is_empty() {
            tracing::debug!(grant_id = %desired.grant_id(), "roles already converged");
            return Ok(desired.grant_id());
        }

        if !plan.to_revoke.is_empty() {
            let stmt = build_revoke_roles(&plan.to_revoke, &desired.grantee)?;
            execute(&mut conn, &stmt).await?;
        }
        if !plan.to_grant.is_empty() {
            let stmt = build_grant_roles(&plan.to_grant, &desired.grantee, desired.admin_option)?;
            execute(&mut conn, &stmt).await?;
        }
        tracing::info!(
            grant_id = %desired.grant_id(),
            granted = plan.to_grant.len(),
            revoked = plan.to_revoke.len(),
            "applied role changes"
        );
        Ok(desired.grant_id())
    }

    /// Read a grantee's current role memberships
    pub async fn observe_roles(&self, grantee: &Principal) -> Result<RoleGrantState> {
        grantee.validate()?;
        let mut conn = self.connection().await?;
        observe_roles_on(&mut conn, grantee).await
    }

    /// Revoke every role the desired state names; empty is a no-op
    pub async fn destroy_roles(&self, desired: &RoleGrantState) -> Result<()> {
        desired.validate()?;
        if desired.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection().await?;
        let stmt = build_revoke_roles(desired.roles(), &desired.grantee)?;
        execute(&mut conn, &stmt).await
    }

    /// Replace a user's default roles wholesale and return the grant id
    pub async fn reconcile_default_roles(&self, desired: &DefaultRoleState) -> Result<String> {
        desired.validate()?;
        let mut conn = self.connection().await?;
        let stmt = build_default_roles(desired.roles(), &desired.user)?;
        execute(&mut conn, &stmt).await?;
        tracing::info!(
            grant_id = %desired.grant_id(),
            roles = desired.roles().len(),
            "set default roles"
        );
        Ok(desired.grant_id())
    }

    /// Read a user's current default roles
    pub async fn observe_default_roles(&self, user: &Principal) -> Result<DefaultRoleState> {
        user.validate()?;
        let mut conn = self.connection().await?;
        let rows: Vec<(String, String)> = conn
            .exec(DEFAULT_ROLES_QUERY, (user.name.as_str(), user.host_or_wildcard()))
            .await
            .map_err(|e| RegrantError::execution_failed(DEFAULT_ROLES_QUERY, e.to_string()))?;
        Ok(fold_default_role_rows(user, rows))
    }

    /// Reset a user's default roles to `NONE`
    pub async fn destroy_default_roles(&self, user: &Principal) -> Result<()> {
        user.validate()?;
        let mut conn = self.connection().await?;
        let stmt = build_default_roles(&[], user)?;
        execute(&mut conn, &stmt).await
    }
}

async fn observe_roles_on(conn: &mut Conn, grantee: &Principal) -> Result<RoleGrantState> {
    let rows: Vec<(String, String, String)> = conn
        .exec(ROLE_EDGES_QUERY, (grantee.name.as_str(), grantee.host_or_wildcard()))
        .await
        .map_err(|e| RegrantError::execution_failed(ROLE_EDGES_QUERY, e.to_string()))?;
    Ok(fold_role_edges(grantee, rows))
}

/// Fold `role_edges` rows into an observed state. Roles come out sorted; the
/// admin flag is set if any edge carries it.
fn fold_role_edges(grantee: &Principal, rows: Vec<(String, String, String)>) -> RoleGrantState {
    let mut state =
        RoleGrantState::new(Principal::new(grantee.name.clone(), grantee.host_or_wildcard()));

    let mut roles = Vec::with_capacity(rows.len());
    for (name, host, admin) in rows {
        if admin == "Y" {
            state.admin_option = true;
        }
        roles.push(Principal::new(name, host));
    }
    roles.sort();
    for role in roles {
        state.add_role(role);
    }
    state
}

fn fold_default_role_rows(user: &Principal, rows: Vec<(String, String)>) -> DefaultRoleState {
    let mut state =
        DefaultRoleState::new(Principal::new(user.name.clone(), user.host_or_wildcard()));

    let mut roles: Vec<Principal> =
        rows.into_iter().map(|(name, host)| Principal::new(name, host)).collect();
    roles.sort();
    for role in roles {
        state.add_role(role);
    }
    state
}

//! State Diffing
//!
//! Pure comparison of a desired grant state against an observed one,
//! producing typed plans of what to grant and what to revoke. Nothing here
//! touches a connection; executing the plan is the reconciler's job.
//!
//! Columns are replaced, not patched: when a keyword exists on both sides
//! with different column lists, the plan revokes the observed entry and
//! grants the desired one, so the server ends up with exactly the desired
//! columns. Privilege keywords are compared textually (`ALL PRIVILEGES` is
//! never expanded into its constituents) and case-insensitively.
//!
//! The grant-option and admin-option flags are carried by the statements the
//! builder emits, not diffed on their own: a flag-only change yields an empty
//! plan.
//!
//! Plans are deterministic: privilege entries come out sorted by keyword and
//! roles by (name, host), regardless of input order.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::state::{Principal, PrivilegeEntry, PrivilegeGrantState, RoleGrantState};

/// What to change to move one privilege scope from observed to desired.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PrivilegeDiff {
    pub to_grant: Vec<PrivilegeEntry>,
    pub to_revoke: Vec<PrivilegeEntry>,
}

impl PrivilegeDiff {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.to_grant.is_empty() && self.to_revoke.is_empty()
    }
}

/// What to change to move a grantee's role set from observed to desired.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RoleDiff {
    pub to_grant: Vec<Principal>,
    pub to_revoke: Vec<Principal>,
}

impl RoleDiff {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.to_grant.is_empty() && self.to_revoke.is_empty()
    }
}

/// Compare privilege entries per keyword.
///
/// A keyword present on both sides with identical column sets is settled;
/// any column difference puts the observed entry on the revoke list and the
/// desired entry on the grant list.
pub fn diff_privileges(
    desired: &PrivilegeGrantState,
    observed: &PrivilegeGrantState,
) -> PrivilegeDiff {
    let want: BTreeMap<String, &PrivilegeEntry> = desired
        .entries()
        .iter()
        .map(|entry| (entry.keyword.to_ascii_uppercase(), entry))
        .collect();
    let have: BTreeMap<String, &PrivilegeEntry> = observed
        .entries()
        .iter()
        .map(|entry| (entry.keyword.to_ascii_uppercase(), entry))
        .collect();

    let mut to_grant = Vec::new();
    for (keyword, entry) in &want {
        match have.get(keyword) {
            Some(existing) if existing.columns == entry.columns => {}
            _ => to_grant.push((*entry).clone()),
        }
    }

    let mut to_revoke = Vec::new();
    for (keyword, entry) in &have {
        match want.get(keyword) {
            Some(wanted) if wanted.columns == entry.columns => {}
            _ => to_revoke.push((*entry).clone()),
        }
    }

    PrivilegeDiff { to_grant, to_revoke }
}

/// Compare role memberships.
///
/// A desired role with an unpinned host matches an observed role of the same
/// name at any host, consuming the first such match. Revokes name the
/// observed principal with its concrete host, so the statement hits the edge
/// that actually exists; grants name the desired principal as configured.
pub fn diff_roles(desired: &RoleGrantState, observed: &RoleGrantState) -> RoleDiff {
    let mut remaining: Vec<&Principal> = observed.roles().iter().collect();
    let mut to_grant = Vec::new();
    for want in desired.roles() {
        if let Some(pos) = remaining.iter().position(|have| role_matches(want, have)) {
            remaining.remove(pos);
        } else {
            to_grant.push(want.clone());
        }
    }
    let mut to_revoke: Vec<Principal> = remaining.into_iter().cloned().collect();

    to_grant.sort();
    to_revoke.sort();
    RoleDiff { to_grant, to_revoke }
}

fn role_matches(want: &Principal, have: &Principal) -> bool {
    want.name == have.name
        && match (&want.host, &have.host) {
            (Some(wanted), Some(actual)) => wanted == actual,
            _ => true,
        }
}

//! Grant State Models
//!
//! The structured representation of who holds what: principals, privilege
//! levels, privilege entries, and the aggregate grant states the diff engine
//! compares. Desired states are built by the caller from its configuration;
//! observed states are built from live server output. Neither is persisted
//! here.
//!
//! # Invariants
//! - A `PrivilegeGrantState` holds at most one entry per privilege keyword
//!   (case-insensitive); `add_entry` merges column lists instead of duplicating.
//! - Role principals are unique per (name, host) within a `RoleGrantState`.
//! - Validation happens before any SQL is built: privilege keywords must be
//!   upper case, names are capped at 32 characters and hosts at 255, matching
//!   the server's own limits.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{RegrantError, Result};

/// Maximum length of a user or role name, per the server's column definition.
pub const MAX_NAME_LEN: usize = 32;

/// Maximum length of a host pattern, per the server's column definition.
pub const MAX_HOST_LEN: usize = 255;

/// The host pattern matching any host.
pub const ANY_HOST: &str = "%";

/// Wildcard database or table scope.
pub const WILDCARD: &str = "*";

/// A (name, host) identity that can be a grantee or a grant subject.
///
/// `host: None` means the host is not pinned: the principal matches a
/// counterpart at any host when states are compared, and takes the server's
/// `%` default where a concrete host is required in SQL.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Principal {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

impl Principal {
    /// Create a principal with a concrete host
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self { name: name.into(), host: Some(host.into()) }
    }

    /// Create a principal whose host is not pinned
    pub fn name_only(name: impl Into<String>) -> Self {
        Self { name: name.into(), host: None }
    }

    /// Parse `name@host` notation; a missing `@host` part leaves the host unpinned
    pub fn parse(s: &str) -> Self {
        match s.split_once('@') {
            Some((name, host)) => Self::new(name, host),
            None => Self::name_only(s),
        }
    }

    /// The concrete host, defaulting to `%` when not pinned
    #[must_use]
    pub fn host_or_wildcard(&self) -> &str {
        self.host.as_deref().unwrap_or(ANY_HOST)
    }

    /// Opaque `name@host` identifier
    #[must_use]
    pub fn id(&self) -> String {
        format!("{}@{}", self.name, self.host_or_wildcard())
    }

    /// Check server length limits (an empty name is the anonymous user and is legal)
    pub fn validate(&self) -> Result<()> {
        if self.name.len() > MAX_NAME_LEN {
            return Err(RegrantError::invalid_input(format!(
                "name `{}` exceeds {} characters",
                self.name, MAX_NAME_LEN
            )));
        }
        if let Some(host) = &self.host {
            if host.len() > MAX_HOST_LEN {
                return Err(RegrantError::invalid_input(format!(
                    "host `{}` exceeds {} characters",
                    host, MAX_HOST_LEN
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}'@'{}'", self.name, self.host_or_wildcard())
    }
}

/// The (database, table) scope a privilege grant applies to.
///
/// `*` denotes "all databases" or "all tables". A wildcard database implies
/// global scope; a concrete database with a `*` table is database scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivilegeLevel {
    pub database: String,
    pub table: String,
}

impl PrivilegeLevel {
    /// Scope covering a single table
    pub fn table(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self { database: database.into(), table: table.into() }
    }

    /// Scope covering every table of one database
    pub fn database(database: impl Into<String>) -> Self {
        Self::table(database, WILDCARD)
    }

    /// Global scope (`*.*`)
    #[must_use]
    pub fn global() -> Self {
        Self::table(WILDCARD, WILDCARD)
    }

    /// True when this level is `*.*`
    #[must_use]
    pub fn is_global(&self) -> bool {
        self.database == WILDCARD && self.table == WILDCARD
    }
}

impl fmt::Display for PrivilegeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.table)
    }
}

/// One privilege keyword with its optional column list.
///
/// Two entries are equal iff the keywords match case-insensitively and the
/// column sets are equal as sets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivilegeEntry {
    pub keyword: String,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub columns: BTreeSet<String>,
}

impl PrivilegeEntry {
    /// An entry applying to all columns
    pub fn new(keyword: impl Into<String>) -> Self {
        Self { keyword: keyword.into(), columns: BTreeSet::new() }
    }

    /// An entry restricted to specific columns
    pub fn with_columns<I, S>(keyword: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keyword: keyword.into(),
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }

    /// Reject keywords the builder must never emit: empty, or not upper case.
    ///
    /// Lower- and mixed-case keywords are a caller error, never silently
    /// normalized.
    pub fn validate(&self) -> Result<()> {
        if self.keyword.is_empty() {
            return Err(RegrantError::invalid_input("privilege keyword is empty"));
        }
        if self.keyword != self.keyword.to_ascii_uppercase() {
            return Err(RegrantError::invalid_input(format!(
                "privilege `{}` must be upper cases",
                self.keyword
            )));
        }
        Ok(())
    }
}

impl PartialEq for PrivilegeEntry {
    fn eq(&self, other: &Self) -> bool {
        self.keyword.eq_ignore_ascii_case(&other.keyword) && self.columns == other.columns
    }
}

impl Eq for PrivilegeEntry {}

/// The aggregate compared by the diff engine: a principal, a level, the set of
/// privilege entries, and the grant-option flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivilegeGrantState {
    pub principal: Principal,
    pub level: PrivilegeLevel,
    entries: Vec<PrivilegeEntry>,
    #[serde(default)]
    pub grant_option: bool,
}

impl PrivilegeGrantState {
    /// An empty state for the given scope
    pub fn new(principal: Principal, level: PrivilegeLevel) -> Self {
        Self { principal, level, entries: Vec::new(), grant_option: false }
    }

    /// Set the grant-option flag
    #[must_use]
    pub fn with_grant_option(mut self, grant_option: bool) -> Self {
        self.grant_option = grant_option;
        self
    }

    /// Add an entry, merging column lists when the keyword is already present
    pub fn add_entry(&mut self, entry: PrivilegeEntry) {
        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|e| e.keyword.eq_ignore_ascii_case(&entry.keyword))
        {
            existing.columns.extend(entry.columns);
        } else {
            self.entries.push(entry);
        }
    }

    #[must_use]
    pub fn entries(&self) -> &[PrivilegeEntry] {
        &self.entries
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Opaque identifier encoding the scope: `database@table@name@host`
    #[must_use]
    pub fn grant_id(&self) -> String {
        format!(
            "{}@{}@{}@{}",
            self.level.database,
            self.level.table,
            self.principal.name,
            self.principal.host_or_wildcard()
        )
    }

    /// Validate the principal and every entry before SQL construction
    pub fn validate(&self) -> Result<()> {
        self.principal.validate()?;
        for entry in &self.entries {
            entry.validate()?;
        }
        Ok(())
    }
}

/// A grantee and the set of roles granted to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleGrantState {
    pub grantee: Principal,
    roles: Vec<Principal>,
    #[serde(default)]
    pub admin_option: bool,
}

impl RoleGrantState {
    pub fn new(grantee: Principal) -> Self {
        Self { grantee, roles: Vec::new(), admin_option: false }
    }

    #[must_use]
    pub fn with_admin_option(mut self, admin_option: bool) -> Self {
        self.admin_option = admin_option;
        self
    }

    /// Add a role; duplicates by (name, host) are ignored
    pub fn add_role(&mut self, role: Principal) {
        if !self.roles.contains(&role) {
            self.roles.push(role);
        }
    }

    #[must_use]
    pub fn roles(&self) -> &[Principal] {
        &self.roles
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }

    /// Opaque identifier encoding the grantee: `name@host`
    #[must_use]
    pub fn grant_id(&self) -> String {
        self.grantee.id()
    }

    pub fn validate(&self) -> Result<()> {
        self.grantee.validate()?;
        for role in &self.roles {
            role.validate()?;
        }
        Ok(())
    }
}

/// The roles a user assumes by default when connecting.
///
/// Default roles are replaced wholesale by a single `ALTER USER` statement,
/// so this state carries no flags and is never diffed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultRoleState {
    pub user: Principal,
    roles: Vec<Principal>,
}

impl DefaultRoleState {
    pub fn new(user: Principal) -> Self {
        Self { user, roles: Vec::new() }
    }

    pub fn add_role(&mut self, role: Principal) {
        if !self.roles.contains(&role) {
            self.roles.push(role);
        }
    }

    #[must_use]
    pub fn roles(&self) -> &[Principal] {
        &self.roles
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }

    /// Opaque identifier encoding the user: `name@host`
    #[must_use]
    pub fn grant_id(&self) -> String {
        self.user.id()
    }

    pub fn validate(&self) -> Result<()> {
        self.user.validate()?;
        for role in &self.roles {
            role.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_principal_parse() {
        let p = Principal::parse("app@10.0.0.%");
        assert_eq!(p.name, "app");
        assert_eq!(p.host.as_deref(), Some("10.0.0.%"));

        let p = Principal::parse("reporting");
        assert_eq!(p.name, "reporting");
        assert_eq!(p.host, None);
        assert_eq!(p.host_or_wildcard(), "%");
    }

    #[test]
    fn test_principal_display_and_id() {
        let p = Principal::new("app", "localhost");
        assert_eq!(p.to_string(), "'app'@'localhost'");
        assert_eq!(p.id(), "app@localhost");

        let p = Principal::name_only("reader");
        assert_eq!(p.to_string(), "'reader'@'%'");
        assert_eq!(p.id(), "reader@%");
    }

    #[test]
    fn test_principal_length_limits() {
        let p = Principal::new("a".repeat(MAX_NAME_LEN), "%");
        assert!(p.validate().is_ok());

        let p = Principal::new("a".repeat(MAX_NAME_LEN + 1), "%");
        let err = p.validate().unwrap_err();
        assert_eq!(err.error_code(), "INVALID_INPUT");
        assert!(err.message().contains("exceeds 32 characters"));

        let p = Principal::new("app", "h".repeat(MAX_HOST_LEN + 1));
        let err = p.validate().unwrap_err();
        assert!(err.message().contains("exceeds 255 characters"));
    }

    #[test]
    fn test_privilege_level_constructors() {
        assert!(PrivilegeLevel::global().is_global());
        assert_eq!(PrivilegeLevel::global().to_string(), "*.*");

        let level = PrivilegeLevel::database("app_db");
        assert_eq!(level.database, "app_db");
        assert_eq!(level.table, "*");
        assert!(!level.is_global());

        assert_eq!(PrivilegeLevel::table("app_db", "users").to_string(), "app_db.users");
    }

    #[test]
    fn test_entry_equality_ignores_keyword_case_and_column_order() {
        let a = PrivilegeEntry::with_columns("SELECT", ["id", "name"]);
        let b = PrivilegeEntry::with_columns("select", ["name", "id"]);
        assert_eq!(a, b);

        let c = PrivilegeEntry::with_columns("SELECT", ["id"]);
        assert_ne!(a, c);

        let d = PrivilegeEntry::new("INSERT");
        assert_ne!(a, d);
    }

    #[test]
    fn test_entry_validate_rejects_lower_case() {
        assert!(PrivilegeEntry::new("SELECT").validate().is_ok());
        assert!(PrivilegeEntry::new("ALL PRIVILEGES").validate().is_ok());

        let err = PrivilegeEntry::new("select").validate().unwrap_err();
        assert_eq!(err.error_code(), "INVALID_INPUT");
        assert!(err.message().contains("must be upper cases"));

        let err = PrivilegeEntry::new("Select").validate().unwrap_err();
        assert!(err.message().contains("must be upper cases"));

        assert!(PrivilegeEntry::new("").validate().is_err());
    }

    #[test]
    fn test_add_entry_merges_columns_per_keyword() {
        let mut state =
            PrivilegeGrantState::new(Principal::new("app", "%"), PrivilegeLevel::database("db1"));
        state.add_entry(PrivilegeEntry::with_columns("SELECT", ["a"]));
        state.add_entry(PrivilegeEntry::with_columns("SELECT", ["b"]));
        state.add_entry(PrivilegeEntry::new("INSERT"));

        assert_eq!(state.entries().len(), 2);
        let select = &state.entries()[0];
        assert_eq!(select.keyword, "SELECT");
        assert_eq!(select.columns, BTreeSet::from(["a".to_string(), "b".to_string()]));
    }

    #[test]
    fn test_grant_id_formats() {
        let state = PrivilegeGrantState::new(
            Principal::new("app", "10.0.0.%"),
            PrivilegeLevel::table("db1", "tbl1"),
        );
        assert_eq!(state.grant_id(), "db1@tbl1@app@10.0.0.%");

        let mut roles = RoleGrantState::new(Principal::new("app", "%"));
        roles.add_role(Principal::name_only("reader"));
        assert_eq!(roles.grant_id(), "app@%");

        let defaults = DefaultRoleState::new(Principal::new("app", "%"));
        assert_eq!(defaults.grant_id(), "app@%");
    }

    #[test]
    fn test_role_state_dedupes_roles() {
        let mut state = RoleGrantState::new(Principal::new("app", "%"));
        state.add_role(Principal::new("reader", "%"));
        state.add_role(Principal::new("reader", "%"));
        state.add_role(Principal::name_only("reader"));

        // Pinned and unpinned hosts are distinct configuration entries
        assert_eq!(state.roles().len(), 2);
    }
}

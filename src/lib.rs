//! Regrant - Convergent MySQL Privilege Reconciliation
//!
//! Regrant observes the privilege and role grants a MySQL server actually holds,
//! compares them against a desired state, and issues the minimal set of GRANT and
//! REVOKE statements needed to converge the server to that state.
//!
//! # Core Principles
//! - Convergent, not transactional: a partially applied reconciliation is a
//!   legitimate terminal state that the next call re-observes and finishes
//! - Server-authoritative quoting (identifiers are quoted by the server itself,
//!   never escaped client-side)
//! - Replace, not patch: column-level privileges are revoked and re-granted
//!   wholesale because the server cannot edit a column list incrementally
//! - Deterministic output (diffs and built statements are stably ordered)
//!
//! # Architecture
//! A reconciliation flows through five stages: acquire a cached connection,
//! read the observed state, diff it against the desired state, build the
//! revoke/grant statements, execute them revoke-first. Each stage lives in its
//! own module and the pure stages (parse, diff, build rendering) never touch
//! the network.
//!
//! # Module Organization
//! - [`error`] - Error types and handling
//! - [`state`] - Principals, privilege levels, and grant state models
//! - [`conn`] - Connection settings, pooling, retry, and server version probing
//! - [`quote`] - Server-side identifier quoting
//! - [`parse`] - Parser for the server's grant-listing output
//! - [`diff`] - Set-difference between desired and observed state
//! - [`stmt`] - GRANT/REVOKE/ALTER USER statement construction
//! - [`reconcile`] - The outbound reconcile/observe/destroy API

pub mod conn;
pub mod diff;
pub mod error;
pub mod parse;
pub mod quote;
pub mod reconcile;
pub mod state;
pub mod stmt;

// Re-export commonly used types for convenience
pub use conn::{ConnectSettings, ConnectionManager, ServerVersion};
pub use diff::{diff_privileges, diff_roles, PrivilegeDiff, RoleDiff};
pub use error::{RegrantError, Result};
pub use parse::{parse_grant_line, parse_grant_statement};
pub use quote::IdentifierQuoter;
pub use reconcile::Reconciler;
pub use state::{
    DefaultRoleState, Principal, PrivilegeEntry, PrivilegeGrantState, PrivilegeLevel,
    RoleGrantState,
};
pub use stmt::SqlStatement;

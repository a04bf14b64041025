//! Statement Construction
//!
//! Builders turn diff plans into concrete `GRANT`, `REVOKE` and `ALTER USER`
//! statements. Principal positions are rendered as `?` placeholders with the
//! values carried alongside, because the server's prepared-statement protocol
//! refuses parameter markers in `user@host` positions: [`SqlStatement`]s are
//! interpolated client-side into escaped string literals and sent over the
//! text protocol instead.
//!
//! Identifiers (databases, tables, columns) are quoted through an
//! [`IdentifierQuoter`]; the `*` wildcard is emitted bare, never quoted, or
//! `*.*` would stop meaning "everything". Privilege keywords must already be
//! upper case; the builders reject anything else rather than normalizing.

use crate::error::{RegrantError, Result};
use crate::parse::Scanner;
use crate::quote::IdentifierQuoter;
use crate::state::{Principal, PrivilegeEntry, PrivilegeLevel, ANY_HOST, WILDCARD};

/// A statement with `?` placeholders and the values to splice into them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlStatement {
    pub sql: String,
    pub params: Vec<String>,
}

impl SqlStatement {
    /// Replace each top-level `?` with its parameter as an escaped,
    /// single-quoted literal. A `?` inside quotes or backticks is data and
    /// stays untouched. Placeholder and parameter counts must agree exactly.
    pub fn interpolate(&self) -> Result<String> {
        let bytes = self.sql.as_bytes();
        let mut out = String::with_capacity(self.sql.len() + self.params.len() * 16);
        let mut params = self.params.iter();
        let mut scanner = Scanner::new();
        let mut tail = 0;
        let mut i = 0;
        while i < bytes.len() {
            if scanner.at_top_level() && bytes[i] == b'?' {
                let value = params.next().ok_or_else(|| {
                    RegrantError::invalid_input(format!(
                        "not enough parameters for statement `{}`",
                        self.sql
                    ))
                })?;
                out.push_str(&self.sql[tail..i]);
                push_quoted(&mut out, value);
                tail = i + 1;
                i += 1;
                continue;
            }
            i = scanner.step(bytes, i);
        }
        out.push_str(&self.sql[tail..]);

        if params.next().is_some() {
            return Err(RegrantError::invalid_input(format!(
                "unused parameters for statement `{}`",
                self.sql
            )));
        }
        Ok(out)
    }
}

fn push_quoted(out: &mut String, value: &str) {
    out.push('\'');
    for c in value.chars() {
        match c {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\0' => out.push_str("\\0"),
            '\u{1a}' => out.push_str("\\Z"),
            c => out.push(c),
        }
    }
    out.push('\'');
}

/// `GRANT <privileges> ON <level> TO ?@?` with an optional
/// `WITH GRANT OPTION` suffix
pub async fn build_grant<Q: IdentifierQuoter>(
    quoter: &mut Q,
    entries: &[PrivilegeEntry],
    level: &PrivilegeLevel,
    principal: &Principal,
    grant_option: bool,
) -> Result<SqlStatement> {
    let mut sql = format!(
        "GRANT {} ON {} TO ?@?",
        render_privileges(quoter, entries).await?,
        render_level(quoter, level).await?,
    );
    if grant_option {
        sql.push_str(" WITH GRANT OPTION");
    }
    Ok(SqlStatement { sql, params: principal_params(principal) })
}

/// `REVOKE <privileges> ON <level> FROM ?@?`; when the grant option is held
/// it is revoked in the same statement
pub async fn build_revoke<Q: IdentifierQuoter>(
    quoter: &mut Q,
    entries: &[PrivilegeEntry],
    level: &PrivilegeLevel,
    principal: &Principal,
    grant_option: bool,
) -> Result<SqlStatement> {
    let mut privileges = render_privileges(quoter, entries).await?;
    if grant_option {
        privileges.push_str(",GRANT OPTION");
    }
    let sql = format!(
        "REVOKE {} ON {} FROM ?@?",
        privileges,
        render_level(quoter, level).await?,
    );
    Ok(SqlStatement { sql, params: principal_params(principal) })
}

/// `GRANT <roles> TO ?@?` with an optional `WITH ADMIN OPTION` suffix
pub fn build_grant_roles(
    roles: &[Principal],
    grantee: &Principal,
    admin_option: bool,
) -> Result<SqlStatement> {
    let (placeholders, mut params) = role_placeholders(roles)?;
    let mut sql = format!("GRANT {placeholders} TO ?@?");
    if admin_option {
        sql.push_str(" WITH ADMIN OPTION");
    }
    params.extend(principal_params(grantee));
    Ok(SqlStatement { sql, params })
}

/// `REVOKE <roles> FROM ?@?`
pub fn build_revoke_roles(roles: &[Principal], grantee: &Principal) -> Result<SqlStatement> {
    let (placeholders, mut params) = role_placeholders(roles)?;
    let sql = format!("REVOKE {placeholders} FROM ?@?");
    params.extend(principal_params(grantee));
    Ok(SqlStatement { sql, params })
}

/// `ALTER USER ?@? DEFAULT ROLE ...`; an empty role list renders as
/// `DEFAULT ROLE NONE`
pub fn build_default_roles(roles: &[Principal], user: &Principal) -> Result<SqlStatement> {
    let mut params = principal_params(user);
    if roles.is_empty() {
        return Ok(SqlStatement {
            sql: "ALTER USER ?@? DEFAULT ROLE NONE".to_string(),
            params,
        });
    }

    let placeholders = vec!["?@?"; roles.len()].join(",");
    for role in roles {
        params.push(role.name.clone());
        params.push(role_host(role).to_string());
    }
    Ok(SqlStatement {
        sql: format!("ALTER USER ?@? DEFAULT ROLE {placeholders}"),
        params,
    })
}

async fn render_privileges<Q: IdentifierQuoter>(
    quoter: &mut Q,
    entries: &[PrivilegeEntry],
) -> Result<String> {
    if entries.is_empty() {
        return Err(RegrantError::invalid_input("privilege list is empty"));
    }

    let mut rendered = Vec::with_capacity(entries.len());
    for entry in entries {
        entry.validate()?;
        if entry.columns.is_empty() {
            rendered.push(entry.keyword.clone());
        } else {
            let columns: Vec<String> = entry.columns.iter().cloned().collect();
            let quoted = quoter.quote_all(&columns).await?;
            rendered.push(format!("{} ({})", entry.keyword, quoted.join(",")));
        }
    }
    Ok(rendered.join(","))
}

async fn render_level<Q: IdentifierQuoter>(
    quoter: &mut Q,
    level: &PrivilegeLevel,
) -> Result<String> {
    let database = render_scope_part(quoter, &level.database).await?;
    let table = render_scope_part(quoter, &level.table).await?;
    Ok(format!("{database}.{table}"))
}

async fn render_scope_part<Q: IdentifierQuoter>(quoter: &mut Q, part: &str) -> Result<String> {
    if part == WILDCARD {
        return Ok(WILDCARD.to_string());
    }
    quoter.quote(part).await
}

fn role_placeholders(roles: &[Principal]) -> Result<(String, Vec<String>)> {
    if roles.is_empty() {
        return Err(RegrantError::invalid_input("role list is empty"));
    }

    let mut placeholders = Vec::with_capacity(roles.len());
    let mut params = Vec::new();
    for role in roles {
        match role.host.as_deref() {
            None | Some("") => {
                placeholders.push("?");
                params.push(role.name.clone());
            }
            Some(host) => {
                placeholders.push("?@?");
                params.push(role.name.clone());
                params.push(host.to_string());
            }
        }
    }
    Ok((placeholders.join(","), params))
}

fn role_host(role: &Principal) -> &str {
    match role.host.as_deref() {
        None | Some("") => ANY_HOST,
        Some(host) => host,
    }
}

fn principal_params(principal: &Principal) -> Vec<String> {
    vec![principal.name.clone(), principal.host_or_wildcard().to_string()]
}

#[cfg(test)]
mod tests {
    use std::future::Future;

    use pretty_assertions::assert_eq;

    use super::*;

    /// Local stand-in for `sys.quote_identifier`, counting server round trips
    struct FakeQuoter {
        calls: usize,
    }

    impl FakeQuoter {
        fn new() -> Self {
            Self { calls: 0 }
        }

        fn backtick(ident: &str) -> String {
            format!("`{}`", ident.replace('`', "``"))
        }
    }

    impl IdentifierQuoter for FakeQuoter {
        fn quote(&mut self, ident: &str) -> impl Future<Output = Result<String>> + Send {
            self.calls += 1;
            let quoted = Self::backtick(ident);
            async move { Ok(quoted) }
        }

        fn quote_all(
            &mut self,
            idents: &[String],
        ) -> impl Future<Output = Result<Vec<String>>> + Send {
            self.calls += 1;
            let quoted: Vec<String> = idents.iter().map(|i| Self::backtick(i)).collect();
            async move { Ok(quoted) }
        }
    }

    fn app() -> Principal {
        Principal::new("app", "10.0.0.%")
    }

    #[tokio::test]
    async fn test_build_grant_with_columns() {
        let mut quoter = FakeQuoter::new();
        let entries = [
            PrivilegeEntry::with_columns("SELECT", ["name", "id"]),
            PrivilegeEntry::new("UPDATE"),
        ];
        let stmt = build_grant(
            &mut quoter,
            &entries,
            &PrivilegeLevel::table("db", "tbl"),
            &app(),
            false,
        )
        .await
        .unwrap();

        assert_eq!(stmt.sql, "GRANT SELECT (`id`,`name`),UPDATE ON `db`.`tbl` TO ?@?");
        assert_eq!(stmt.params, vec!["app".to_string(), "10.0.0.%".to_string()]);
    }

    #[tokio::test]
    async fn test_build_grant_with_grant_option() {
        let mut quoter = FakeQuoter::new();
        let entries = [PrivilegeEntry::new("SELECT")];
        let stmt = build_grant(&mut quoter, &entries, &PrivilegeLevel::database("db1"), &app(), true)
            .await
            .unwrap();

        assert_eq!(stmt.sql, "GRANT SELECT ON `db1`.* TO ?@? WITH GRANT OPTION");
    }

    #[tokio::test]
    async fn test_wildcard_scope_never_touches_the_quoter() {
        let mut quoter = FakeQuoter::new();
        let entries = [PrivilegeEntry::new("SELECT")];
        let stmt =
            build_grant(&mut quoter, &entries, &PrivilegeLevel::global(), &app(), false)
                .await
                .unwrap();

        assert_eq!(stmt.sql, "GRANT SELECT ON *.* TO ?@?");
        assert_eq!(quoter.calls, 0);
    }

    #[tokio::test]
    async fn test_build_revoke_includes_grant_option_in_list() {
        let mut quoter = FakeQuoter::new();
        let entries = [PrivilegeEntry::new("SELECT"), PrivilegeEntry::new("INSERT")];
        let level = PrivilegeLevel::database("db1");

        let stmt = build_revoke(&mut quoter, &entries, &level, &app(), false).await.unwrap();
        assert_eq!(stmt.sql, "REVOKE SELECT,INSERT ON `db1`.* FROM ?@?");

        let stmt = build_revoke(&mut quoter, &entries, &level, &app(), true).await.unwrap();
        assert_eq!(stmt.sql, "REVOKE SELECT,INSERT,GRANT OPTION ON `db1`.* FROM ?@?");
    }

    #[tokio::test]
    async fn test_builders_reject_bad_input() {
        let mut quoter = FakeQuoter::new();
        let level = PrivilegeLevel::global();

        let err = build_grant(&mut quoter, &[], &level, &app(), false).await.unwrap_err();
        assert_eq!(err.error_code(), "INVALID_INPUT");

        let entries = [PrivilegeEntry::new("select")];
        let err = build_grant(&mut quoter, &entries, &level, &app(), false).await.unwrap_err();
        assert!(err.message().contains("must be upper cases"));

        let err = build_revoke(&mut quoter, &entries, &level, &app(), false).await.unwrap_err();
        assert!(err.message().contains("must be upper cases"));

        assert!(build_grant_roles(&[], &app(), false).is_err());
        assert!(build_revoke_roles(&[], &app()).is_err());
    }

    #[test]
    fn test_build_grant_roles_placeholder_shapes() {
        let roles = [Principal::name_only("reader"), Principal::new("writer", "10.%")];
        let stmt = build_grant_roles(&roles, &Principal::new("app", "%"), true).unwrap();

        assert_eq!(stmt.sql, "GRANT ?,?@? TO ?@? WITH ADMIN OPTION");
        assert_eq!(
            stmt.params,
            vec![
                "reader".to_string(),
                "writer".to_string(),
                "10.%".to_string(),
                "app".to_string(),
                "%".to_string(),
            ]
        );
    }

    #[test]
    fn test_build_revoke_roles() {
        let roles = [Principal::new("reader", "localhost")];
        let stmt = build_revoke_roles(&roles, &Principal::new("app", "%")).unwrap();

        assert_eq!(stmt.sql, "REVOKE ?@? FROM ?@?");
        assert_eq!(
            stmt.params,
            vec![
                "reader".to_string(),
                "localhost".to_string(),
                "app".to_string(),
                "%".to_string(),
            ]
        );
    }

    #[test]
    fn test_build_default_roles() {
        let user = Principal::new("app", "%");

        let stmt = build_default_roles(&[], &user).unwrap();
        assert_eq!(stmt.sql, "ALTER USER ?@? DEFAULT ROLE NONE");
        assert_eq!(stmt.params, vec!["app".to_string(), "%".to_string()]);

        let roles = [Principal::name_only("reader"), Principal::new("writer", "10.%")];
        let stmt = build_default_roles(&roles, &user).unwrap();
        assert_eq!(stmt.sql, "ALTER USER ?@? DEFAULT ROLE ?@?,?@?");
        assert_eq!(
            stmt.params,
            vec![
                "app".to_string(),
                "%".to_string(),
                "reader".to_string(),
                "%".to_string(),
                "writer".to_string(),
                "10.%".to_string(),
            ]
        );
    }

    #[test]
    fn test_interpolate_renders_quoted_literals() {
        let stmt = SqlStatement {
            sql: "GRANT SELECT ON `db`.* TO ?@?".to_string(),
            params: vec!["app".to_string(), "10.0.0.%".to_string()],
        };
        assert_eq!(
            stmt.interpolate().unwrap(),
            "GRANT SELECT ON `db`.* TO 'app'@'10.0.0.%'"
        );
    }

    #[test]
    fn test_interpolate_escapes_values() {
        let stmt = SqlStatement {
            sql: "GRANT ? TO ?@?".to_string(),
            params: vec!["o'brien".to_string(), "app".to_string(), "h\\x\n".to_string()],
        };
        assert_eq!(
            stmt.interpolate().unwrap(),
            "GRANT 'o\\'brien' TO 'app'@'h\\\\x\\n'"
        );
    }

    #[test]
    fn test_interpolate_ignores_placeholders_inside_quotes() {
        let stmt = SqlStatement {
            sql: "GRANT SELECT ON `d?b`.* TO ?@?".to_string(),
            params: vec!["app".to_string(), "%".to_string()],
        };
        assert_eq!(
            stmt.interpolate().unwrap(),
            "GRANT SELECT ON `d?b`.* TO 'app'@'%'"
        );
    }

    #[test]
    fn test_interpolate_rejects_count_mismatch() {
        let stmt = SqlStatement {
            sql: "GRANT ? TO ?@?".to_string(),
            params: vec!["reader".to_string()],
        };
        let err = stmt.interpolate().unwrap_err();
        assert_eq!(err.error_code(), "INVALID_INPUT");

        let stmt = SqlStatement {
            sql: "GRANT ? TO ?".to_string(),
            params: vec!["a".to_string(), "b".to_string(), "c".to_string()],
        };
        let err = stmt.interpolate().unwrap_err();
        assert!(err.message().contains("unused parameters"));
    }
}

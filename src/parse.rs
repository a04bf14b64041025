//! Grant Statement Parsing
//!
//! Turns one line of `SHOW GRANTS` output back into a structured
//! [`PrivilegeGrantState`]. The grammar is deliberately narrow: it covers
//! exactly what servers emit for privilege grants,
//!
//! ```text
//! GRANT <priv>[ (col, ...)][, ...] ON [TABLE ]<db>.<table> TO <user>@<host> [WITH GRANT OPTION]
//! ```
//!
//! with identifiers in backticks, principals in single or double quotes or
//! backticks, and `*` for wildcard scopes.
//!
//! Lines that are valid output but not privilege grants parse to `Ok(None)`
//! so callers can skip them: role grants (a `TO` clause with no `ON`),
//! `PROXY` grants (whose `ON` names a principal, not a scope) and routine
//! grants (`ON FUNCTION` or `ON PROCEDURE`). `USAGE` is the
//! server's way of printing "no privileges", so it never produces an entry.
//! Anything else that deviates from the grammar is a hard
//! [`ParseFailed`](crate::RegrantError::ParseFailed) error carrying the
//! offending line.
//!
//! Scanning is quote-aware throughout: a `TO`, comma or dot inside quoted
//! identifiers or a column list never splits the statement.

use crate::error::{RegrantError, Result};
use crate::state::{Principal, PrivilegeEntry, PrivilegeGrantState, PrivilegeLevel, WILDCARD};

/// Parse one `SHOW GRANTS` line.
///
/// Returns `Ok(None)` for lines that are well-formed but out of scope (role,
/// proxy and routine grants), `Ok(Some(_))` for privilege grants.
pub fn parse_grant_statement(line: &str) -> Result<Option<PrivilegeGrantState>> {
    let trimmed = line.trim().trim_end_matches(';').trim_end();
    let fail = |detail: String| RegrantError::parse_failed(line, detail);

    let rest = strip_prefix_ci(trimmed, "GRANT ")
        .ok_or_else(|| fail("not a GRANT statement".to_string()))?;

    let (rest, grant_option) = match strip_suffix_ci(rest, " WITH GRANT OPTION") {
        Some(stripped) => (stripped, true),
        None => (rest, false),
    };

    let to_idx = find_top_level(rest, " TO ", true)
        .ok_or_else(|| fail("missing TO clause".to_string()))?;
    let head = rest[..to_idx].trim();
    let grantee_part = rest[to_idx + 4..].trim();

    // A TO clause with no ON clause grants roles, not privileges.
    let split = if let Some(level) = strip_prefix_ci(head, "ON ") {
        Some(("", level.trim()))
    } else {
        find_top_level(head, " ON ", true).map(|idx| (head[..idx].trim(), head[idx + 4..].trim()))
    };
    let (privs_part, level_part) = match split {
        Some(parts) => parts,
        None => return Ok(None),
    };

    // PROXY grants put a principal where the scope would be.
    if find_top_level(level_part, "@", true).is_some() {
        return Ok(None);
    }

    // The scope may carry an object type. Routine grants target a FUNCTION
    // or PROCEDURE, not a table.
    let level_part = if let Some(stripped) = strip_prefix_ci(level_part, "TABLE ") {
        stripped.trim_start()
    } else if strip_prefix_ci(level_part, "FUNCTION ").is_some()
        || strip_prefix_ci(level_part, "PROCEDURE ").is_some()
    {
        return Ok(None);
    } else {
        level_part
    };

    let principal = parse_principal(grantee_part).map_err(&fail)?;
    let level = parse_level(level_part).map_err(&fail)?;
    let entries = parse_privilege_items(privs_part).map_err(&fail)?;

    let mut state = PrivilegeGrantState::new(principal, level).with_grant_option(grant_option);
    for entry in entries {
        state.add_entry(entry);
    }
    Ok(Some(state))
}

/// Parse a line and keep it only when it applies to the given scope.
///
/// Matching is exact on all four of database, table, name and host, with an
/// unpinned host compared as `%`.
pub fn parse_grant_line(
    line: &str,
    level: &PrivilegeLevel,
    principal: &Principal,
) -> Result<Option<PrivilegeGrantState>> {
    let Some(state) = parse_grant_statement(line)? else {
        return Ok(None);
    };
    let matches = state.level == *level
        && state.principal.name == principal.name
        && state.principal.host_or_wildcard() == principal.host_or_wildcard();
    Ok(matches.then_some(state))
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum QuoteState {
    None,
    Backtick,
    Single,
    Double,
}

/// Tracks quoting and parenthesis depth while walking a statement byte by
/// byte. Doubled quotes and backslash escapes are consumed as units; UTF-8
/// continuation bytes never collide with the ASCII characters inspected here.
pub(crate) struct Scanner {
    state: QuoteState,
    depth: usize,
}

impl Scanner {
    pub(crate) fn new() -> Self {
        Self { state: QuoteState::None, depth: 0 }
    }

    pub(crate) fn at_top_level(&self) -> bool {
        self.state == QuoteState::None && self.depth == 0
    }

    /// Consume the byte at `i`, returning the next position
    pub(crate) fn step(&mut self, bytes: &[u8], i: usize) -> usize {
        let c = bytes[i];
        match self.state {
            QuoteState::None => match c {
                b'`' => self.state = QuoteState::Backtick,
                b'\'' => self.state = QuoteState::Single,
                b'"' => self.state = QuoteState::Double,
                b'(' => self.depth += 1,
                b')' => self.depth = self.depth.saturating_sub(1),
                _ => {}
            },
            QuoteState::Backtick => {
                if c == b'`' {
                    if bytes.get(i + 1) == Some(&b'`') {
                        return i + 2;
                    }
                    self.state = QuoteState::None;
                }
            }
            QuoteState::Single => {
                if c == b'\\' {
                    return (i + 2).min(bytes.len());
                }
                if c == b'\'' {
                    if bytes.get(i + 1) == Some(&b'\'') {
                        return i + 2;
                    }
                    self.state = QuoteState::None;
                }
            }
            QuoteState::Double => {
                if c == b'\\' {
                    return (i + 2).min(bytes.len());
                }
                if c == b'"' {
                    if bytes.get(i + 1) == Some(&b'"') {
                        return i + 2;
                    }
                    self.state = QuoteState::None;
                }
            }
        }
        i + 1
    }
}

/// Case-insensitive search for `needle` outside quotes and parentheses
fn find_top_level(s: &str, needle: &str, last: bool) -> Option<usize> {
    let bytes = s.as_bytes();
    let n = needle.as_bytes();
    let mut scanner = Scanner::new();
    let mut found = None;
    let mut i = 0;
    while i < bytes.len() {
        if scanner.at_top_level()
            && i + n.len() <= bytes.len()
            && bytes[i..i + n.len()].eq_ignore_ascii_case(n)
        {
            found = Some(i);
            if !last {
                return found;
            }
        }
        i = scanner.step(bytes, i);
    }
    found
}

/// Split on `delim` outside quotes and parentheses
fn split_top_level(s: &str, delim: u8) -> Vec<&str> {
    let bytes = s.as_bytes();
    let mut scanner = Scanner::new();
    let mut parts = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        if scanner.at_top_level() && bytes[i] == delim {
            parts.push(&s[start..i]);
            start = i + 1;
            i += 1;
            continue;
        }
        i = scanner.step(bytes, i);
    }
    parts.push(&s[start..]);
    parts
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len() && s.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
    {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

fn strip_suffix_ci<'a>(s: &'a str, suffix: &str) -> Option<&'a str> {
    if s.len() >= suffix.len()
        && s.as_bytes()[s.len() - suffix.len()..].eq_ignore_ascii_case(suffix.as_bytes())
    {
        Some(&s[..s.len() - suffix.len()])
    } else {
        None
    }
}

fn parse_principal(raw: &str) -> std::result::Result<Principal, String> {
    let parts = split_top_level(raw, b'@');
    match parts.as_slice() {
        [name] => Ok(Principal::name_only(unquote_part(name.trim())?)),
        [name, host] => Ok(Principal::new(unquote_part(name.trim())?, unquote_part(host.trim())?)),
        _ => Err(format!("malformed principal `{raw}`")),
    }
}

fn parse_level(raw: &str) -> std::result::Result<PrivilegeLevel, String> {
    let segments = split_top_level(raw, b'.');
    let (database, table) = match segments.as_slice() {
        [db] => (unquote_identifier(db.trim())?, WILDCARD.to_string()),
        [db, table] => (unquote_identifier(db.trim())?, unquote_identifier(table.trim())?),
        _ => return Err(format!("unsupported privilege level `{raw}`")),
    };
    Ok(PrivilegeLevel::table(database, table))
}

fn parse_privilege_items(raw: &str) -> std::result::Result<Vec<PrivilegeEntry>, String> {
    if raw.is_empty() {
        return Err("empty privilege list".to_string());
    }
    let mut entries = Vec::new();
    for item in split_top_level(raw, b',') {
        let item = item.trim();
        if item.is_empty() {
            return Err("empty privilege in list".to_string());
        }
        let entry = parse_privilege_item(item)?;
        // USAGE is the server's placeholder for an empty privilege set.
        if entry.keyword == "USAGE" {
            continue;
        }
        entries.push(entry);
    }
    Ok(entries)
}

fn parse_privilege_item(item: &str) -> std::result::Result<PrivilegeEntry, String> {
    let open = match find_top_level(item, "(", false) {
        None => {
            if find_top_level(item, ")", false).is_some() {
                return Err(format!("unbalanced parentheses in `{item}`"));
            }
            return Ok(PrivilegeEntry::new(normalize_keyword(item)));
        }
        Some(open) => open,
    };

    let keyword = normalize_keyword(item[..open].trim());
    if keyword.is_empty() {
        return Err(format!("missing privilege keyword before column list in `{item}`"));
    }
    if !item.ends_with(')') {
        return Err(format!("unterminated column list in `{item}`"));
    }
    let inner = &item[open + 1..item.len() - 1];
    if find_top_level(inner, "(", false).is_some() || find_top_level(inner, ")", false).is_some() {
        return Err(format!("unbalanced parentheses in `{item}`"));
    }
    if inner.trim().is_empty() {
        return Err(format!("empty column list in `{item}`"));
    }

    let mut columns = Vec::new();
    for column in split_top_level(inner, b',') {
        let column = column.trim();
        if column.is_empty() {
            return Err(format!("empty column name in `{item}`"));
        }
        columns.push(unquote_identifier(column)?);
    }
    Ok(PrivilegeEntry::with_columns(keyword, columns))
}

fn normalize_keyword(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ").to_ascii_uppercase()
}

/// Unquote a backtick-quoted identifier; bare identifiers pass through
fn unquote_identifier(raw: &str) -> std::result::Result<String, String> {
    if let Some(rest) = raw.strip_prefix('`') {
        let inner = rest
            .strip_suffix('`')
            .ok_or_else(|| format!("unterminated identifier quote in `{raw}`"))?;
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c == '`' {
                match chars.next() {
                    Some('`') => out.push('`'),
                    _ => return Err(format!("stray quote in identifier `{raw}`")),
                }
            } else {
                out.push(c);
            }
        }
        return Ok(out);
    }
    if raw.is_empty() {
        return Err("empty identifier".to_string());
    }
    if raw.contains(['`', '\'', '"']) {
        return Err(format!("malformed identifier `{raw}`"));
    }
    Ok(raw.to_string())
}

/// Unquote one side of a `user@host` pair; accepts backtick, single or
/// double quoting and bare tokens
fn unquote_part(raw: &str) -> std::result::Result<String, String> {
    if raw.starts_with('`') {
        return unquote_identifier(raw);
    }
    if let Some(quote) = raw.chars().next().filter(|c| *c == '\'' || *c == '"') {
        return unquote_string(raw, quote);
    }
    if raw.is_empty() {
        return Err("empty principal part".to_string());
    }
    if raw.contains(['`', '\'', '"']) {
        return Err(format!("malformed principal part `{raw}`"));
    }
    Ok(raw.to_string())
}

fn unquote_string(raw: &str, quote: char) -> std::result::Result<String, String> {
    let inner = raw
        .strip_prefix(quote)
        .and_then(|s| s.strip_suffix(quote))
        .ok_or_else(|| format!("unterminated quote in `{raw}`"))?;

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(escaped) => out.push(unescape_char(escaped)),
                None => return Err(format!("dangling escape in `{raw}`")),
            }
        } else if c == quote {
            match chars.next() {
                Some(d) if d == quote => out.push(quote),
                _ => return Err(format!("stray quote in `{raw}`")),
            }
        } else {
            out.push(c);
        }
    }
    Ok(out)
}

fn unescape_char(c: char) -> char {
    match c {
        'n' => '\n',
        't' => '\t',
        'r' => '\r',
        '0' => '\0',
        other => other,
    }
}

//! Connection Management
//!
//! Pools are created lazily and cached by a fingerprint of the full connect
//! settings, so two callers with identical settings share one pool while any
//! difference (even password or default schema) yields a separate one.
//!
//! Establishing a pool is a two-step dance. A probe connection is dialed
//! first, with retry: transient dial failures (network refused, DNS, broken
//! handshake) are retried every 500ms until the retry budget is exhausted,
//! while an error the server itself reported (bad credentials, unknown
//! database) aborts immediately since no amount of retrying fixes it. The
//! probe reads the server version and, on servers that still auto-create
//! accounts on `GRANT` (5.7.5 up to 8.0), applies an `sql_mode` guard so a
//! typo'd principal surfaces as an error instead of a phantom account. The
//! guard statement is validated once on the probe and then installed as a
//! per-connection setup statement on the pool.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder, Pool, PoolConstraints, PoolOpts, SslOpts};
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, timeout};

use crate::error::{RegrantError, Result};

/// Default MySQL port
pub const DEFAULT_PORT: u16 = 3306;

/// Default retry budget for establishing the probe connection, in seconds
pub const DEFAULT_CONNECT_RETRY_TIMEOUT_SECS: u64 = 300;

/// Default maximum lifetime of a pooled connection (8 hours), in seconds
pub const DEFAULT_MAX_CONN_LIFETIME_SECS: u64 = 28_800;

/// Default cap on open connections per pool
pub const DEFAULT_MAX_OPEN_CONNS: usize = 5;

const RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Guard against implicit account creation on pre-8.0 servers.
const SQL_MODE_COMPAT_STMT: &str =
    "SET SESSION sql_mode=CONCAT(@@sql_mode, ',NO_AUTO_CREATE_USER')";

/// Everything needed to reach one server.
///
/// Durations are plain seconds so settings deserialize from flat JSON
/// documents without custom formats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectSettings {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default)]
    pub tls: bool,
    #[serde(default = "default_connect_retry_timeout")]
    pub connect_retry_timeout_secs: u64,
    #[serde(default = "default_max_conn_lifetime")]
    pub max_conn_lifetime_secs: u64,
    #[serde(default = "default_max_open_conns")]
    pub max_open_conns: usize,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_connect_retry_timeout() -> u64 {
    DEFAULT_CONNECT_RETRY_TIMEOUT_SECS
}

fn default_max_conn_lifetime() -> u64 {
    DEFAULT_MAX_CONN_LIFETIME_SECS
}

fn default_max_open_conns() -> usize {
    DEFAULT_MAX_OPEN_CONNS
}

impl ConnectSettings {
    /// Settings with default timeouts and pool limits
    pub fn new(
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            password: password.into(),
            database: None,
            tls: false,
            connect_retry_timeout_secs: DEFAULT_CONNECT_RETRY_TIMEOUT_SECS,
            max_conn_lifetime_secs: DEFAULT_MAX_CONN_LIFETIME_SECS,
            max_open_conns: DEFAULT_MAX_OPEN_CONNS,
        }
    }

    /// Set the default schema
    #[must_use]
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Enable TLS
    #[must_use]
    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    /// Read settings from `MYSQL_ENDPOINT` (`host` or `host:port`),
    /// `MYSQL_USERNAME` and `MYSQL_PASSWORD`; all three must be set
    pub fn from_env() -> Result<Self> {
        let endpoint = std::env::var("MYSQL_ENDPOINT")
            .map_err(|_| RegrantError::invalid_input("MYSQL_ENDPOINT is not set"))?;
        let user = std::env::var("MYSQL_USERNAME")
            .map_err(|_| RegrantError::invalid_input("MYSQL_USERNAME is not set"))?;
        let password = std::env::var("MYSQL_PASSWORD")
            .map_err(|_| RegrantError::invalid_input("MYSQL_PASSWORD is not set"))?;

        let (host, port) = match endpoint.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    RegrantError::invalid_input(format!(
                        "invalid port in MYSQL_ENDPOINT `{endpoint}`"
                    ))
                })?;
                (host.to_string(), port)
            }
            None => (endpoint, DEFAULT_PORT),
        };

        Ok(Self::new(host, port, user, password))
    }

    /// Deserialize settings from a JSON document
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| RegrantError::invalid_input(format!("invalid connect settings: {e}")))
    }

    /// Cache key covering every field that changes what a connection can see.
    /// Contains the password, so it must never be logged.
    pub(crate) fn fingerprint(&self) -> String {
        format!(
            "{}:{}@tcp({}:{})/{}?tls={}&lifetime={}&open={}",
            self.user,
            self.password,
            self.host,
            self.port,
            self.database.as_deref().unwrap_or(""),
            self.tls,
            self.max_conn_lifetime_secs,
            self.max_open_conns,
        )
    }

    pub(crate) fn opts_builder(&self) -> Result<OptsBuilder> {
        if self.host.is_empty() {
            return Err(RegrantError::invalid_input("host must not be empty"));
        }
        if self.user.is_empty() {
            return Err(RegrantError::invalid_input("user must not be empty"));
        }

        let mut builder = OptsBuilder::default()
            .ip_or_hostname(self.host.clone())
            .tcp_port(self.port)
            .user(Some(self.user.clone()))
            .pass(Some(self.password.clone()))
            .db_name(self.database.clone());
        if self.tls {
            builder = builder.ssl_opts(SslOpts::default());
        }
        Ok(builder)
    }
}

/// Server version as reported by `@@GLOBAL.version`, reduced to a numeric
/// triple. Suffixes like `-log` or `-MariaDB` are ignored.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ServerVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl ServerVersion {
    #[must_use]
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self { major, minor, patch }
    }

    /// Parse a raw version string, tolerating build metadata after `:` or `-`
    pub fn parse(raw: &str) -> Result<Self> {
        let core = raw.split(':').next().unwrap_or(raw);
        let core = core.split('-').next().unwrap_or(core);

        let mut parts = core.split('.');
        let mut next = |label: &str| -> Result<u64> {
            match parts.next() {
                None => Ok(0),
                Some(p) => p.parse::<u64>().map_err(|_| {
                    RegrantError::invalid_input(format!(
                        "unparseable {label} in server version `{raw}`"
                    ))
                }),
            }
        };
        let major = next("major")?;
        let minor = next("minor")?;
        let patch = next("patch")?;
        Ok(Self { major, minor, patch })
    }

    /// True for [5.7.5, 8.0.0), the range where `GRANT` may silently create
    /// the account it targets unless `NO_AUTO_CREATE_USER` is set
    #[must_use]
    pub fn needs_no_auto_create_user(&self) -> bool {
        *self >= Self::new(5, 7, 5) && *self < Self::new(8, 0, 0)
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

struct PoolEntry {
    pool: Pool,
    version: ServerVersion,
}

/// Shared, lazily populated cache of connection pools.
///
/// Cheap to share behind an `Arc`; the interior mutex is only held for map
/// lookups and inserts, never across an await point.
#[derive(Default)]
pub struct ConnectionManager {
    cache: Mutex<HashMap<String, PoolEntry>>,
}

impl ConnectionManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Check out a connection along with the version detected when the pool
    /// was established
    pub async fn acquire(&self, settings: &ConnectSettings) -> Result<(Conn, ServerVersion)> {
        let (pool, version) = self.ensure_pool(settings).await?;
        let conn = pool.get_conn().await.map_err(|e| {
            RegrantError::connection_failed(format!("could not connect to server: {e}"))
        })?;
        Ok((conn, version))
    }

    /// Version of the server the settings point at, from the cached pool
    pub async fn server_version(&self, settings: &ConnectSettings) -> Result<ServerVersion> {
        let (_, version) = self.ensure_pool(settings).await?;
        Ok(version)
    }

    /// Disconnect every cached pool
    pub async fn shutdown(&self) -> Result<()> {
        let entries: Vec<PoolEntry> = {
            let mut cache = self.lock_cache();
            cache.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            entry
                .pool
                .disconnect()
                .await
                .map_err(|e| RegrantError::connection_failed(e.to_string()))?;
        }
        Ok(())
    }

    async fn ensure_pool(&self, settings: &ConnectSettings) -> Result<(Pool, ServerVersion)> {
        let key = settings.fingerprint();
        if let Some(hit) = self.lookup(&key) {
            tracing::debug!(
                host = %settings.host,
                port = settings.port,
                user = %settings.user,
                "reusing cached connection pool"
            );
            return Ok(hit);
        }

        let constraints = pool_constraints(settings)?;
        let version = self.probe(settings).await?;
        let pool = Pool::new(build_pool_opts(settings, version, constraints)?);

        // Another task may have populated the cache while we probed; the
        // first entry wins and the loser discards its pool.
        let existing = {
            let mut cache = self.lock_cache();
            match cache.get(&key) {
                Some(entry) => Some((entry.pool.clone(), entry.version)),
                None => {
                    cache.insert(key, PoolEntry { pool: pool.clone(), version });
                    None
                }
            }
        };
        if let Some(hit) = existing {
            if let Err(e) = pool.disconnect().await {
                tracing::debug!(error = %e, "failed to discard raced pool");
            }
            return Ok(hit);
        }

        tracing::info!(
            host = %settings.host,
            port = settings.port,
            user = %settings.user,
            version = %version,
            "established connection pool"
        );
        Ok((pool, version))
    }

    /// Dial once with retry, read the server version and validate the
    /// `sql_mode` guard where the version calls for it
    async fn probe(&self, settings: &ConnectSettings) -> Result<ServerVersion> {
        let mut conn = connect_with_retry(settings).await?;

        let raw: Option<String> = conn
            .query_first("SELECT @@GLOBAL.version")
            .await
            .map_err(|e| {
                RegrantError::connection_failed(format!("failed getting server version: {e}"))
            })?;
        let raw = raw.ok_or_else(|| {
            RegrantError::connection_failed("failed getting server version: empty result")
        })?;
        let version = ServerVersion::parse(&raw).map_err(|e| {
            RegrantError::connection_failed(format!(
                "failed getting server version: {}",
                e.message()
            ))
        })?;

        if version.needs_no_auto_create_user() {
            conn.query_drop(SQL_MODE_COMPAT_STMT).await.map_err(|e| {
                RegrantError::connection_failed(format!("failed setting SQL mode: {e}"))
            })?;
        }

        conn.disconnect()
            .await
            .map_err(|e| RegrantError::connection_failed(e.to_string()))?;
        Ok(version)
    }

    fn lookup(&self, key: &str) -> Option<(Pool, ServerVersion)> {
        self.lock_cache().get(key).map(|entry| (entry.pool.clone(), entry.version))
    }

    fn lock_cache(&self) -> MutexGuard<'_, HashMap<String, PoolEntry>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn connect_with_retry(settings: &ConnectSettings) -> Result<Conn> {
    let opts: Opts = settings.opts_builder()?.into();
    let budget = Duration::from_secs(settings.connect_retry_timeout_secs);
    let started = Instant::now();
    let mut last_err = String::from("retry budget exhausted before first attempt");
    let mut attempt: u32 = 0;

    loop {
        let remaining = budget.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Err(RegrantError::connection_failed(format!(
                "could not connect to server: {last_err}"
            )));
        }
        attempt += 1;

        match timeout(remaining, Conn::new(opts.clone())).await {
            Ok(Ok(conn)) => return Ok(conn),
            Ok(Err(err)) if !is_retryable(&err) => {
                return Err(RegrantError::connection_failed(format!(
                    "could not connect to server: {err}"
                )));
            }
            Ok(Err(err)) => {
                tracing::warn!(
                    attempt,
                    host = %settings.host,
                    port = settings.port,
                    error = %err,
                    "connection attempt failed, retrying"
                );
                last_err = err.to_string();
                sleep(RETRY_INTERVAL).await;
            }
            Err(_) => {
                return Err(RegrantError::connection_failed(format!(
                    "could not connect to server: attempt timed out, last error: {last_err}"
                )));
            }
        }
    }
}

/// Errors the server itself reported (bad credentials, unknown database) are
/// permanent; everything else is assumed transient.
fn is_retryable(err: &mysql_async::Error) -> bool {
    !matches!(err, mysql_async::Error::Server(_) | mysql_async::Error::Url(_))
}

fn pool_constraints(settings: &ConnectSettings) -> Result<PoolConstraints> {
    PoolConstraints::new(1, settings.max_open_conns).ok_or_else(|| {
        RegrantError::invalid_input(format!(
            "max_open_conns must be at least 1, got {}",
            settings.max_open_conns
        ))
    })
}

fn build_pool_opts(
    settings: &ConnectSettings,
    version: ServerVersion,
    constraints: PoolConstraints,
) -> Result<Opts> {
    let pool_opts = PoolOpts::default()
        .with_constraints(constraints)
        .with_abs_conn_ttl(Some(Duration::from_secs(settings.max_conn_lifetime_secs)));

    let mut builder = settings.opts_builder()?.pool_opts(pool_opts);
    if version.needs_no_auto_create_user() {
        builder = builder.setup(vec![SQL_MODE_COMPAT_STMT]);
    }
    Ok(builder.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ConnectSettings {
        ConnectSettings::new("localhost", 3306, "root", "secret")
    }

    #[test]
    fn test_version_parse() {
        assert_eq!(ServerVersion::parse("8.0.36").unwrap(), ServerVersion::new(8, 0, 36));
        assert_eq!(ServerVersion::parse("8.0.36-log").unwrap(), ServerVersion::new(8, 0, 36));
        assert_eq!(
            ServerVersion::parse("10.11.6-MariaDB-log").unwrap(),
            ServerVersion::new(10, 11, 6)
        );
        assert_eq!(
            ServerVersion::parse("5.7.44:ade7b0").unwrap(),
            ServerVersion::new(5, 7, 44)
        );
        assert_eq!(ServerVersion::parse("8.0").unwrap(), ServerVersion::new(8, 0, 0));

        assert!(ServerVersion::parse("eight.oh").is_err());
        assert!(ServerVersion::parse("").is_err());
    }

    #[test]
    fn test_version_compat_band() {
        assert!(!ServerVersion::new(5, 7, 4).needs_no_auto_create_user());
        assert!(ServerVersion::new(5, 7, 5).needs_no_auto_create_user());
        assert!(ServerVersion::new(5, 7, 44).needs_no_auto_create_user());
        assert!(!ServerVersion::new(8, 0, 0).needs_no_auto_create_user());
        assert!(!ServerVersion::new(8, 4, 0).needs_no_auto_create_user());
    }

    #[test]
    fn test_version_display() {
        assert_eq!(ServerVersion::new(8, 0, 36).to_string(), "8.0.36");
    }

    #[test]
    fn test_fingerprint_covers_identity_fields() {
        let base = settings();
        assert_eq!(base.fingerprint(), settings().fingerprint());

        let mut other = settings();
        other.password = "different".into();
        assert_ne!(base.fingerprint(), other.fingerprint());

        let other = settings().with_database("app_db");
        assert_ne!(base.fingerprint(), other.fingerprint());

        let mut other = settings();
        other.port = 3307;
        assert_ne!(base.fingerprint(), other.fingerprint());
    }

    #[test]
    fn test_settings_from_json_applies_defaults() {
        let parsed =
            ConnectSettings::from_json(r#"{"host": "db.internal", "user": "admin"}"#).unwrap();
        assert_eq!(parsed.host, "db.internal");
        assert_eq!(parsed.port, DEFAULT_PORT);
        assert_eq!(parsed.password, "");
        assert_eq!(parsed.connect_retry_timeout_secs, DEFAULT_CONNECT_RETRY_TIMEOUT_SECS);
        assert_eq!(parsed.max_conn_lifetime_secs, DEFAULT_MAX_CONN_LIFETIME_SECS);
        assert_eq!(parsed.max_open_conns, DEFAULT_MAX_OPEN_CONNS);
        assert!(!parsed.tls);

        let err = ConnectSettings::from_json("{\"host\": \"db\"}").unwrap_err();
        assert_eq!(err.error_code(), "INVALID_INPUT");
    }

    #[test]
    fn test_opts_builder_rejects_empty_identity() {
        let mut s = settings();
        s.host = String::new();
        assert_eq!(s.opts_builder().unwrap_err().error_code(), "INVALID_INPUT");

        let mut s = settings();
        s.user = String::new();
        assert_eq!(s.opts_builder().unwrap_err().error_code(), "INVALID_INPUT");
    }

    #[test]
    fn test_pool_constraints_reject_zero_conn_cap() {
        let mut s = settings();
        s.max_open_conns = 0;
        let err = pool_constraints(&s).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_INPUT");
        assert!(err.message().contains("max_open_conns"));

        assert!(pool_constraints(&settings()).is_ok());
    }

    #[test]
    fn test_retryable_classification() {
        let io = mysql_async::Error::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        ));
        assert!(is_retryable(&io));

        let denied = mysql_async::Error::Server(mysql_async::ServerError {
            code: 1045,
            message: "Access denied for user".into(),
            state: "28000".into(),
        });
        assert!(!is_retryable(&denied));
    }

    #[test]
    fn test_settings_from_env() {
        std::env::set_var("MYSQL_ENDPOINT", "db.internal:3307");
        std::env::set_var("MYSQL_USERNAME", "admin");
        std::env::set_var("MYSQL_PASSWORD", "hunter2");

        let parsed = ConnectSettings::from_env().unwrap();
        assert_eq!(parsed.host, "db.internal");
        assert_eq!(parsed.port, 3307);
        assert_eq!(parsed.user, "admin");
        assert_eq!(parsed.password, "hunter2");

        std::env::set_var("MYSQL_ENDPOINT", "db.internal");
        assert_eq!(ConnectSettings::from_env().unwrap().port, DEFAULT_PORT);

        std::env::set_var("MYSQL_ENDPOINT", "db.internal:not-a-port");
        assert!(ConnectSettings::from_env().is_err());
        std::env::set_var("MYSQL_ENDPOINT", "db.internal:3307");

        std::env::remove_var("MYSQL_PASSWORD");
        let err = ConnectSettings::from_env().unwrap_err();
        assert!(err.message().contains("MYSQL_PASSWORD"));

        std::env::remove_var("MYSQL_ENDPOINT");
        let err = ConnectSettings::from_env().unwrap_err();
        assert!(err.message().contains("MYSQL_ENDPOINT"));

        std::env::remove_var("MYSQL_USERNAME");
    }
}

//! Pool configuration and the live pools built from it
//!
//! This module provides:
//! - `PoolConfigurator`, a pure function from descriptor + tuning to `PoolConfig`
//! - the vendor property table and its mapping onto sqlx connect options
//! - `ManagedPool`, the shared pool handle for either backend
//! - leak detection for borrowed connections

use crate::config::ConfigProvider;
use crate::descriptor::ConnectionDescriptor;
use crate::{DataSourceError, Result};
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlSslMode};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Database, MySql, Sqlite};
use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const DB_MAX_CONNECTIONS: &str = "DB_MAX_CONNECTIONS";
pub const DB_MIN_CONNECTIONS: &str = "DB_MIN_CONNECTIONS";

pub const DEFAULT_MAX_POOL_SIZE: u32 = 20;
pub const DEFAULT_MIN_IDLE: u32 = 5;
pub const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 600_000;
pub const DEFAULT_MAX_LIFETIME_MS: u64 = 1_800_000;
pub const DEFAULT_LEAK_DETECTION_THRESHOLD_MS: u64 = 60_000;
pub const DEFAULT_VALIDATION_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_TEST_QUERY: &str = "SELECT 1";
pub const DEFAULT_POOL_NAME: &str = "AuthMySQLPool";

pub const FALLBACK_POOL_NAME: &str = "FallbackMemoryPool";
pub const FALLBACK_DATABASE: &str = "authdb";
pub const FALLBACK_MAX_POOL_SIZE: u32 = 5;
pub const FALLBACK_URL: &str = "sqlite::memory:";

/// Driver flags applied to every MySQL pool; URL flags override them
pub const VENDOR_PROPERTIES: [(&str, &str); 19] = [
    // statement caching
    ("cachePrepStmts", "true"),
    ("prepStmtCacheSize", "250"),
    ("prepStmtCacheSqlLimit", "2048"),
    ("useServerPrepStmts", "true"),
    ("useLocalSessionState", "true"),
    ("rewriteBatchedStatements", "true"),
    ("cacheResultSetMetadata", "true"),
    ("cacheServerConfiguration", "true"),
    ("elideSetAutoCommits", "true"),
    ("maintainTimeStats", "false"),
    // character set
    ("useUnicode", "true"),
    ("characterEncoding", "UTF-8"),
    ("connectionCollation", "utf8mb4_unicode_ci"),
    // TLS, opportunistic and unverified
    ("useSSL", "true"),
    ("requireSSL", "false"),
    ("allowPublicKeyRetrieval", "true"),
    ("verifyServerCertificate", "false"),
    // time zone
    ("serverTimezone", "UTC"),
    ("useLegacyDatetimeCode", "false"),
];

/// Backing store a pool talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum StoreKind {
    MySql,
    InMemory,
}

/// Optional overrides for the pool defaults
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolTuning {
    pub max_pool_size: Option<u32>,
    pub min_idle: Option<u32>,
    pub connection_timeout_ms: Option<u64>,
    pub idle_timeout_ms: Option<u64>,
    pub max_lifetime_ms: Option<u64>,
    pub leak_detection_threshold_ms: Option<u64>,
    pub test_query: Option<String>,
}

impl PoolTuning {
    /// Read `DB_MAX_CONNECTIONS` / `DB_MIN_CONNECTIONS`; unparseable values are ignored
    pub fn from_provider(provider: &dyn ConfigProvider) -> Self {
        Self {
            max_pool_size: read_u32(provider, DB_MAX_CONNECTIONS),
            min_idle: read_u32(provider, DB_MIN_CONNECTIONS),
            ..Self::default()
        }
    }
}

fn read_u32(provider: &dyn ConfigProvider, key: &str) -> Option<u32> {
    let raw = provider.get_non_empty(key)?;
    match raw.trim().parse::<u32>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring {}='{}': not a non-negative integer, using default", key, raw);
            None
        }
    }
}

/// Complete, validated configuration for one pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub pool_name: String,
    pub store: StoreKind,
    pub descriptor: ConnectionDescriptor,
    pub max_pool_size: u32,
    pub min_idle: u32,
    pub connection_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub max_lifetime_ms: u64,
    pub leak_detection_threshold_ms: u64,
    pub validation_timeout_ms: u64,
    pub vendor_properties: BTreeMap<String, String>,
    pub test_query: String,
}

impl PoolConfig {
    /// Check `max_pool_size >= min_idle`, a non-empty pool and positive timeouts
    pub fn validate(&self) -> Result<()> {
        if self.max_pool_size == 0 {
            return Err(DataSourceError::validation_error(
                "Max pool size cannot be 0".to_string(),
                Some(self.max_pool_size.to_string()),
            ));
        }

        if self.max_pool_size < self.min_idle {
            return Err(DataSourceError::validation_error(
                format!(
                    "Max pool size ({}) must not be smaller than min idle ({})",
                    self.max_pool_size, self.min_idle
                ),
                Some(format!("max={}, min={}", self.max_pool_size, self.min_idle)),
            ));
        }

        let timeouts = [
            ("connection_timeout_ms", self.connection_timeout_ms),
            ("idle_timeout_ms", self.idle_timeout_ms),
            ("max_lifetime_ms", self.max_lifetime_ms),
            ("leak_detection_threshold_ms", self.leak_detection_threshold_ms),
            ("validation_timeout_ms", self.validation_timeout_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, value)| *value == 0) {
            return Err(DataSourceError::validation_error(
                format!("{} must be greater than 0", name),
                Some("0".to_string()),
            ));
        }

        if self.test_query.trim().is_empty() {
            return Err(DataSourceError::validation_error(
                "Test query cannot be empty".to_string(),
                None,
            ));
        }

        Ok(())
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_millis(self.max_lifetime_ms)
    }

    pub fn leak_detection_threshold(&self) -> Duration {
        Duration::from_millis(self.leak_detection_threshold_ms)
    }

    pub fn validation_timeout(&self) -> Duration {
        Duration::from_millis(self.validation_timeout_ms)
    }

    /// Connection URL with credentials masked
    pub fn masked_url(&self) -> String {
        match self.store {
            StoreKind::MySql => crate::mask::mask_secrets(&self.descriptor.jdbc_url()),
            StoreKind::InMemory => format!("{} ({})", FALLBACK_URL, self.descriptor.database()),
        }
    }

    fn flag(&self, key: &str) -> Option<&str> {
        self.vendor_properties.get(key).map(String::as_str)
    }

    fn flag_enabled(&self, key: &str) -> bool {
        self.flag(key).is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }
}

/// Builds [`PoolConfig`] values; performs no I/O
pub struct PoolConfigurator;

impl PoolConfigurator {
    /// Apply defaults and `tuning` to `descriptor`
    pub fn configure(descriptor: ConnectionDescriptor, tuning: &PoolTuning) -> Result<PoolConfig> {
        let vendor_properties = Self::vendor_properties(&descriptor);

        let config = PoolConfig {
            pool_name: DEFAULT_POOL_NAME.to_string(),
            store: StoreKind::MySql,
            descriptor,
            max_pool_size: tuning.max_pool_size.unwrap_or(DEFAULT_MAX_POOL_SIZE),
            min_idle: tuning.min_idle.unwrap_or(DEFAULT_MIN_IDLE),
            connection_timeout_ms: tuning
                .connection_timeout_ms
                .unwrap_or(DEFAULT_CONNECTION_TIMEOUT_MS),
            idle_timeout_ms: tuning.idle_timeout_ms.unwrap_or(DEFAULT_IDLE_TIMEOUT_MS),
            max_lifetime_ms: tuning.max_lifetime_ms.unwrap_or(DEFAULT_MAX_LIFETIME_MS),
            leak_detection_threshold_ms: tuning
                .leak_detection_threshold_ms
                .unwrap_or(DEFAULT_LEAK_DETECTION_THRESHOLD_MS),
            validation_timeout_ms: DEFAULT_VALIDATION_TIMEOUT_MS,
            vendor_properties,
            test_query: tuning
                .test_query
                .clone()
                .unwrap_or_else(|| DEFAULT_TEST_QUERY.to_string()),
        };

        config.validate()?;
        Ok(config)
    }

    /// Configuration of the in-memory fallback store; cannot fail
    pub fn fallback() -> PoolConfig {
        PoolConfig {
            pool_name: FALLBACK_POOL_NAME.to_string(),
            store: StoreKind::InMemory,
            descriptor: ConnectionDescriptor::in_memory(FALLBACK_DATABASE),
            max_pool_size: FALLBACK_MAX_POOL_SIZE,
            min_idle: 1,
            connection_timeout_ms: DEFAULT_CONNECTION_TIMEOUT_MS,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            max_lifetime_ms: DEFAULT_MAX_LIFETIME_MS,
            leak_detection_threshold_ms: DEFAULT_LEAK_DETECTION_THRESHOLD_MS,
            validation_timeout_ms: DEFAULT_VALIDATION_TIMEOUT_MS,
            vendor_properties: BTreeMap::new(),
            test_query: DEFAULT_TEST_QUERY.to_string(),
        }
    }

    /// Vendor table with the descriptor's URL flags layered on top
    pub fn vendor_properties(descriptor: &ConnectionDescriptor) -> BTreeMap<String, String> {
        let mut properties: BTreeMap<String, String> = VENDOR_PROPERTIES
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        for (key, value) in descriptor.properties() {
            properties.insert(key.clone(), value.clone());
        }
        properties
    }

    /// sqlx connect options for a MySQL pool config.
    ///
    /// Flags with no sqlx counterpart (batch rewriting, metadata caches) stay
    /// in the table for reporting only. sqlx already pins the session time
    /// zone to UTC, which is what `serverTimezone=UTC` asks for.
    pub fn mysql_connect_options(config: &PoolConfig) -> MySqlConnectOptions {
        let descriptor = &config.descriptor;
        let mut options = MySqlConnectOptions::new()
            .host(descriptor.host())
            .port(descriptor.port())
            .username(descriptor.username())
            .database(descriptor.database())
            .ssl_mode(Self::ssl_mode(config));

        if !descriptor.password().is_empty() {
            options = options.password(descriptor.password());
        }

        let cache_capacity = if config.flag_enabled("cachePrepStmts") {
            config
                .flag("prepStmtCacheSize")
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(250)
        } else {
            0
        };
        options = options.statement_cache_capacity(cache_capacity);

        if let Some(encoding) = config.flag("characterEncoding") {
            if encoding.eq_ignore_ascii_case("UTF-8") || encoding.eq_ignore_ascii_case("utf8") {
                options = options.charset("utf8mb4");
            }
        }
        if let Some(collation) = config.flag("connectionCollation") {
            options = options.collation(collation);
        }

        if let Some(timezone) = config.flag("serverTimezone") {
            if !timezone.eq_ignore_ascii_case("UTC") {
                debug!("serverTimezone={} is not applied; sessions run in UTC", timezone);
            }
        }

        options
    }

    /// TLS policy from `useSSL` / `requireSSL` / `verifyServerCertificate`
    pub fn ssl_mode(config: &PoolConfig) -> MySqlSslMode {
        let use_ssl = config.flag("useSSL").map_or(true, |v| v.eq_ignore_ascii_case("true"));
        if !use_ssl {
            return MySqlSslMode::Disabled;
        }

        match (
            config.flag_enabled("requireSSL"),
            config.flag_enabled("verifyServerCertificate"),
        ) {
            (true, true) => MySqlSslMode::VerifyIdentity,
            (true, false) => MySqlSslMode::Required,
            (false, _) => MySqlSslMode::Preferred,
        }
    }
}

/// Handle to the live sqlx pool
#[derive(Debug, Clone)]
pub enum PoolHandle {
    MySql(MySqlPool),
    InMemory(SqlitePool),
}

/// A live pool together with the configuration it was built from
#[derive(Debug)]
pub struct ManagedPool {
    handle: PoolHandle,
    config: Arc<PoolConfig>,
    leaked: Arc<AtomicU64>,
}

impl ManagedPool {
    /// Build a MySQL pool and establish its first connection
    pub async fn connect(config: PoolConfig) -> Result<Self> {
        if config.store != StoreKind::MySql {
            return Ok(Self::in_memory(config));
        }

        info!(
            "Creating pool '{}' for {} (max={}, min={})",
            config.pool_name,
            config.masked_url(),
            config.max_pool_size,
            config.min_idle
        );

        let options = PoolConfigurator::mysql_connect_options(&config);
        let pool = Self::mysql_pool_options(&config)
            .connect_with(options)
            .await?;

        Ok(Self::from_handle(PoolHandle::MySql(pool), config))
    }

    /// Build a MySQL pool without connecting; connections open on first use
    pub fn connect_lazy(config: PoolConfig) -> Self {
        if config.store != StoreKind::MySql {
            return Self::in_memory(config);
        }

        let options = PoolConfigurator::mysql_connect_options(&config);
        let pool = Self::mysql_pool_options(&config).connect_lazy_with(options);
        Self::from_handle(PoolHandle::MySql(pool), config)
    }

    /// Build the in-memory store. Lazy, so construction cannot fail.
    pub fn in_memory(config: PoolConfig) -> Self {
        info!(
            "Creating in-memory pool '{}' for {} (max={})",
            config.pool_name,
            config.masked_url(),
            config.max_pool_size
        );

        // ':memory:' maps to a named shared-cache database, so every pooled
        // connection sees the same data.
        let options = SqliteConnectOptions::from_str(FALLBACK_URL).unwrap_or_else(|e| {
            warn!("Could not parse {} ({}), using a plain in-memory database", FALLBACK_URL, e);
            SqliteConnectOptions::new().filename(":memory:").shared_cache(true)
        });

        // Connections are never retired; the last one closing would drop the data
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_pool_size)
            .min_connections(config.min_idle)
            .acquire_timeout(config.connection_timeout())
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_lazy_with(options);

        Self::from_handle(PoolHandle::InMemory(pool), config)
    }

    fn mysql_pool_options(config: &PoolConfig) -> MySqlPoolOptions {
        MySqlPoolOptions::new()
            .max_connections(config.max_pool_size)
            .min_connections(config.min_idle)
            .acquire_timeout(config.connection_timeout())
            .idle_timeout(config.idle_timeout())
            .max_lifetime(config.max_lifetime())
            .test_before_acquire(true)
    }

    fn from_handle(handle: PoolHandle, config: PoolConfig) -> Self {
        Self {
            handle,
            config: Arc::new(config),
            leaked: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn handle(&self) -> &PoolHandle {
        &self.handle
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn store(&self) -> StoreKind {
        self.config.store
    }

    pub fn is_fallback(&self) -> bool {
        self.config.store == StoreKind::InMemory
    }

    pub fn masked_url(&self) -> String {
        self.config.masked_url()
    }

    /// Connections currently open (idle + borrowed)
    pub fn size(&self) -> u32 {
        match &self.handle {
            PoolHandle::MySql(pool) => pool.size(),
            PoolHandle::InMemory(pool) => pool.size(),
        }
    }

    pub fn num_idle(&self) -> usize {
        match &self.handle {
            PoolHandle::MySql(pool) => pool.num_idle(),
            PoolHandle::InMemory(pool) => pool.num_idle(),
        }
    }

    /// Borrows that outlived the leak-detection threshold so far
    pub fn leaked_connections(&self) -> u64 {
        self.leaked.load(Ordering::Relaxed)
    }

    /// Borrow a connection, bounded by the connection timeout.
    ///
    /// The returned guard gives the connection back when dropped.
    pub async fn acquire(&self) -> Result<BorrowedConnection> {
        let tracker = LeakTracker {
            pool_name: self.config.pool_name.clone(),
            threshold: self.config.leak_detection_threshold(),
            leaked: self.leaked.clone(),
        };

        match &self.handle {
            PoolHandle::MySql(pool) => {
                let conn = pool.acquire().await.map_err(DataSourceError::connection_acquisition)?;
                Ok(BorrowedConnection::MySql(TrackedConnection::new(conn, tracker)))
            }
            PoolHandle::InMemory(pool) => {
                let conn = pool.acquire().await.map_err(DataSourceError::connection_acquisition)?;
                Ok(BorrowedConnection::InMemory(TrackedConnection::new(conn, tracker)))
            }
        }
    }

    /// Close the pool, waiting for borrowed connections to come back
    pub async fn close(&self) {
        info!("Closing pool '{}'", self.config.pool_name);
        match &self.handle {
            PoolHandle::MySql(pool) => pool.close().await,
            PoolHandle::InMemory(pool) => pool.close().await,
        }
    }

    pub fn is_closed(&self) -> bool {
        match &self.handle {
            PoolHandle::MySql(pool) => pool.is_closed(),
            PoolHandle::InMemory(pool) => pool.is_closed(),
        }
    }
}

struct LeakTracker {
    pool_name: String,
    threshold: Duration,
    leaked: Arc<AtomicU64>,
}

/// Pooled connection with a leak-detection timer attached
pub struct TrackedConnection<DB: Database> {
    conn: PoolConnection<DB>,
    leak_timer: JoinHandle<()>,
}

impl<DB: Database> TrackedConnection<DB> {
    fn new(conn: PoolConnection<DB>, tracker: LeakTracker) -> Self {
        let leak_timer = tokio::spawn(async move {
            tokio::time::sleep(tracker.threshold).await;
            tracker.leaked.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Connection leak detection triggered for pool '{}': connection borrowed for more than {}ms",
                tracker.pool_name,
                tracker.threshold.as_millis()
            );
        });

        Self { conn, leak_timer }
    }
}

impl<DB: Database> Deref for TrackedConnection<DB> {
    type Target = DB::Connection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl<DB: Database> DerefMut for TrackedConnection<DB> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

impl<DB: Database> Drop for TrackedConnection<DB> {
    fn drop(&mut self) {
        // The connection itself returns to the pool when `conn` drops
        self.leak_timer.abort();
    }
}

/// A borrowed connection from either backend
pub enum BorrowedConnection {
    MySql(TrackedConnection<MySql>),
    InMemory(TrackedConnection<Sqlite>),
}

//! Database liveness probing
//!
//! The probe works against the [`ConnectionSource`] trait rather than a
//! concrete pool, so any backend (or a test stub) can be checked the same
//! way. Reports are built fresh on every call and never cached.

use crate::pool::{BorrowedConnection, ManagedPool, PoolConfig};
use crate::{DataSourceError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::Connection;
use std::collections::BTreeMap;
use std::error::Error as _;
use std::time::Duration;
use tracing::{debug, warn};

/// Status reported for the database or for the application as a whole
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Up,
    Down,
    Degraded,
    NotConfigured,
}

/// Outcome of a single probe
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub detail: BTreeMap<String, Value>,
}

impl HealthReport {
    pub fn new(status: HealthStatus) -> Self {
        Self {
            status,
            detail: BTreeMap::new(),
        }
    }

    pub fn not_configured() -> Self {
        Self::new(HealthStatus::NotConfigured)
            .with("error", json!("No datasource configured"))
    }

    /// DOWN with a plain error message
    pub fn down(error: &str) -> Self {
        Self::new(HealthStatus::Down).with("error", json!(error))
    }

    /// DOWN carrying the error kind, its message and its cause
    pub fn from_error(error: &str, err: &DataSourceError) -> Self {
        let cause = err
            .source()
            .map(|cause| crate::mask::mask_secrets(&cause.to_string()))
            .unwrap_or_else(|| "None".to_string());

        Self::down(error)
            .with("exception", json!(err.kind()))
            .with("message", json!(err.user_message()))
            .with("cause", json!(cause))
    }

    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.detail.insert(key.to_string(), value);
        self
    }

    pub fn is_up(&self) -> bool {
        self.status == HealthStatus::Up
    }

    pub fn detail_str(&self, key: &str) -> Option<&str> {
        self.detail.get(key).and_then(Value::as_str)
    }
}

/// What the probe reports about the backend it reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionMetadata {
    /// Connection URL, already masked
    pub url: String,
    pub driver: String,
    pub version: String,
}

/// A borrowed connection as seen by the probe
#[async_trait]
pub trait ProbeConnection: Send {
    /// Whether the connection is unusable
    async fn is_closed(&mut self) -> bool;

    /// Run `sql` and return the first column of the first row, if any
    async fn query_scalar(&mut self, sql: &str) -> Result<Option<i64>>;

    async fn metadata(&mut self) -> Result<ConnectionMetadata>;
}

/// Anything that can lend a connection to the probe
#[async_trait]
pub trait ConnectionSource: Send + Sync {
    /// `Ok(None)` means the source handed back no connection at all
    async fn acquire(&self) -> Result<Option<Box<dyn ProbeConnection>>>;
}

/// Liveness check issuing the test query on a scoped connection
#[derive(Debug, Clone)]
pub struct HealthProbe {
    test_query: String,
    expected: i64,
    validation_timeout: Duration,
}

impl Default for HealthProbe {
    fn default() -> Self {
        Self::new(crate::pool::DEFAULT_TEST_QUERY)
    }
}

impl HealthProbe {
    pub fn new(test_query: impl Into<String>) -> Self {
        Self {
            test_query: test_query.into(),
            expected: 1,
            validation_timeout: Duration::from_millis(crate::pool::DEFAULT_VALIDATION_TIMEOUT_MS),
        }
    }

    /// Probe using a pool's test query and validation timeout
    pub fn for_pool(config: &PoolConfig) -> Self {
        Self {
            test_query: config.test_query.clone(),
            expected: 1,
            validation_timeout: config.validation_timeout(),
        }
    }

    pub fn with_validation_timeout(mut self, timeout: Duration) -> Self {
        self.validation_timeout = timeout;
        self
    }

    /// Check `source`; `None` reports NOT_CONFIGURED rather than DOWN.
    ///
    /// The connection lives only inside this call and goes back to its pool
    /// on every return path.
    pub async fn probe(&self, source: Option<&dyn ConnectionSource>) -> HealthReport {
        let Some(source) = source else {
            return HealthReport::not_configured();
        };

        let mut conn = match source.acquire().await {
            Ok(Some(conn)) => conn,
            Ok(None) => return HealthReport::down("Connection is null or closed"),
            Err(e) => {
                warn!("Health check could not acquire a connection: {}", e.user_message());
                return HealthReport::from_error("Database connection failed", &e);
            }
        };

        if conn.is_closed().await {
            return HealthReport::down("Connection is null or closed");
        }

        let outcome = tokio::time::timeout(self.validation_timeout, conn.query_scalar(&self.test_query)).await;
        let scalar = match outcome {
            Ok(Ok(scalar)) => scalar,
            Ok(Err(e)) => {
                warn!("Health check query failed: {}", e.user_message());
                return HealthReport::from_error("Database connection failed", &e);
            }
            Err(_) => {
                let e = DataSourceError::timeout_error(
                    format!("health check query '{}'", self.test_query),
                    self.validation_timeout.as_millis() as u64,
                );
                return HealthReport::from_error("Database connection failed", &e);
            }
        };

        if scalar != Some(self.expected) {
            warn!("Health check query returned {:?}, expected {}", scalar, self.expected);
            return HealthReport::down("Test query failed");
        }

        let metadata = match conn.metadata().await {
            Ok(metadata) => metadata,
            Err(e) => {
                debug!("Could not read connection metadata: {}", e.user_message());
                ConnectionMetadata {
                    url: "unknown".to_string(),
                    driver: "unknown".to_string(),
                    version: "unknown".to_string(),
                }
            }
        };

        HealthReport::new(HealthStatus::Up)
            .with("database", json!("Available"))
            .with("url", json!(crate::mask::mask_secrets(&metadata.url)))
            .with("driver", json!(metadata.driver))
            .with("version", json!(metadata.version))
            .with("query", json!(format!("{} - SUCCESS", self.test_query)))
    }

    pub async fn is_healthy(&self, source: Option<&dyn ConnectionSource>) -> bool {
        self.probe(source).await.is_up()
    }
}

/// Connection borrowed from a [`ManagedPool`] for probing
struct PooledProbeConnection {
    conn: BorrowedConnection,
    url: String,
}

#[async_trait]
impl ProbeConnection for PooledProbeConnection {
    async fn is_closed(&mut self) -> bool {
        let ping = match &mut self.conn {
            BorrowedConnection::MySql(c) => c.ping().await,
            BorrowedConnection::InMemory(c) => c.ping().await,
        };
        ping.is_err()
    }

    async fn query_scalar(&mut self, sql: &str) -> Result<Option<i64>> {
        let result = match &mut self.conn {
            BorrowedConnection::MySql(c) => {
                sqlx::query_scalar::<_, i64>(sql).fetch_optional(&mut **c).await
            }
            BorrowedConnection::InMemory(c) => {
                sqlx::query_scalar::<_, i64>(sql).fetch_optional(&mut **c).await
            }
        };
        result.map_err(|e| DataSourceError::query_error(sql.to_string(), e))
    }

    async fn metadata(&mut self) -> Result<ConnectionMetadata> {
        let (driver, sql) = match &self.conn {
            BorrowedConnection::MySql(_) => ("MySQL (sqlx)", "SELECT VERSION()"),
            BorrowedConnection::InMemory(_) => ("SQLite (sqlx)", "SELECT sqlite_version()"),
        };

        let version = match &mut self.conn {
            BorrowedConnection::MySql(c) => {
                sqlx::query_scalar::<_, String>(sql).fetch_one(&mut **c).await
            }
            BorrowedConnection::InMemory(c) => {
                sqlx::query_scalar::<_, String>(sql).fetch_one(&mut **c).await
            }
        }
        .map_err(|e| DataSourceError::query_error(sql.to_string(), e))?;

        Ok(ConnectionMetadata {
            url: self.url.clone(),
            driver: driver.to_string(),
            version,
        })
    }
}

#[async_trait]
impl ConnectionSource for ManagedPool {
    async fn acquire(&self) -> Result<Option<Box<dyn ProbeConnection>>> {
        let conn = ManagedPool::acquire(self).await?;
        Ok(Some(Box::new(PooledProbeConnection {
            conn,
            url: self.masked_url(),
        })))
    }
}

/// Overall status built from the database report and other subsystems
#[derive(Debug, Clone, Serialize)]
pub struct ApplicationHealth {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub database: HealthReport,
    pub components: BTreeMap<String, HealthStatus>,
}

impl ApplicationHealth {
    /// A failing database degrades the application; any other DOWN component fails it
    pub fn aggregate(database: HealthReport, components: BTreeMap<String, HealthStatus>) -> Self {
        let status = if components.values().any(|s| *s == HealthStatus::Down) {
            HealthStatus::Down
        } else if database.status == HealthStatus::Down
            || components.values().any(|s| *s == HealthStatus::Degraded)
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Up
        };

        Self {
            status,
            timestamp: Utc::now(),
            database,
            components,
        }
    }
}

//! Status endpoint exposing the database health report over HTTP

use crate::health::{ApplicationHealth, HealthStatus};
use crate::supervisor::FailoverSupervisor;
use crate::Result;
use chrono::Utc;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use warp::http::StatusCode;
use warp::Filter;

/// HTTP adapter over a [`FailoverSupervisor`]
#[derive(Clone)]
pub struct StatusServer {
    supervisor: Arc<FailoverSupervisor>,
    components: Arc<RwLock<BTreeMap<String, HealthStatus>>>,
}

impl StatusServer {
    pub fn new(supervisor: Arc<FailoverSupervisor>) -> Self {
        Self {
            supervisor,
            components: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Record the status of a non-database subsystem
    pub async fn set_component(&self, name: impl Into<String>, status: HealthStatus) {
        self.components.write().await.insert(name.into(), status);
    }

    /// Fresh application health summary
    pub async fn health(&self) -> ApplicationHealth {
        let database = self.supervisor.probe().await;
        let components = self.components.read().await.clone();
        let health = ApplicationHealth::aggregate(database, components);
        debug!("Health check: {:?} (database {:?})", health.status, health.database.status);
        health
    }

    /// `GET /api/health` and `GET /api/ping`
    pub fn routes(&self) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        let server = self.clone();
        let health_route = warp::path!("api" / "health")
            .and(warp::get())
            .and_then(move || {
                let server = server.clone();
                async move {
                    let health = server.health().await;
                    let status = if health.status == HealthStatus::Up {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    };
                    Ok::<_, warp::Rejection>(warp::reply::with_status(warp::reply::json(&health), status))
                }
            });

        let ping_route = warp::path!("api" / "ping").and(warp::get()).map(|| {
            warp::reply::json(&json!({
                "message": "pong",
                "timestamp": Utc::now().timestamp_millis(),
            }))
        });

        health_route.or(ping_route)
    }

    /// Serve until the future is dropped
    pub async fn start(&self, port: u16) -> Result<()> {
        info!("Status endpoint listening on http://0.0.0.0:{}/api/health", port);

        warp::serve(self.routes()).run(([0, 0, 0, 0], port)).await;

        info!("Status endpoint stopped");
        Ok(())
    }

    /// Close the active pool
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down status endpoint");
        self.supervisor.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapProvider;
    use crate::pool::{ManagedPool, PoolConfig};
    use crate::supervisor::PoolFactory;
    use async_trait::async_trait;
    use serde_json::Value;

    struct InMemoryFactory;

    #[async_trait]
    impl PoolFactory for InMemoryFactory {
        async fn build(&self, config: &PoolConfig) -> Result<ManagedPool> {
            Ok(ManagedPool::in_memory(config.clone()))
        }
    }

    async fn started() -> StatusServer {
        let supervisor = Arc::new(FailoverSupervisor::new(InMemoryFactory));
        supervisor.start(&MapProvider::new()).await;
        StatusServer::new(supervisor)
    }

    #[tokio::test]
    async fn test_health_up() {
        let server = started().await;
        let response = warp::test::request()
            .method("GET")
            .path("/api/health")
            .reply(&server.routes())
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["status"], "UP");
        assert_eq!(body["database"]["status"], "UP");
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_health_degraded_returns_503() {
        let server = started().await;
        server.set_component("server", HealthStatus::Up).await;
        if let Some(pool) = server.supervisor.pool().await {
            pool.close().await;
        }

        let response = warp::test::request()
            .method("GET")
            .path("/api/health")
            .reply(&server.routes())
            .await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["status"], "DEGRADED");
        assert_eq!(body["database"]["status"], "DOWN");
        assert_eq!(body["components"]["server"], "UP");
    }

    #[tokio::test]
    async fn test_ping() {
        let server = started().await;
        let response = warp::test::request()
            .method("GET")
            .path("/api/ping")
            .reply(&server.routes())
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["message"], "pong");
    }

    #[tokio::test]
    async fn test_unknown_path_rejected() {
        let server = started().await;
        let response = warp::test::request()
            .method("GET")
            .path("/api/nope")
            .reply(&server.routes())
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

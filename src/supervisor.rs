//! Failover between connection sources
//!
//! Sources are tried in priority order until one parses, configures and
//! builds a pool. When none does, an in-memory store takes over so the
//! process always ends up with a usable pool.

use crate::config::ConfigProvider;
use crate::descriptor::DescriptorParser;
use crate::health::{HealthProbe, HealthReport};
use crate::pool::{ManagedPool, PoolConfig, PoolConfigurator, PoolTuning};
use crate::source::{RawSource, SourceResolver};
use crate::{DataSourceError, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Where the supervisor is in source resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SupervisorState {
    Init,
    /// 1-based index into the candidate list
    TryingSource(usize),
    Configured,
    FallbackActive,
}

/// Turns a validated [`PoolConfig`] into a live pool
#[async_trait]
pub trait PoolFactory: Send + Sync {
    async fn build(&self, config: &PoolConfig) -> Result<ManagedPool>;

    /// Must not fail
    fn build_fallback(&self, config: PoolConfig) -> ManagedPool {
        ManagedPool::in_memory(config)
    }
}

/// Builds sqlx pools, connecting eagerly so unreachable backends are skipped
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlxPoolFactory;

#[async_trait]
impl PoolFactory for SqlxPoolFactory {
    async fn build(&self, config: &PoolConfig) -> Result<ManagedPool> {
        ManagedPool::connect(config.clone()).await
    }
}

struct Active {
    state: SupervisorState,
    pool: Option<Arc<ManagedPool>>,
}

/// Owns the active pool and the resolution state machine
pub struct FailoverSupervisor {
    factory: Box<dyn PoolFactory>,
    active: RwLock<Active>,
}

impl Default for FailoverSupervisor {
    fn default() -> Self {
        Self::new(SqlxPoolFactory)
    }
}

impl FailoverSupervisor {
    pub fn new(factory: impl PoolFactory + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            active: RwLock::new(Active {
                state: SupervisorState::Init,
                pool: None,
            }),
        }
    }

    pub async fn state(&self) -> SupervisorState {
        self.active.read().await.state
    }

    /// The pool currently handed to collaborators
    pub async fn pool(&self) -> Option<Arc<ManagedPool>> {
        self.active.read().await.pool.clone()
    }

    /// Resolve a pool for the first time. Never fails.
    pub async fn start(&self, provider: &dyn ConfigProvider) -> Arc<ManagedPool> {
        info!("Starting connection source resolution");
        self.set_state(SupervisorState::Init).await;

        match self.resolve(provider).await {
            Ok(pool) => self.install(SupervisorState::Configured, Arc::new(pool)).await,
            Err(_) => self.activate_fallback().await,
        }
    }

    /// Run resolution again.
    ///
    /// The current pool stays in service until a replacement is built. When
    /// every source fails, a configured pool that still probes UP is kept;
    /// otherwise the fallback takes over.
    pub async fn re_resolve(&self, provider: &dyn ConfigProvider) -> Arc<ManagedPool> {
        info!("Re-resolving connection source");
        let (previous_state, current) = {
            let mut active = self.active.write().await;
            let previous = active.state;
            active.state = SupervisorState::Init;
            (previous, active.pool.clone())
        };

        if let Ok(pool) = self.resolve(provider).await {
            return self.install(SupervisorState::Configured, Arc::new(pool)).await;
        }

        if let Some(current) = current {
            match previous_state {
                SupervisorState::Configured => {
                    let report = HealthProbe::for_pool(current.config()).probe(Some(current.as_ref())).await;
                    if report.is_up() {
                        warn!(
                            "No replacement source available, keeping healthy pool '{}'",
                            current.config().pool_name
                        );
                        self.set_state(SupervisorState::Configured).await;
                        return current;
                    }
                    warn!(
                        "Current pool '{}' is no longer healthy: {:?}",
                        current.config().pool_name,
                        report.detail_str("error")
                    );
                }
                SupervisorState::FallbackActive if current.is_fallback() => {
                    // Rebuilding the in-memory store would discard its data
                    info!("Fallback store remains active");
                    self.set_state(SupervisorState::FallbackActive).await;
                    return current;
                }
                _ => {}
            }
        }

        self.activate_fallback().await
    }

    /// Probe the active pool; NOT_CONFIGURED before the first resolution
    pub async fn probe(&self) -> HealthReport {
        let pool = self.pool().await;
        match pool {
            Some(pool) => {
                HealthProbe::for_pool(pool.config())
                    .probe(Some(pool.as_ref()))
                    .await
            }
            None => HealthProbe::default().probe(None).await,
        }
    }

    /// Close the active pool
    pub async fn shutdown(&self) {
        let pool = self.active.write().await.pool.take();
        if let Some(pool) = pool {
            pool.close().await;
        }
        self.set_state(SupervisorState::Init).await;
    }

    async fn resolve(&self, provider: &dyn ConfigProvider) -> Result<ManagedPool> {
        let candidates = SourceResolver::candidates(provider);
        let tuning = PoolTuning::from_provider(provider);
        let parser = DescriptorParser::new(SourceResolver::discrete_vars(provider));
        let mut attempts = Vec::with_capacity(candidates.len());

        for (index, source) in candidates.iter().enumerate() {
            self.set_state(SupervisorState::TryingSource(index + 1)).await;
            info!(
                "Trying connection source {}/{}: {}",
                index + 1,
                candidates.len(),
                source.describe()
            );

            match self.try_source(&parser, source, &tuning).await {
                Ok(pool) => {
                    info!(
                        "Connection source {} configured pool '{}' for {}",
                        source.key(),
                        pool.config().pool_name,
                        pool.masked_url()
                    );
                    return Ok(pool);
                }
                Err(e) => {
                    warn!("Connection source {} failed: {}", source.key(), e.detailed_message());
                    attempts.push(format!("{}: {}", source.key(), e.user_message()));
                }
            }
        }

        Err(DataSourceError::all_sources_exhausted(attempts))
    }

    async fn try_source(
        &self,
        parser: &DescriptorParser,
        source: &RawSource,
        tuning: &PoolTuning,
    ) -> Result<ManagedPool> {
        let descriptor = parser.parse(source)?;
        let config = PoolConfigurator::configure(descriptor, tuning)?;
        self.factory.build(&config).await
    }

    async fn activate_fallback(&self) -> Arc<ManagedPool> {
        let pool = Arc::new(self.factory.build_fallback(PoolConfigurator::fallback()));
        error!(
            "No external connection source usable, activating fallback store {}",
            pool.masked_url()
        );
        self.install(SupervisorState::FallbackActive, pool).await
    }

    /// Swap in `pool`, then close whatever it replaced.
    ///
    /// Closing waits for borrowed connections to come back, so it runs in
    /// the background; the old pool stops lending as soon as it starts.
    async fn install(&self, state: SupervisorState, pool: Arc<ManagedPool>) -> Arc<ManagedPool> {
        let previous = {
            let mut active = self.active.write().await;
            active.state = state;
            active.pool.replace(pool.clone())
        };

        if let Some(previous) = previous {
            if !Arc::ptr_eq(&previous, &pool) {
                tokio::spawn(async move {
                    previous.close().await;
                    debug!("Replaced pool '{}' closed", previous.config().pool_name);
                });
            }
        }
        pool
    }

    async fn set_state(&self, state: SupervisorState) {
        self.active.write().await.state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapProvider;
    use crate::health::HealthStatus;
    use crate::pool::StoreKind;
    use crate::source::{DATABASE_URL, DB_HOST, DB_PORT, MYSQL_URL};
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Succeeds with an in-memory pool unless the target host is marked down
    #[derive(Default)]
    struct StubFactory {
        down_hosts: HashSet<String>,
        built: Arc<Mutex<Vec<String>>>,
    }

    impl StubFactory {
        fn with_down(hosts: &[&str]) -> Self {
            Self {
                down_hosts: hosts.iter().map(|h| h.to_string()).collect(),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl PoolFactory for StubFactory {
        async fn build(&self, config: &PoolConfig) -> Result<ManagedPool> {
            let host = config.descriptor.host().to_string();
            self.built.lock().unwrap().push(host.clone());
            if self.down_hosts.contains(&host) {
                return Err(DataSourceError::connection_acquisition(sqlx::Error::PoolTimedOut));
            }
            Ok(ManagedPool::in_memory(config.clone()))
        }
    }

    #[tokio::test]
    async fn test_defaults_configure_discrete_source() {
        let supervisor = FailoverSupervisor::new(StubFactory::default());
        assert_eq!(supervisor.state().await, SupervisorState::Init);
        assert_eq!(supervisor.probe().await.status, HealthStatus::NotConfigured);

        let pool = supervisor.start(&MapProvider::new()).await;
        assert_eq!(supervisor.state().await, SupervisorState::Configured);
        assert_eq!(pool.config().descriptor.host(), "localhost");
        assert_eq!(pool.store(), StoreKind::MySql);
    }

    #[tokio::test]
    async fn test_unreachable_source_moves_to_next() {
        let factory = StubFactory::with_down(&["primary"]);
        let built = factory.built.clone();
        let supervisor = FailoverSupervisor::new(factory);
        let provider = MapProvider::from([
            (DATABASE_URL, "mysql://u:p@primary:3306/authdb"),
            (MYSQL_URL, "mysql://u:p@secondary:3306/authdb"),
        ]);

        let pool = supervisor.start(&provider).await;
        assert_eq!(pool.config().descriptor.host(), "secondary");
        assert_eq!(*built.lock().unwrap(), vec!["primary", "secondary"]);
    }

    #[tokio::test]
    async fn test_malformed_url_falls_through_without_raising() {
        let supervisor = FailoverSupervisor::new(StubFactory::default());
        let provider = MapProvider::from([
            (DATABASE_URL, "mysql://user:pw@db.example:notaport/db"),
            (DB_HOST, "discrete-host"),
        ]);

        let pool = supervisor.start(&provider).await;
        assert_eq!(supervisor.state().await, SupervisorState::Configured);
        assert_eq!(pool.config().descriptor.host(), "discrete-host");
    }

    #[tokio::test]
    async fn test_all_sources_failing_activates_fallback() {
        let supervisor = FailoverSupervisor::new(StubFactory::with_down(&["primary", "localhost"]));
        let provider = MapProvider::from([(DATABASE_URL, "mysql://u:p@primary:3306/authdb")]);

        let pool = supervisor.start(&provider).await;
        assert_eq!(supervisor.state().await, SupervisorState::FallbackActive);
        assert!(pool.is_fallback());
        assert_eq!(pool.config().pool_name, crate::pool::FALLBACK_POOL_NAME);
        assert_eq!(supervisor.probe().await.status, HealthStatus::Up);
    }

    #[tokio::test]
    async fn test_bad_discrete_port_and_invalid_tuning_still_start() {
        let supervisor = FailoverSupervisor::new(StubFactory::default());
        let provider = MapProvider::from([
            (DB_PORT, "not-a-port"),
            (crate::pool::DB_MAX_CONNECTIONS, "2"),
            (crate::pool::DB_MIN_CONNECTIONS, "10"),
        ]);

        let pool = supervisor.start(&provider).await;
        assert!(pool.is_fallback());
    }

    #[tokio::test]
    async fn test_re_resolve_keeps_healthy_pool() {
        let supervisor = FailoverSupervisor::new(StubFactory::with_down(&["gone"]));
        let original = supervisor
            .start(&MapProvider::from([(DB_HOST, "primary")]))
            .await;

        let kept = supervisor
            .re_resolve(&MapProvider::from([(DB_HOST, "gone")]))
            .await;
        assert!(Arc::ptr_eq(&original, &kept));
        assert!(!kept.is_closed());
        assert_eq!(supervisor.state().await, SupervisorState::Configured);
    }

    #[tokio::test]
    async fn test_re_resolve_replaces_pool_and_closes_old() {
        let supervisor = FailoverSupervisor::new(StubFactory::default());
        let original = supervisor
            .start(&MapProvider::from([(DB_HOST, "first")]))
            .await;

        let replacement = supervisor
            .re_resolve(&MapProvider::from([(DB_HOST, "second")]))
            .await;
        assert_eq!(replacement.config().descriptor.host(), "second");
        tokio::time::timeout(Duration::from_secs(2), async {
            while !original.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("replaced pool should be closed");

        let current = supervisor.pool().await.unwrap();
        assert!(Arc::ptr_eq(&current, &replacement));
    }

    #[tokio::test]
    async fn test_re_resolve_does_not_wait_for_old_borrowers() {
        let supervisor = FailoverSupervisor::new(StubFactory::default());
        let original = supervisor
            .start(&MapProvider::from([(DB_HOST, "first")]))
            .await;
        let held = original.acquire().await.unwrap();

        let replacement = tokio::time::timeout(
            Duration::from_secs(3),
            supervisor.re_resolve(&MapProvider::from([(DB_HOST, "second")])),
        )
        .await
        .expect("re-resolution should not block on borrowed connections");
        assert_eq!(replacement.config().descriptor.host(), "second");

        // The old pool stops lending but the outstanding borrow keeps working
        drop(held);
        tokio::time::timeout(Duration::from_secs(2), async {
            while !original.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("old pool should close once its borrower is done");
    }

    #[tokio::test]
    async fn test_re_resolve_replaces_unhealthy_pool_with_fallback() {
        let supervisor = FailoverSupervisor::new(StubFactory::with_down(&["gone"]));
        let original = supervisor
            .start(&MapProvider::from([(DB_HOST, "primary")]))
            .await;
        original.close().await;

        let pool = supervisor
            .re_resolve(&MapProvider::from([(DB_HOST, "gone")]))
            .await;
        assert!(pool.is_fallback());
        assert_eq!(supervisor.state().await, SupervisorState::FallbackActive);
    }

    #[tokio::test]
    async fn test_re_resolve_keeps_existing_fallback() {
        let supervisor = FailoverSupervisor::new(StubFactory::with_down(&["localhost"]));
        let fallback = supervisor.start(&MapProvider::new()).await;
        assert!(fallback.is_fallback());

        let again = supervisor.re_resolve(&MapProvider::new()).await;
        assert!(Arc::ptr_eq(&fallback, &again));
        assert!(!again.is_closed());
    }

    #[tokio::test]
    async fn test_shutdown_closes_pool() {
        let supervisor = FailoverSupervisor::new(StubFactory::default());
        let pool = supervisor.start(&MapProvider::new()).await;
        supervisor.shutdown().await;

        assert!(pool.is_closed());
        assert!(supervisor.pool().await.is_none());
    }
}

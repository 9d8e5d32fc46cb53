//! Authentication service datasource
//!
//! Resolves a MySQL connection from whichever configuration source is
//! present, builds a tuned connection pool for it, falls back to an
//! in-memory store when nothing external is usable, and reports database
//! liveness for a status endpoint.

pub mod config;
pub mod descriptor;
pub mod error;
pub mod health;
pub mod mask;
pub mod pool;
pub mod server;
pub mod source;
pub mod supervisor;

pub use config::{Config, ConfigProvider, EnvironmentProvider, LayeredProvider, MapProvider, ServerConfig};
pub use descriptor::{ConnectionDescriptor, DescriptorParser};
pub use error::{DataSourceError, Result};
pub use health::{ApplicationHealth, HealthProbe, HealthReport, HealthStatus};
pub use pool::{ManagedPool, PoolConfig, PoolConfigurator, PoolTuning};
pub use source::{RawSource, SourceResolver};
pub use supervisor::{FailoverSupervisor, SupervisorState};

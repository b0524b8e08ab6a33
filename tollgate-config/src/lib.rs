//! Configuration loading for Tollgate deployments.
//!
//! Values resolve from environment variables first, then a TOML file, then
//! built-in defaults. See [`ConfigLoader`].

#![allow(missing_docs)]

pub mod duration;
pub mod loader;
pub mod models;
pub mod sources;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoadError, ConfigLoader, ConfigLoaderOptions};
pub use models::{
    ConfigMetadata, QueueConfig, RateLimiterConfig, ReaperConfig, RedisConfig, TollgateConfig,
    WorkerSettings,
};
pub use sources::{EnvConfig, FileConfig};
pub use validation::{ConfigGuardRailError, ConfigWarning, ConfigWarnings};

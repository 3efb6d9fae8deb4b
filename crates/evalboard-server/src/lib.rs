//! evalboard server
//!
//! REST API over the run executor, provider adapters, TOML configuration and
//! tracing setup. The `evalboard` binary wraps these in a CLI.

pub mod app;
pub mod config;
pub mod provider;
pub mod routes;
pub mod telemetry;

pub use app::{AppState, StartupError};
pub use config::{
    AppConfig, ConfigError, LoggingConfig, ProviderConfig, ProviderKind, ServerConfig,
    StorageBackend, StorageConfig,
};
pub use provider::{OpenAiCompatibleGenerator, ProviderRouter};
pub use routes::routes;

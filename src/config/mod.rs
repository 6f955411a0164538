//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ServerConfig (validated, immutable)
//!     → ServerOptions / AxumTransport / observability / registrar
//!
//! No config file:
//!     → ServerConfig::default()
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, load_config_or_default, ConfigError};
pub use schema::{
    IdentityConfig, ListenerConfig, ObservabilityConfig, RegistrarConfig, ServerConfig, ServiceConfig,
    ShutdownTimings,
};
pub use validation::{validate_config, ValidationError};

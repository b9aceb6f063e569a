//! Ambient runtime configuration: engine backend selection and
//! structured logging setup.

pub mod error;
pub mod logging;
pub mod runtime_config;

pub use error::{ConfigError, ConfigResult};
pub use logging::init_tracing;
pub use runtime_config::{DockerConfig, EngineBackend, KubernetesConfig, RuntimeConfig, parse_runtime_config};

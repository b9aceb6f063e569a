//! Runtime configuration: which engine backend to drive a run with,
//! and how to reach it.

use kdl::KdlDocument;

use crate::{ConfigError, ConfigResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineBackend {
    Docker,
    Kubernetes,
}

impl EngineBackend {
    fn parse(raw: &str) -> ConfigResult<Self> {
        match raw {
            "docker" => Ok(Self::Docker),
            "kubernetes" | "k8s" => Ok(Self::Kubernetes),
            other => Err(ConfigError::UnknownBackend(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DockerConfig {
    pub socket: Option<String>,
}

#[derive(Debug, Clone)]
pub struct KubernetesConfig {
    pub namespace: String,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub engine: EngineBackend,
    pub docker: DockerConfig,
    pub kubernetes: KubernetesConfig,
    pub log_level: String,
    pub log_cap: Option<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            engine: EngineBackend::Docker,
            docker: DockerConfig::default(),
            kubernetes: KubernetesConfig::default(),
            log_level: "info".to_string(),
            log_cap: None,
        }
    }
}

/// Parse runtime configuration from KDL text, e.g.:
///
/// ```kdl
/// engine "docker"
///
/// docker {
///     socket "unix:///var/run/docker.sock"
/// }
///
/// logging {
///     level "debug"
/// }
///
/// log-cap 500
/// ```
pub fn parse_runtime_config(kdl: &str) -> ConfigResult<RuntimeConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = RuntimeConfig::default();
    let mut saw_engine = false;

    for node in doc.nodes() {
        match node.name().value() {
            "engine" => {
                let raw = first_string_arg(node, "engine")?;
                config.engine = EngineBackend::parse(&raw)?;
                saw_engine = true;
            }
            "docker" => {
                if let Some(children) = node.children() {
                    for child in children.nodes() {
                        if child.name().value() == "socket" {
                            config.docker.socket = Some(first_string_arg(child, "socket")?);
                        }
                    }
                }
            }
            "kubernetes" => {
                if let Some(children) = node.children() {
                    for child in children.nodes() {
                        if child.name().value() == "namespace" {
                            config.kubernetes.namespace = first_string_arg(child, "namespace")?;
                        }
                    }
                }
            }
            "logging" => {
                if let Some(children) = node.children() {
                    for child in children.nodes() {
                        if child.name().value() == "level" {
                            config.log_level = first_string_arg(child, "level")?;
                        }
                    }
                }
            }
            "log-cap" => {
                config.log_cap = Some(first_int_arg(node, "log-cap")? as usize);
            }
            _ => {}
        }
    }

    if !saw_engine {
        return Err(ConfigError::MissingField("engine".to_string()));
    }

    Ok(config)
}

fn first_string_arg(node: &kdl::KdlNode, field: &str) -> ConfigResult<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
        .ok_or_else(|| ConfigError::MissingField(field.to_string()))
}

fn first_int_arg(node: &kdl::KdlNode, field: &str) -> ConfigResult<i64> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
        .ok_or_else(|| ConfigError::MissingField(field.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_docker_backend_with_socket() {
        let kdl = r#"
            engine "docker"

            docker {
                socket "unix:///var/run/docker.sock"
            }

            log-cap 500
        "#;
        let config = parse_runtime_config(kdl).unwrap();
        assert_eq!(config.engine, EngineBackend::Docker);
        assert_eq!(
            config.docker.socket.as_deref(),
            Some("unix:///var/run/docker.sock")
        );
        assert_eq!(config.log_cap, Some(500));
    }

    #[test]
    fn parses_kubernetes_backend_with_namespace() {
        let kdl = r#"
            engine "kubernetes"

            kubernetes {
                namespace "ci"
            }
        "#;
        let config = parse_runtime_config(kdl).unwrap();
        assert_eq!(config.engine, EngineBackend::Kubernetes);
        assert_eq!(config.kubernetes.namespace, "ci");
    }

    #[test]
    fn missing_engine_is_an_error() {
        let err = parse_runtime_config("docker {}").unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(_)));
    }

    #[test]
    fn unknown_backend_is_an_error() {
        let err = parse_runtime_config(r#"engine "lambda""#).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownBackend(_)));
    }

    #[test]
    fn defaults_are_sane() {
        let config = RuntimeConfig::default();
        assert_eq!(config.engine, EngineBackend::Docker);
        assert_eq!(config.kubernetes.namespace, "default");
        assert_eq!(config.log_level, "info");
    }
}

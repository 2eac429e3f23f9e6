//! Service description carried inside deploy commands.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::ServiceId;

/// Where a service's runnable image comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    /// Built from a git revision via a Dockerfile.
    Git,
    /// Pulled directly from a registry.
    DockerImage,
}

/// HTTP health check the agent should configure for the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    /// Path probed on the service port.
    pub path: String,
    /// Seconds between probes.
    pub interval_seconds: u64,
}

impl Default for HealthCheckSpec {
    fn default() -> Self {
        Self {
            path: "/".to_owned(),
            interval_seconds: 30,
        }
    }
}

/// Resource limits applied to the container.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Memory limit in MB.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    /// CPU cores (fractional allowed).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_cores: Option<f64>,
}

/// Everything the agent needs to know about a service to run it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Service identifier.
    pub id: ServiceId,
    /// Human-readable service name.
    pub name: String,
    /// Service type label (e.g. "web", "worker").
    #[serde(rename = "type")]
    pub kind: String,
    /// Source of the runnable image.
    pub source_type: SourceType,
    /// Registry image reference, when `source_type` is `docker_image`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_image: Option<String>,
    /// Dockerfile path within the repository, for git-sourced services.
    pub dockerfile_path: String,
    /// Container port the service listens on.
    pub port: u16,
    /// Desired replica count.
    pub replicas: u32,
    /// Health check configuration.
    pub health_check: HealthCheckSpec,
    /// Environment variables injected into the container.
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
    /// Resource limits.
    #[serde(default)]
    pub resources: ResourceSpec,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_spec_serializes_type_field() {
        let spec = ServiceSpec {
            id: ServiceId::new("svc-1"),
            name: "api".to_owned(),
            kind: "web".to_owned(),
            source_type: SourceType::Git,
            docker_image: None,
            dockerfile_path: "Dockerfile".to_owned(),
            port: 8080,
            replicas: 2,
            health_check: HealthCheckSpec::default(),
            env_vars: BTreeMap::new(),
            resources: ResourceSpec::default(),
        };

        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["type"], "web");
        assert_eq!(json["source_type"], "git");
        assert!(json.get("docker_image").is_none());
    }
}

//! Compute and network provisioning backend contract.

use async_trait::async_trait;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::LazyLock;
use thiserror::Error;

/// Length of the random suffix shared by one environment's resources.
pub const NAME_SUFFIX_LEN: usize = 6;

/// Name of the service port that forwards SSH.
pub const SSH_PORT_NAME: &str = "2222-ssh";

const NAME_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

static SECRET_FIELD: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#""(accessToken|workerUserPassword)"\s*:\s*"[^"]*""#).ok());

/// Masks credentials in a rendered resource request.
///
/// Falls back to masking the whole input if the pattern is unavailable.
#[must_use]
pub fn redact_secrets(rendered: &str) -> Cow<'_, str> {
    match SECRET_FIELD.as_ref() {
        Some(pattern) => pattern.replace_all(rendered, "\"$1\":\"***\""),
        None => Cow::Borrowed("***"),
    }
}

/// Backend failures.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// The resource does not exist.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Any other backend failure.
    #[error("{0}")]
    Other(String),
}

/// A compute unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    /// Resource name.
    pub name: String,
    /// Reported phase, or the failure reason when one is available.
    pub phase: String,
}

/// A port exposed by a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    /// Port name.
    pub name: String,
    /// Node port assigned by the backend.
    pub node_port: Option<u16>,
}

/// An internal network endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// Resource name.
    pub name: String,
    /// Routable internal address, once assigned.
    pub cluster_ip: Option<String>,
    /// Exposed ports.
    #[serde(default)]
    pub ports: Vec<ServicePort>,
}

/// A public route to a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Resource name.
    pub name: String,
    /// Public host.
    pub host: String,
    /// Path prefix on the host.
    pub path: String,
}

/// Names of every resource belonging to one environment attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceNames {
    /// Random suffix.
    pub suffix: String,
    /// Compute unit name.
    pub pod: String,
    /// Internal service name.
    pub service: String,
    /// Debug service name.
    pub ssh_service: String,
    /// Public route name.
    pub route: String,
    /// Context path the agent is served under.
    pub context_path: String,
}

impl ResourceNames {
    /// Derives names from a fresh random suffix.
    #[must_use]
    pub fn generate(prefix: &str) -> Self {
        let mut rng = rand::thread_rng();
        let suffix: String = (0..NAME_SUFFIX_LEN)
            .map(|_| char::from(NAME_ALPHABET[rng.gen_range(0..NAME_ALPHABET.len())]))
            .collect();
        Self::from_suffix(prefix, &suffix)
    }

    /// Derives names from a given suffix.
    #[must_use]
    pub fn from_suffix(prefix: &str, suffix: &str) -> Self {
        Self {
            suffix: suffix.to_string(),
            pod: format!("{prefix}-pod-{suffix}"),
            service: format!("{prefix}-service-{suffix}"),
            ssh_service: format!("{prefix}-ssh-{suffix}"),
            route: format!("{prefix}-route-{suffix}"),
            context_path: format!("{prefix}-{suffix}"),
        }
    }
}

/// Everything the backend needs to create one environment's resources.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// Resource names.
    pub names: ResourceNames,
    /// Builder image.
    pub image: String,
    /// Memory limit, e.g. `4096Mi`.
    pub memory: String,
    /// Port the agent listens on.
    pub container_port: u16,
    /// Variables substituted into the resource templates.
    pub variables: BTreeMap<String, String>,
}

impl ResourceRequest {
    /// Renders the request as JSON with credentials masked.
    #[must_use]
    pub fn to_log_string(&self) -> String {
        match serde_json::to_string(self) {
            Ok(rendered) => redact_secrets(&rendered).into_owned(),
            Err(e) => format!("<unrenderable request: {e}>"),
        }
    }
}

impl std::fmt::Debug for ResourceRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_log_string())
    }
}

/// Creates, reads and deletes environment resources.
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    /// Creates the compute unit.
    async fn create_pod(&self, request: &ResourceRequest) -> Result<Pod, BackendError>;
    /// Reads the compute unit.
    async fn get_pod(&self, name: &str) -> Result<Pod, BackendError>;
    /// Deletes the compute unit.
    async fn delete_pod(&self, name: &str) -> Result<(), BackendError>;

    /// Creates the internal service.
    async fn create_service(&self, request: &ResourceRequest) -> Result<Service, BackendError>;
    /// Creates the debug service.
    async fn create_ssh_service(&self, request: &ResourceRequest) -> Result<Service, BackendError>;
    /// Reads a service.
    async fn get_service(&self, name: &str) -> Result<Service, BackendError>;
    /// Deletes a service.
    async fn delete_service(&self, name: &str) -> Result<(), BackendError>;

    /// Creates the public route.
    async fn create_route(&self, request: &ResourceRequest) -> Result<Route, BackendError>;
    /// Reads the public route.
    async fn get_route(&self, name: &str) -> Result<Route, BackendError>;
    /// Deletes the public route.
    async fn delete_route(&self, name: &str) -> Result<(), BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_names_share_suffix() {
        let names = ResourceNames::generate("build-agent");
        assert_eq!(names.suffix.len(), NAME_SUFFIX_LEN);
        assert!(names.suffix.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert_eq!(names.pod, format!("build-agent-pod-{}", names.suffix));
        assert_eq!(names.route, format!("build-agent-route-{}", names.suffix));
        assert_eq!(names.context_path, format!("build-agent-{}", names.suffix));
    }

    #[test]
    fn test_redact_secrets() {
        let rendered = r#"{"accessToken": "abc.def", "image": "builder", "workerUserPassword":"pw"}"#;
        let redacted = redact_secrets(rendered);
        assert!(!redacted.contains("abc.def"));
        assert!(!redacted.contains("\"pw\""));
        assert!(redacted.contains("\"image\": \"builder\""));
    }

    #[test]
    fn test_request_debug_hides_token() {
        let mut variables = BTreeMap::new();
        variables.insert("accessToken".to_string(), "top-secret".to_string());
        let request = ResourceRequest {
            names: ResourceNames::from_suffix("ba", "abc123"),
            image: "builder".to_string(),
            memory: "4096Mi".to_string(),
            container_port: 8080,
            variables,
        };
        let rendered = format!("{request:?}");
        assert!(!rendered.contains("top-secret"));
        assert!(rendered.contains("ba-pod-abc123"));
    }
}

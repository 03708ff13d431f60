//! Typed clients for the services a sandbox project spans
//!
//! Each downstream service (Authentication, VM Management, Storage) sits behind
//! the same narrow [`ServiceClient`] capability set so the orchestrator can
//! sequence them uniformly and tests can substitute [`mock::MockServiceClient`].

pub mod auth;
pub mod config;
pub mod error;
mod http;
pub mod storage;
pub mod vm;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use auth::AuthClient;
pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use storage::StorageClient;
pub use vm::VmClient;

/// Opaque identifier of a downstream resource, as returned by its service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceRef(pub String);

impl ResourceRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything a downstream service needs to attribute a new resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub project_id: String,
    pub project_name: String,
    pub owner: String,
    pub flavor: Option<String>,
    pub image: Option<String>,
    pub ssh_public_key: Option<String>,
}

/// Lifecycle of a downstream resource as reported by `get_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    Pending,
    Ready,
    Deleting,
    Gone,
    Failed,
}

impl ResourceStatus {
    /// Map a downstream status string. Unrecognised values are treated as
    /// still in progress.
    pub fn from_downstream(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ready" | "active" | "running" | "granted" | "created" | "available" => {
                ResourceStatus::Ready
            }
            "deleting" | "deletion_in_progress" | "terminating" => ResourceStatus::Deleting,
            "deleted" | "gone" | "released" | "revoked" => ResourceStatus::Gone,
            "failed" | "error" => ResourceStatus::Failed,
            _ => ResourceStatus::Pending,
        }
    }
}

/// Capability set shared by every downstream service client.
///
/// Implementations must bound each call by their configured timeout and
/// classify failures into [`ClientError`] variants.
#[async_trait]
pub trait ServiceClient: Send + Sync {
    /// Short service name used in logs and error messages.
    fn service(&self) -> &'static str;

    async fn create(&self, spec: &ResourceSpec) -> Result<ResourceRef>;

    async fn delete(&self, resource: &ResourceRef) -> Result<()>;

    async fn get_status(&self, resource: &ResourceRef) -> Result<ResourceStatus>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downstream_status_strings_are_normalised() {
        assert_eq!(ResourceStatus::from_downstream("ACTIVE"), ResourceStatus::Ready);
        assert_eq!(ResourceStatus::from_downstream("DELETED"), ResourceStatus::Gone);
        assert_eq!(
            ResourceStatus::from_downstream("terminating"),
            ResourceStatus::Deleting
        );
        assert_eq!(ResourceStatus::from_downstream("error"), ResourceStatus::Failed);
        assert_eq!(
            ResourceStatus::from_downstream("BUILD"),
            ResourceStatus::Pending
        );
    }
}

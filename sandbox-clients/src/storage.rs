use crate::{
    error::{ClientError, Result},
    http::{field, HttpTransport},
    ClientConfig, ResourceRef, ResourceSpec, ResourceStatus, ServiceClient,
};
use async_trait::async_trait;
use reqwest::Method;
use serde_json::json;
use tracing::info;

const SERVICE: &str = "storage";

pub const DEFAULT_REPOSITORY_GROUP: &str = "desp-aas-projects";

/// Client for the Storage service, which hosts one git repository per project.
pub struct StorageClient {
    http: HttpTransport,
    repository_group: String,
}

impl StorageClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        Ok(Self {
            http: HttpTransport::new(SERVICE, config)?,
            repository_group: DEFAULT_REPOSITORY_GROUP.to_string(),
        })
    }

    /// Group (namespace) the repositories are created under.
    pub fn with_repository_group(mut self, group: impl Into<String>) -> Self {
        self.repository_group = group.into();
        self
    }

    /// Repositories are named `{project name}_{project id}` so two projects
    /// with the same display name never collide.
    pub fn repository_name(spec: &ResourceSpec) -> String {
        format!("{}_{}", spec.project_name, spec.project_id)
    }
}

#[async_trait]
impl ServiceClient for StorageClient {
    fn service(&self) -> &'static str {
        SERVICE
    }

    async fn create(&self, spec: &ResourceSpec) -> Result<ResourceRef> {
        let payload = json!({
            "project_id": spec.project_id,
            "owner": spec.owner,
            "name": Self::repository_name(spec),
            "group": self.repository_group,
        });

        let body = self
            .http
            .send(Method::POST, &["repos"], Some(&payload))
            .await?;
        let repo_id = field(&body, &["id", "resource_id", "repo_id"]).ok_or_else(|| {
            ClientError::permanent(SERVICE, "create response did not contain a repository id")
        })?;

        info!(project_id = %spec.project_id, repo_id = %repo_id, "Project repository created");
        Ok(ResourceRef::new(repo_id))
    }

    async fn delete(&self, resource: &ResourceRef) -> Result<()> {
        self.http.remove(&["repos", resource.as_str()]).await
    }

    async fn get_status(&self, resource: &ResourceRef) -> Result<ResourceStatus> {
        self.http.resource_status(&["repos", resource.as_str()]).await
    }
}

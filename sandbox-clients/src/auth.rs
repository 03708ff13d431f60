use crate::{
    error::Result,
    http::{field, HttpTransport},
    ClientConfig, ResourceRef, ResourceSpec, ResourceStatus, ServiceClient,
};
use async_trait::async_trait;
use reqwest::Method;
use serde_json::json;
use tracing::info;

const SERVICE: &str = "auth";

/// Client for the Authentication service.
///
/// Access grants are addressed by project id (`/projects/{id}/grant`), so the
/// project id is the resource reference. A grant id returned by the service
/// is only logged.
pub struct AuthClient {
    http: HttpTransport,
}

impl AuthClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        Ok(Self {
            http: HttpTransport::new(SERVICE, config)?,
        })
    }
}

#[async_trait]
impl ServiceClient for AuthClient {
    fn service(&self) -> &'static str {
        SERVICE
    }

    async fn create(&self, spec: &ResourceSpec) -> Result<ResourceRef> {
        let payload = json!({
            "project_id": spec.project_id,
            "project_name": spec.project_name,
            "owner": spec.owner,
        });

        let body = self
            .http
            .send(
                Method::POST,
                &["projects", &spec.project_id, "grant"],
                Some(&payload),
            )
            .await?;

        if let Some(grant_id) = field(&body, &["id", "grant_id"]) {
            info!(project_id = %spec.project_id, grant_id = %grant_id, "Project access grant created");
        }
        Ok(ResourceRef::new(spec.project_id.clone()))
    }

    async fn delete(&self, resource: &ResourceRef) -> Result<()> {
        self.http
            .remove(&["projects", resource.as_str(), "grant"])
            .await
    }

    async fn get_status(&self, resource: &ResourceRef) -> Result<ResourceStatus> {
        self.http
            .resource_status(&["projects", resource.as_str(), "grant"])
            .await
    }
}

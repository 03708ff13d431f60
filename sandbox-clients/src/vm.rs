use crate::{
    error::{ClientError, Result},
    http::{field, HttpTransport},
    ClientConfig, ResourceRef, ResourceSpec, ResourceStatus, ServiceClient,
};
use async_trait::async_trait;
use reqwest::Method;
use serde_json::json;
use tracing::info;

const SERVICE: &str = "vm";

/// Client for the VM Management service (`/vms`).
pub struct VmClient {
    http: HttpTransport,
}

impl VmClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        Ok(Self {
            http: HttpTransport::new(SERVICE, config)?,
        })
    }
}

#[async_trait]
impl ServiceClient for VmClient {
    fn service(&self) -> &'static str {
        SERVICE
    }

    async fn create(&self, spec: &ResourceSpec) -> Result<ResourceRef> {
        let payload = json!({
            "project_id": spec.project_id,
            "owner": spec.owner,
            "name": spec.project_name,
            "flavor": spec.flavor,
            "image": spec.image,
            "ssh_public_key": spec.ssh_public_key,
        });

        let body = self.http.send(Method::POST, &["vms"], Some(&payload)).await?;
        let vm_id = field(&body, &["id", "vm_id", "server_id"]).ok_or_else(|| {
            ClientError::permanent(SERVICE, "create response did not contain a VM id")
        })?;

        info!(project_id = %spec.project_id, vm_id = %vm_id, "VM creation accepted");
        Ok(ResourceRef::new(vm_id))
    }

    async fn delete(&self, resource: &ResourceRef) -> Result<()> {
        self.http.remove(&["vms", resource.as_str()]).await
    }

    async fn get_status(&self, resource: &ResourceRef) -> Result<ResourceStatus> {
        self.http.resource_status(&["vms", resource.as_str()]).await
    }
}

use crate::{
    error::{ClientError, Result},
    ResourceRef, ResourceSpec, ResourceStatus, ServiceClient,
};
use async_trait::async_trait;
use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

#[derive(Default)]
struct MockState {
    create_calls: usize,
    delete_calls: usize,
    status_calls: usize,
    create_script: VecDeque<ClientError>,
    delete_script: VecDeque<ClientError>,
    create_always: Option<ClientError>,
    delete_always: Option<ClientError>,
    // resource id -> owning project id
    live: HashMap<String, String>,
    // resource id -> remaining "deleting" answers before it reports gone
    releasing: HashMap<String, u32>,
    deleting_polls: u32,
    next_id: usize,
    latency: Duration,
}

/// In-memory [`ServiceClient`] with call counters and scripted failures.
///
/// Resources it creates are tracked as live until deleted, so tests can
/// assert both how many downstream calls happened and what is left behind.
pub struct MockServiceClient {
    service: &'static str,
    state: Mutex<MockState>,
}

impl MockServiceClient {
    pub fn new(service: &'static str) -> Self {
        Self {
            service,
            state: Mutex::new(MockState::default()),
        }
    }

    /// Delay every create and delete, to widen race windows in tests.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.lock().latency = latency;
        self
    }

    /// After a delete, report `deleting` this many times before `gone`.
    pub fn with_deleting_polls(self, polls: u32) -> Self {
        self.lock().deleting_polls = polls;
        self
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn transient_error(&self, message: &str) -> ClientError {
        ClientError::transient(self.service, message)
    }

    pub fn permanent_error(&self, message: &str) -> ClientError {
        ClientError::permanent(self.service, message)
    }

    /// Fail the next `times` creates with `error`, then behave normally.
    pub fn fail_creates(&self, times: usize, error: ClientError) {
        let mut state = self.lock();
        for _ in 0..times {
            state.create_script.push_back(error.clone());
        }
    }

    pub fn fail_all_creates(&self, error: ClientError) {
        self.lock().create_always = Some(error);
    }

    pub fn fail_deletes(&self, times: usize, error: ClientError) {
        let mut state = self.lock();
        for _ in 0..times {
            state.delete_script.push_back(error.clone());
        }
    }

    pub fn fail_all_deletes(&self, error: ClientError) {
        self.lock().delete_always = Some(error);
    }

    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.create_script.clear();
        state.delete_script.clear();
        state.create_always = None;
        state.delete_always = None;
    }

    /// Register a resource as if an earlier run had created it.
    pub fn seed_resource(&self, resource: &ResourceRef, project_id: &str) {
        self.lock()
            .live
            .insert(resource.as_str().to_string(), project_id.to_string());
    }

    pub fn create_calls(&self) -> usize {
        self.lock().create_calls
    }

    pub fn delete_calls(&self) -> usize {
        self.lock().delete_calls
    }

    pub fn status_calls(&self) -> usize {
        self.lock().status_calls
    }

    pub fn live_count(&self) -> usize {
        self.lock().live.len()
    }

    pub fn is_live(&self, resource: &ResourceRef) -> bool {
        self.lock().live.contains_key(resource.as_str())
    }

    async fn simulate_latency(&self) {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl ServiceClient for MockServiceClient {
    fn service(&self) -> &'static str {
        self.service
    }

    async fn create(&self, spec: &ResourceSpec) -> Result<ResourceRef> {
        self.lock().create_calls += 1;
        self.simulate_latency().await;

        let mut state = self.lock();
        if let Some(err) = state.create_script.pop_front() {
            return Err(err);
        }
        if let Some(err) = &state.create_always {
            return Err(err.clone());
        }

        state.next_id += 1;
        let id = format!("{}-{}", self.service, state.next_id);
        state.live.insert(id.clone(), spec.project_id.clone());
        Ok(ResourceRef::new(id))
    }

    async fn delete(&self, resource: &ResourceRef) -> Result<()> {
        self.lock().delete_calls += 1;
        self.simulate_latency().await;

        let mut state = self.lock();
        if let Some(err) = state.delete_script.pop_front() {
            return Err(err);
        }
        if let Some(err) = &state.delete_always {
            return Err(err.clone());
        }

        if state.live.remove(resource.as_str()).is_none() {
            return Err(ClientError::not_found(self.service, resource.as_str()));
        }
        if state.deleting_polls > 0 {
            let polls = state.deleting_polls;
            state.releasing.insert(resource.as_str().to_string(), polls);
        }
        Ok(())
    }

    async fn get_status(&self, resource: &ResourceRef) -> Result<ResourceStatus> {
        let mut state = self.lock();
        state.status_calls += 1;

        if state.live.contains_key(resource.as_str()) {
            return Ok(ResourceStatus::Ready);
        }
        if let Some(remaining) = state.releasing.get_mut(resource.as_str()) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(ResourceStatus::Deleting);
            }
        }
        Ok(ResourceStatus::Gone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ResourceSpec {
        ResourceSpec {
            project_id: "p1".to_string(),
            project_name: "demo".to_string(),
            owner: "alice".to_string(),
            flavor: None,
            image: None,
            ssh_public_key: None,
        }
    }

    #[tokio::test]
    async fn scripted_failures_run_out_then_calls_succeed() {
        let client = MockServiceClient::new("vm");
        client.fail_creates(2, client.transient_error("flaky"));

        assert!(client.create(&spec()).await.is_err());
        assert!(client.create(&spec()).await.is_err());
        let resource = client.create(&spec()).await.expect("third create succeeds");

        assert_eq!(client.create_calls(), 3);
        assert!(client.is_live(&resource));
    }

    #[tokio::test]
    async fn delete_of_unknown_resource_is_not_found() {
        let client = MockServiceClient::new("storage");
        let err = client
            .delete(&ResourceRef::new("missing"))
            .await
            .expect_err("nothing to delete");
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn deleted_resource_reports_deleting_before_gone() {
        let client = MockServiceClient::new("vm").with_deleting_polls(2);
        let resource = client.create(&spec()).await.unwrap();
        client.delete(&resource).await.unwrap();

        assert_eq!(
            client.get_status(&resource).await.unwrap(),
            ResourceStatus::Deleting
        );
        assert_eq!(
            client.get_status(&resource).await.unwrap(),
            ResourceStatus::Deleting
        );
        assert_eq!(
            client.get_status(&resource).await.unwrap(),
            ResourceStatus::Gone
        );
    }
}

use std::time::Duration;

/// Connection settings for one downstream service.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the service, e.g. `http://vm-management:8080`
    pub base_url: String,
    /// Upper bound for a single request, connect included
    pub timeout: Duration,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

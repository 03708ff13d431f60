use sandbox_clients::{
    storage::DEFAULT_REPOSITORY_GROUP, AuthClient, ClientConfig, StorageClient, VmClient,
};
use sandbox_orchestrator::{OrchestratorConfig, RetryPolicy, ServiceClients};
use serde::Deserialize;
use std::{path::PathBuf, str::FromStr, sync::Arc, time::Duration};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_reconciler_interval")]
    pub reconciler_interval_secs: u64,

    /// Idle time after which the reconciler takes over a working project
    #[serde(default = "default_stuck_after")]
    pub stuck_after_secs: u64,

    #[serde(default = "default_auth_url")]
    pub auth_url: String,

    #[serde(default = "default_vm_url")]
    pub vm_url: String,

    #[serde(default = "default_storage_url")]
    pub storage_url: String,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,

    #[serde(default = "default_retry_jitter")]
    pub retry_jitter: bool,

    #[serde(default = "default_release_poll_interval")]
    pub release_poll_interval_secs: u64,

    #[serde(default = "default_release_timeout")]
    pub release_timeout_secs: u64,

    #[serde(default = "default_repository_group")]
    pub repository_group: String,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn default_bind_addr() -> String {
    std::env::var("SANDBOX_API_BIND").unwrap_or_else(|_| "0.0.0.0:3140".to_string())
}

fn default_db_path() -> PathBuf {
    if let Ok(path) = std::env::var("SANDBOX_API_DB_PATH") {
        return PathBuf::from(path);
    }

    if cfg!(windows) {
        let appdata = std::env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(appdata)
            .join("sandbox")
            .join("api")
            .join("sandbox.db")
    } else {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home)
            .join(".sandbox")
            .join("api")
            .join("sandbox.db")
    }
}

fn default_reconciler_interval() -> u64 {
    env_or("SANDBOX_API_RECONCILER_INTERVAL", 60)
}

fn default_stuck_after() -> u64 {
    env_or("SANDBOX_API_STUCK_AFTER", 600) // 10 minutes
}

fn default_auth_url() -> String {
    std::env::var("SANDBOX_AUTH_URL").unwrap_or_else(|_| "http://localhost:8081".to_string())
}

fn default_vm_url() -> String {
    std::env::var("SANDBOX_VM_URL").unwrap_or_else(|_| "http://localhost:8082".to_string())
}

fn default_storage_url() -> String {
    std::env::var("SANDBOX_STORAGE_URL").unwrap_or_else(|_| "http://localhost:8083".to_string())
}

fn default_request_timeout() -> u64 {
    env_or("SANDBOX_API_REQUEST_TIMEOUT", 30)
}

fn default_retry_max_attempts() -> u32 {
    env_or("SANDBOX_API_RETRY_MAX_ATTEMPTS", 5)
}

fn default_retry_base_delay() -> u64 {
    env_or("SANDBOX_API_RETRY_BASE_DELAY_MS", 500)
}

fn default_retry_max_delay() -> u64 {
    env_or("SANDBOX_API_RETRY_MAX_DELAY_MS", 30_000)
}

fn default_retry_jitter() -> bool {
    env_or("SANDBOX_API_RETRY_JITTER", true)
}

fn default_release_poll_interval() -> u64 {
    env_or("SANDBOX_API_RELEASE_POLL_INTERVAL", 5)
}

fn default_release_timeout() -> u64 {
    env_or("SANDBOX_API_RELEASE_TIMEOUT", 600)
}

fn default_repository_group() -> String {
    std::env::var("SANDBOX_API_REPOSITORY_GROUP")
        .unwrap_or_else(|_| DEFAULT_REPOSITORY_GROUP.to_string())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            db_path: default_db_path(),
            reconciler_interval_secs: default_reconciler_interval(),
            stuck_after_secs: default_stuck_after(),
            auth_url: default_auth_url(),
            vm_url: default_vm_url(),
            storage_url: default_storage_url(),
            request_timeout_secs: default_request_timeout(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
            retry_jitter: default_retry_jitter(),
            release_poll_interval_secs: default_release_poll_interval(),
            release_timeout_secs: default_release_timeout(),
            repository_group: default_repository_group(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn client_config(&self, base_url: &str) -> ClientConfig {
        ClientConfig::new(base_url).with_timeout(Duration::from_secs(self.request_timeout_secs))
    }

    /// HTTP clients for the three downstream services
    pub fn service_clients(&self) -> sandbox_clients::Result<ServiceClients> {
        let auth = AuthClient::new(&self.client_config(&self.auth_url))?;
        let vm = VmClient::new(&self.client_config(&self.vm_url))?;
        let storage = StorageClient::new(&self.client_config(&self.storage_url))?
            .with_repository_group(self.repository_group.clone());

        Ok(ServiceClients::new(
            Arc::new(auth),
            Arc::new(vm),
            Arc::new(storage),
        ))
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        let retry = RetryPolicy::new(
            self.retry_max_attempts,
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
        .with_jitter(self.retry_jitter);

        OrchestratorConfig {
            retry,
            stuck_after: Duration::from_secs(self.stuck_after_secs),
            release_poll_interval: Duration::from_secs(self.release_poll_interval_secs),
            release_timeout: Duration::from_secs(self.release_timeout_secs),
        }
    }
}

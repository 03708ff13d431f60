use crate::{
    error::{ClientError, Result},
    ClientConfig, ResourceStatus,
};
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

/// JSON-over-HTTP plumbing shared by the three service clients.
///
/// Owns the timeout-bounded `reqwest` client and the mapping from transport
/// and status failures onto [`ClientError`].
pub(crate) struct HttpTransport {
    service: &'static str,
    client: Client,
    base_url: Url,
}

impl HttpTransport {
    pub(crate) fn new(service: &'static str, config: &ClientConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url).map_err(|e| ClientError::Config {
            service,
            message: format!("invalid base URL '{}': {e}", config.base_url),
        })?;
        if base_url.cannot_be_a_base() {
            return Err(ClientError::Config {
                service,
                message: format!("base URL '{}' cannot carry a path", config.base_url),
            });
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.timeout)
            .user_agent(concat!("sandbox-orchestrator/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ClientError::Config {
                service,
                message: format!("failed to create HTTP client: {e}"),
            })?;

        Ok(Self {
            service,
            client,
            base_url,
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ClientError::Config {
                service: self.service,
                message: "base URL cannot carry a path".to_string(),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Send a request and decode the JSON response body.
    /// An empty success body decodes to `Value::Null`.
    pub(crate) async fn send(
        &self,
        method: Method,
        segments: &[&str],
        body: Option<&Value>,
    ) -> Result<Value> {
        let url = self.url(segments)?;
        debug!(service = self.service, %method, %url, "Calling downstream service");

        let mut request = self.client.request(method.clone(), url.clone());
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| self.transport_error(&e))?;
        let status = response.status();
        let text = response.text().await.map_err(|e| self.transport_error(&e))?;

        if status.is_success() {
            if text.trim().is_empty() || method == Method::DELETE {
                return Ok(Value::Null);
            }
            // The call may have taken effect downstream, so let the caller
            // retry instead of compensating for a resource it cannot name.
            return serde_json::from_str(&text).map_err(|e| {
                warn!(service = self.service, %method, %url, %status, "Undecodable success body");
                ClientError::transient(
                    self.service,
                    format!("{status} with undecodable response body: {e}"),
                )
            });
        }

        let err = classify_status(self.service, status, &text);
        warn!(service = self.service, %method, %url, %status, error = %err, "Downstream call failed");
        Err(err)
    }

    pub(crate) async fn remove(&self, segments: &[&str]) -> Result<()> {
        self.send(Method::DELETE, segments, None).await.map(|_| ())
    }

    /// `GET` a resource; a 404 means the resource is gone.
    pub(crate) async fn resource_status(&self, segments: &[&str]) -> Result<ResourceStatus> {
        match self.send(Method::GET, segments, None).await {
            Ok(body) => Ok(field(&body, &["status", "state"])
                .map(|s| ResourceStatus::from_downstream(&s))
                .unwrap_or(ResourceStatus::Ready)),
            Err(e) if e.is_not_found() => Ok(ResourceStatus::Gone),
            Err(e) => Err(e),
        }
    }

    fn transport_error(&self, err: &reqwest::Error) -> ClientError {
        if err.is_builder() {
            ClientError::Config {
                service: self.service,
                message: err.to_string(),
            }
        } else if err.is_timeout() {
            ClientError::transient(self.service, format!("request timed out: {err}"))
        } else {
            ClientError::transient(self.service, format!("transport failure: {err}"))
        }
    }
}

pub(crate) fn classify_status(service: &'static str, status: StatusCode, body: &str) -> ClientError {
    let detail = extract_message(body)
        .or_else(|| status.canonical_reason().map(str::to_string))
        .unwrap_or_default();
    let message = format!("{}: {detail}", status.as_u16());

    match status {
        StatusCode::NOT_FOUND => ClientError::not_found(service, message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            ClientError::transient(service, message)
        }
        s if s.is_server_error() => ClientError::transient(service, message),
        _ => ClientError::permanent(service, message),
    }
}

/// Pull a human readable message out of an error body.
pub(crate) fn extract_message(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }

    let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
        return Some(trimmed.to_string());
    };

    let found = [
        value.pointer("/error/message"),
        value.get("error"),
        value.get("message"),
        value.get("detail"),
    ]
    .into_iter()
    .flatten()
    .find_map(|v| v.as_str().map(str::to_string));

    found.or_else(|| Some(trimmed.to_string()))
}

/// Look up a string or integer field at the top level or under `data`.
pub(crate) fn field(body: &Value, names: &[&str]) -> Option<String> {
    [Some(body), body.get("data")]
        .into_iter()
        .flatten()
        .flat_map(|scope| names.iter().filter_map(move |name| scope.get(*name)))
        .find_map(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

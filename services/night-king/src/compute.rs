//! Compute Engine REST client.
//!
//! Implements [`ComputeApi`] over the v1 instances API:
//! - `instances.get` for the power state
//! - `instances.start` for resurrection

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use nightking_events::InstanceRef;
use nightking_reconcile::PowerState;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use tracing::{debug, error};

use crate::auth::TokenProvider;
use crate::config::Config;
use crate::poller::{ComputeApi, ComputeError};

/// Compute Engine API client.
pub struct ComputeClient {
    client: reqwest::Client,
    base_url: Url,
    project: String,
    tokens: Arc<dyn TokenProvider>,
}

/// The subset of the instance resource we read.
#[derive(Debug, Deserialize)]
struct InstanceResource {
    status: String,
}

/// Zonal operation returned by `instances.start`.
#[derive(Debug, Deserialize)]
struct Operation {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

impl ComputeClient {
    /// Create a new compute client.
    pub fn new(config: &Config, tokens: Arc<dyn TokenProvider>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build compute HTTP client")?;

        let base_url = Url::parse(&config.compute_endpoint)
            .with_context(|| format!("Invalid compute endpoint: {}", config.compute_endpoint))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("Invalid compute endpoint: {}", config.compute_endpoint);
        }

        Ok(Self {
            client,
            base_url,
            project: config.project.clone(),
            tokens,
        })
    }

    /// Build the URL of an instance resource, plus any trailing segments.
    ///
    /// Project, zone and name are each pushed as one percent-encoded path
    /// segment, so payload values can never leave the configured project.
    fn instance_url(&self, instance: &InstanceRef, suffix: &[&str]) -> Result<Url, String> {
        for segment in [instance.location(), instance.name()] {
            // The url crate silently drops dot segments
            if segment == "." || segment == ".." {
                return Err(format!("invalid path segment {:?}", segment));
            }
        }

        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| format!("endpoint {} cannot hold a path", self.base_url))?
            .pop_if_empty()
            .extend(["compute", "v1", "projects", self.project.as_str(), "zones"])
            .push(instance.location())
            .push("instances")
            .push(instance.name())
            .extend(suffix);
        Ok(url)
    }
}

#[async_trait]
impl ComputeApi for ComputeClient {
    async fn get_status(&self, instance: &InstanceRef) -> Result<PowerState, ComputeError> {
        let query_failed = |reason: String| ComputeError::QueryFailed {
            instance: instance.clone(),
            reason,
        };

        let token = self
            .tokens
            .access_token()
            .await
            .map_err(|e| query_failed(format!("access token: {:#}", e)))?;

        let url = self.instance_url(instance, &[]).map_err(query_failed)?;
        debug!(url = %url, "Describing instance");

        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| query_failed(e.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(ComputeError::InstanceNotFound {
                instance: instance.clone(),
            });
        }

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Failed to describe instance");
            return Err(query_failed(format!("{} - {}", status, body)));
        }

        let resource: InstanceResource = response
            .json()
            .await
            .map_err(|e| query_failed(e.to_string()))?;

        Ok(PowerState::from_status(&resource.status))
    }

    async fn start(&self, instance: &InstanceRef) -> Result<(), ComputeError> {
        let start_failed = |reason: String| ComputeError::StartRequestFailed {
            instance: instance.clone(),
            reason,
        };

        let token = self
            .tokens
            .access_token()
            .await
            .map_err(|e| start_failed(format!("access token: {:#}", e)))?;

        let url = self.instance_url(instance, &["start"]).map_err(start_failed)?;
        debug!(url = %url, "Starting instance");

        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_LENGTH, 0)
            .send()
            .await
            .map_err(|e| start_failed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Failed to start instance");
            return Err(start_failed(format!("{} - {}", status, body)));
        }

        // The body only describes the async operation; failing to read it
        // does not change that the request was accepted.
        match response.json::<Operation>().await {
            Ok(operation) => debug!(
                operation = operation.name.as_deref().unwrap_or_default(),
                status = operation.status.as_deref().unwrap_or_default(),
                "Start operation accepted"
            ),
            Err(e) => debug!(error = %e, "Start accepted with unreadable operation body"),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::auth::StaticToken;

    const INSTANCE_PATH: &str =
        "/compute/v1/projects/my-project/zones/us-east1-b/instances/worker-1";

    fn client(server: &MockServer) -> ComputeClient {
        ComputeClient {
            client: reqwest::Client::new(),
            base_url: Url::parse(&server.uri()).unwrap(),
            project: "my-project".to_string(),
            tokens: Arc::new(StaticToken::new("ya29.test")),
        }
    }

    fn worker() -> InstanceRef {
        InstanceRef::new("worker-1", "us-east1-b").unwrap()
    }

    #[tokio::test]
    async fn test_get_status_maps_power_state() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(INSTANCE_PATH))
            .and(header("authorization", "Bearer ya29.test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "kind": "compute#instance",
                "name": "worker-1",
                "status": "TERMINATED"
            })))
            .mount(&server)
            .await;

        let state = client(&server).get_status(&worker()).await.unwrap();
        assert_eq!(state, PowerState::Terminated);
    }

    #[tokio::test]
    async fn test_get_status_unknown_status_is_other() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(INSTANCE_PATH))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "status": "STAGING" })),
            )
            .mount(&server)
            .await;

        let state = client(&server).get_status(&worker()).await.unwrap();
        assert_eq!(state, PowerState::Other("STAGING".to_string()));
    }

    #[tokio::test]
    async fn test_get_status_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(INSTANCE_PATH))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = client(&server).get_status(&worker()).await.unwrap_err();
        assert_eq!(err, ComputeError::InstanceNotFound { instance: worker() });
    }

    #[tokio::test]
    async fn test_get_status_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(INSTANCE_PATH))
            .respond_with(ResponseTemplate::new(503).set_body_string("backend unavailable"))
            .mount(&server)
            .await;

        let err = client(&server).get_status(&worker()).await.unwrap_err();
        assert!(matches!(err, ComputeError::QueryFailed { .. }));
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn test_start_accepted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("{}/start", INSTANCE_PATH)))
            .and(header("authorization", "Bearer ya29.test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "kind": "compute#operation",
                "name": "operation-123",
                "status": "RUNNING"
            })))
            .expect(1)
            .mount(&server)
            .await;

        client(&server).start(&worker()).await.unwrap();
    }

    #[tokio::test]
    async fn test_start_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("{}/start", INSTANCE_PATH)))
            .respond_with(ResponseTemplate::new(403).set_body_string("quota exceeded"))
            .mount(&server)
            .await;

        let err = client(&server).start(&worker()).await.unwrap_err();
        assert!(matches!(err, ComputeError::StartRequestFailed { .. }));
    }

    #[tokio::test]
    async fn test_payload_cannot_escape_configured_project() {
        let server = MockServer::start().await;
        Mock::given(path_regex("^/compute/v1/projects/other-project/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "TERMINATED"
            })))
            .expect(0)
            .mount(&server)
            .await;

        let victim = InstanceRef::new("victim", "../../other-project/zones/z").unwrap();
        let client = client(&server);

        let err = client.get_status(&victim).await.unwrap_err();
        assert_eq!(err, ComputeError::InstanceNotFound { instance: victim.clone() });
        assert!(client.start(&victim).await.is_err());

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 2);
        for request in requests {
            let segments: Vec<&str> = request.url.path_segments().unwrap().collect();
            assert_eq!(&segments[..4], &["compute", "v1", "projects", "my-project"]);
            assert_eq!(segments[4], "zones");
            assert_eq!(segments[6], "instances");
            assert_eq!(segments[7], "victim");
        }
    }

    #[tokio::test]
    async fn test_url_keeps_reserved_characters_in_one_segment() {
        let server = MockServer::start().await;
        let instance = InstanceRef::new("worker?x=1#frag", "us-east1-b/../x").unwrap();

        let url = client(&server).instance_url(&instance, &["start"]).unwrap();
        let segments: Vec<&str> = url.path_segments().unwrap().collect();

        assert_eq!(segments.len(), 9);
        assert_eq!(segments[3], "my-project");
        assert_eq!(segments[8], "start");
        assert!(url.query().is_none());
        assert!(url.fragment().is_none());
    }

    #[tokio::test]
    async fn test_dot_segments_are_rejected_without_a_request() {
        let server = MockServer::start().await;
        let client = client(&server);

        let err = client
            .get_status(&InstanceRef::new("..", "us-east1-b").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, ComputeError::QueryFailed { .. }));

        let err = client
            .start(&InstanceRef::new("worker-1", ".").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, ComputeError::StartRequestFailed { .. }));

        assert!(server.received_requests().await.unwrap().is_empty());
    }
}

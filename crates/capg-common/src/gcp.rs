//! Read-only client for the GKE container API
//!
//! Reconcilers only observe GKE; creating and deleting clusters or node
//! pools is done elsewhere. [`ContainerService`] is the seam tests mock.

use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::{Error, Result};

/// Default API endpoint
pub const CONTAINER_API: &str = "https://container.googleapis.com/v1beta1";

/// Environment variable holding a pre-issued access token
pub const ACCESS_TOKEN_ENV: &str = "GKE_ACCESS_TOKEN";

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Refresh cached tokens this long before they expire
const TOKEN_SLACK: Duration = Duration::from_secs(60);

/// Lifecycle state of a GKE cluster
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterState {
    /// Being created
    Provisioning,
    /// Serving
    Running,
    /// Being changed
    Reconciling,
    /// Being deleted
    Stopping,
    /// Broken
    Error,
    /// Serving with reduced capacity
    Degraded,
    /// Any value this client does not know
    #[serde(other)]
    Unspecified,
}

impl ClusterState {
    /// Whether GKE is still working towards a stable state
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            Self::Provisioning | Self::Reconciling | Self::Stopping | Self::Unspecified
        )
    }
}

/// Lifecycle state of a GKE node pool
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodePoolState {
    /// Being created
    Provisioning,
    /// Serving
    Running,
    /// Serving, but some nodes failed
    RunningWithError,
    /// Being changed
    Reconciling,
    /// Being deleted
    Stopping,
    /// Broken
    Error,
    /// Any value this client does not know
    #[serde(other)]
    Unspecified,
}

/// Observed GKE cluster
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GkeClusterInfo {
    /// Lifecycle state
    pub status: ClusterState,
    /// Control plane IP address
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Explanation attached to the state
    #[serde(default)]
    pub status_message: Option<String>,
}

/// Observed GKE node pool
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolInfo {
    /// Lifecycle state
    pub status: NodePoolState,
    /// Explanation attached to the state
    #[serde(default)]
    pub status_message: Option<String>,
}

/// GKE lookups used by the reconcilers
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ContainerService: Send + Sync {
    /// Fetch a cluster; `Ok(None)` if it does not exist
    async fn get_cluster(
        &self,
        project: &str,
        location: &str,
        cluster: &str,
    ) -> Result<Option<GkeClusterInfo>>;

    /// Fetch a node pool; `Ok(None)` if it does not exist
    async fn get_node_pool(
        &self,
        project: &str,
        location: &str,
        cluster: &str,
        node_pool: &str,
    ) -> Result<Option<NodePoolInfo>>;
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

/// [`ContainerService`] over the GKE REST API
///
/// Authenticates with `GKE_ACCESS_TOKEN` when set, otherwise with the
/// workload identity token from the GCE metadata server.
pub struct GkeRestClient {
    http: reqwest::Client,
    base_url: String,
    token: Mutex<Option<(String, Instant)>>,
}

impl Default for GkeRestClient {
    fn default() -> Self {
        Self::new(CONTAINER_API)
    }
}

impl GkeRestClient {
    /// Client for the API at `base_url`
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: Mutex::new(None),
        }
    }

    fn cluster_url(&self, project: &str, location: &str, cluster: &str) -> String {
        format!(
            "{}/projects/{}/locations/{}/clusters/{}",
            self.base_url, project, location, cluster
        )
    }

    async fn access_token(&self) -> Result<String> {
        if let Ok(token) = std::env::var(ACCESS_TOKEN_ENV) {
            return Ok(token);
        }

        let mut cached = self.token.lock().await;
        if let Some((token, expires)) = cached.as_ref() {
            if Instant::now() + TOKEN_SLACK < *expires {
                return Ok(token.clone());
            }
        }

        let response = self
            .http
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| Error::transport_with_context("gke-auth", e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::transport_with_context(
                "gke-auth",
                format!("metadata server returned {}", response.status()),
            ));
        }
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::transport_with_context("gke-auth", e.to_string()))?;

        let expires = Instant::now() + Duration::from_secs(body.expires_in);
        *cached = Some((body.access_token.clone(), expires));
        debug!(expires_in = body.expires_in, "refreshed GKE access token");
        Ok(body.access_token)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<Option<T>> {
        let token = self.access_token().await?;
        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| Error::transport_with_context("gke", e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(Error::transport_with_context(
                "gke",
                format!("GET {url} returned {status}: {body}"),
            ));
        }
        let parsed = response
            .json()
            .await
            .map_err(|e| Error::serialization(format!("decoding {url}: {e}")))?;
        Ok(Some(parsed))
    }
}

#[async_trait]
impl ContainerService for GkeRestClient {
    async fn get_cluster(
        &self,
        project: &str,
        location: &str,
        cluster: &str,
    ) -> Result<Option<GkeClusterInfo>> {
        self.get_json(&self.cluster_url(project, location, cluster))
            .await
    }

    async fn get_node_pool(
        &self,
        project: &str,
        location: &str,
        cluster: &str,
        node_pool: &str,
    ) -> Result<Option<NodePoolInfo>> {
        let url = format!(
            "{}/nodePools/{}",
            self.cluster_url(project, location, cluster),
            node_pool
        );
        self.get_json(&url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_response_parses() {
        let info: GkeClusterInfo = serde_json::from_value(serde_json::json!({
            "name": "demo",
            "status": "RUNNING",
            "endpoint": "34.1.2.3",
            "currentMasterVersion": "1.30.5-gke.1014001"
        }))
        .unwrap();
        assert_eq!(info.status, ClusterState::Running);
        assert_eq!(info.endpoint.as_deref(), Some("34.1.2.3"));
    }

    #[test]
    fn unknown_states_are_unspecified() {
        let info: NodePoolInfo =
            serde_json::from_value(serde_json::json!({ "status": "STATUS_UNSPECIFIED" })).unwrap();
        assert_eq!(info.status, NodePoolState::Unspecified);

        let info: NodePoolInfo = serde_json::from_value(serde_json::json!({
            "status": "RUNNING_WITH_ERROR",
            "statusMessage": "2 nodes failed"
        }))
        .unwrap();
        assert_eq!(info.status, NodePoolState::RunningWithError);
        assert_eq!(info.status_message.as_deref(), Some("2 nodes failed"));
    }

    #[test]
    fn transitional_cluster_states() {
        assert!(ClusterState::Provisioning.is_transitional());
        assert!(!ClusterState::Running.is_transitional());
        assert!(!ClusterState::Error.is_transitional());
    }

    #[test]
    fn urls_follow_locations_layout() {
        let client = GkeRestClient::new("https://example.test/v1beta1/");
        assert_eq!(
            client.cluster_url("proj", "europe-west1", "demo"),
            "https://example.test/v1beta1/projects/proj/locations/europe-west1/clusters/demo"
        );
    }
}

//! Startup checks and process identity

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::Api;
use kube::Client;
use tracing::info;

use capg_common::retry::{retry_with_backoff, RetryConfig};
use capg_common::scheme::Scheme;

/// Attempts per CRD before startup gives up
pub const CRD_CHECK_ATTEMPTS: u32 = 5;

/// Verify the CRD of every owned kind is installed
///
/// Transient API errors and missing CRDs are retried with backoff; the
/// error after the last attempt is fatal.
pub async fn ensure_crds_present(client: &Client, scheme: &Scheme) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let retry = RetryConfig::with_max_attempts(CRD_CHECK_ATTEMPTS);

    for kind in scheme.owned_kinds() {
        let name = kind.crd_name();
        retry_with_backoff(&retry, &format!("check CRD {name}"), || {
            let crds = crds.clone();
            let name = name.clone();
            async move {
                match crds.get_opt(&name).await {
                    Ok(Some(_)) => Ok(()),
                    Ok(None) => Err(anyhow::anyhow!("CRD {name} is not installed")),
                    Err(e) => Err(anyhow::anyhow!("failed to read CRD {name}: {e}")),
                }
            }
        })
        .await?;
        info!(crd = %name, kind = %kind, "CRD present");
    }
    Ok(())
}

/// Identity used as Lease holder and event reporter instance
///
/// `POD_NAME`, else `HOSTNAME`, suffixed with a random id so a restarted
/// process never mistakes its predecessor's Lease for its own.
pub fn pod_identity() -> String {
    identity_from(
        std::env::var("POD_NAME").ok(),
        std::env::var("HOSTNAME").ok(),
    )
}

fn identity_from(pod_name: Option<String>, hostname: Option<String>) -> String {
    let base = pod_name
        .filter(|s| !s.is_empty())
        .or_else(|| hostname.filter(|s| !s.is_empty()))
        .unwrap_or_else(|| "capg-controller".to_string());
    format!("{base}_{}", uuid::Uuid::new_v4())
}

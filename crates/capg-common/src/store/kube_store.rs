//! API-server backed store

use std::marker::PhantomData;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::api::{Api, ListParams, PostParams};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::Client;
use tracing::debug;

use super::{ObjectKey, ResourceStore, StoreObject, WatchEvent};
use crate::{Error, Result, FIELD_MANAGER};

/// [`ResourceStore`] over the Kubernetes API
///
/// With a namespace set, `list` and `watch` only see that namespace.
pub struct KubeStore<K> {
    client: Client,
    namespace: Option<String>,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Clone for KubeStore<K> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            namespace: self.namespace.clone(),
            _kind: PhantomData,
        }
    }
}

impl<K: StoreObject> KubeStore<K> {
    /// Store over every namespace, or only `namespace` when given
    pub fn new(client: Client, namespace: Option<String>) -> Self {
        Self {
            client,
            namespace,
            _kind: PhantomData,
        }
    }

    fn scoped_api(&self) -> Api<K> {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    fn api_for(&self, key: &ObjectKey) -> Api<K> {
        match &key.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::default_namespaced(self.client.clone()),
        }
    }
}

/// Copy of `obj` whose write is rejected unless the stored version is `expected_version`
fn pinned<K: StoreObject>(obj: &K, expected_version: &str) -> K {
    let mut desired = obj.clone();
    desired.meta_mut().resource_version = Some(expected_version.to_string());
    desired
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

/// Map write failures onto the store's error contract
fn classify(err: kube::Error, key: &ObjectKey, expected_version: &str) -> Error {
    match err {
        kube::Error::Api(ae) if ae.code == 409 => Error::conflict(key.to_string(), expected_version),
        kube::Error::Api(ae) if ae.code == 404 => Error::not_found(key.to_string()),
        kube::Error::Api(ae) => Error::Kube {
            source: kube::Error::Api(ae),
        },
        other => Error::transport_with_context("store", other.to_string()),
    }
}

#[async_trait]
impl<K: StoreObject> ResourceStore<K> for KubeStore<K> {
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>> {
        Ok(self.api_for(key).get_opt(&key.name).await?)
    }

    async fn list(&self) -> Result<Vec<K>> {
        Ok(self
            .scoped_api()
            .list(&ListParams::default())
            .await?
            .items)
    }

    fn watch(&self) -> BoxStream<'static, Result<WatchEvent>> {
        // Shorter than the client's read timeout so the server closes first
        let config = watcher::Config::default().timeout(25);
        watcher::watcher(self.scoped_api(), config)
            .default_backoff()
            .filter_map(|event| async move {
                match event {
                    Ok(Event::Apply(obj)) | Ok(Event::InitApply(obj)) => {
                        Some(Ok(WatchEvent::Applied(ObjectKey::from_resource(&obj))))
                    }
                    Ok(Event::Delete(obj)) => {
                        Some(Ok(WatchEvent::Deleted(ObjectKey::from_resource(&obj))))
                    }
                    Ok(Event::Init) | Ok(Event::InitDone) => None,
                    Err(e) => Some(Err(Error::transport_with_context("watch", e.to_string()))),
                }
            })
            .boxed()
    }

    async fn conditional_update(&self, obj: &K, expected_version: &str) -> Result<String> {
        let key = ObjectKey::from_resource(obj);
        let desired = pinned(obj, expected_version);
        let written = self
            .api_for(&key)
            .replace(&key.name, &post_params(), &desired)
            .await
            .map_err(|e| classify(e, &key, expected_version))?;
        let version = written.meta().resource_version.clone().unwrap_or_default();
        debug!(key = %key, expected_version, new_version = %version, "object replaced");
        Ok(version)
    }

    async fn conditional_update_status(&self, obj: &K, expected_version: &str) -> Result<String> {
        let key = ObjectKey::from_resource(obj);
        let body = serde_json::to_vec(&pinned(obj, expected_version))?;
        let written = self
            .api_for(&key)
            .replace_status(&key.name, &post_params(), body)
            .await
            .map_err(|e| classify(e, &key, expected_version))?;
        let version = written.meta().resource_version.clone().unwrap_or_default();
        debug!(key = %key, expected_version, new_version = %version, "status replaced");
        Ok(version)
    }
}

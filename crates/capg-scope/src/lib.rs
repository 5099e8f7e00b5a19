//! Per-reconcile scopes over GKE infrastructure objects
//!
//! A scope wraps one object for the length of one reconcile invocation. It
//! snapshots the object when opened, lets reconcile logic mutate it through
//! typed setters, and on [`Scope::close`] writes it back with a single
//! version-checked update if anything changed.
//!
//! Closing must happen on every exit path; [`with_scope`] guarantees that.

#![deny(missing_docs)]

mod cluster;
mod machine_pool;
mod patch;

use std::sync::Arc;

use async_trait::async_trait;
use capg_common::gcp::ContainerService;
use capg_common::Result;
use futures::future::BoxFuture;
use tracing::warn;

pub use cluster::{GkeClusterScope, GkeClusterScopeParams};
pub use machine_pool::{GkeMachinePoolScope, GkeMachinePoolScopeParams};
pub use patch::PatchHelper;

/// Cloud clients available to reconcile logic through a scope
#[derive(Clone, Default)]
pub struct GkeClients {
    /// GKE container API
    pub container: Option<Arc<dyn ContainerService>>,
}

/// A handle that must be closed exactly once
#[async_trait]
pub trait Scope: Send + Sized {
    /// Commit pending changes and consume the scope
    async fn close(self) -> Result<()>;
}

/// Run `body` against `scope`, then close it whatever the outcome
///
/// An error from `body` wins over an error from closing; the latter is
/// logged in that case.
pub async fn with_scope<S, T, F>(mut scope: S, body: F) -> Result<T>
where
    S: Scope,
    T: Send,
    F: for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, Result<T>> + Send,
{
    let outcome = body(&mut scope).await;
    let closed = scope.close().await;
    match (outcome, closed) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(close_err)) => Err(close_err),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(close_err)) => {
            warn!(error = %close_err, "scope commit failed after reconcile error");
            Err(err)
        }
    }
}

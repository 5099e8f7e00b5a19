//! Reconciliation scheduler and GKE reconcilers
//!
//! Change notifications from a [`capg_common::ResourceStore`] feed one
//! [`WorkQueue`] per kind. A fixed pool of workers drains each queue while
//! this process leads, running every reconcile under a deadline and
//! requeueing according to its outcome.

#![deny(missing_docs)]

mod action;
mod controller;
pub mod policy;
mod queue;
pub mod reconcilers;
mod scheduler;

pub use action::Action;
pub use controller::{Controller, ControllerConfig, Reconcile};
pub use queue::{KeyStatus, WorkItem, WorkQueue};
pub use scheduler::Scheduler;

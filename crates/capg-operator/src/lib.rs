//! GKE cluster-api provider controller manager
//!
//! Library half of the `capg-operator` binary: configuration, startup
//! checks and the [`manager::Manager`] that runs the scheduler.

#![deny(missing_docs)]

pub mod config;
pub mod manager;
pub mod startup;

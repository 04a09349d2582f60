//! Lifecycle daemon library
//!
//! This module provides the components of the `lifecycled` binary:
//! - Layered configuration
//! - Kube-backed collaborators for the convergence engine
//! - The Kyma controller loop

pub mod config;
pub mod controller;
pub mod error;
pub mod kube_client;

pub use config::LifecycleConfig;
pub use controller::{error_policy, reconcile, Context};
pub use error::{DaemonError, DaemonResult};
pub use kube_client::KubeCluster;

//! Lifecycle Engine - module convergence for Kyma resources
//!
//! Every pass over a Kyma runs the same pipeline:
//!
//! - **Resolution**: pick the release channel and version of every module and
//!   fetch its ModuleTemplate, gated by visibility, maintenance windows and skew
//!   protection ([`TemplateResolver`])
//! - **Assembly**: turn the resolved template and its descriptor into a Manifest
//!   ([`ModuleAssembler`])
//! - **Sync**: apply all manifests concurrently under a named field owner
//!   ([`SyncRunner`])
//! - **Status**: rebuild module statuses from what the cluster reports
//!
//! Mandatory modules run through assembly and sync as well, without being
//! declared ([`MandatoryResolver`]).
//!
//! [`ConvergenceStateMachine`] owns the pipeline and the install/delete entry
//! points. Cluster access goes through the traits in [`client`]; the daemon
//! provides kube-backed implementations and [`memory`] provides in-memory ones.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod assembler;
pub mod channel;
pub mod client;
pub mod descriptor;
pub mod error;
pub mod lookup;
pub mod maintenance;
pub mod mandatory;
pub mod memory;
pub mod remote;
pub mod requeue;
pub mod state_machine;
pub mod status;
pub mod sync;

// Re-export main types
pub use assembler::{manifest_name, AssembledModule, ModuleAssembler};
pub use channel::ChannelResolver;
pub use client::{
    CrdGenerations, DescriptorProvider, KymaStore, ManifestApplier, RemoteCatalog, RemoteSync,
    TemplateReader, TemplateWriter, WebhookManager,
};
pub use descriptor::CachedDescriptorProvider;
pub use error::{ClientError, ClientResult, LifecycleError, Result};
pub use lookup::{fetch_module_info, ModuleInfo, TemplateInfo, TemplateResolver, TemplatesByModule};
pub use maintenance::{MaintenanceWindow, MaintenanceWindowPolicy, PolicyError, PolicyMaintenanceWindow};
pub use mandatory::{assemble_mandatory, MandatoryResolver};
pub use memory::{InMemoryCluster, InMemoryRemote};
pub use requeue::{Requeue, RequeueIntervals};
pub use state_machine::{ConvergenceStateMachine, EngineConfig, RuntimeClients};
pub use sync::{need_to_update, SyncReport, SyncRunner};

/// Namespace the Kyma and default custom resources live in inside the runtime cluster
pub const DEFAULT_REMOTE_NAMESPACE: &str = "kyma-system";

//! Lifecycle Types - custom resources for module convergence
//!
//! The lifecycle manager reconciles a declarative [`Kyma`] resource against a
//! control-plane cluster (KCP) and a remote runtime cluster (SKR). This crate
//! holds the resources that flow through that reconciliation.
//!
//! ## Key Concepts
//!
//! - **Kyma**: root aggregate, declares modules and a release channel
//! - **ModuleReleaseMeta**: maps channels to versions, or pins a mandatory version
//! - **ModuleTemplate**: one immutable release of a module, `{module}-{version}`
//! - **Manifest**: the applied artifact for one (Kyma, module) pair
//! - **State**: lifecycle state shared by Kyma, modules and manifests
//! - **Descriptor**: decoded component descriptor a template points at

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod conditions;
pub mod descriptor;
pub mod error;
pub mod kyma;
pub mod labels;
pub mod manifest;
pub mod release_meta;
pub mod state;
pub mod template;

// Re-export main types
pub use conditions::{ConditionStatus, KymaCondition, KymaConditionType};
pub use descriptor::{
    AccessKind, AccessSpec, ComponentNameMapping, Descriptor, DescriptorResource, RepositoryContext,
};
pub use error::{Result, TypesError};
pub use kyma::{
    CustomResourcePolicy, Kyma, KymaSpec, KymaStatus, LastOperation, Module, ModuleStatus,
    PartialMeta, TrackingObject,
};
pub use manifest::{ImageSpec, InstallInfo, Manifest, ManifestSpec, ManifestStatus, RefType};
pub use release_meta::{ChannelVersionAssignment, Mandatory, ModuleReleaseMeta, ModuleReleaseMetaSpec};
pub use state::{InstallPhase, State};
pub use template::{template_name, ModuleTemplate, ModuleTemplateSpec};

/// API group shared by every lifecycle resource
pub const OPERATOR_GROUP: &str = "operator.kyma-project.io";

/// Served version of the lifecycle resources
pub const API_VERSION: &str = "operator.kyma-project.io/v1beta2";

/// Channel used when neither the module nor the Kyma declares one
pub const DEFAULT_CHANNEL: &str = "regular";

/// Reserved channel value that is never valid in a spec
pub const NONE_CHANNEL: &str = "none";

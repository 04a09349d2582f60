//! Collaborator interfaces of the convergence engine
//!
//! The engine never talks to an API server directly. Each concern is a narrow
//! trait injected at construction; the daemon supplies kube-backed
//! implementations and tests use the in-memory ones from [`crate::memory`].
//!
//! Reads return `Ok(None)` for objects that do not exist. Deletes of absent
//! objects return [`ClientError::NotFound`](crate::ClientError::NotFound) and callers decide whether to care.

use crate::error::{ClientResult, Result};
use async_trait::async_trait;
use lifecycle_types::{Descriptor, Kyma, Manifest, ModuleReleaseMeta, ModuleTemplate};
use std::sync::Arc;

/// Read access to module templates and release metadata
#[async_trait]
pub trait TemplateReader: Send + Sync {
    async fn get_template(
        &self,
        namespace: &str,
        name: &str,
    ) -> ClientResult<Option<ModuleTemplate>>;

    /// Release metadata is named after the module it describes
    async fn get_release_meta(
        &self,
        namespace: &str,
        module: &str,
    ) -> ClientResult<Option<ModuleReleaseMeta>>;

    async fn list_templates(&self) -> ClientResult<Vec<ModuleTemplate>>;
}

/// Metadata writes to module templates
#[async_trait]
pub trait TemplateWriter: Send + Sync {
    async fn update_template(&self, template: &ModuleTemplate) -> ClientResult<()>;
}

/// Decoded component descriptors of templates
pub trait DescriptorProvider: Send + Sync {
    fn get_descriptor(&self, template: &ModuleTemplate) -> Result<Arc<Descriptor>>;
}

/// Manifest persistence with field-owned apply
#[async_trait]
pub trait ManifestApplier: Send + Sync {
    async fn get_manifest(
        &self,
        namespace: &str,
        name: &str,
    ) -> ClientResult<Option<Manifest>>;

    /// Server-side apply forcing ownership of the fields in `manifest`
    async fn apply_manifest(
        &self,
        manifest: &Manifest,
        field_owner: &str,
    ) -> ClientResult<Manifest>;

    async fn update_manifest(&self, manifest: &Manifest) -> ClientResult<Manifest>;

    async fn delete_manifest(&self, namespace: &str, name: &str) -> ClientResult<()>;

    /// Manifests labelled as belonging to a Kyma
    async fn list_manifests_for_kyma(
        &self,
        namespace: &str,
        kyma_name: &str,
    ) -> ClientResult<Vec<Manifest>>;
}

/// Kyma persistence in the control plane
#[async_trait]
pub trait KymaStore: Send + Sync {
    async fn get_kyma(&self, namespace: &str, name: &str) -> ClientResult<Option<Kyma>>;

    /// Write metadata and spec, returning the stored object
    async fn update_kyma(&self, kyma: &Kyma) -> ClientResult<Kyma>;

    /// Write the status subresource
    async fn update_kyma_status(&self, kyma: &Kyma) -> ClientResult<Kyma>;
}

/// Kyma CRD generations observed in both clusters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrdGenerations {
    /// Control plane
    pub kcp: i64,
    /// Runtime cluster
    pub skr: i64,
}

/// Bookkeeping of the Kyma copy inside the runtime cluster
#[async_trait]
pub trait RemoteSync: Send + Sync {
    /// Open access to the runtime cluster; fails with `AccessSecretNotFound` once it is gone
    async fn init(&self, kyma: &Kyma) -> Result<()>;

    /// Drop cached clients for the runtime cluster
    async fn invalidate(&self, kyma: &Kyma);

    /// Make sure the Kyma CRDs in the runtime cluster are current
    async fn sync_crds(&self, kyma: &Kyma) -> Result<CrdGenerations>;

    /// Remote Kyma, created from the control-plane copy when missing
    async fn synchronize_kyma(&self, kyma: &Kyma) -> Result<Kyma>;

    /// Copy the control-plane status into the remote Kyma
    async fn sync_status(&self, kyma: &Kyma) -> Result<()>;

    async fn delete_remote_kyma(&self, kyma: &Kyma) -> Result<()>;

    async fn remove_remote_finalizers(&self, kyma: &Kyma) -> Result<()>;
}

/// Module catalog mirrored into the runtime cluster
#[async_trait]
pub trait RemoteCatalog: Send + Sync {
    async fn sync(&self, kyma: &Kyma) -> Result<()>;

    async fn delete(&self, kyma: &Kyma) -> Result<()>;
}

/// Runtime watcher webhook and its certificate
#[async_trait]
pub trait WebhookManager: Send + Sync {
    /// Install or refresh; `CertificateNotReady` while the certificate is pending
    async fn install(&self, kyma: &Kyma) -> Result<()>;

    async fn remove(&self, kyma: &Kyma) -> Result<()>;

    /// Remove the control-plane certificate of a Kyma that is already gone
    async fn remove_certificate(&self, namespace: &str, kyma_name: &str) -> Result<()>;
}

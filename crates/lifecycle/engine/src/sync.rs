//! Applying assembled manifests
//!
//! Every module is synced in its own future. A future owns its
//! [`AssembledModule`] and hands it back with the manifest it observed in the
//! cluster; nothing is shared while the futures run. Failures are collected and
//! reported together after all modules were attempted.

use crate::assembler::AssembledModule;
use crate::client::ManifestApplier;
use crate::error::{LifecycleError, Result};
use futures::future::join_all;
use kube::ResourceExt;
use lifecycle_types::{Kyma, Manifest, ModuleStatus, State};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// Outcome of one sync round
#[derive(Debug)]
pub struct SyncReport {
    /// Modules with `manifest` replaced by what the cluster now holds
    pub modules: Vec<AssembledModule>,
    pub errors: Vec<String>,
    pub elapsed: Duration,
}

impl SyncReport {
    pub fn result(&self) -> Result<()> {
        if self.errors.is_empty() {
            return Ok(());
        }
        Err(LifecycleError::ServerSideApplyFailed {
            errors: self.errors.clone(),
            elapsed: self.elapsed,
        })
    }
}

/// State a manifest reports, with a fresh manifest counting as processing
pub fn observed_state(manifest: &Manifest) -> State {
    match manifest.state() {
        State::Unset => State::Processing,
        state => state,
    }
}

/// Whether the desired manifest has to be written.
///
/// Deterministic in its inputs, so a pass that finds nothing to do stays a no-op.
pub fn need_to_update(
    in_cluster: Option<&Manifest>,
    desired: &Manifest,
    status: Option<&ModuleStatus>,
    module: &AssembledModule,
) -> bool {
    let Some(in_cluster) = in_cluster else {
        return !module.unmanaged;
    };
    let Some(status) = status else {
        return true;
    };

    if let (Some(recorded), Some(template)) = (&status.template, &module.template.template) {
        if recorded.generation() != template.generation() {
            return true;
        }
    }

    desired.spec.version != status.version
        || desired.channel().unwrap_or_default() != status.channel
        || status.state != observed_state(in_cluster)
        || module.unmanaged != in_cluster.is_unmanaged()
}

/// Applies manifests for all modules of a Kyma
pub struct SyncRunner {
    manifests: Arc<dyn ManifestApplier>,
}

impl SyncRunner {
    pub fn new(manifests: Arc<dyn ManifestApplier>) -> Self {
        Self { manifests }
    }

    /// Sync every module concurrently; one failure never stops the others
    #[instrument(skip(self, kyma, modules), fields(kyma = %kyma.name_any(), modules = modules.len()))]
    pub async fn reconcile_manifests(&self, kyma: &Kyma, modules: Vec<AssembledModule>) -> SyncReport {
        let start = Instant::now();
        let owner = kyma.field_owner();

        let results = join_all(
            modules
                .into_iter()
                .map(|module| self.sync_module(kyma, &owner, module)),
        )
        .await;

        let mut report = SyncReport {
            modules: Vec::with_capacity(results.len()),
            errors: Vec::new(),
            elapsed: Duration::ZERO,
        };
        for (module, error) in results {
            if let Some(error) = error {
                warn!(module = %module.module_name, error = %error, "Module sync failed");
                report
                    .errors
                    .push(format!("could not update module {}: {error}", module.module_name));
            }
            report.modules.push(module);
        }
        report.elapsed = start.elapsed();
        debug!(elapsed = ?report.elapsed, "ServerSideApply finished");
        report
    }

    async fn sync_module(
        &self,
        kyma: &Kyma,
        owner: &str,
        mut module: AssembledModule,
    ) -> (AssembledModule, Option<LifecycleError>) {
        if let Some(error) = &module.template.error {
            if error.is_template_not_allowed() {
                let error = match &module.manifest {
                    Some(manifest) => self.delete(manifest).await.err(),
                    None => None,
                };
                return (module, error);
            }
            return (module, None);
        }

        let Some(desired) = module.manifest.clone() else {
            return (module, None);
        };

        // On failure the desired manifest stays on the module for status reporting
        match self.update(kyma, owner, &module, desired).await {
            Ok(observed) => {
                module.manifest = Some(observed);
                (module, None)
            }
            Err(e) => (module, Some(e)),
        }
    }

    async fn update(
        &self,
        kyma: &Kyma,
        owner: &str,
        module: &AssembledModule,
        desired: Manifest,
    ) -> Result<Manifest> {
        let namespace = desired.namespace().unwrap_or_default();
        let name = desired.name_any();

        let in_cluster = self
            .manifests
            .get_manifest(&namespace, &name)
            .await
            .map_err(|e| {
                LifecycleError::from(e)
                    .context(format!("error getting manifest {namespace}/{name} before update"))
            })?;

        // Both sides agree the module is handed over to the user
        if let Some(existing) = &in_cluster {
            if module.unmanaged && existing.is_unmanaged() {
                self.delete(existing).await?;
                return Ok(desired);
            }
        }

        let status = kyma.module_status(&module.module_name);
        if !need_to_update(in_cluster.as_ref(), &desired, status, module) {
            return Ok(in_cluster.unwrap_or(desired));
        }

        if module.enabled {
            let applied = self
                .manifests
                .apply_manifest(&desired, owner)
                .await
                .map_err(|e| {
                    LifecycleError::from(e)
                        .context(format!("error applying manifest {namespace}/{name}"))
                })?;
            debug!(module = %module.module_name, manifest = %name, "Successfully patched module");
            return Ok(applied);
        }

        // Disabled modules only get their spec refreshed until they are deleted
        let Some(mut existing) = in_cluster else {
            return Ok(desired);
        };
        existing.spec = desired.spec.clone();
        match self.manifests.update_manifest(&existing).await {
            Ok(updated) => Ok(updated),
            Err(e) if e.is_not_found() => Ok(desired),
            Err(e) => Err(LifecycleError::from(e)
                .context(format!("error update manifest {namespace}/{name}"))),
        }
    }

    async fn delete(&self, manifest: &Manifest) -> Result<()> {
        let namespace = manifest.namespace().unwrap_or_default();
        match self
            .manifests
            .delete_manifest(&namespace, &manifest.name_any())
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(LifecycleError::from(e).context("failed to delete manifest")),
        }
    }
}

//! Convergence state machine
//!
//! One [`ConvergenceStateMachine`] serves both controller entry points:
//! [`reconcile_install`](ConvergenceStateMachine::reconcile_install) drives a
//! live Kyma towards its declared modules and
//! [`reconcile_delete`](ConvergenceStateMachine::reconcile_delete) tears it down
//! once a deletion timestamp is set. Every pass re-derives state from the
//! cluster and ends with a [`Requeue`] decision; nothing is retried internally.
//!
//! The Kyma object is single-writer per pass. Concurrent sub-tasks receive a
//! snapshot and return their results as values, which are merged into the
//! Kyma after all of them completed.

use crate::assembler::ModuleAssembler;
use crate::client::{
    DescriptorProvider, KymaStore, ManifestApplier, RemoteCatalog, RemoteSync, TemplateReader,
    TemplateWriter, WebhookManager,
};
use crate::error::{ClientError, LifecycleError, Result};
use crate::lookup::{fetch_module_info, TemplateResolver};
use crate::maintenance::MaintenanceWindow;
use crate::mandatory::{assemble_mandatory, MandatoryResolver};
use crate::remote::{apply_crd_generations, replace_spec};
use crate::requeue::{Requeue, RequeueIntervals};
use crate::status::{
    delete_no_longer_existing_module_statuses, delete_no_longer_existing_modules,
    update_module_statuses,
};
use crate::sync::SyncRunner;
use kube::ResourceExt;
use lifecycle_types::{
    labels, ConditionStatus, InstallPhase, Kyma, KymaConditionType, ModuleStatus, State,
    NONE_CHANNEL,
};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Static settings of the engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Manifests are installed into the runtime cluster and Kymas are synced there
    pub in_kcp_mode: bool,
    /// Namespace for default custom resources in the runtime cluster
    pub remote_sync_namespace: String,
    pub intervals: RequeueIntervals,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            in_kcp_mode: false,
            remote_sync_namespace: crate::DEFAULT_REMOTE_NAMESPACE.to_string(),
            intervals: RequeueIntervals::default(),
        }
    }
}

/// Collaborators behind the runtime-cluster boundary
#[derive(Clone)]
pub struct RuntimeClients {
    pub remote: Arc<dyn RemoteSync>,
    pub catalog: Arc<dyn RemoteCatalog>,
    /// Watcher webhook, absent when the watcher is disabled
    pub webhook: Option<Arc<dyn WebhookManager>>,
}

/// Per-pass output of manifest reconciliation
struct ModulesOutcome {
    statuses: Vec<ModuleStatus>,
    /// Aggregated apply failure, reported after statuses were merged
    sync_error: Option<LifecycleError>,
}

/// Drives Kymas through their lifecycle
pub struct ConvergenceStateMachine {
    /// Kyma persistence
    kymas: Arc<dyn KymaStore>,
    /// Template listing for mandatory modules and their labels
    templates: Arc<dyn TemplateReader>,
    template_writer: Arc<dyn TemplateWriter>,
    /// Manifest persistence
    manifests: Arc<dyn ManifestApplier>,
    resolver: TemplateResolver,
    mandatory: MandatoryResolver,
    assembler: ModuleAssembler,
    sync: SyncRunner,
    /// Runtime cluster collaborators, only used in KCP mode
    runtime: Option<RuntimeClients>,
    config: EngineConfig,
}

impl ConvergenceStateMachine {
    /// Create a state machine working on the control plane only
    pub fn new(
        kymas: Arc<dyn KymaStore>,
        templates: Arc<dyn TemplateReader>,
        template_writer: Arc<dyn TemplateWriter>,
        manifests: Arc<dyn ManifestApplier>,
        descriptors: Arc<dyn DescriptorProvider>,
        config: EngineConfig,
    ) -> Self {
        let resolver = TemplateResolver::new(templates.clone(), descriptors.clone());
        let mandatory = MandatoryResolver::new(templates.clone());
        let assembler = ModuleAssembler::new(
            descriptors,
            config.remote_sync_namespace.clone(),
            config.in_kcp_mode,
        );
        let sync = SyncRunner::new(manifests.clone());

        Self {
            kymas,
            templates,
            template_writer,
            manifests,
            resolver,
            mandatory,
            assembler,
            sync,
            runtime: None,
            config,
        }
    }

    /// Attach runtime-cluster collaborators
    pub fn with_runtime(mut self, runtime: RuntimeClients) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Gate downtime-requiring updates behind maintenance windows
    pub fn with_maintenance_window(mut self, window: Arc<dyn MaintenanceWindow>) -> Self {
        self.resolver = self.resolver.with_maintenance_window(window);
        self
    }

    pub fn intervals(&self) -> &RequeueIntervals {
        &self.config.intervals
    }

    fn sync_enabled(&self, kyma: &Kyma) -> bool {
        self.config.in_kcp_mode && self.runtime.is_some() && kyma.has_sync_label_enabled()
    }

    fn watcher_enabled(&self, kyma: &Kyma) -> bool {
        self.sync_enabled(kyma) && self.webhook().is_some()
    }

    fn webhook(&self) -> Option<&Arc<dyn WebhookManager>> {
        self.runtime.as_ref().and_then(|r| r.webhook.as_ref())
    }

    fn runtime(&self) -> Result<&RuntimeClients> {
        self.runtime.as_ref().ok_or_else(|| {
            LifecycleError::Internal("runtime cluster clients are not configured".to_string())
        })
    }

    // ------------------------------------------------------------------
    // Install path
    // ------------------------------------------------------------------

    /// Run one installation pass for a Kyma
    #[instrument(skip(self))]
    pub async fn reconcile_install(&self, namespace: &str, name: &str) -> Result<Requeue> {
        // 1. Fetch
        let Some(mut kyma) = self.kymas.get_kyma(namespace, name).await? else {
            debug!("Kyma not found, probably already deleted");
            return Ok(Requeue::Never);
        };
        if kyma.is_deleting() {
            return Ok(Requeue::After(self.config.intervals.success));
        }

        let sync_enabled = self.sync_enabled(&kyma);
        kyma.init_conditions(sync_enabled, self.watcher_enabled(&kyma));

        if kyma.skip_reconciliation() {
            debug!("Skipping reconciliation");
            return Ok(Requeue::After(self.config.intervals.success));
        }

        // 2. Template labels are shared by every Kyma
        if let Err(e) = self.sync_mandatory_labels().await {
            return self.requeue_with_error(&mut kyma, e).await;
        }

        // 3. Runtime cluster access
        if sync_enabled {
            if let Err(e) = self.runtime()?.remote.init(&kyma).await {
                return self.runtime_unavailable(&mut kyma, e).await;
            }
        }

        match self.install(&mut kyma, sync_enabled).await {
            Ok(requeue) => Ok(requeue),
            Err(e) => self.requeue_with_error(&mut kyma, e).await,
        }
    }

    async fn install(&self, kyma: &mut Kyma, sync_enabled: bool) -> Result<Requeue> {
        // 4. Metadata first, the next pass works on the stored object
        if kyma.ensure_labels_and_finalizers() {
            self.kymas.update_kyma(kyma).await.map_err(|e| {
                LifecycleError::from(e).context("failed to update kyma after finalizer check")
            })?;
            return Ok(Requeue::Immediately);
        }

        // 5. Remote CRDs and spec
        if sync_enabled {
            let remote = &self.runtime()?.remote;
            let generations = remote
                .sync_crds(kyma)
                .await
                .map_err(|e| e.context("could not sync CRDs"))?;
            if apply_crd_generations(kyma, generations) {
                self.kymas.update_kyma(kyma).await.map_err(|e| {
                    LifecycleError::from(e).context("could not update kyma annotations")
                })?;
                return Ok(Requeue::Immediately);
            }

            let remote_kyma = remote.synchronize_kyma(kyma).await.map_err(|e| {
                e.context("could not replace control plane kyma spec with remote kyma spec")
            })?;
            replace_spec(kyma, &remote_kyma);
        }
        validate_channel(kyma)?;

        // 6. State dispatch
        let requeue = match kyma.state().install_phase() {
            InstallPhase::Initialize => {
                self.update_status(kyma, State::Processing, "started processing")
                    .await?;
                Requeue::Immediately
            }
            InstallPhase::Converge => self.handle_processing(kyma, sync_enabled).await?,
            InstallPhase::Halt => return Ok(Requeue::Never),
        };

        // 7. Mirror status into the runtime cluster
        if sync_enabled {
            self.runtime()?
                .remote
                .sync_status(kyma)
                .await
                .map_err(|e| e.context("could not synchronize remote kyma status"))?;
        }
        Ok(requeue)
    }

    async fn handle_processing(&self, kyma: &mut Kyma, sync_enabled: bool) -> Result<Requeue> {
        let watcher_enabled = self.watcher_enabled(kyma);
        let snapshot = kyma.clone();

        let (modules, mandatory_error, catalog, webhook) = futures::try_join!(
            self.reconcile_manifests(&snapshot),
            self.reconcile_mandatory_manifests(&snapshot),
            self.sync_catalog(&snapshot, sync_enabled),
            self.install_webhook(&snapshot, watcher_enabled),
        )?;

        // Single merge point for everything the sub-tasks observed
        kyma.status_mut().modules = modules.statuses;
        let modules_ready = if kyma.all_modules_ready() {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        };
        kyma.update_condition(KymaConditionType::Modules, modules_ready);
        if let Some(status) = catalog {
            kyma.update_condition(KymaConditionType::ModuleCatalog, status);
        }
        if let Some(status) = webhook {
            kyma.update_condition(KymaConditionType::SkrWebhook, status);
        }
        if let Some(error) = modules.sync_error {
            return Err(error.context("could not reconcile manifests"));
        }
        if let Some(error) = mandatory_error {
            return Err(error.context("could not reconcile mandatory manifests"));
        }

        let state = kyma.determine_state();
        let interval = self.config.intervals.for_state(state);
        let message = if state == State::Ready {
            if kyma.state() != State::Ready {
                info!("Kyma is ready");
            }
            "kyma is ready"
        } else {
            "waiting for all modules to become ready"
        };
        self.update_status(kyma, state, message).await?;
        Ok(Requeue::After(interval))
    }

    /// Resolve, assemble and apply every module, returning the rebuilt status list
    async fn reconcile_manifests(&self, kyma: &Kyma) -> Result<ModulesOutcome> {
        let modules = fetch_module_info(kyma);
        let templates = self.resolver.resolve_all(kyma, &modules).await;
        let assembled = self.assembler.assemble_all(kyma, &modules, &templates);
        let report = self.sync.reconcile_manifests(kyma, assembled).await;

        let mut observed = kyma.clone();
        update_module_statuses(&mut observed, &report.modules);
        delete_no_longer_existing_module_statuses(&mut observed, self.manifests.as_ref()).await;
        delete_no_longer_existing_modules(&observed, self.manifests.as_ref())
            .await
            .map_err(|e| {
                e.context("error while syncing conditions during deleting non exists modules")
            })?;

        Ok(ModulesOutcome {
            statuses: observed.status().modules,
            sync_error: report.result().err(),
        })
    }

    /// Install every mandatory module, returning the aggregated apply failure
    async fn reconcile_mandatory_manifests(&self, kyma: &Kyma) -> Result<Option<LifecycleError>> {
        let resolved = self.mandatory.resolve_all(kyma).await?;
        if resolved.is_empty() {
            return Ok(None);
        }

        let assembled = assemble_mandatory(&self.assembler, kyma, resolved);
        for module in &assembled {
            if let Some(error) = &module.template.error {
                warn!(module = %module.module_name, error = %error, "Mandatory module not installable");
            }
        }
        let report = self.sync.reconcile_manifests(kyma, assembled).await;
        Ok(report.result().err())
    }

    async fn sync_catalog(&self, kyma: &Kyma, enabled: bool) -> Result<Option<ConditionStatus>> {
        if !enabled {
            return Ok(None);
        }
        self.runtime()?
            .catalog
            .sync(kyma)
            .await
            .map_err(|e| e.context("failed to synchronize remote module catalog"))?;
        Ok(Some(ConditionStatus::True))
    }

    async fn install_webhook(&self, kyma: &Kyma, enabled: bool) -> Result<Option<ConditionStatus>> {
        let Some(webhook) = self.webhook().filter(|_| enabled) else {
            return Ok(None);
        };
        match webhook.install(kyma).await {
            Ok(()) => Ok(Some(ConditionStatus::True)),
            Err(e) if matches!(e.root(), LifecycleError::CertificateNotReady(_)) => {
                debug!(error = %e, "Watcher certificate not ready yet");
                Ok(Some(ConditionStatus::False))
            }
            Err(e) => Err(e),
        }
    }

    async fn sync_mandatory_labels(&self) -> Result<()> {
        let templates = self
            .templates
            .list_templates()
            .await
            .map_err(|e| LifecycleError::from(e).context("failed to list module templates"))?;

        for mut template in templates {
            if !template.sync_mandatory_label() {
                continue;
            }
            let name = template.name_any();
            self.template_writer
                .update_template(&template)
                .await
                .map_err(|e| {
                    LifecycleError::from(e).context(format!("failed to update module template {name}"))
                })?;
            debug!(template = %name, "Synced mandatory module label");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Delete path
    // ------------------------------------------------------------------

    /// Run one deletion pass for a Kyma
    #[instrument(skip(self))]
    pub async fn reconcile_delete(&self, namespace: &str, name: &str) -> Result<Requeue> {
        let Some(mut kyma) = self.kymas.get_kyma(namespace, name).await? else {
            // Nothing left but the certificate issued for it
            if let Some(webhook) = self.webhook() {
                webhook.remove_certificate(namespace, name).await?;
            }
            return Ok(Requeue::Never);
        };
        if !kyma.is_deleting() {
            return Ok(Requeue::After(self.config.intervals.success));
        }

        let sync_enabled = self.sync_enabled(&kyma);
        kyma.init_conditions(sync_enabled, self.watcher_enabled(&kyma));

        if sync_enabled {
            if let Err(e) = self.runtime()?.remote.init(&kyma).await {
                if matches!(e.root(), LifecycleError::AccessSecretNotFound(_)) {
                    return self.handle_deleted_runtime(&mut kyma).await;
                }
                return self.runtime_unavailable(&mut kyma, e).await;
            }
        }

        if kyma.state() != State::Deleting {
            if sync_enabled {
                if let Err(e) = self.runtime()?.remote.delete_remote_kyma(&kyma).await {
                    if !e.is_not_found() {
                        let e = e.context("error occurred while trying to delete remotely synced kyma");
                        return self.requeue_with_error(&mut kyma, e).await;
                    }
                }
                info!("Deleted remotely synced Kyma");
            }
            if let Err(e) = self
                .update_status(&mut kyma, State::Deleting, "waiting for modules to be deleted")
                .await
            {
                let e = e.context("could not update kyma status after triggering deletion");
                return self.requeue_with_error(&mut kyma, e).await;
            }
            return Ok(Requeue::Immediately);
        }

        self.handle_deleting(&mut kyma, sync_enabled).await
    }

    async fn handle_deleting(&self, kyma: &mut Kyma, sync_enabled: bool) -> Result<Requeue> {
        if sync_enabled {
            let runtime = self.runtime()?;
            if let Some(webhook) = self.webhook() {
                webhook.remove(kyma).await?;
            }
            if let Err(e) = runtime.catalog.delete(kyma).await {
                let e = e.context("failed to delete remote module catalog");
                return self.requeue_with_error(kyma, e).await;
            }

            runtime.remote.invalidate(kyma).await;
            if let Err(e) = runtime.remote.remove_remote_finalizers(kyma).await {
                if !e.is_not_found() {
                    return self.requeue_with_error(kyma, e).await;
                }
            }
            info!("Removed remote finalizers");
        }

        self.cleanup_manifests(kyma).await?;

        kyma.remove_finalizer(labels::KYMA_FINALIZER);
        self.kymas.update_kyma(kyma).await.map_err(|e| {
            LifecycleError::from(e).context("error while updating kyma during deletion")
        })?;
        Ok(Requeue::Immediately)
    }

    /// Delete every manifest of the Kyma; done only once none is left
    async fn cleanup_manifests(&self, kyma: &Kyma) -> Result<()> {
        let namespace = kyma.namespace().unwrap_or_default();
        let related = self
            .manifests
            .list_manifests_for_kyma(&namespace, &kyma.name_any())
            .await
            .map_err(|e| LifecycleError::from(e).context("error while trying to get manifests"))?;
        if related.is_empty() {
            return Ok(());
        }

        for manifest in &related {
            match self
                .manifests
                .delete_manifest(&namespace, &manifest.name_any())
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    return Err(LifecycleError::from(e)
                        .context("error while trying to delete manifest"))
                }
            }
        }
        debug!(manifests = related.len(), "Waiting for manifests to be deleted");
        Err(LifecycleError::ManifestsStillExist)
    }

    async fn handle_deleted_runtime(&self, kyma: &mut Kyma) -> Result<Requeue> {
        info!("Access secret not found, assuming runtime cluster is already deleted");
        kyma.finalizers_mut().clear();
        self.kymas.update_kyma(kyma).await.map_err(|e| {
            LifecycleError::from(e).context("error while updating kyma during deletion")
        })?;
        Ok(Requeue::Immediately)
    }

    // ------------------------------------------------------------------
    // Status writes
    // ------------------------------------------------------------------

    async fn runtime_unavailable(&self, kyma: &mut Kyma, error: LifecycleError) -> Result<Requeue> {
        if let Some(runtime) = self.runtime.as_ref() {
            runtime.remote.invalidate(kyma).await;
        }
        if matches!(error.root(), LifecycleError::Client(ClientError::Unauthorized(_))) {
            info!("Connection refused, resetting cached runtime cluster client");
        } else {
            kyma.set_module_statuses_to_error(&error.to_string());
        }
        self.requeue_with_error(kyma, error).await
    }

    async fn update_status(&self, kyma: &mut Kyma, state: State, message: &str) -> Result<()> {
        kyma.set_state(state, message)?;
        self.kymas.update_kyma_status(kyma).await.map_err(|e| {
            LifecycleError::from(e).context(format!(
                "error while updating status to {} because of {message}",
                state.as_str()
            ))
        })?;
        Ok(())
    }

    /// Record the error on the Kyma and ask for an immediate retry
    async fn requeue_with_error(&self, kyma: &mut Kyma, error: LifecycleError) -> Result<Requeue> {
        warn!(error = %error, "Reconciliation pass failed");
        kyma.set_state(State::Error, error.to_string())?;
        self.kymas.update_kyma_status(kyma).await.map_err(|e| {
            LifecycleError::from(e).context("error while updating status to Error")
        })?;
        Ok(Requeue::Immediately)
    }
}

fn validate_channel(kyma: &Kyma) -> Result<()> {
    if kyma.spec.channel == NONE_CHANNEL {
        return Err(LifecycleError::InvalidKymaSpec(
            "value \"none\" is not allowed in spec.channel".to_string(),
        ));
    }
    Ok(())
}

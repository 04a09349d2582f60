//! In-memory collaborators
//!
//! [`InMemoryCluster`] stands in for the control-plane API server and
//! [`InMemoryRemote`] for everything behind the runtime-cluster boundary. Both
//! are thread-safe and count the writes they receive, which is what the
//! convergence tests assert on.

use crate::client::{
    CrdGenerations, KymaStore, ManifestApplier, RemoteCatalog, RemoteSync, TemplateReader,
    TemplateWriter, WebhookManager,
};
use crate::error::{ClientError, ClientResult, LifecycleError, Result};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use kube::ResourceExt;
use lifecycle_types::{
    labels, template_name, ChannelVersionAssignment, Kyma, Mandatory, Manifest, ManifestStatus,
    ModuleReleaseMeta, ModuleReleaseMetaSpec, ModuleTemplate, ModuleTemplateSpec, State,
};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn object_key<K: ResourceExt>(object: &K) -> Key {
    (object.namespace().unwrap_or_default(), object.name_any())
}

/// In-memory control-plane cluster
pub struct InMemoryCluster {
    templates: DashMap<Key, ModuleTemplate>,
    release_metas: DashMap<Key, ModuleReleaseMeta>,
    manifests: DashMap<Key, Manifest>,
    kymas: DashMap<Key, Kyma>,
    failing_applies: DashSet<String>,
    failing_template_list: AtomicBool,
    applies: AtomicUsize,
    template_updates: AtomicUsize,
    next_uid: AtomicI64,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self {
            templates: DashMap::new(),
            release_metas: DashMap::new(),
            manifests: DashMap::new(),
            kymas: DashMap::new(),
            failing_applies: DashSet::new(),
            failing_template_list: AtomicBool::new(false),
            applies: AtomicUsize::new(0),
            template_updates: AtomicUsize::new(0),
            next_uid: AtomicI64::new(1),
        }
    }

    fn uid(&self) -> String {
        format!("uid-{}", self.next_uid.fetch_add(1, Ordering::Relaxed))
    }

    /// Publish channel versions of a module, replacing its release metadata
    pub fn publish_module(&self, namespace: &str, module: &str, channels: &[(&str, &str)]) {
        let mut meta = ModuleReleaseMeta::new(
            module,
            ModuleReleaseMetaSpec {
                module_name: module.to_string(),
                channels: channels
                    .iter()
                    .map(|(channel, version)| ChannelVersionAssignment {
                        channel: channel.to_string(),
                        version: version.to_string(),
                    })
                    .collect(),
                ..Default::default()
            },
        );
        meta.metadata.namespace = Some(namespace.to_string());
        self.release_metas.insert(key(namespace, module), meta);

        for (_, version) in channels {
            self.insert_template(namespace, module, version, false);
        }
    }

    /// Publish a module that is installed on every Kyma
    pub fn publish_mandatory_module(&self, namespace: &str, module: &str, version: &str) {
        let mut meta = ModuleReleaseMeta::new(
            module,
            ModuleReleaseMetaSpec {
                module_name: module.to_string(),
                mandatory: Some(Mandatory {
                    version: version.to_string(),
                }),
                ..Default::default()
            },
        );
        meta.metadata.namespace = Some(namespace.to_string());
        self.release_metas.insert(key(namespace, module), meta);
        self.insert_template(namespace, module, version, true);
    }

    /// Publish a mandatory template without release metadata
    pub fn publish_mandatory_template(&self, namespace: &str, module: &str, version: &str) {
        self.insert_template(namespace, module, version, true);
    }

    fn insert_template(&self, namespace: &str, module: &str, version: &str, mandatory: bool) {
        let name = template_name(module, version);
        if self.templates.contains_key(&key(namespace, &name)) {
            return;
        }
        let mut template = ModuleTemplate::new(
            &name,
            ModuleTemplateSpec {
                module_name: module.to_string(),
                version: version.to_string(),
                mandatory,
                descriptor: json!({"component": {
                    "name": format!("kyma-project.io/module/{module}"),
                    "version": version,
                    "repositoryContexts": [
                        {"baseUrl": "registry.example", "componentNameMapping": "urlPath"}
                    ],
                    "resources": [{
                        "name": "raw-manifest",
                        "access": {"type": "localBlob", "localReference": format!("sha256:{module}-{version}"), "mediaType": "application/x-tar"}
                    }]
                }}),
                ..Default::default()
            },
        );
        template.metadata.namespace = Some(namespace.to_string());
        template.metadata.generation = Some(1);
        template.metadata.uid = Some(self.uid());
        self.templates.insert(key(namespace, &name), template);
    }

    /// Set a label on a published template
    pub fn update_template_labels(&self, namespace: &str, name: &str, label: &str, value: &str) {
        if let Some(mut template) = self.templates.get_mut(&key(namespace, name)) {
            template
                .labels_mut()
                .insert(label.to_string(), value.to_string());
        }
    }

    /// Mark a template as requiring downtime for upgrades
    pub fn set_requires_downtime(&self, namespace: &str, name: &str) {
        if let Some(mut template) = self.templates.get_mut(&key(namespace, name)) {
            template.spec.requires_downtime = true;
            template.metadata.generation = Some(template.generation() + 1);
        }
    }

    pub fn template(&self, namespace: &str, name: &str) -> Option<ModuleTemplate> {
        self.templates.get(&key(namespace, name)).map(|t| t.clone())
    }

    /// Store a Kyma as the API server would after a create
    pub fn insert_kyma(&self, mut kyma: Kyma) {
        if kyma.metadata.uid.is_none() {
            kyma.metadata.uid = Some(self.uid());
        }
        kyma.metadata.generation.get_or_insert(1);
        self.kymas.insert(object_key(&kyma), kyma);
    }

    pub fn kyma(&self, namespace: &str, name: &str) -> Option<Kyma> {
        self.kymas.get(&key(namespace, name)).map(|k| k.clone())
    }

    /// Edit the spec of a stored Kyma, bumping its generation
    pub fn edit_kyma<F: FnOnce(&mut Kyma)>(&self, namespace: &str, name: &str, edit: F) {
        if let Some(mut kyma) = self.kymas.get_mut(&key(namespace, name)) {
            edit(&mut kyma);
            kyma.metadata.generation = Some(kyma.metadata.generation.unwrap_or_default() + 1);
        }
    }

    /// Mark a Kyma for deletion, as a delete call against a finalized object does
    pub fn mark_kyma_deleted(&self, namespace: &str, name: &str) {
        if let Some(mut kyma) = self.kymas.get_mut(&key(namespace, name)) {
            kyma.metadata.deletion_timestamp = Some(
                k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()),
            );
        }
    }

    /// Store a manifest directly, bypassing apply
    pub fn insert_manifest(&self, manifest: Manifest) {
        self.manifests.insert(object_key(&manifest), manifest);
    }

    /// Report a state for a manifest, as the manifest controller would
    pub fn set_manifest_state(&self, namespace: &str, name: &str, state: State) {
        if let Some(mut manifest) = self.manifests.get_mut(&key(namespace, name)) {
            manifest.status = Some(ManifestStatus { state });
        }
    }

    /// Report a state for every manifest of a module
    pub fn set_module_state(&self, module: &str, state: State) {
        for mut manifest in self.manifests.iter_mut() {
            if manifest.labels().get(labels::MODULE_NAME).map(String::as_str) == Some(module) {
                manifest.status = Some(ManifestStatus { state });
            }
        }
    }

    pub fn manifests(&self) -> Vec<Manifest> {
        let mut manifests: Vec<Manifest> = self.manifests.iter().map(|m| m.clone()).collect();
        manifests.sort_by_key(|m| m.name_any());
        manifests
    }

    /// Make every apply of the named manifest fail
    pub fn fail_apply_for(&self, manifest_name: &str) {
        self.failing_applies.insert(manifest_name.to_string());
    }

    pub fn heal_apply_for(&self, manifest_name: &str) {
        self.failing_applies.remove(manifest_name);
    }

    pub fn fail_template_listing(&self, fail: bool) {
        self.failing_template_list.store(fail, Ordering::SeqCst);
    }

    pub fn apply_count(&self) -> usize {
        self.applies.load(Ordering::SeqCst)
    }

    pub fn template_update_count(&self) -> usize {
        self.template_updates.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TemplateReader for InMemoryCluster {
    async fn get_template(&self, namespace: &str, name: &str) -> ClientResult<Option<ModuleTemplate>> {
        Ok(self.template(namespace, name))
    }

    async fn get_release_meta(
        &self,
        namespace: &str,
        module: &str,
    ) -> ClientResult<Option<ModuleReleaseMeta>> {
        Ok(self.release_metas.get(&key(namespace, module)).map(|m| m.clone()))
    }

    async fn list_templates(&self) -> ClientResult<Vec<ModuleTemplate>> {
        if self.failing_template_list.load(Ordering::SeqCst) {
            return Err(ClientError::Api("etcdserver: request timed out".to_string()));
        }
        Ok(self.templates.iter().map(|t| t.clone()).collect())
    }
}

#[async_trait]
impl TemplateWriter for InMemoryCluster {
    async fn update_template(&self, template: &ModuleTemplate) -> ClientResult<()> {
        let mut stored = self
            .templates
            .get_mut(&object_key(template))
            .ok_or_else(|| ClientError::NotFound(template.name_any()))?;
        stored.metadata.labels = template.metadata.labels.clone();
        self.template_updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl ManifestApplier for InMemoryCluster {
    async fn get_manifest(&self, namespace: &str, name: &str) -> ClientResult<Option<Manifest>> {
        Ok(self.manifests.get(&key(namespace, name)).map(|m| m.clone()))
    }

    async fn apply_manifest(&self, manifest: &Manifest, field_owner: &str) -> ClientResult<Manifest> {
        let name = manifest.name_any();
        if self.failing_applies.contains(&name) {
            return Err(ClientError::Api(format!(
                "admission webhook denied {name} for {field_owner}"
            )));
        }
        self.applies.fetch_add(1, Ordering::SeqCst);

        let mut entry = self.manifests.entry(object_key(manifest)).or_insert_with(|| {
            let mut created = manifest.clone();
            created.metadata.uid = Some(self.uid());
            created.metadata.generation = Some(0);
            created.status = None;
            created
        });
        let stored = entry.value_mut();
        if stored.spec != manifest.spec || stored.generation() == 0 {
            stored.metadata.generation = Some(stored.generation() + 1);
        }
        stored.spec = manifest.spec.clone();
        stored.labels_mut().extend(manifest.labels().clone());
        stored.annotations_mut().extend(manifest.annotations().clone());
        if !manifest.is_unmanaged() {
            stored.annotations_mut().remove(labels::UNMANAGED);
        }
        stored.metadata.owner_references = manifest.metadata.owner_references.clone();
        Ok(stored.clone())
    }

    async fn update_manifest(&self, manifest: &Manifest) -> ClientResult<Manifest> {
        let mut stored = self
            .manifests
            .get_mut(&object_key(manifest))
            .ok_or_else(|| ClientError::NotFound(manifest.name_any()))?;
        if stored.spec != manifest.spec {
            stored.metadata.generation = Some(stored.generation() + 1);
        }
        stored.spec = manifest.spec.clone();
        stored.metadata.labels = manifest.metadata.labels.clone();
        stored.metadata.annotations = manifest.metadata.annotations.clone();
        Ok(stored.clone())
    }

    async fn delete_manifest(&self, namespace: &str, name: &str) -> ClientResult<()> {
        self.manifests
            .remove(&key(namespace, name))
            .map(|_| ())
            .ok_or_else(|| ClientError::NotFound(format!("{namespace}/{name}")))
    }

    async fn list_manifests_for_kyma(
        &self,
        namespace: &str,
        kyma_name: &str,
    ) -> ClientResult<Vec<Manifest>> {
        Ok(self
            .manifests()
            .into_iter()
            .filter(|m| m.namespace().as_deref() == Some(namespace))
            .filter(|m| m.labels().get(labels::KYMA_NAME).map(String::as_str) == Some(kyma_name))
            .collect())
    }
}

#[async_trait]
impl KymaStore for InMemoryCluster {
    async fn get_kyma(&self, namespace: &str, name: &str) -> ClientResult<Option<Kyma>> {
        Ok(self.kyma(namespace, name))
    }

    async fn update_kyma(&self, kyma: &Kyma) -> ClientResult<Kyma> {
        let key = object_key(kyma);
        let mut stored = self
            .kymas
            .get_mut(&key)
            .ok_or_else(|| ClientError::NotFound(kyma.name_any()))?;

        if stored.spec != kyma.spec {
            stored.metadata.generation = Some(stored.metadata.generation.unwrap_or_default() + 1);
        }
        stored.spec = kyma.spec.clone();
        stored.metadata.labels = kyma.metadata.labels.clone();
        stored.metadata.annotations = kyma.metadata.annotations.clone();
        stored.metadata.finalizers = kyma.metadata.finalizers.clone();
        let updated = stored.clone();
        drop(stored);

        // A deleted object goes away with its last finalizer
        if updated.is_deleting() && updated.finalizers().is_empty() {
            self.kymas.remove(&key);
        }
        Ok(updated)
    }

    async fn update_kyma_status(&self, kyma: &Kyma) -> ClientResult<Kyma> {
        let mut stored = self
            .kymas
            .get_mut(&object_key(kyma))
            .ok_or_else(|| ClientError::NotFound(kyma.name_any()))?;
        stored.status = kyma.status.clone();
        Ok(stored.clone())
    }
}

/// In-memory runtime cluster: remote Kyma copy, catalog and watcher webhook
pub struct InMemoryRemote {
    kymas: DashMap<String, Kyma>,
    injected: DashMap<&'static str, LifecycleError>,
    certificate_ready: AtomicBool,
    kcp_crd_generation: AtomicI64,
    skr_crd_generation: AtomicI64,
    inits: AtomicUsize,
    invalidations: AtomicUsize,
    catalog_syncs: AtomicUsize,
    catalog_deletes: AtomicUsize,
    webhook_installs: AtomicUsize,
    webhook_removals: AtomicUsize,
    certificate_removals: AtomicUsize,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self {
            kymas: DashMap::new(),
            injected: DashMap::new(),
            certificate_ready: AtomicBool::new(true),
            kcp_crd_generation: AtomicI64::new(1),
            skr_crd_generation: AtomicI64::new(1),
            inits: AtomicUsize::new(0),
            invalidations: AtomicUsize::new(0),
            catalog_syncs: AtomicUsize::new(0),
            catalog_deletes: AtomicUsize::new(0),
            webhook_installs: AtomicUsize::new(0),
            webhook_removals: AtomicUsize::new(0),
            certificate_removals: AtomicUsize::new(0),
        }
    }

    fn injected(&self, operation: &'static str) -> Result<()> {
        match self.injected.get(operation) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    /// Make `init` fail until cleared
    pub fn fail_init(&self, error: LifecycleError) {
        self.injected.insert("init", error);
    }

    pub fn fail_catalog_sync(&self, error: LifecycleError) {
        self.injected.insert("catalog_sync", error);
    }

    pub fn clear_failures(&self) {
        self.injected.clear();
    }

    pub fn set_certificate_ready(&self, ready: bool) {
        self.certificate_ready.store(ready, Ordering::SeqCst);
    }

    pub fn set_crd_generations(&self, generations: CrdGenerations) {
        self.kcp_crd_generation.store(generations.kcp, Ordering::SeqCst);
        self.skr_crd_generation.store(generations.skr, Ordering::SeqCst);
    }

    /// Remote copy of a Kyma, as the runtime-cluster user sees it
    pub fn remote_kyma(&self, name: &str) -> Option<Kyma> {
        self.kymas.get(name).map(|k| k.clone())
    }

    /// Edit the remote copy, as a runtime-cluster user would
    pub fn edit_remote_kyma<F: FnOnce(&mut Kyma)>(&self, name: &str, edit: F) {
        if let Some(mut kyma) = self.kymas.get_mut(name) {
            edit(&mut kyma);
        }
    }

    pub fn init_count(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }

    pub fn invalidation_count(&self) -> usize {
        self.invalidations.load(Ordering::SeqCst)
    }

    pub fn catalog_sync_count(&self) -> usize {
        self.catalog_syncs.load(Ordering::SeqCst)
    }

    pub fn catalog_delete_count(&self) -> usize {
        self.catalog_deletes.load(Ordering::SeqCst)
    }

    pub fn webhook_install_count(&self) -> usize {
        self.webhook_installs.load(Ordering::SeqCst)
    }

    pub fn webhook_removal_count(&self) -> usize {
        self.webhook_removals.load(Ordering::SeqCst)
    }

    pub fn certificate_removal_count(&self) -> usize {
        self.certificate_removals.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteSync for InMemoryRemote {
    async fn init(&self, _kyma: &Kyma) -> Result<()> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        self.injected("init")
    }

    async fn invalidate(&self, _kyma: &Kyma) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }

    async fn sync_crds(&self, _kyma: &Kyma) -> Result<CrdGenerations> {
        Ok(CrdGenerations {
            kcp: self.kcp_crd_generation.load(Ordering::SeqCst),
            skr: self.skr_crd_generation.load(Ordering::SeqCst),
        })
    }

    async fn synchronize_kyma(&self, kyma: &Kyma) -> Result<Kyma> {
        let remote = self.kymas.entry(kyma.name_any()).or_insert_with(|| {
            let mut created = Kyma::new(&kyma.name_any(), kyma.spec.clone());
            created.metadata.namespace = Some(crate::DEFAULT_REMOTE_NAMESPACE.to_string());
            created
                .finalizers_mut()
                .push(labels::KYMA_FINALIZER.to_string());
            created
        });
        Ok(remote.clone())
    }

    async fn sync_status(&self, kyma: &Kyma) -> Result<()> {
        if let Some(mut remote) = self.kymas.get_mut(&kyma.name_any()) {
            remote.status = kyma.status.clone();
        }
        Ok(())
    }

    async fn delete_remote_kyma(&self, kyma: &Kyma) -> Result<()> {
        if let Some(mut remote) = self.kymas.get_mut(&kyma.name_any()) {
            remote.metadata.deletion_timestamp = Some(
                k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()),
            );
        }
        Ok(())
    }

    async fn remove_remote_finalizers(&self, kyma: &Kyma) -> Result<()> {
        let name = kyma.name_any();
        let gone = match self.kymas.get_mut(&name) {
            Some(mut remote) => {
                remote.remove_finalizer(labels::KYMA_FINALIZER);
                remote.is_deleting()
            }
            None => false,
        };
        if gone {
            self.kymas.remove(&name);
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteCatalog for InMemoryRemote {
    async fn sync(&self, _kyma: &Kyma) -> Result<()> {
        self.catalog_syncs.fetch_add(1, Ordering::SeqCst);
        self.injected("catalog_sync")
    }

    async fn delete(&self, _kyma: &Kyma) -> Result<()> {
        self.catalog_deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl WebhookManager for InMemoryRemote {
    async fn install(&self, kyma: &Kyma) -> Result<()> {
        self.webhook_installs.fetch_add(1, Ordering::SeqCst);
        if !self.certificate_ready.load(Ordering::SeqCst) {
            return Err(LifecycleError::CertificateNotReady(kyma.name_any()));
        }
        Ok(())
    }

    async fn remove(&self, _kyma: &Kyma) -> Result<()> {
        self.webhook_removals.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove_certificate(&self, _namespace: &str, _kyma_name: &str) -> Result<()> {
        self.certificate_removals.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lifecycle_types::{KymaSpec, ManifestSpec};

    fn manifest(version: &str) -> Manifest {
        let mut manifest = Manifest::new(
            "k1-m1",
            ManifestSpec {
                version: version.to_string(),
                ..Default::default()
            },
        );
        manifest.metadata.namespace = Some("kcp-system".to_string());
        manifest
            .labels_mut()
            .insert(labels::KYMA_NAME.to_string(), "k1".to_string());
        manifest
    }

    #[tokio::test]
    async fn test_apply_bumps_generation_on_spec_change_only() {
        let cluster = InMemoryCluster::new();

        let first = cluster.apply_manifest(&manifest("1.0.0"), "owner").await.unwrap();
        assert_eq!(first.generation(), 1);
        cluster.set_manifest_state("kcp-system", "k1-m1", State::Ready);

        let same = cluster.apply_manifest(&manifest("1.0.0"), "owner").await.unwrap();
        assert_eq!(same.generation(), 1);
        assert_eq!(same.state(), State::Ready);

        let changed = cluster.apply_manifest(&manifest("2.0.0"), "owner").await.unwrap();
        assert_eq!(changed.generation(), 2);
        assert_eq!(cluster.apply_count(), 3);
    }

    #[tokio::test]
    async fn test_delete_missing_manifest_is_not_found() {
        let cluster = InMemoryCluster::new();
        let err = cluster.delete_manifest("kcp-system", "nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_list_manifests_for_kyma() {
        let cluster = InMemoryCluster::new();
        cluster.insert_manifest(manifest("1.0.0"));
        let mut foreign = manifest("1.0.0");
        foreign.metadata.name = Some("k2-m1".to_string());
        foreign
            .labels_mut()
            .insert(labels::KYMA_NAME.to_string(), "k2".to_string());
        cluster.insert_manifest(foreign);

        let owned = cluster.list_manifests_for_kyma("kcp-system", "k1").await.unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].name_any(), "k1-m1");
    }

    #[tokio::test]
    async fn test_kyma_removed_with_last_finalizer() {
        let cluster = InMemoryCluster::new();
        let mut kyma = Kyma::new("k1", KymaSpec::default());
        kyma.metadata.namespace = Some("kcp-system".to_string());
        kyma.finalizers_mut().push(labels::KYMA_FINALIZER.to_string());
        cluster.insert_kyma(kyma);
        cluster.mark_kyma_deleted("kcp-system", "k1");

        let mut stored = cluster.kyma("kcp-system", "k1").unwrap();
        stored.remove_finalizer(labels::KYMA_FINALIZER);
        cluster.update_kyma(&stored).await.unwrap();
        assert!(cluster.kyma("kcp-system", "k1").is_none());
    }

    #[tokio::test]
    async fn test_remote_kyma_created_once() {
        let remote = InMemoryRemote::new();
        let mut kyma = Kyma::new("k1", KymaSpec::default());
        kyma.metadata.namespace = Some("kcp-system".to_string());

        remote.synchronize_kyma(&kyma).await.unwrap();
        remote.edit_remote_kyma("k1", |k| k.spec.channel = "fast".to_string());
        let synced = remote.synchronize_kyma(&kyma).await.unwrap();
        assert_eq!(synced.spec.channel, "fast");
    }
}

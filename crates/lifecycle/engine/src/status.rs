//! Module status reconstruction
//!
//! Status entries are rebuilt from what the sync runner observed, never from
//! what it intended to write. Entries of modules that are no longer declared
//! stay until their manifest is confirmed gone.

use crate::assembler::AssembledModule;
use crate::client::ManifestApplier;
use crate::error::{LifecycleError, Result};
use crate::sync::observed_state;
use kube::{Resource, ResourceExt};
use lifecycle_types::{Kyma, Manifest, ModuleStatus, ModuleTemplate, State, TrackingObject, API_VERSION};
use serde_json::Value;
use tracing::{debug, instrument, warn};

/// Status entry for one module after a sync round
pub fn generate_module_status(module: &AssembledModule, existing: Option<&ModuleStatus>) -> Option<ModuleStatus> {
    if let Some(error) = &module.template.error {
        return Some(status_from_error(module, error, existing));
    }

    let (Some(manifest), Some(template)) = (&module.manifest, &module.template.template) else {
        return existing.cloned();
    };

    if module.unmanaged {
        return Some(ModuleStatus {
            name: module.module_name.clone(),
            fqdn: module.fqdn.clone(),
            channel: module.template.desired_channel.clone(),
            version: manifest.spec.version.clone(),
            state: State::Unmanaged,
            ..Default::default()
        });
    }

    Some(ModuleStatus {
        name: module.module_name.clone(),
        fqdn: module.fqdn.clone(),
        channel: module.template.desired_channel.clone(),
        version: manifest.spec.version.clone(),
        state: observed_state(manifest),
        message: String::new(),
        manifest: Some(manifest_tracking(manifest)),
        template: Some(template_tracking(template)),
        resource: manifest.spec.resource.as_ref().and_then(resource_tracking),
    })
}

fn status_from_error(
    module: &AssembledModule,
    error: &LifecycleError,
    existing: Option<&ModuleStatus>,
) -> ModuleStatus {
    let fresh = |state: State| ModuleStatus {
        name: module.module_name.clone(),
        fqdn: module.fqdn.clone(),
        channel: module.template.desired_channel.clone(),
        state,
        message: error.to_string(),
        ..Default::default()
    };
    let carried = || {
        existing.cloned().unwrap_or_else(|| ModuleStatus {
            name: module.module_name.clone(),
            ..Default::default()
        })
    };

    match error.root() {
        LifecycleError::TemplateUpdateNotAllowed(_) => ModuleStatus {
            state: State::Error,
            message: error.to_string(),
            ..carried()
        },
        LifecycleError::NoTemplatesInListResult(_) => fresh(State::Warning),
        LifecycleError::WaitingForNextMaintenanceWindow => ModuleStatus {
            message: error.to_string(),
            ..carried()
        },
        LifecycleError::MaintenanceWindowUnknown(_) => ModuleStatus {
            state: State::Error,
            message: error.to_string(),
            ..carried()
        },
        _ => fresh(State::Error),
    }
}

fn manifest_tracking(manifest: &Manifest) -> TrackingObject {
    TrackingObject::new(
        Manifest::kind(&()),
        API_VERSION,
        manifest.name_any(),
        manifest.namespace().unwrap_or_default(),
        manifest.generation(),
    )
}

fn template_tracking(template: &ModuleTemplate) -> TrackingObject {
    TrackingObject::new(
        ModuleTemplate::kind(&()),
        API_VERSION,
        template.name_any(),
        template.namespace().unwrap_or_default(),
        template.generation(),
    )
}

fn resource_tracking(resource: &Value) -> Option<TrackingObject> {
    let text = |v: Option<&Value>| v.and_then(Value::as_str).unwrap_or_default().to_string();
    let metadata = resource.get("metadata")?;
    Some(TrackingObject::new(
        text(resource.get("kind")),
        text(resource.get("apiVersion")),
        text(metadata.get("name")),
        text(metadata.get("namespace")),
        metadata.get("generation").and_then(Value::as_i64).unwrap_or_default(),
    ))
}

/// Upsert status entries by module name, keeping the existing order
pub fn update_module_statuses(kyma: &mut Kyma, modules: &[AssembledModule]) {
    for module in modules {
        let existing = kyma.module_status(&module.module_name).cloned();
        let Some(latest) = generate_module_status(module, existing.as_ref()) else {
            continue;
        };
        let statuses = &mut kyma.status_mut().modules;
        match statuses.iter_mut().find(|s| s.name == latest.name) {
            Some(entry) => *entry = latest,
            None => statuses.push(latest),
        }
    }
}

/// Drop entries of undeclared modules whose manifest is gone, refresh the rest
#[instrument(skip(kyma, manifests), fields(kyma = %kyma.name_any()))]
pub async fn delete_no_longer_existing_module_statuses(kyma: &mut Kyma, manifests: &dyn ManifestApplier) {
    let undeclared: Vec<ModuleStatus> = kyma
        .no_longer_declared_module_statuses()
        .into_iter()
        .cloned()
        .collect();

    let mut dropped = Vec::new();
    let mut refreshed = Vec::new();
    for status in undeclared {
        let Some(tracked) = &status.manifest else {
            dropped.push(status.name.clone());
            continue;
        };
        match manifests
            .get_manifest(tracked.namespace(), tracked.name())
            .await
        {
            Ok(None) => dropped.push(status.name.clone()),
            Ok(Some(manifest)) => refreshed.push((status.name.clone(), observed_state(&manifest))),
            Err(e) => {
                warn!(module = %status.name, error = %e, "Could not probe manifest of removed module");
            }
        }
    }

    let statuses = &mut kyma.status_mut().modules;
    for (name, state) in refreshed {
        if let Some(entry) = statuses.iter_mut().find(|s| s.name == name) {
            entry.state = state;
        }
    }
    if !dropped.is_empty() {
        debug!(modules = ?dropped, "Dropping status of removed modules");
        statuses.retain(|s| !dropped.contains(&s.name));
    }
}

/// Delete manifests still tracked by status entries of undeclared modules
#[instrument(skip(kyma, manifests), fields(kyma = %kyma.name_any()))]
pub async fn delete_no_longer_existing_modules(kyma: &Kyma, manifests: &dyn ManifestApplier) -> Result<()> {
    for status in kyma.no_longer_declared_module_statuses() {
        let Some(tracked) = &status.manifest else {
            continue;
        };
        match manifests
            .delete_manifest(tracked.namespace(), tracked.name())
            .await
        {
            Ok(()) => debug!(module = %status.name, manifest = %tracked.name(), "Deleted manifest of removed module"),
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                return Err(LifecycleError::from(e)
                    .context(format!("error deleting module {}", status.name)))
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::TemplateInfo;
    use crate::memory::InMemoryCluster;
    use lifecycle_types::{KymaSpec, ManifestSpec, ManifestStatus, Module, ModuleTemplateSpec};
    use serde_json::json;

    fn template() -> ModuleTemplate {
        let mut template = ModuleTemplate::new("m1-2.0.0", ModuleTemplateSpec::default());
        template.metadata.namespace = Some("kcp-system".to_string());
        template.metadata.generation = Some(3);
        template
    }

    fn manifest(state: Option<State>) -> Manifest {
        let mut manifest = Manifest::new(
            "k1-m1",
            ManifestSpec {
                version: "2.0.0".to_string(),
                resource: Some(json!({
                    "apiVersion": "operator.kyma-project.io/v1alpha1",
                    "kind": "M1",
                    "metadata": {"name": "m1-default", "namespace": "kyma-system"}
                })),
                ..Default::default()
            },
        );
        manifest.metadata.namespace = Some("kcp-system".to_string());
        manifest.metadata.generation = Some(1);
        manifest.status = state.map(|state| ManifestStatus { state });
        manifest
    }

    fn module(error: Option<LifecycleError>) -> AssembledModule {
        AssembledModule {
            module_name: "m1".to_string(),
            fqdn: "kyma-project.io/module/m1".to_string(),
            template: TemplateInfo {
                template: Some(template()),
                desired_channel: "fast".to_string(),
                error,
            },
            manifest: Some(manifest(None)),
            enabled: true,
            unmanaged: false,
        }
    }

    fn existing() -> ModuleStatus {
        ModuleStatus {
            name: "m1".to_string(),
            channel: "regular".to_string(),
            version: "2.0.0".to_string(),
            state: State::Ready,
            ..Default::default()
        }
    }

    #[test]
    fn test_status_from_observed_manifest() {
        let status = generate_module_status(&module(None), None).unwrap();
        assert_eq!(status.state, State::Processing);
        assert_eq!(status.version, "2.0.0");
        assert_eq!(status.channel, "fast");

        let manifest = status.manifest.unwrap();
        assert_eq!(manifest.kind, "Manifest");
        assert_eq!(manifest.api_version, API_VERSION);
        assert_eq!(manifest.name(), "k1-m1");
        assert_eq!(status.template.unwrap().generation(), 3);

        let resource = status.resource.unwrap();
        assert_eq!(resource.kind, "M1");
        assert_eq!(resource.name(), "m1-default");
        assert_eq!(resource.namespace(), "kyma-system");
    }

    #[test]
    fn test_unmanaged_status_drops_tracking() {
        let mut unmanaged = module(None);
        unmanaged.unmanaged = true;
        let status = generate_module_status(&unmanaged, None).unwrap();
        assert_eq!(status.state, State::Unmanaged);
        assert!(status.manifest.is_none());
        assert!(status.template.is_none());
        assert!(status.resource.is_none());
    }

    #[test]
    fn test_status_from_errors() {
        let skew = LifecycleError::TemplateUpdateNotAllowed("ignore channel skew".to_string());
        let status = generate_module_status(&module(Some(skew)), Some(&existing())).unwrap();
        assert_eq!(status.state, State::Error);
        assert_eq!(status.version, "2.0.0");
        assert_eq!(status.channel, "regular");
        assert!(status.message.contains("ignore channel skew"));

        let waiting = generate_module_status(
            &module(Some(LifecycleError::WaitingForNextMaintenanceWindow)),
            Some(&existing()),
        )
        .unwrap();
        assert_eq!(waiting.state, State::Ready);
        assert!(waiting.message.contains("maintenance window"));

        let missing = generate_module_status(
            &module(Some(LifecycleError::NoTemplatesInListResult("none".to_string()))),
            Some(&existing()),
        )
        .unwrap();
        assert_eq!(missing.state, State::Warning);
        assert_eq!(missing.channel, "fast");
        assert!(missing.version.is_empty());

        let other = generate_module_status(
            &module(Some(LifecycleError::ReleaseMetaNotFound("m1".to_string()))),
            None,
        )
        .unwrap();
        assert_eq!(other.state, State::Error);
        assert!(other.message.contains("ModuleReleaseMeta not found"));
    }

    #[test]
    fn test_update_keeps_order() {
        let mut kyma = Kyma::new("k1", KymaSpec::default());
        kyma.status_mut().modules = vec![
            ModuleStatus {
                name: "a".to_string(),
                ..Default::default()
            },
            existing(),
        ];
        let mut b = module(None);
        b.module_name = "b".to_string();
        update_module_statuses(&mut kyma, &[module(None), b]);

        let names: Vec<_> = kyma.status().modules.iter().map(|m| m.name.clone()).collect();
        assert_eq!(names, vec!["a", "m1", "b"]);
        assert_eq!(kyma.module_status("m1").unwrap().state, State::Processing);
    }

    #[tokio::test]
    async fn test_removed_module_status_dropped_only_after_manifest_gone() {
        let cluster = InMemoryCluster::new();
        cluster.insert_manifest(manifest(Some(State::Deleting)));

        let mut kyma = Kyma::new(
            "k1",
            KymaSpec {
                modules: vec![Module::new("kept")],
                ..Default::default()
            },
        );
        let mut removed = existing();
        removed.manifest = Some(manifest_tracking(&manifest(None)));
        kyma.status_mut().modules = vec![
            removed,
            ModuleStatus {
                name: "untracked".to_string(),
                ..Default::default()
            },
        ];

        delete_no_longer_existing_module_statuses(&mut kyma, &cluster).await;
        assert!(kyma.module_status("untracked").is_none());
        assert_eq!(kyma.module_status("m1").unwrap().state, State::Deleting);

        delete_no_longer_existing_modules(&kyma, &cluster).await.unwrap();
        assert!(cluster.manifests().is_empty());
        // A second delete of the same manifest is a no-op
        delete_no_longer_existing_modules(&kyma, &cluster).await.unwrap();

        delete_no_longer_existing_module_statuses(&mut kyma, &cluster).await;
        assert!(kyma.module_status("m1").is_none());
    }
}

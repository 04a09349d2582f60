//! Manifest assembly from resolved templates
//!
//! The assembler is pure: it reads the resolved template and its decoded
//! descriptor and produces the manifest the sync runner applies. Failures
//! stay on the module and never stop assembly of the others.

use crate::client::DescriptorProvider;
use crate::error::{LifecycleError, Result};
use crate::lookup::{ModuleInfo, TemplateInfo, TemplatesByModule};
use kube::{Resource, ResourceExt};
use lifecycle_types::{
    labels, AccessKind, ComponentNameMapping, CustomResourcePolicy, Descriptor, ImageSpec,
    InstallInfo, Kyma, Manifest, ManifestSpec, RefType,
};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

/// Layer carrying the raw module manifest
pub const RAW_MANIFEST_LAYER: &str = "raw-manifest";
/// Layer carrying module configuration
pub const CONFIG_LAYER: &str = "config";
/// Legacy name of the configuration layer
pub const CRDS_LAYER: &str = "crds";
/// Layer carrying the default custom resource, informational only
pub const DEFAULT_CR_LAYER: &str = "default-cr";

const DEFAULT_REPO_SUBDIRECTORY: &str = "component-descriptors";
const TAR_MEDIA_TYPE: &str = "application/x-tar";

/// A module after assembly, the unit the sync runner works on
#[derive(Debug, Clone)]
pub struct AssembledModule {
    pub module_name: String,
    pub fqdn: String,
    pub template: TemplateInfo,
    /// Desired manifest, absent when resolution or assembly failed
    pub manifest: Option<Manifest>,
    pub enabled: bool,
    pub unmanaged: bool,
}

impl AssembledModule {
    fn failed(info: &ModuleInfo, template: TemplateInfo) -> Self {
        Self {
            module_name: info.name().to_string(),
            fqdn: String::new(),
            template,
            manifest: None,
            enabled: info.enabled,
            unmanaged: info.unmanaged,
        }
    }
}

/// Builds manifests from resolved templates
pub struct ModuleAssembler {
    descriptors: Arc<dyn DescriptorProvider>,
    remote_sync_namespace: String,
    in_kcp_mode: bool,
}

impl ModuleAssembler {
    pub fn new(
        descriptors: Arc<dyn DescriptorProvider>,
        remote_sync_namespace: impl Into<String>,
        in_kcp_mode: bool,
    ) -> Self {
        Self {
            descriptors,
            remote_sync_namespace: remote_sync_namespace.into(),
            in_kcp_mode,
        }
    }

    /// Assemble every module once, in declaration order
    pub fn assemble_all(
        &self,
        kyma: &Kyma,
        modules: &[ModuleInfo],
        templates: &TemplatesByModule,
    ) -> Vec<AssembledModule> {
        let mut seen = HashSet::new();
        modules
            .iter()
            .filter(|info| seen.insert(info.name().to_string()))
            .map(|info| {
                let template = templates.get(info.name()).cloned().unwrap_or_default();
                self.assemble(kyma, info, template)
            })
            .collect()
    }

    pub fn assemble(&self, kyma: &Kyma, info: &ModuleInfo, mut template: TemplateInfo) -> AssembledModule {
        // Not-allowed templates are still assembled so the sync runner can remove them
        if let Some(error) = &template.error {
            if !error.is_template_not_allowed() {
                return AssembledModule::failed(info, template);
            }
        }
        let Some(resolved) = template.template.as_ref() else {
            return AssembledModule::failed(info, template);
        };

        let descriptor = match self.descriptors.get_descriptor(resolved) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                template.error = Some(e);
                return AssembledModule::failed(info, template);
            }
        };

        let fqdn = descriptor.name.clone();
        let name = manifest_name(&fqdn, &kyma.name_any(), info.name());
        let resource = match info.module.custom_resource_policy {
            CustomResourcePolicy::Ignore => None,
            CustomResourcePolicy::CreateAndDelete => resolved
                .spec
                .data
                .clone()
                .map(|data| default_resource(data, &name, &self.remote_sync_namespace)),
        };

        let spec = match self.manifest_spec(&descriptor, resource) {
            Ok(spec) => spec,
            Err(e) => {
                template.error = Some(e.context("could not translate layers and merge them"));
                return AssembledModule::failed(info, template);
            }
        };

        let mut manifest = Manifest::new(&name, spec);
        manifest.metadata.namespace = kyma.namespace();
        manifest.metadata.owner_references = kyma.controller_owner_ref(&()).map(|owner| vec![owner]);

        let manifest_labels = manifest.labels_mut();
        manifest_labels.insert(labels::KYMA_NAME.to_string(), kyma.name_any());
        manifest_labels.insert(labels::MODULE_NAME.to_string(), info.name().to_string());
        manifest_labels.insert(labels::CHANNEL.to_string(), template.desired_channel.clone());
        manifest_labels.insert(labels::MANAGED_BY.to_string(), labels::OPERATOR_NAME.to_string());

        let annotations = manifest.annotations_mut();
        annotations.insert(labels::FQDN.to_string(), fqdn.clone());
        if info.unmanaged {
            annotations.insert(labels::UNMANAGED.to_string(), labels::ENABLED.to_string());
        }

        AssembledModule {
            module_name: info.name().to_string(),
            fqdn,
            template,
            manifest: Some(manifest),
            enabled: info.enabled,
            unmanaged: info.unmanaged,
        }
    }

    fn manifest_spec(&self, descriptor: &Descriptor, resource: Option<Value>) -> Result<ManifestSpec> {
        let mut spec = ManifestSpec {
            remote: self.in_kcp_mode,
            version: descriptor.version.clone(),
            resource,
            localized_images: localized_images(descriptor),
            ..Default::default()
        };

        let Some(context) = descriptor.effective_repository_context() else {
            return Ok(spec);
        };

        for layer in &descriptor.resources {
            if layer.access.kind() != AccessKind::LocalBlob {
                continue;
            }
            match layer.name.as_str() {
                RAW_MANIFEST_LAYER => {
                    spec.install = InstallInfo {
                        name: layer.name.clone(),
                        source: layer_image(descriptor, context, &layer.access)?,
                    };
                }
                CONFIG_LAYER | CRDS_LAYER => {
                    spec.config = Some(layer_image(descriptor, context, &layer.access)?);
                }
                DEFAULT_CR_LAYER => {}
                _ => {}
            }
        }
        Ok(spec)
    }
}

/// Stable manifest name for a module of a Kyma
pub fn manifest_name(fqdn: &str, kyma_name: &str, module_name: &str) -> String {
    let digest = sha256_hex(fqdn);
    format!("{kyma_name}-{module_name}-{}", &digest[..10])
}

fn sha256_hex(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// Default the custom resource's name and namespace when the template leaves them out
fn default_resource(mut data: Value, name: &str, namespace: &str) -> Value {
    if let Some(object) = data.as_object_mut() {
        let metadata = object
            .entry("metadata")
            .or_insert_with(|| Value::Object(Default::default()));
        if let Some(metadata) = metadata.as_object_mut() {
            let blank = |v: Option<&Value>| v.and_then(Value::as_str).map_or(true, str::is_empty);
            if blank(metadata.get("name")) {
                metadata.insert("name".to_string(), Value::String(name.to_string()));
            }
            if blank(metadata.get("namespace")) {
                metadata.insert("namespace".to_string(), Value::String(namespace.to_string()));
            }
        }
    }
    data
}

fn layer_image(
    descriptor: &Descriptor,
    context: &lifecycle_types::RepositoryContext,
    access: &lifecycle_types::AccessSpec,
) -> Result<ImageSpec> {
    let ref_type = match access.media_type.as_deref() {
        Some(TAR_MEDIA_TYPE) => RefType::OciDir,
        _ => RefType::OciRef,
    };
    let reference = access
        .local_reference
        .clone()
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| descriptor.version.clone());

    let (repo, name) = match context.component_name_mapping {
        ComponentNameMapping::UrlPath => (
            format!("{}/{DEFAULT_REPO_SUBDIRECTORY}", context.base()),
            descriptor.name.clone(),
        ),
        ComponentNameMapping::Sha256Digest => {
            (format!("{}/", context.base()), sha256_hex(&descriptor.name))
        }
        ComponentNameMapping::Unsupported => {
            return Err(LifecycleError::ComponentNameMappingNotSupported(
                context.base_url.clone(),
            ))
        }
    };

    Ok(ImageSpec {
        repo,
        name,
        reference,
        ref_type,
    })
}

fn localized_images(descriptor: &Descriptor) -> Vec<String> {
    descriptor
        .resources
        .iter()
        .filter_map(|resource| match resource.access.kind() {
            AccessKind::OciArtifact => resource
                .access
                .image_reference
                .clone()
                .filter(|r| !r.is_empty()),
            AccessKind::LocalBlob => None,
            AccessKind::Unsupported => {
                warn!(
                    resource = %resource.name,
                    access_type = %resource.access.access_type,
                    "Skipping resource with unsupported access type"
                );
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::CachedDescriptorProvider;
    use crate::lookup::fetch_module_info;
    use lifecycle_types::{KymaSpec, Module, ModuleTemplate, ModuleTemplateSpec};
    use serde_json::json;

    const FQDN: &str = "kyma-project.io/module/m1";

    fn descriptor(mapping: &str) -> Value {
        json!({"component": {
            "name": FQDN,
            "version": "2.0.0",
            "repositoryContexts": [{"baseUrl": "registry.example", "subPath": "prod", "componentNameMapping": mapping}],
            "resources": [
                {"name": "raw-manifest", "access": {"type": "localBlob", "localReference": "sha256:raw", "mediaType": "application/x-tar"}},
                {"name": "config", "access": {"type": "localBlob/v1", "mediaType": "application/octet-stream"}},
                {"name": "default-cr", "access": {"type": "localBlob", "localReference": "sha256:cr"}},
                {"name": "m1-image", "access": {"type": "ociArtifact", "imageReference": "europe-docker.pkg.dev/m1:2.0.0"}},
                {"name": "docs", "access": {"type": "s3", "imageReference": "ignored"}}
            ]
        }})
    }

    fn resolved(mapping: &str, data: Option<Value>) -> TemplateInfo {
        let mut template = ModuleTemplate::new(
            "m1-2.0.0",
            ModuleTemplateSpec {
                module_name: "m1".to_string(),
                version: "2.0.0".to_string(),
                data,
                descriptor: descriptor(mapping),
                ..Default::default()
            },
        );
        template.metadata.namespace = Some("kcp-system".to_string());
        TemplateInfo {
            template: Some(template),
            desired_channel: "regular".to_string(),
            error: None,
        }
    }

    fn kyma(module: Module) -> Kyma {
        let mut kyma = Kyma::new(
            "k1",
            KymaSpec {
                channel: "regular".to_string(),
                modules: vec![module],
                ..Default::default()
            },
        );
        kyma.metadata.namespace = Some("kcp-system".to_string());
        kyma.metadata.uid = Some("uid-k1".to_string());
        kyma
    }

    fn assembler() -> ModuleAssembler {
        ModuleAssembler::new(Arc::new(CachedDescriptorProvider::new()), "kyma-system", false)
    }

    #[test]
    fn test_assembles_manifest_from_layers() {
        let kyma = kyma(Module::new("m1"));
        let info = &fetch_module_info(&kyma)[0];
        let module = assembler().assemble(
            &kyma,
            info,
            resolved("urlPath", Some(json!({"kind": "M1", "metadata": {"name": ""}}))),
        );

        assert_eq!(module.fqdn, FQDN);
        let manifest = module.manifest.unwrap();
        assert_eq!(manifest.name_any(), manifest_name(FQDN, "k1", "m1"));
        assert_eq!(manifest.namespace().as_deref(), Some("kcp-system"));
        assert_eq!(manifest.spec.version, "2.0.0");
        assert!(!manifest.spec.remote);

        let install = &manifest.spec.install;
        assert_eq!(install.name, RAW_MANIFEST_LAYER);
        assert_eq!(install.source.repo, "registry.example/prod/component-descriptors");
        assert_eq!(install.source.name, FQDN);
        assert_eq!(install.source.reference, "sha256:raw");
        assert_eq!(install.source.ref_type, RefType::OciDir);

        let config = manifest.spec.config.as_ref().unwrap();
        assert_eq!(config.reference, "2.0.0");
        assert_eq!(config.ref_type, RefType::OciRef);

        assert_eq!(
            manifest.spec.localized_images,
            vec!["europe-docker.pkg.dev/m1:2.0.0".to_string()]
        );

        let resource = manifest.spec.resource.as_ref().unwrap();
        assert_eq!(resource["metadata"]["name"], manifest.name_any());
        assert_eq!(resource["metadata"]["namespace"], "kyma-system");

        assert_eq!(manifest.labels()[labels::CHANNEL], "regular");
        assert_eq!(manifest.labels()[labels::KYMA_NAME], "k1");
        assert_eq!(manifest.annotations()[labels::FQDN], FQDN);
        assert!(!manifest.is_unmanaged());
        let owner = &manifest.owner_references()[0];
        assert_eq!(owner.uid, "uid-k1");
        assert_eq!(owner.controller, Some(true));
    }

    #[test]
    fn test_digest_mapping_and_ignored_resource() {
        let mut module = Module::new("m1");
        module.custom_resource_policy = CustomResourcePolicy::Ignore;
        module.managed = false;
        let kyma = kyma(module);
        let info = &fetch_module_info(&kyma)[0];

        let module = assembler().assemble(
            &kyma,
            info,
            resolved("sha256-digest", Some(json!({"kind": "M1"}))),
        );
        let manifest = module.manifest.unwrap();
        assert_eq!(manifest.spec.install.source.repo, "registry.example/prod/");
        assert_eq!(manifest.spec.install.source.name, sha256_hex(FQDN));
        assert!(manifest.spec.resource.is_none());
        assert!(manifest.is_unmanaged());
    }

    #[test]
    fn test_unsupported_mapping_fails_the_module() {
        let kyma = kyma(Module::new("m1"));
        let info = &fetch_module_info(&kyma)[0];

        let module = assembler().assemble(&kyma, info, resolved("customMapping", None));
        assert!(module.manifest.is_none());
        assert!(matches!(
            module.template.error.as_ref().map(LifecycleError::root),
            Some(LifecycleError::ComponentNameMappingNotSupported(_))
        ));
    }

    #[test]
    fn test_resolution_errors_pass_through() {
        let kyma = kyma(Module::new("m1"));
        let info = &fetch_module_info(&kyma)[0];

        let mut waiting = resolved("urlPath", None);
        waiting.template = None;
        waiting.error = Some(LifecycleError::WaitingForNextMaintenanceWindow);
        let module = assembler().assemble(&kyma, info, waiting);
        assert!(module.manifest.is_none());
        assert!(module.template.error.unwrap().is_waiting_for_window());

        let mut not_allowed = resolved("urlPath", None);
        not_allowed.error = Some(LifecycleError::TemplateNotAllowed("beta module".to_string()));
        let module = assembler().assemble(&kyma, info, not_allowed);
        assert!(module.manifest.is_some());
    }
}

//! Mandatory modules
//!
//! Templates with `spec.mandatory` are installed on every Kyma, declared or
//! not. They skip channel selection and visibility rules, never get a module
//! status entry, and their manifests carry the mandatory-module label. The
//! version comes from the pinned version of the module's release metadata, or
//! the highest published mandatory template when there is none.

use crate::assembler::{AssembledModule, ModuleAssembler};
use crate::channel::ChannelResolver;
use crate::client::TemplateReader;
use crate::error::{LifecycleError, Result};
use crate::lookup::{parse_version, ModuleInfo, TemplateInfo};
use kube::ResourceExt;
use lifecycle_types::{labels, template_name, Kyma, Module, ModuleTemplate};
use semver::Version;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Mandatory templates of one namespace, grouped by module name
pub fn mandatory_templates_by_module(
    templates: Vec<ModuleTemplate>,
    namespace: &str,
) -> BTreeMap<String, Vec<ModuleTemplate>> {
    let mut by_module: BTreeMap<String, Vec<ModuleTemplate>> = BTreeMap::new();
    for template in templates {
        if !template.spec.mandatory || template.namespace().as_deref() != Some(namespace) {
            continue;
        }
        by_module
            .entry(template.spec.module_name.clone())
            .or_default()
            .push(template);
    }
    by_module
}

/// Template with the highest version; any unparsable version fails the module
pub fn highest_version(module: &str, candidates: Vec<ModuleTemplate>) -> Result<ModuleTemplate> {
    let mut highest: Option<(Version, ModuleTemplate)> = None;
    for template in candidates {
        let version = parse_version(&template.spec.version).ok_or_else(|| {
            LifecycleError::InvalidTemplateVersion(format!(
                "{} of mandatory module {module}",
                template.spec.version
            ))
        })?;
        if highest.as_ref().map_or(true, |(current, _)| version > *current) {
            highest = Some((version, template));
        }
    }
    highest.map(|(_, template)| template).ok_or_else(|| {
        LifecycleError::NoTemplatesInListResult(format!("for mandatory module {module}"))
    })
}

/// Finds the mandatory modules a Kyma receives
pub struct MandatoryResolver {
    reader: Arc<dyn TemplateReader>,
}

impl MandatoryResolver {
    pub fn new(reader: Arc<dyn TemplateReader>) -> Self {
        Self { reader }
    }

    /// Resolve every mandatory module in the Kyma's namespace.
    ///
    /// Only listing templates can fail the call; per-module failures stay on
    /// the returned [`TemplateInfo`].
    #[instrument(skip(self, kyma), fields(kyma = %kyma.name_any()))]
    pub async fn resolve_all(&self, kyma: &Kyma) -> Result<Vec<(ModuleInfo, TemplateInfo)>> {
        let namespace = kyma.namespace().unwrap_or_default();
        let templates = self.reader.list_templates().await.map_err(|e| {
            LifecycleError::from(e).context("failed to list mandatory module templates")
        })?;
        let desired_channel = ChannelResolver::desired_channel(None, &kyma.spec.channel);

        let mut resolved = Vec::new();
        for (module, candidates) in mandatory_templates_by_module(templates, &namespace) {
            let info = ModuleInfo {
                module: Module::new(module.as_str()),
                enabled: true,
                unmanaged: false,
                validation_error: None,
            };
            let template = match self.select(&namespace, &module, candidates).await {
                Ok(template) => {
                    debug!(module = %module, version = %template.spec.version, "Resolved mandatory module");
                    TemplateInfo {
                        template: Some(template),
                        desired_channel: desired_channel.clone(),
                        error: None,
                    }
                }
                Err(e) => TemplateInfo {
                    template: None,
                    desired_channel: desired_channel.clone(),
                    error: Some(e),
                },
            };
            resolved.push((info, template));
        }
        Ok(resolved)
    }

    async fn select(
        &self,
        namespace: &str,
        module: &str,
        candidates: Vec<ModuleTemplate>,
    ) -> Result<ModuleTemplate> {
        let meta = self.reader.get_release_meta(namespace, module).await?;
        let pinned = match meta.filter(|m| m.spec.mandatory_version().is_some()) {
            Some(meta) => ChannelResolver::desired_version(&meta, "")?,
            None => return highest_version(module, candidates),
        };

        candidates
            .into_iter()
            .find(|t| t.spec.version == pinned)
            .ok_or_else(|| {
                LifecycleError::NoTemplatesInListResult(format!(
                    "failed to get mandatory module template {namespace}/{}",
                    template_name(module, &pinned)
                ))
            })
    }
}

/// Assemble resolved mandatory modules and label their manifests
pub fn assemble_mandatory(
    assembler: &ModuleAssembler,
    kyma: &Kyma,
    resolved: Vec<(ModuleInfo, TemplateInfo)>,
) -> Vec<AssembledModule> {
    resolved
        .into_iter()
        .map(|(info, template)| {
            let mut module = assembler.assemble(kyma, &info, template);
            if let Some(manifest) = module.manifest.as_mut() {
                manifest
                    .labels_mut()
                    .insert(labels::IS_MANDATORY_MODULE.to_string(), labels::ENABLED.to_string());
            }
            module
        })
        .collect()
}

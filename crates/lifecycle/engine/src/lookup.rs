//! Template resolution for every module of a Kyma
//!
//! Each module is resolved independently: failures are recorded on that
//! module's [`TemplateInfo`] and never stop the others. Resolution runs
//!
//! 1. release-meta lookup and channel/version selection,
//! 2. template fetch by `{module}-{version}`,
//! 3. maintenance-window gating,
//! 4. visibility rules (internal, beta, mandatory),
//! 5. skew protection against the installed version.

use crate::channel::ChannelResolver;
use crate::client::{DescriptorProvider, TemplateReader};
use crate::error::LifecycleError;
use crate::maintenance::MaintenanceWindow;
use kube::ResourceExt;
use lifecycle_types::{
    template_name, Kyma, Module, ModuleReleaseMeta, ModuleStatus, ModuleTemplate, NONE_CHANNEL,
};
use semver::Version;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// A module as the resolver sees it: declared (enabled) or only left in status (disabled)
#[derive(Debug, Clone)]
pub struct ModuleInfo {
    pub module: Module,
    pub enabled: bool,
    pub unmanaged: bool,
    pub validation_error: Option<LifecycleError>,
}

impl ModuleInfo {
    pub fn name(&self) -> &str {
        &self.module.name
    }
}

/// Declared modules followed by status entries no longer declared
pub fn fetch_module_info(kyma: &Kyma) -> Vec<ModuleInfo> {
    let mut infos: Vec<ModuleInfo> = kyma
        .spec
        .modules
        .iter()
        .map(|module| {
            let validation_error = (module.channel.as_deref() == Some(NONE_CHANNEL)).then(|| {
                LifecycleError::InvalidKymaSpec(format!(
                    "invalid configuration in Kyma spec.modules for module {}: Channel \"none\" is not allowed",
                    module.name
                ))
            });
            ModuleInfo {
                module: module.clone(),
                enabled: true,
                unmanaged: !module.managed,
                validation_error,
            }
        })
        .collect();

    for status in kyma.no_longer_declared_module_statuses() {
        let validation_error = status.template.is_none().then(|| {
            LifecycleError::InvalidModuleEntry(format!(
                "for module {}: ModuleTemplate reference is missing",
                status.name
            ))
        });
        let mut module = Module::new(status.name.clone());
        module.channel = (!status.channel.is_empty()).then(|| status.channel.clone());
        infos.push(ModuleInfo {
            module,
            enabled: false,
            unmanaged: false,
            validation_error,
        });
    }
    infos
}

/// Resolution outcome of one module
#[derive(Debug, Clone, Default)]
pub struct TemplateInfo {
    /// Resolved template, absent when resolution failed before or while fetching it
    pub template: Option<ModuleTemplate>,
    pub desired_channel: String,
    pub error: Option<LifecycleError>,
}

impl TemplateInfo {
    fn failed(desired_channel: String, error: LifecycleError) -> Self {
        Self {
            template: None,
            desired_channel,
            error: Some(error),
        }
    }
}

/// Resolved templates by module name
pub type TemplatesByModule = HashMap<String, TemplateInfo>;

/// Resolves templates for the modules of a Kyma
pub struct TemplateResolver {
    reader: Arc<dyn TemplateReader>,
    descriptors: Arc<dyn DescriptorProvider>,
    maintenance_window: Option<Arc<dyn MaintenanceWindow>>,
}

impl TemplateResolver {
    pub fn new(reader: Arc<dyn TemplateReader>, descriptors: Arc<dyn DescriptorProvider>) -> Self {
        Self {
            reader,
            descriptors,
            maintenance_window: None,
        }
    }

    /// Gate downtime-requiring updates behind maintenance windows
    pub fn with_maintenance_window(mut self, maintenance_window: Arc<dyn MaintenanceWindow>) -> Self {
        self.maintenance_window = Some(maintenance_window);
        self
    }

    /// Resolve every module; the first entry wins for duplicate names
    #[instrument(skip(self, kyma, modules), fields(kyma = %kyma.name_any()))]
    pub async fn resolve_all(&self, kyma: &Kyma, modules: &[ModuleInfo]) -> TemplatesByModule {
        let mut templates = TemplatesByModule::new();
        for module in modules {
            if templates.contains_key(module.name()) {
                continue;
            }
            let resolved = self.resolve(kyma, module).await;
            templates.insert(module.name().to_string(), resolved);
        }
        templates
    }

    /// Resolve a single module
    pub async fn resolve(&self, kyma: &Kyma, module: &ModuleInfo) -> TemplateInfo {
        let desired_channel =
            ChannelResolver::desired_channel(module.module.channel.as_deref(), &kyma.spec.channel);

        if let Some(error) = &module.validation_error {
            return TemplateInfo::failed(desired_channel, error.clone());
        }

        let namespace = kyma.namespace().unwrap_or_default();
        let meta = match self.reader.get_release_meta(&namespace, module.name()).await {
            Ok(Some(meta)) => meta,
            Ok(None) => {
                return TemplateInfo::failed(
                    desired_channel,
                    LifecycleError::ReleaseMetaNotFound(module.name().to_string()),
                )
            }
            Err(e) => return TemplateInfo::failed(desired_channel, e.into()),
        };

        let info = self
            .lookup_with_maintenance_window(kyma, module, &meta, desired_channel)
            .await;
        let mut info = validate_template_mode(info, kyma, &meta);
        if info.error.is_some() {
            return info;
        }

        let Some(template) = info.template.as_ref() else {
            return info;
        };
        let descriptor = match self.descriptors.get_descriptor(template) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                info.error = Some(e);
                return info;
            }
        };

        if let Some(status) = kyma.module_status(module.name()) {
            mark_invalid_skew_update(&mut info, status, &descriptor.version);
        }
        info
    }

    async fn lookup_with_maintenance_window(
        &self,
        kyma: &Kyma,
        module: &ModuleInfo,
        meta: &ModuleReleaseMeta,
        desired_channel: String,
    ) -> TemplateInfo {
        let mut info = self.lookup(kyma, module, meta, desired_channel).await;

        let Some(window) = self.maintenance_window.as_ref() else {
            return info;
        };
        let required = match info.template.as_ref() {
            Some(template) if info.error.is_none() => window.is_required(template, kyma),
            _ => false,
        };
        if !required {
            return info;
        }

        match window.is_active(kyma) {
            Ok(true) => {}
            Ok(false) => {
                debug!(module = %module.name(), "Update deferred to next maintenance window");
                info.template = None;
                info.error = Some(LifecycleError::WaitingForNextMaintenanceWindow);
            }
            Err(e) => {
                info.template = None;
                info.error = Some(LifecycleError::MaintenanceWindowUnknown(e.to_string()));
            }
        }
        info
    }

    async fn lookup(
        &self,
        kyma: &Kyma,
        module: &ModuleInfo,
        meta: &ModuleReleaseMeta,
        desired_channel: String,
    ) -> TemplateInfo {
        let version = match ChannelResolver::desired_version(meta, &desired_channel) {
            Ok(version) => version,
            Err(e) => return TemplateInfo::failed(desired_channel, e),
        };

        let namespace = kyma.namespace().unwrap_or_default();
        let name = template_name(module.name(), &version);
        match self.reader.get_template(&namespace, &name).await {
            Ok(Some(template)) => TemplateInfo {
                template: Some(template),
                desired_channel,
                error: None,
            },
            Ok(None) => TemplateInfo::failed(
                desired_channel,
                LifecycleError::NoTemplatesInListResult(format!(
                    "failed to get module template {namespace}/{name}"
                )),
            ),
            Err(e) => TemplateInfo::failed(
                desired_channel,
                LifecycleError::from(e).context(format!("failed to get module template {name}")),
            ),
        }
    }
}

/// Reject templates the Kyma may not install through the regular path
pub fn validate_template_mode(
    mut info: TemplateInfo,
    kyma: &Kyma,
    meta: &ModuleReleaseMeta,
) -> TemplateInfo {
    if info.error.is_some() {
        return info;
    }
    let Some(template) = info.template.as_ref() else {
        return info;
    };

    let error = if (template.is_internal() || meta.spec.internal) && !kyma.is_internal() {
        Some(LifecycleError::TemplateNotAllowed("internal module".to_string()))
    } else if (template.is_beta() || meta.spec.beta) && !kyma.is_beta() {
        Some(LifecycleError::TemplateNotAllowed("beta module".to_string()))
    } else if template.spec.mandatory {
        Some(LifecycleError::NoTemplatesInListResult(format!(
            "for module {} in channel {}",
            template.name_any(),
            info.desired_channel
        )))
    } else {
        None
    };
    info.error = error;
    info
}

/// Parse versions the way release tooling writes them: optional `v`, missing parts padded
pub fn parse_version(raw: &str) -> Option<Version> {
    let raw = raw.trim().trim_start_matches(['v', 'V']);
    let end = raw.find(['-', '+']).unwrap_or(raw.len());
    let (core, rest) = raw.split_at(end);

    let mut parts: Vec<&str> = core.split('.').collect();
    if parts.is_empty() || parts.len() > 3 || parts.iter().any(|p| p.is_empty()) {
        return None;
    }
    while parts.len() < 3 {
        parts.push("0");
    }
    Version::parse(&format!("{}{rest}", parts.join("."))).ok()
}

/// Flag downgrades relative to the installed version; pre-release and build metadata are ignored
pub fn mark_invalid_skew_update(info: &mut TemplateInfo, status: &ModuleStatus, template_version: &str) {
    if status.template.is_none() || info.error.is_some() {
        return;
    }

    let Some(new_version) = parse_version(template_version) else {
        let msg = "could not handle channel skew as descriptor from template contains invalid version";
        warn!(module = %status.name, version = %template_version, "{msg}");
        info.error = Some(LifecycleError::TemplateUpdateNotAllowed(msg.to_string()));
        return;
    };
    let Some(old_version) = parse_version(&status.version) else {
        let msg = "could not handle channel skew as Modules contains invalid version";
        warn!(module = %status.name, version = %status.version, "{msg}");
        info.error = Some(LifecycleError::TemplateUpdateNotAllowed(msg.to_string()));
        return;
    };

    let core = |v: &Version| Version::new(v.major, v.minor, v.patch);
    if core(&new_version) < core(&old_version) {
        let msg = format!(
            "ignore channel skew (from {} to {}), as a higher version ({}) of the module was previously installed",
            status.channel, info.desired_channel, old_version
        );
        info!(
            module = %status.name,
            previous_version = %old_version,
            new_version = %new_version,
            "{msg}"
        );
        info.error = Some(LifecycleError::TemplateUpdateNotAllowed(msg));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::CachedDescriptorProvider;
    use crate::maintenance::PolicyError;
    use crate::memory::InMemoryCluster;
    use lifecycle_types::{labels, KymaSpec, TrackingObject};

    struct FixedWindow {
        required: bool,
        active: Result<bool, PolicyError>,
    }

    impl MaintenanceWindow for FixedWindow {
        fn is_required(&self, _: &ModuleTemplate, _: &Kyma) -> bool {
            self.required
        }

        fn is_active(&self, _: &Kyma) -> Result<bool, PolicyError> {
            self.active.clone()
        }
    }

    fn kyma(modules: Vec<Module>) -> Kyma {
        let mut kyma = Kyma::new(
            "k1",
            KymaSpec {
                channel: "regular".to_string(),
                modules,
                ..Default::default()
            },
        );
        kyma.metadata.namespace = Some("kcp-system".to_string());
        kyma
    }

    fn installed(kyma: &mut Kyma, name: &str, version: &str) {
        kyma.status_mut().modules.push(ModuleStatus {
            name: name.to_string(),
            channel: "regular".to_string(),
            version: version.to_string(),
            template: Some(TrackingObject::new(
                "ModuleTemplate",
                lifecycle_types::API_VERSION,
                template_name(name, version),
                "kcp-system",
                1,
            )),
            ..Default::default()
        });
    }

    fn resolver(cluster: &Arc<InMemoryCluster>) -> TemplateResolver {
        TemplateResolver::new(cluster.clone(), Arc::new(CachedDescriptorProvider::new()))
    }

    fn cluster_with(module: &str, version: &str) -> Arc<InMemoryCluster> {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.publish_module("kcp-system", module, &[("regular", version)]);
        cluster
    }

    #[test]
    fn test_fetch_module_info_marks_disabled_and_invalid() {
        let mut kyma = kyma(vec![Module::new("m1"), Module::new("m2").with_channel("none")]);
        installed(&mut kyma, "m1", "1.0.0");
        installed(&mut kyma, "old", "1.0.0");
        kyma.status_mut().modules.push(ModuleStatus {
            name: "broken".to_string(),
            ..Default::default()
        });

        let infos = fetch_module_info(&kyma);
        let names: Vec<_> = infos.iter().map(|i| (i.name(), i.enabled)).collect();
        assert_eq!(
            names,
            vec![("m1", true), ("m2", true), ("old", false), ("broken", false)]
        );
        assert!(matches!(
            infos[1].validation_error,
            Some(LifecycleError::InvalidKymaSpec(_))
        ));
        assert!(infos[2].validation_error.is_none());
        assert!(matches!(
            infos[3].validation_error,
            Some(LifecycleError::InvalidModuleEntry(_))
        ));
    }

    #[test]
    fn test_parse_version_is_lenient() {
        assert_eq!(parse_version("v1.2"), Some(Version::new(1, 2, 0)));
        assert_eq!(parse_version("3"), Some(Version::new(3, 0, 0)));
        assert_eq!(
            parse_version("1.2.3-rc.1+build").map(|v| v.pre.to_string()),
            Some("rc.1".to_string())
        );
        assert_eq!(parse_version("latest"), None);
        assert_eq!(parse_version("1..2"), None);
    }

    #[tokio::test]
    async fn test_resolves_channel_version() {
        let cluster = cluster_with("m1", "2.0.0");
        let kyma = kyma(vec![Module::new("m1")]);

        let infos = fetch_module_info(&kyma);
        let templates = resolver(&cluster).resolve_all(&kyma, &infos).await;
        let info = &templates["m1"];
        assert!(info.error.is_none());
        assert_eq!(info.desired_channel, "regular");
        assert_eq!(info.template.as_ref().unwrap().spec.version, "2.0.0");
    }

    #[tokio::test]
    async fn test_missing_release_meta() {
        let cluster = Arc::new(InMemoryCluster::new());
        let kyma = kyma(vec![Module::new("m1")]);

        let info = resolver(&cluster)
            .resolve(&kyma, &fetch_module_info(&kyma)[0])
            .await;
        assert!(matches!(info.error, Some(LifecycleError::ReleaseMetaNotFound(_))));
    }

    #[tokio::test]
    async fn test_skew_rejects_downgrade_only() {
        for (candidate, allowed) in [("1.1.9", false), ("1.2.0", true), ("1.2.1", true)] {
            let cluster = cluster_with("m1", candidate);
            let mut kyma = kyma(vec![Module::new("m1").with_channel("fast")]);
            installed(&mut kyma, "m1", "1.2.0");
            cluster.publish_module("kcp-system", "m1", &[("fast", candidate)]);

            let info = resolver(&cluster)
                .resolve(&kyma, &fetch_module_info(&kyma)[0])
                .await;
            assert_eq!(info.error.is_none(), allowed, "candidate {candidate}");
            if !allowed {
                let err = info.error.unwrap();
                assert!(err.is_update_not_allowed());
                assert!(err
                    .to_string()
                    .contains("ignore channel skew (from regular to fast), as a higher version (1.2.0)"));
            }
        }
    }

    #[tokio::test]
    async fn test_visibility_rules() {
        let cluster = cluster_with("m1", "1.0.0");
        cluster.update_template_labels("kcp-system", "m1-1.0.0", labels::BETA, "true");
        let mut kyma = kyma(vec![Module::new("m1")]);

        let info = resolver(&cluster)
            .resolve(&kyma, &fetch_module_info(&kyma)[0])
            .await;
        assert!(info.error.as_ref().unwrap().is_template_not_allowed());
        assert!(info.error.unwrap().to_string().contains("beta module"));

        kyma.labels_mut()
            .insert(labels::BETA.to_string(), "true".to_string());
        let info = resolver(&cluster)
            .resolve(&kyma, &fetch_module_info(&kyma)[0])
            .await;
        assert!(info.error.is_none());
    }

    #[tokio::test]
    async fn test_mandatory_template_not_installed_through_regular_path() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.publish_mandatory_module("kcp-system", "m1", "1.0.0");
        let kyma = kyma(vec![Module::new("m1")]);

        let info = resolver(&cluster)
            .resolve(&kyma, &fetch_module_info(&kyma)[0])
            .await;
        assert!(matches!(
            info.error,
            Some(LifecycleError::NoTemplatesInListResult(_))
        ));
    }

    #[tokio::test]
    async fn test_maintenance_window_gating() {
        let cluster = cluster_with("m1", "2.0.0");
        let kyma = kyma(vec![Module::new("m1")]);
        let module = &fetch_module_info(&kyma)[0];

        let waiting = resolver(&cluster).with_maintenance_window(Arc::new(FixedWindow {
            required: true,
            active: Ok(false),
        }));
        let info = waiting.resolve(&kyma, module).await;
        assert!(info.template.is_none());
        assert!(info.error.unwrap().is_waiting_for_window());

        let unknown = resolver(&cluster).with_maintenance_window(Arc::new(FixedWindow {
            required: true,
            active: Err(PolicyError::NoPolicyConfigured),
        }));
        let info = unknown.resolve(&kyma, module).await;
        assert!(matches!(
            info.error,
            Some(LifecycleError::MaintenanceWindowUnknown(_))
        ));

        let open = resolver(&cluster).with_maintenance_window(Arc::new(FixedWindow {
            required: true,
            active: Ok(true),
        }));
        assert!(open.resolve(&kyma, module).await.error.is_none());
    }
}

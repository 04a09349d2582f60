//! ModuleTemplate: one released version of a module

use crate::labels;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A released module version, named `{module}-{version}`
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "operator.kyma-project.io",
    version = "v1beta2",
    kind = "ModuleTemplate",
    namespaced,
    shortname = "mt"
)]
#[serde(rename_all = "camelCase")]
pub struct ModuleTemplateSpec {
    /// Module this template releases
    #[serde(default)]
    pub module_name: String,

    /// Module version
    #[serde(default)]
    pub version: String,

    /// Channel the template was published to, informational only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    /// Installed on every Kyma through the mandatory path
    #[serde(default)]
    pub mandatory: bool,

    /// Upgrading to this version requires a maintenance window
    #[serde(default)]
    pub requires_downtime: bool,

    /// Default custom resource for the module
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    /// Raw component descriptor, decoded by a descriptor provider
    #[serde(default)]
    pub descriptor: serde_json::Value,
}

impl ModuleTemplate {
    fn label_enabled(&self, key: &str) -> bool {
        self.labels()
            .get(key)
            .map(|v| labels::is_enabled(v))
            .unwrap_or(false)
    }

    pub fn is_beta(&self) -> bool {
        self.label_enabled(labels::BETA)
    }

    pub fn is_internal(&self) -> bool {
        self.label_enabled(labels::INTERNAL)
    }

    /// Object generation, zero when the server has not assigned one
    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or_default()
    }

    /// Bring the mandatory-module label in line with `spec.mandatory`.
    ///
    /// Returns true when the label set changed and the template needs a write.
    pub fn sync_mandatory_label(&mut self) -> bool {
        let labelled = self.label_enabled(labels::IS_MANDATORY_MODULE);
        match (self.spec.mandatory, labelled) {
            (true, false) => {
                self.labels_mut().insert(
                    labels::IS_MANDATORY_MODULE.to_string(),
                    labels::ENABLED.to_string(),
                );
                true
            }
            (false, true) => {
                self.labels_mut().remove(labels::IS_MANDATORY_MODULE);
                true
            }
            _ => false,
        }
    }
}

/// Name of the template holding `version` of `module`
pub fn template_name(module: &str, version: &str) -> String {
    format!("{module}-{version}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_mandatory_label() {
        let mut template = ModuleTemplate::new(
            "m1-1.0.0",
            ModuleTemplateSpec {
                mandatory: true,
                ..Default::default()
            },
        );
        assert!(template.sync_mandatory_label());
        assert!(!template.sync_mandatory_label());

        template.spec.mandatory = false;
        assert!(template.sync_mandatory_label());
        assert!(!template.labels().contains_key(labels::IS_MANDATORY_MODULE));
        assert!(!template.sync_mandatory_label());
    }

    #[test]
    fn test_visibility_labels() {
        let mut template = ModuleTemplate::new("m1-1.0.0", ModuleTemplateSpec::default());
        assert!(!template.is_beta());

        template
            .labels_mut()
            .insert(labels::BETA.to_string(), "true".to_string());
        assert!(template.is_beta());
        assert!(!template.is_internal());
    }

    #[test]
    fn test_template_name() {
        assert_eq!(template_name("m1", "2.0.0"), "m1-2.0.0");
    }
}

//! Manifest: the applied artifact for one (Kyma, module) pair

use crate::labels;
use crate::State;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Installable unit assembled from a module template
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "operator.kyma-project.io",
    version = "v1beta2",
    kind = "Manifest",
    namespaced,
    status = "ManifestStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ManifestSpec {
    /// Install into the runtime cluster rather than the control plane
    #[serde(default)]
    pub remote: bool,

    /// Module version
    #[serde(default)]
    pub version: String,

    /// Where the raw module manifest comes from
    #[serde(default)]
    pub install: InstallInfo,

    /// Optional configuration layer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ImageSpec>,

    /// Default custom resource to create
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<serde_json::Value>,

    /// Images referenced by the module, for air-gapped installs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub localized_images: Vec<String>,
}

/// Install source of a manifest
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct InstallInfo {
    /// Layer the source was taken from
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub source: ImageSpec,
}

/// OCI location of a descriptor layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ImageSpec {
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "ref", default)]
    pub reference: String,
    #[serde(rename = "type", default)]
    pub ref_type: RefType,
}

/// How `ImageSpec::reference` is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub enum RefType {
    #[default]
    #[serde(rename = "oci-ref")]
    OciRef,
    #[serde(rename = "oci-dir")]
    OciDir,
}

/// Observed installation state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ManifestStatus {
    #[serde(default)]
    pub state: State,
}

impl Manifest {
    /// Whether the manifest was handed over to the user
    pub fn is_unmanaged(&self) -> bool {
        self.annotations()
            .get(labels::UNMANAGED)
            .map(|v| labels::is_enabled(v))
            .unwrap_or(false)
    }

    /// Whether the manifest installs a mandatory module
    pub fn is_mandatory(&self) -> bool {
        self.labels()
            .get(labels::IS_MANDATORY_MODULE)
            .map(|v| labels::is_enabled(v))
            .unwrap_or(false)
    }

    /// Installation state, `Unset` until the manifest controller reports one
    pub fn state(&self) -> State {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }

    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or_default()
    }

    /// Channel label the manifest was assembled for
    pub fn channel(&self) -> Option<&str> {
        self.labels().get(labels::CHANNEL).map(String::as_str)
    }
}

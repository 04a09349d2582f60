//! ModuleReleaseMeta: channel to version assignments of a module

use crate::error::{Result, TypesError};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Release metadata for one module.
///
/// Exactly one of `channels` and `mandatory` is populated.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "operator.kyma-project.io",
    version = "v1beta2",
    kind = "ModuleReleaseMeta",
    namespaced,
    shortname = "mrm"
)]
#[serde(rename_all = "camelCase")]
pub struct ModuleReleaseMetaSpec {
    /// Module the assignments belong to
    pub module_name: String,

    /// Channel to version map
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<ChannelVersionAssignment>,

    /// Fixed version for mandatory modules
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mandatory: Option<Mandatory>,

    /// Only offered to Kymas opted into beta modules
    #[serde(default)]
    pub beta: bool,

    /// Only offered to Kymas opted into internal modules
    #[serde(default)]
    pub internal: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ChannelVersionAssignment {
    pub channel: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Mandatory {
    pub version: String,
}

impl ModuleReleaseMetaSpec {
    /// Check that exactly one of channels/mandatory is set
    pub fn validate(&self) -> Result<()> {
        match (self.channels.is_empty(), self.mandatory.is_some()) {
            (false, true) => Err(TypesError::AmbiguousReleaseMeta {
                module: self.module_name.clone(),
            }),
            (true, false) => Err(TypesError::EmptyReleaseMeta {
                module: self.module_name.clone(),
            }),
            _ => Ok(()),
        }
    }

    /// Version assigned to a channel
    pub fn channel_version(&self, channel: &str) -> Option<&str> {
        self.channels
            .iter()
            .find(|a| a.channel == channel)
            .map(|a| a.version.as_str())
    }

    /// Pinned version of a mandatory module
    pub fn mandatory_version(&self) -> Option<&str> {
        self.mandatory.as_ref().map(|m| m.version.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment(channel: &str, version: &str) -> ChannelVersionAssignment {
        ChannelVersionAssignment {
            channel: channel.to_string(),
            version: version.to_string(),
        }
    }

    #[test]
    fn test_exactly_one_of_channels_and_mandatory() {
        let mut spec = ModuleReleaseMetaSpec {
            module_name: "m1".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            spec.validate(),
            Err(TypesError::EmptyReleaseMeta { .. })
        ));

        spec.channels = vec![assignment("regular", "1.0.0")];
        assert!(spec.validate().is_ok());

        spec.mandatory = Some(Mandatory {
            version: "1.0.0".to_string(),
        });
        assert!(matches!(
            spec.validate(),
            Err(TypesError::AmbiguousReleaseMeta { .. })
        ));

        spec.channels.clear();
        assert!(spec.validate().is_ok());
        assert_eq!(spec.mandatory_version(), Some("1.0.0"));
    }

    #[test]
    fn test_channel_version_lookup() {
        let spec = ModuleReleaseMetaSpec {
            module_name: "m1".to_string(),
            channels: vec![assignment("regular", "2.0.0"), assignment("fast", "2.1.0")],
            ..Default::default()
        };
        assert_eq!(spec.channel_version("fast"), Some("2.1.0"));
        assert_eq!(spec.channel_version("experimental"), None);
    }
}

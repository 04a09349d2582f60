//! Channel and version selection from release metadata

use crate::error::{LifecycleError, Result};
use lifecycle_types::{ModuleReleaseMeta, DEFAULT_CHANNEL};

/// Maps a module's channel onto the version it should run
pub struct ChannelResolver;

impl ChannelResolver {
    /// Module override, then the Kyma channel, then the default channel
    pub fn desired_channel(module_channel: Option<&str>, kyma_channel: &str) -> String {
        match module_channel {
            Some(channel) if !channel.is_empty() => channel.to_string(),
            _ if !kyma_channel.is_empty() => kyma_channel.to_string(),
            _ => DEFAULT_CHANNEL.to_string(),
        }
    }

    /// Mandatory version if pinned, otherwise the version assigned to `channel`
    pub fn desired_version(meta: &ModuleReleaseMeta, channel: &str) -> Result<String> {
        meta.spec.validate()?;

        if let Some(version) = meta.spec.mandatory_version() {
            return Ok(version.to_string());
        }

        meta.spec
            .channel_version(channel)
            .map(str::to_string)
            .ok_or_else(|| {
                LifecycleError::NoTemplatesInListResult(format!(
                    "no versions found for module {} in channel {channel}",
                    meta.spec.module_name
                ))
            })
    }
}

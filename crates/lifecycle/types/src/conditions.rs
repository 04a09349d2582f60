//! Kyma status conditions

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Condition types a Kyma reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KymaConditionType {
    /// All declared modules are ready
    Modules,
    /// The module catalog is synced into the runtime cluster
    ModuleCatalog,
    /// The runtime watcher webhook is installed
    SkrWebhook,
}

impl KymaConditionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KymaConditionType::Modules => "Modules",
            KymaConditionType::ModuleCatalog => "ModuleCatalog",
            KymaConditionType::SkrWebhook => "SKRWebhook",
        }
    }

    /// Human readable message for a condition outcome
    pub fn message(&self, status: ConditionStatus) -> &'static str {
        match (self, status) {
            (KymaConditionType::Modules, ConditionStatus::True) => "all modules are in ready state",
            (KymaConditionType::Modules, ConditionStatus::False) => "not all modules are in ready state",
            (KymaConditionType::ModuleCatalog, ConditionStatus::True) => {
                "module templates are synchronized"
            }
            (KymaConditionType::ModuleCatalog, ConditionStatus::False) => {
                "module templates synchronization failed"
            }
            (KymaConditionType::SkrWebhook, ConditionStatus::True) => {
                "skrwebhook and its resources are installed and ready"
            }
            (KymaConditionType::SkrWebhook, ConditionStatus::False) => {
                "skrwebhook and its resources are not ready"
            }
            (_, ConditionStatus::Unknown) => "condition has not been evaluated yet",
        }
    }
}

impl fmt::Display for KymaConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tri-state condition status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// A single status condition
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KymaCondition {
    /// Condition type, see [`KymaConditionType`]
    #[serde(rename = "type")]
    pub type_: String,

    /// Outcome of the condition
    pub status: ConditionStatus,

    /// Machine readable reason
    #[serde(default)]
    pub reason: String,

    /// Human readable message
    #[serde(default)]
    pub message: String,

    /// Kyma generation the condition was computed for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// RFC3339 timestamp of the last status flip
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

/// Reason attached to every condition this operator writes
pub const CONDITION_REASON: &str = "Ready";

/// Upsert a condition by type. The transition time only moves when the status flips.
pub fn set_condition(conditions: &mut Vec<KymaCondition>, condition: KymaCondition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status != condition.status {
                existing.last_transition_time = condition.last_transition_time;
            }
            existing.status = condition.status;
            existing.reason = condition.reason;
            existing.message = condition.message;
            existing.observed_generation = condition.observed_generation;
        }
        None => conditions.push(condition),
    }
}

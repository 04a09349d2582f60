//! Maintenance-window gating of downtime-requiring module updates

mod policy;

pub use policy::{
    MaintenancePolicyMatch, MaintenancePolicyRule, MaintenanceWindowPolicy, PolicyError,
    ResolveOptions, ResolvedWindow, Runtime, WindowSpec, WindowTime,
};

use chrono::{DateTime, Duration, Utc};
use lifecycle_types::{Kyma, ModuleTemplate};
use std::path::Path;

/// Decides whether a template update has to wait for a maintenance window
pub trait MaintenanceWindow: Send + Sync {
    /// Whether moving to `template` needs a window at all
    fn is_required(&self, template: &ModuleTemplate, kyma: &Kyma) -> bool;

    /// Whether a window is open for the Kyma's runtime right now
    fn is_active(&self, kyma: &Kyma) -> Result<bool, PolicyError>;
}

/// Maintenance windows backed by a policy file
#[derive(Debug, Clone)]
pub struct PolicyMaintenanceWindow {
    policy: Option<MaintenanceWindowPolicy>,
    min_window_size: Duration,
}

impl PolicyMaintenanceWindow {
    pub fn new(policy: Option<MaintenanceWindowPolicy>, min_window_size: Duration) -> Self {
        Self {
            policy,
            min_window_size,
        }
    }

    /// Load `{dir}/{name}.json`; an empty name disables windows
    pub fn from_dir(
        dir: impl AsRef<Path>,
        name: &str,
        min_window_size: Duration,
    ) -> Result<Self, PolicyError> {
        let policy = MaintenanceWindowPolicy::load(dir, name)?;
        Ok(Self::new(policy, min_window_size))
    }

    pub fn has_policy(&self) -> bool {
        self.policy.is_some()
    }

    pub fn is_active_at(&self, kyma: &Kyma, now: DateTime<Utc>) -> Result<bool, PolicyError> {
        let policy = self
            .policy
            .as_ref()
            .ok_or(PolicyError::NoPolicyConfigured)?;

        let options = ResolveOptions {
            time: now,
            ongoing: true,
            min_duration: self.min_window_size,
            ..Default::default()
        };
        let window = policy.resolve(&runtime_of(kyma), &options)?;
        Ok(window.contains(now))
    }
}

fn runtime_of(kyma: &Kyma) -> Runtime {
    Runtime {
        global_account_id: kyma.global_account_id().to_string(),
        plan: kyma.plan().to_string(),
        region: kyma.region().to_string(),
        platform_region: kyma.platform_region().to_string(),
    }
}

impl MaintenanceWindow for PolicyMaintenanceWindow {
    fn is_required(&self, template: &ModuleTemplate, kyma: &Kyma) -> bool {
        if !template.spec.requires_downtime || kyma.spec.skip_maintenance_windows {
            return false;
        }

        // Fresh installs never wait
        match kyma.module_status(&template.spec.module_name) {
            Some(status) => status.version != template.spec.version,
            None => false,
        }
    }

    fn is_active(&self, kyma: &Kyma) -> Result<bool, PolicyError> {
        self.is_active_at(kyma, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lifecycle_types::{labels, KymaSpec, ModuleStatus, ModuleTemplateSpec};
    use kube::ResourceExt;

    const POLICY: &str = r#"{
        "rules": [
            {"match": {"region": "^eu-"}, "windows": [{"days": ["Sat"], "begin": "01:00:00+00:00", "end": "05:00:00+00:00"}]}
        ],
        "default": {"days": ["Sun"], "begin": "10:00:00+00:00", "end": "12:00:00+00:00"}
    }"#;

    fn gate() -> PolicyMaintenanceWindow {
        let policy = MaintenanceWindowPolicy::from_json(POLICY.as_bytes()).unwrap();
        PolicyMaintenanceWindow::new(Some(policy), Duration::minutes(20))
    }

    fn template(version: &str, requires_downtime: bool) -> ModuleTemplate {
        ModuleTemplate::new(
            &format!("m1-{version}"),
            ModuleTemplateSpec {
                module_name: "m1".to_string(),
                version: version.to_string(),
                requires_downtime,
                ..Default::default()
            },
        )
    }

    fn kyma_with_installed(version: Option<&str>) -> Kyma {
        let mut kyma = Kyma::new("k1", KymaSpec::default());
        if let Some(version) = version {
            kyma.status_mut().modules.push(ModuleStatus {
                name: "m1".to_string(),
                version: version.to_string(),
                ..Default::default()
            });
        }
        kyma
    }

    fn utc(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_is_required_only_for_downtime_upgrades() {
        let gate = gate();
        let installed = kyma_with_installed(Some("1.0.0"));

        assert!(!gate.is_required(&template("2.0.0", false), &installed));
        assert!(gate.is_required(&template("2.0.0", true), &installed));
        assert!(!gate.is_required(&template("1.0.0", true), &installed));
        assert!(!gate.is_required(&template("2.0.0", true), &kyma_with_installed(None)));

        let mut skipping = installed.clone();
        skipping.spec.skip_maintenance_windows = true;
        assert!(!gate.is_required(&template("2.0.0", true), &skipping));
    }

    #[test]
    fn test_is_active_uses_runtime_labels() {
        let gate = gate();
        let mut kyma = kyma_with_installed(Some("1.0.0"));

        // Saturday 02:00
        let saturday = utc("2024-01-06T02:00:00Z");
        assert!(!gate.is_active_at(&kyma, saturday).unwrap());

        kyma.labels_mut()
            .insert(labels::REGION.to_string(), "eu-west-1".to_string());
        assert!(gate.is_active_at(&kyma, saturday).unwrap());

        // Too close to the end of the window
        assert!(!gate.is_active_at(&kyma, utc("2024-01-06T04:50:00Z")).unwrap());
    }

    #[test]
    fn test_is_active_without_policy_fails() {
        let gate = PolicyMaintenanceWindow::new(None, Duration::minutes(20));
        assert!(!gate.has_policy());
        assert_eq!(
            gate.is_active(&kyma_with_installed(None)),
            Err(PolicyError::NoPolicyConfigured)
        );
    }
}

//! Kyma controller loop
//!
//! Watches Kymas and the Manifests they own. Every event runs one engine pass:
//! the delete path once a deletion timestamp is set, the install path otherwise.

use crate::config::LifecycleConfig;
use crate::error::{DaemonError, DaemonResult};
use crate::kube_client::KubeCluster;
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use lifecycle_engine::{
    CachedDescriptorProvider, ConvergenceStateMachine, PolicyMaintenanceWindow, Requeue,
    RequeueIntervals,
};
use lifecycle_types::{Kyma, Manifest};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Delay used for "requeue right away", leaves room for the watch cache to catch up
pub const IMMEDIATE_REQUEUE: Duration = Duration::from_millis(500);

/// Shared state of the reconcilers
pub struct Context {
    engine: ConvergenceStateMachine,
    intervals: RequeueIntervals,
}

impl Context {
    pub fn new(engine: ConvergenceStateMachine) -> Self {
        let intervals = *engine.intervals();
        Self { engine, intervals }
    }
}

/// Translate an engine decision into a controller action
pub fn to_action(requeue: Requeue) -> Action {
    match requeue {
        Requeue::Never => Action::await_change(),
        Requeue::Immediately => Action::requeue(IMMEDIATE_REQUEUE),
        Requeue::After(interval) => Action::requeue(interval),
    }
}

/// Run one pass for a Kyma
#[instrument(skip(kyma, ctx), fields(kyma = %kyma.name_any()))]
pub async fn reconcile(kyma: Arc<Kyma>, ctx: Arc<Context>) -> DaemonResult<Action> {
    let name = kyma.name_any();
    let namespace = kyma
        .namespace()
        .ok_or_else(|| DaemonError::MissingNamespace(name.clone()))?;

    let requeue = if kyma.is_deleting() {
        ctx.engine.reconcile_delete(&namespace, &name).await?
    } else {
        ctx.engine.reconcile_install(&namespace, &name).await?
    };

    debug!(?requeue, "pass finished");
    Ok(to_action(requeue))
}

/// Requeue policy for failed passes
pub fn error_policy(kyma: Arc<Kyma>, error: &DaemonError, ctx: Arc<Context>) -> Action {
    if error.is_waiting_for_manifests() {
        debug!(kyma = %kyma.name_any(), "waiting for manifests to be deleted");
        return Action::requeue(ctx.intervals.busy);
    }

    warn!(
        kyma = %kyma.name_any(),
        error = %error,
        "reconciliation failed"
    );
    Action::requeue(ctx.intervals.error)
}

/// Build the engine from configuration and kube-backed collaborators
pub fn build_engine(client: Client, config: &LifecycleConfig) -> DaemonResult<ConvergenceStateMachine> {
    let cluster = Arc::new(KubeCluster::new(client));

    let mut engine = ConvergenceStateMachine::new(
        cluster.clone(),
        cluster.clone(),
        cluster.clone(),
        cluster,
        Arc::new(CachedDescriptorProvider::new()),
        config.engine_config(),
    );

    if config.maintenance.enabled() {
        let window = PolicyMaintenanceWindow::from_dir(
            &config.maintenance.policy_dir,
            &config.maintenance.policy_name,
            config.maintenance.min_window(),
        )?;
        info!(
            policy = %config.maintenance.policy_name,
            "maintenance windows enabled"
        );
        engine = engine.with_maintenance_window(Arc::new(window));
    }

    if config.remote.in_kcp_mode {
        warn!("no runtime cluster access configured, kymas are not synced to runtime clusters");
    }

    Ok(engine)
}

/// Run the controller until a shutdown signal arrives
pub async fn run(client: Client, config: LifecycleConfig) -> DaemonResult<()> {
    let engine = build_engine(client.clone(), &config)?;
    let ctx = Arc::new(Context::new(engine));

    let namespace = &config.controller.namespace;
    let kymas = Api::<Kyma>::namespaced(client.clone(), namespace);
    let manifests = Api::<Manifest>::namespaced(client, namespace);

    info!(
        namespace = %namespace,
        concurrency = config.controller.max_concurrent_reconciles,
        kcp_mode = config.remote.in_kcp_mode,
        "starting kyma controller"
    );

    Controller::new(kymas, watcher::Config::default())
        .owns(manifests, watcher::Config::default())
        .with_config(
            controller::Config::default().concurrency(config.controller.max_concurrent_reconciles),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((kyma, _)) => debug!(kyma = %kyma.name, "reconciled"),
                Err(e) => debug!(error = %e, "reconcile failed"),
            }
        })
        .await;

    info!("controller terminated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lifecycle_engine::{EngineConfig, InMemoryCluster, LifecycleError};
    use lifecycle_types::{KymaSpec, State};

    const NS: &str = "kcp-system";

    fn context(cluster: &Arc<InMemoryCluster>) -> Arc<Context> {
        let engine = ConvergenceStateMachine::new(
            cluster.clone(),
            cluster.clone(),
            cluster.clone(),
            cluster.clone(),
            Arc::new(CachedDescriptorProvider::new()),
            EngineConfig::default(),
        );
        Arc::new(Context::new(engine))
    }

    fn kyma() -> Kyma {
        let mut kyma = Kyma::new(
            "k1",
            KymaSpec {
                channel: "regular".to_string(),
                ..Default::default()
            },
        );
        kyma.metadata.namespace = Some(NS.to_string());
        kyma
    }

    #[test]
    fn test_requeue_to_action() {
        assert_eq!(to_action(Requeue::Never), Action::await_change());
        assert_eq!(to_action(Requeue::Immediately), Action::requeue(IMMEDIATE_REQUEUE));
        assert_eq!(
            to_action(Requeue::After(Duration::from_secs(30))),
            Action::requeue(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_error_policy_intervals() {
        let cluster = Arc::new(InMemoryCluster::new());
        let ctx = context(&cluster);
        let kyma = Arc::new(kyma());

        let waiting = DaemonError::from(LifecycleError::ManifestsStillExist);
        assert_eq!(
            error_policy(kyma.clone(), &waiting, ctx.clone()),
            Action::requeue(Duration::from_secs(5))
        );

        let failed = DaemonError::from(LifecycleError::Internal("boom".to_string()));
        assert_eq!(
            error_policy(kyma, &failed, ctx),
            Action::requeue(Duration::from_secs(2))
        );
    }

    #[tokio::test]
    async fn test_reconcile_dispatches_on_deletion() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.insert_kyma(kyma());
        let ctx = context(&cluster);

        // Finalizer pass, then the initial state pass
        let stored = Arc::new(cluster.kyma(NS, "k1").unwrap());
        let action = reconcile(stored, ctx.clone()).await.unwrap();
        assert_eq!(action, Action::requeue(IMMEDIATE_REQUEUE));

        let stored = Arc::new(cluster.kyma(NS, "k1").unwrap());
        reconcile(stored, ctx.clone()).await.unwrap();
        assert_eq!(cluster.kyma(NS, "k1").unwrap().state(), State::Processing);

        cluster.mark_kyma_deleted(NS, "k1");
        let stored = Arc::new(cluster.kyma(NS, "k1").unwrap());
        let action = reconcile(stored, ctx).await.unwrap();
        assert_eq!(action, Action::requeue(IMMEDIATE_REQUEUE));
        assert_eq!(cluster.kyma(NS, "k1").unwrap().state(), State::Deleting);
    }

    #[tokio::test]
    async fn test_reconcile_requires_namespace() {
        let cluster = Arc::new(InMemoryCluster::new());
        let ctx = context(&cluster);
        let mut orphan = kyma();
        orphan.metadata.namespace = None;

        let err = reconcile(Arc::new(orphan), ctx).await.unwrap_err();
        assert!(matches!(err, DaemonError::MissingNamespace(_)));
    }
}

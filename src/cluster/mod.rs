//! The cluster aggregate. Whether the control plane was provisioned by us is decided once, when
//! the cluster is constructed, by checking for the cluster's root stack. Callers get back a
//! `Box<dyn Cluster>` and never need to know which variant they have.
mod owned;
mod unowned;

pub use self::owned::OwnedCluster;
pub use self::unowned::UnownedCluster;

use crate::config::{ClusterConfig, ReconcilerConfig, WaitConfig};
use crate::control_plane::{refresh_cluster_status, ControlPlane};
use crate::error::{Error, ReconcileError};
use crate::kube::{KubeClient, KubeClientProvider, UpdateKubeProxyTask};
use crate::nodegroup::NodeGroupManager;
use crate::runner::{RunReport, Task, TaskContext, TaskOutcome, TaskTree};
use crate::stack::{ResourceKind, StackBackend, StackManager};

use async_trait::async_trait;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait Cluster: Send + Sync {
    /// Upgrades the control plane to the version in the cluster config, and then brings
    /// kube-proxy in line with it
    async fn upgrade(&self, dry_run: bool) -> Result<RunReport, Error>;

    /// Deletes the cluster along with everything we manage for it. Stack convergence is
    /// polled every `wait_interval`.
    async fn delete(&self, wait_interval: Duration, wait: bool) -> Result<RunReport, Error>;
}

/// The collaborators needed to work with a cluster. Cloning is cheap.
#[derive(Clone)]
pub struct ClusterProvider {
    pub control_plane: Arc<dyn ControlPlane>,
    pub stack_backend: Arc<dyn StackBackend>,
    pub kube_clients: Arc<dyn KubeClientProvider>,
}

/// Resolves the ownership of the cluster and returns the matching variant. Fails if the
/// cluster does not exist.
pub async fn new(
    cfg: ClusterConfig,
    provider: &ClusterProvider,
    config: ReconcilerConfig,
) -> Result<Box<dyn Cluster>, Error> {
    let summary = refresh_cluster_status(&*provider.control_plane, &cfg.metadata.name).await?;

    let stacks = StackManager::new(provider.stack_backend.clone(), config);
    let has_cluster_stack = stacks
        .has_cluster_stack()
        .await
        .map_err(ReconcileError::from)?;

    if has_cluster_stack {
        log::debug!("Cluster {:?} was created by stackctl", cfg.metadata.name);
        return Ok(Box::new(OwnedCluster::new(cfg, summary, provider.clone(), stacks)));
    }
    log::debug!("Cluster {:?} was not created by stackctl", cfg.metadata.name);

    let kube = provider.kube_clients.client_for(&summary)?;
    Ok(Box::new(UnownedCluster::new(
        cfg,
        summary,
        provider.control_plane.clone(),
        kube,
        stacks,
    )))
}

fn wait_config(stacks: &StackManager, wait_interval: Duration) -> WaitConfig {
    WaitConfig::fixed_interval(wait_interval).with_timeout(stacks.config().wait.timeout)
}

/// Builds the upgrade chain shared by both variants: the control plane first, then kube-proxy.
/// Kube-proxy must never be updated ahead of the control plane.
fn upgrade_tasks(
    control_plane: Arc<dyn ControlPlane>,
    cfg: &ClusterConfig,
    current_version: &str,
    kube: Arc<dyn KubeClient>,
) -> TaskTree {
    let desired = cfg
        .metadata
        .version
        .clone()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| current_version.to_owned());
    TaskTree::sequential_stop_on_error()
        .with_task(UpgradeControlPlaneTask {
            control_plane,
            cluster: cfg.metadata.name.clone(),
            current_version: current_version.to_owned(),
            desired_version: desired.clone(),
        })
        .with_task(UpdateKubeProxyTask::new(kube, desired))
}

/// The first two delete phases shared by both variants: every node group, and then every
/// add-on and service account stack. Both phases always wait, since the cluster can only be
/// removed once they are gone.
async fn delete_resource_phases(
    control_plane: Arc<dyn ControlPlane>,
    stacks: &StackManager,
    cfg: &ClusterConfig,
) -> Result<Vec<TaskTree>, ReconcileError> {
    let nodegroups = NodeGroupManager::new(control_plane, stacks.clone());
    let nodegroup_tasks = nodegroups
        .delete_tasks(&cfg.node_groups, &cfg.managed_node_groups, true)
        .await?;

    let mut stack_names = BTreeSet::new();
    for kind in &[ResourceKind::Addon, ResourceKind::IamServiceAccount] {
        for stack in stacks.list_stacks_of_kind(*kind).await? {
            stack_names.insert(stack.name);
        }
    }
    let mut stack_tasks = TaskTree::parallel();
    for name in stack_names {
        stack_tasks.append(DeleteStackTask {
            stacks: stacks.clone(),
            stack_name: name,
            wait: true,
        });
    }
    Ok(vec![nodegroup_tasks, stack_tasks])
}

struct UpgradeControlPlaneTask {
    control_plane: Arc<dyn ControlPlane>,
    cluster: String,
    current_version: String,
    desired_version: String,
}

#[async_trait]
impl Task for UpgradeControlPlaneTask {
    fn describe(&self) -> String {
        format!(
            "upgrade cluster {:?} control plane to version {:?}",
            self.cluster, self.desired_version
        )
    }

    async fn run(&self, ctx: &TaskContext) -> Result<TaskOutcome, Error> {
        if self.current_version == self.desired_version {
            log::info!(
                "cluster {:?} control plane is already at version {}",
                self.cluster,
                self.current_version
            );
            return Ok(TaskOutcome::Unchanged);
        }
        if ctx.plan_mode() {
            return Ok(TaskOutcome::Planned(format!(
                "would upgrade cluster {:?} control plane from version {} to {}",
                self.cluster, self.current_version, self.desired_version
            )));
        }
        log::info!(
            "upgrading cluster {:?} control plane from version {} to {}",
            self.cluster,
            self.current_version,
            self.desired_version
        );
        self.control_plane
            .update_cluster_version(&self.cluster, &self.desired_version)
            .await
            .map_err(|e| ReconcileError::remote("update cluster version", self.cluster.as_str(), e))?;
        Ok(TaskOutcome::Completed)
    }
}

pub struct DeleteStackTask {
    stacks: StackManager,
    stack_name: String,
    wait: bool,
}

#[async_trait]
impl Task for DeleteStackTask {
    fn describe(&self) -> String {
        format!("delete stack {:?}", self.stack_name)
    }

    async fn run(&self, ctx: &TaskContext) -> Result<TaskOutcome, Error> {
        if ctx.plan_mode() {
            return Ok(TaskOutcome::Planned(format!(
                "would delete stack {:?}",
                self.stack_name
            )));
        }
        let op = self
            .stacks
            .delete_stack_by_name(&self.stack_name, self.wait)
            .await
            .map_err(ReconcileError::from)?;
        Ok(op.into())
    }
}

use super::{delete_resource_phases, upgrade_tasks, wait_config, Cluster, ClusterProvider, DeleteStackTask};
use crate::config::ClusterConfig;
use crate::control_plane::ClusterSummary;
use crate::error::{Error, ReconcileError};
use crate::runner::{RunReport, TaskTree};
use crate::stack::StackManager;

use async_trait::async_trait;

use std::time::Duration;

/// A cluster whose control plane was provisioned by us, and so has a root stack
pub struct OwnedCluster {
    cfg: ClusterConfig,
    summary: ClusterSummary,
    provider: ClusterProvider,
    stacks: StackManager,
}

impl OwnedCluster {
    pub fn new(
        cfg: ClusterConfig,
        summary: ClusterSummary,
        provider: ClusterProvider,
        stacks: StackManager,
    ) -> OwnedCluster {
        OwnedCluster {
            cfg,
            summary,
            provider,
            stacks,
        }
    }

    /// The root stack must not be in the middle of another operation
    async fn ensure_stack_is_stable(&self) -> Result<(), ReconcileError> {
        let name = self.stacks.cluster_stack_name();
        let stack = self
            .stacks
            .describe_stack(&name)
            .await?
            .ok_or_else(|| ReconcileError::not_found("stack", name.as_str()))?;
        if !stack.status.is_stable() {
            return Err(ReconcileError::validation(format!(
                "cluster stack {:?} is in state {}, try again once it has finished",
                name, stack.status
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Cluster for OwnedCluster {
    async fn upgrade(&self, dry_run: bool) -> Result<RunReport, Error> {
        self.ensure_stack_is_stable().await?;
        let kube = self.provider.kube_clients.client_for(&self.summary)?;
        let tasks = upgrade_tasks(
            self.provider.control_plane.clone(),
            &self.cfg,
            &self.summary.version,
            kube,
        );
        let subject = format!("cluster {:?}", self.cfg.metadata.name);
        tasks.do_all(dry_run).await.into_result("upgrade", &subject)
    }

    async fn delete(&self, wait_interval: Duration, wait: bool) -> Result<RunReport, Error> {
        let stacks = self.stacks.with_wait(wait_config(&self.stacks, wait_interval));
        let mut tasks = TaskTree::sequential_stop_on_error();
        for phase in delete_resource_phases(self.provider.control_plane.clone(), &stacks, &self.cfg).await? {
            tasks.append_tree(phase);
        }
        tasks.append(DeleteStackTask {
            stacks: stacks.clone(),
            stack_name: stacks.cluster_stack_name(),
            wait,
        });
        let subject = format!("cluster {:?}", self.cfg.metadata.name);
        tasks.do_all(false).await.into_result("delete", &subject)
    }
}

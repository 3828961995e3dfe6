use super::{delete_resource_phases, upgrade_tasks, wait_config, Cluster};
use crate::config::{ClusterConfig, WaitConfig};
use crate::control_plane::{ClusterStatus, ClusterSummary, ControlPlane};
use crate::error::{Error, ReconcileError};
use crate::kube::KubeClient;
use crate::runner::{duration_to_millis, RunReport, Task, TaskContext, TaskOutcome, TaskTree};
use crate::stack::wait::new_backoff;
use crate::stack::StackManager;

use async_trait::async_trait;
use backoff::backoff::Backoff;

use std::sync::Arc;
use std::time::{Duration, Instant};

/// A cluster that was created by some other tool. We may still manage its node groups and
/// add-on roles, but the control plane itself is deleted directly.
pub struct UnownedCluster {
    cfg: ClusterConfig,
    summary: ClusterSummary,
    control_plane: Arc<dyn ControlPlane>,
    kube: Arc<dyn KubeClient>,
    stacks: StackManager,
}

impl UnownedCluster {
    pub fn new(
        cfg: ClusterConfig,
        summary: ClusterSummary,
        control_plane: Arc<dyn ControlPlane>,
        kube: Arc<dyn KubeClient>,
        stacks: StackManager,
    ) -> UnownedCluster {
        UnownedCluster {
            cfg,
            summary,
            control_plane,
            kube,
            stacks,
        }
    }
}

#[async_trait]
impl Cluster for UnownedCluster {
    async fn upgrade(&self, dry_run: bool) -> Result<RunReport, Error> {
        let tasks = upgrade_tasks(
            self.control_plane.clone(),
            &self.cfg,
            &self.summary.version,
            self.kube.clone(),
        );
        let subject = format!("cluster {:?}", self.cfg.metadata.name);
        tasks.do_all(dry_run).await.into_result("upgrade", &subject)
    }

    async fn delete(&self, wait_interval: Duration, wait: bool) -> Result<RunReport, Error> {
        let wait_config = wait_config(&self.stacks, wait_interval);
        let stacks = self.stacks.with_wait(wait_config.clone());
        let mut tasks = TaskTree::sequential_stop_on_error();
        for phase in delete_resource_phases(self.control_plane.clone(), &stacks, &self.cfg).await? {
            tasks.append_tree(phase);
        }
        tasks.append(DeleteClusterTask {
            control_plane: self.control_plane.clone(),
            cluster: self.cfg.metadata.name.clone(),
            wait,
            wait_config,
        });
        let subject = format!("cluster {:?}", self.cfg.metadata.name);
        tasks.do_all(false).await.into_result("delete", &subject)
    }
}

pub(super) struct DeleteClusterTask {
    pub(super) control_plane: Arc<dyn ControlPlane>,
    pub(super) cluster: String,
    pub(super) wait: bool,
    pub(super) wait_config: WaitConfig,
}

impl DeleteClusterTask {
    /// The control plane has no status for a deleted cluster, only its absence. Polls until the
    /// cluster is gone, it has failed, or the wait times out.
    async fn wait_for_removal(&self) -> Result<(), ReconcileError> {
        let start_time = Instant::now();
        let mut backoff = new_backoff(&self.wait_config);
        loop {
            let summary = self
                .control_plane
                .describe_cluster(&self.cluster)
                .await
                .map_err(|e| ReconcileError::remote("describe cluster", self.cluster.as_str(), e))?;
            match summary {
                None => {
                    log::debug!(
                        "cluster {:?} was removed after {}ms",
                        self.cluster,
                        duration_to_millis(start_time.elapsed())
                    );
                    return Ok(());
                }
                Some(summary) if summary.status == ClusterStatus::Failed => {
                    return Err(ReconcileError::FailedState {
                        kind: "cluster",
                        name: self.cluster.clone(),
                        state: summary.status.to_string(),
                    });
                }
                Some(_) => match backoff.next_backoff() {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => {
                        return Err(ReconcileError::Timeout {
                            kind: "cluster",
                            name: self.cluster.clone(),
                            elapsed: start_time.elapsed(),
                        });
                    }
                },
            }
        }
    }
}

#[async_trait]
impl Task for DeleteClusterTask {
    fn describe(&self) -> String {
        format!("delete cluster {:?}", self.cluster)
    }

    async fn run(&self, ctx: &TaskContext) -> Result<TaskOutcome, Error> {
        if ctx.plan_mode() {
            return Ok(TaskOutcome::Planned(format!("would delete cluster {:?}", self.cluster)));
        }
        self.control_plane
            .delete_cluster(&self.cluster)
            .await
            .map_err(|e| ReconcileError::remote("delete cluster", self.cluster.as_str(), e))?;
        if self.wait {
            log::debug!("waiting for cluster {:?} to be removed", self.cluster);
            self.wait_for_removal().await?;
            return Ok(TaskOutcome::Completed);
        }
        Ok(TaskOutcome::Initiated)
    }
}

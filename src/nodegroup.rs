//! Deletes node groups. Node groups that we created have a stack, and are torn down by deleting
//! it. Managed node groups may also have been created outside of this tool, in which case they
//! have no stack and are deleted directly through the control plane. Both kinds end up in the
//! same task tree, so that they share one run and one error report.
use crate::config::{ManagedNodeGroup, NodeGroup};
use crate::control_plane::ControlPlane;
use crate::error::{Error, ReconcileError};
use crate::runner::{RunReport, Task, TaskContext, TaskOutcome, TaskTree};
use crate::stack::{ResourceKind, StackManager};

use async_trait::async_trait;

use std::collections::HashSet;
use std::sync::Arc;

#[derive(Clone)]
pub struct NodeGroupManager {
    control_plane: Arc<dyn ControlPlane>,
    stacks: StackManager,
}

impl NodeGroupManager {
    pub fn new(control_plane: Arc<dyn ControlPlane>, stacks: StackManager) -> NodeGroupManager {
        NodeGroupManager {
            control_plane,
            stacks,
        }
    }

    /// Lists every nodegroup stack of the cluster, once
    async fn stack_names(&self) -> Result<HashSet<String>, ReconcileError> {
        let stacks = self
            .stacks
            .list_stacks_of_kind(ResourceKind::NodeGroup)
            .await?;
        Ok(stacks.into_iter().map(|s| s.name).collect())
    }

    /// Partitions the node groups into those that are deleted by deleting their stack, and
    /// managed node groups without a stack, which are deleted through the control plane. All
    /// unmanaged node groups are assumed to have a stack.
    pub async fn delete_tasks(
        &self,
        node_groups: &[NodeGroup],
        managed_node_groups: &[ManagedNodeGroup],
        wait: bool,
    ) -> Result<TaskTree, ReconcileError> {
        let has_stack = self.stack_names().await?;

        let mut with_stacks = node_groups
            .iter()
            .map(|ng| ng.name.as_str())
            .collect::<Vec<_>>();
        let mut without_stacks = Vec::new();
        for ng in managed_node_groups {
            let stack_name = self.stacks.stack_name(ResourceKind::NodeGroup, &ng.name);
            if has_stack.contains(&stack_name) {
                with_stacks.push(ng.name.as_str());
            } else {
                without_stacks.push(ng.name.as_str());
            }
        }

        let mut tasks = TaskTree::parallel();
        for name in with_stacks {
            tasks.append(DeleteNodeGroupStackTask {
                stacks: self.stacks.clone(),
                nodegroup: name.to_owned(),
                stack_name: self.stacks.stack_name(ResourceKind::NodeGroup, name),
                wait,
            });
        }
        for name in without_stacks {
            tasks.append(DeleteUnownedNodegroupTask {
                control_plane: self.control_plane.clone(),
                cluster: self.stacks.config().cluster_name.clone(),
                nodegroup: name.to_owned(),
            });
        }
        Ok(tasks)
    }

    /// Builds and runs the delete tasks, summarizing any failures into a single error
    pub async fn delete(
        &self,
        node_groups: &[NodeGroup],
        managed_node_groups: &[ManagedNodeGroup],
        wait: bool,
        plan: bool,
    ) -> Result<RunReport, Error> {
        let tasks = self
            .delete_tasks(node_groups, managed_node_groups, wait)
            .await?;
        tasks.do_all(plan).await.into_result("delete", "nodegroup(s)")
    }
}

pub struct DeleteNodeGroupStackTask {
    stacks: StackManager,
    nodegroup: String,
    stack_name: String,
    wait: bool,
}

#[async_trait]
impl Task for DeleteNodeGroupStackTask {
    fn describe(&self) -> String {
        format!("delete nodegroup {:?}", self.nodegroup)
    }

    async fn run(&self, ctx: &TaskContext) -> Result<TaskOutcome, Error> {
        let stack = self
            .stacks
            .describe_stack(&self.stack_name)
            .await
            .map_err(ReconcileError::from)?;
        if stack.is_none() {
            log::warn!(
                "stack {:?} for nodegroup {:?} was not found",
                self.stack_name,
                self.nodegroup
            );
            return Ok(TaskOutcome::Unchanged);
        }
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

/// Deletes a managed node group that has no stack, directly through the control plane. The
/// control plane does not report the progress of a node group deletion, so this never waits,
/// whatever was requested for the stack-backed groups, and always reports `Initiated`.
pub struct DeleteUnownedNodegroupTask {
    control_plane: Arc<dyn ControlPlane>,
    cluster: String,
    nodegroup: String,
}

#[async_trait]
impl Task for DeleteUnownedNodegroupTask {
    fn describe(&self) -> String {
        format!("delete unowned nodegroup {:?}", self.nodegroup)
    }

    async fn run(&self, ctx: &TaskContext) -> Result<TaskOutcome, Error> {
        if ctx.plan_mode() {
            return Ok(TaskOutcome::Planned(format!(
                "would delete nodegroup {:?} via the control plane",
                self.nodegroup
            )));
        }
        self.control_plane
            .delete_nodegroup(&self.cluster, &self.nodegroup)
            .await
            .map_err(|e| ReconcileError::remote("delete nodegroup", self.nodegroup.as_str(), e))?;
        log::debug!("deleted nodegroup {:?}", self.nodegroup);
        Ok(TaskOutcome::Initiated)
    }
}

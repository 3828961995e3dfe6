use super::AddonManager;
use crate::config::Addon;
use crate::error::{Error, ReconcileError};
use crate::runner::{Task, TaskContext, TaskOutcome};
use crate::stack::StackNames;

use async_trait::async_trait;

/// Deletes the add-on through the control plane. An add-on that is already gone is not an
/// error, so that the stack cleanup that follows still gets a chance to run.
pub struct DeleteAddonTask {
    manager: AddonManager,
    addon: Addon,
}

impl DeleteAddonTask {
    pub fn new(manager: AddonManager, addon: Addon) -> DeleteAddonTask {
        DeleteAddonTask { manager, addon }
    }
}

#[async_trait]
impl Task for DeleteAddonTask {
    fn describe(&self) -> String {
        format!("delete addon {:?}", self.addon.name)
    }

    async fn run(&self, ctx: &TaskContext) -> Result<TaskOutcome, Error> {
        let manager = &self.manager;
        let name = self.addon.canonical_name();
        log::debug!("addon: {:?}", self.addon);

        let existing = manager
            .control_plane
            .describe_addon(manager.cluster_name(), &name)
            .await
            .map_err(|e| ReconcileError::remote("describe addon", name.as_str(), e))?;
        if existing.is_none() {
            log::warn!("addon {:?} was not found, nothing to delete", name);
            return Ok(TaskOutcome::Unchanged);
        }

        if ctx.plan_mode() {
            return Ok(TaskOutcome::Planned(format!("would delete addon {:?}", name)));
        }

        log::info!("deleting addon: {}", name);
        manager
            .control_plane
            .delete_addon(manager.cluster_name(), &name)
            .await
            .map_err(|e| ReconcileError::remote("delete addon", name.as_str(), e))?;
        log::info!("deleted addon: {}", name);
        Ok(TaskOutcome::Completed)
    }
}

/// Deletes the IAM stack that backs the add-on's role, if there is one
pub struct DeleteAddonStackTask {
    manager: AddonManager,
    addon: Addon,
    wait: bool,
}

impl DeleteAddonStackTask {
    pub fn new(manager: AddonManager, addon: Addon, wait: bool) -> DeleteAddonStackTask {
        DeleteAddonStackTask {
            manager,
            addon,
            wait,
        }
    }
}

#[async_trait]
impl Task for DeleteAddonStackTask {
    fn describe(&self) -> String {
        format!("delete IAM stack for addon {:?}", self.addon.name)
    }

    async fn run(&self, ctx: &TaskContext) -> Result<TaskOutcome, Error> {
        let stacks = &self.manager.stacks;
        let stack_name = self.manager.stack_name(&self.addon);
        let existing = stacks
            .list_stacks_matching(&StackNames::exact_pattern(&stack_name))
            .await
            .map_err(ReconcileError::from)?;
        if existing.is_empty() {
            log::info!("no associated IAM stacks found");
            return Ok(TaskOutcome::Unchanged);
        }

        if ctx.plan_mode() {
            return Ok(TaskOutcome::Planned(format!(
                "would delete IAM stack {:?}",
                stack_name
            )));
        }

        log::info!("deleting associated IAM stacks");
        let op = stacks
            .delete_stack_by_name(&stack_name, self.wait)
            .await
            .map_err(ReconcileError::from)?;
        Ok(op.into())
    }
}

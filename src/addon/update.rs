use super::{known_service_account_location, AddonManager};
use crate::config::Addon;
use crate::control_plane::{AddonSummary, ResolveConflicts, UpdateAddonInput};
use crate::error::{Error, ReconcileError};
use crate::runner::{Task, TaskContext, TaskOutcome};
use crate::stack::{
    CreateStackInput, ResourceKind, StackError, StackNames, StackOperation, TemplateBody,
    UpdateStackInput,
};
use crate::template::{build_iam_role_template, RoleTemplateInput};

use async_trait::async_trait;

use std::collections::BTreeMap;

const CHANGE_SET_NAME: &str = "updating-policy";
const CHANGE_DESCRIPTION: &str = "updating policies";

/// What happened, or in plan mode what would happen, to the stack backing the add-on's role
#[derive(Debug, Clone, Copy, PartialEq)]
enum StackAction {
    Created,
    Updated,
    Unchanged,
    WouldCreate,
    WouldUpdate,
}

#[derive(Debug, Clone, PartialEq)]
enum RoleSource {
    Explicit,
    Stack { name: String, action: StackAction },
    Preserved,
}

/// The role that the add-on should run with. `arn` is only `None` when the add-on has no role,
/// or in plan mode when the role would come from a stack that does not exist yet.
#[derive(Debug, Clone, PartialEq)]
struct ResolvedRole {
    arn: Option<String>,
    source: RoleSource,
}

impl ResolvedRole {
    fn stack_pending(&self) -> bool {
        matches!(
            self.source,
            RoleSource::Stack {
                action: StackAction::WouldCreate,
                ..
            } | RoleSource::Stack {
                action: StackAction::WouldUpdate,
                ..
            }
        )
    }

    fn stack_changed(&self) -> bool {
        matches!(
            self.source,
            RoleSource::Stack {
                action: StackAction::Created,
                ..
            } | RoleSource::Stack {
                action: StackAction::Updated,
                ..
            }
        )
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_owned())
    }
}

impl AddonManager {
    /// Converges a single add-on. The role ARN comes from exactly one of: the explicit
    /// `serviceAccountRoleARN`, a stack built from the add-on's policies, or the role that is
    /// currently bound to the add-on. The update is skipped entirely if neither the version
    /// nor the role would change.
    pub async fn update(&self, addon: &Addon, plan_mode: bool) -> Result<TaskOutcome, ReconcileError> {
        log::debug!("addon: {:?}", addon);
        if addon.service_account_role_arn.is_empty() && addon.has_policies() {
            // the template only depends on local inputs, so it is rendered before any remote call
            self.render_template(addon)?;
        }
        let summary = self.get(addon).await?;
        let version = resolve_version(addon, &summary);
        let role = self.resolve_role(addon, &summary, plan_mode).await?;

        let version_changed = version != summary.version;
        let role_changed = role.arn != non_empty(&summary.iam_role);
        if !version_changed && !role_changed && !role.stack_pending() {
            log::info!("addon {:?} is already up-to-date", addon.canonical_name());
            return if role.stack_changed() {
                Ok(TaskOutcome::Completed)
            } else {
                Ok(TaskOutcome::Unchanged)
            };
        }

        let input = UpdateAddonInput {
            cluster_name: self.cluster_name().to_owned(),
            addon_name: addon.canonical_name(),
            version,
            service_account_role_arn: role.arn.clone(),
            resolve_conflicts: if addon.force {
                log::debug!("setting resolve conflicts to overwrite");
                Some(ResolveConflicts::Overwrite)
            } else {
                None
            },
        };

        if plan_mode {
            let message = plan_message(&input, &role);
            log::info!("(plan) {}", message);
            return Ok(TaskOutcome::Planned(message));
        }

        log::info!("updating addon {:?}", input.addon_name);
        log::debug!("{}", input);
        let addon_name = input.addon_name.clone();
        self.control_plane
            .update_addon(input)
            .await
            .map_err(|e| ReconcileError::remote("update addon", addon_name, e))?;
        Ok(TaskOutcome::Completed)
    }

    async fn resolve_role(
        &self,
        addon: &Addon,
        summary: &AddonSummary,
        plan_mode: bool,
    ) -> Result<ResolvedRole, ReconcileError> {
        if !addon.service_account_role_arn.is_empty() {
            return Ok(ResolvedRole {
                arn: Some(addon.service_account_role_arn.clone()),
                source: RoleSource::Explicit,
            });
        }
        if addon.has_policies() {
            return self.update_with_new_policies(addon, plan_mode).await;
        }
        // preserve the current role, if there is one
        Ok(ResolvedRole {
            arn: non_empty(&summary.iam_role),
            source: RoleSource::Preserved,
        })
    }

    async fn update_with_new_policies(
        &self,
        addon: &Addon,
        plan_mode: bool,
    ) -> Result<ResolvedRole, ReconcileError> {
        let stack_name = self.stack_name(addon);
        let template = self.render_template(addon)?;
        let pattern = StackNames::exact_pattern(&stack_name);
        let existing = self.stacks.list_stacks_matching(&pattern).await?;

        if existing.is_empty() {
            if plan_mode {
                log::info!("(plan) would create IAM stack {:?} for addon {:?}", stack_name, addon.name);
                return Ok(ResolvedRole {
                    arn: None,
                    source: RoleSource::Stack {
                        name: stack_name,
                        action: StackAction::WouldCreate,
                    },
                });
            }
            let arn = self.create_new_role(addon, &stack_name, template).await?;
            return Ok(ResolvedRole {
                arn: Some(arn),
                source: RoleSource::Stack {
                    name: stack_name,
                    action: StackAction::Created,
                },
            });
        }

        if plan_mode {
            let change = self.stacks.diff_template(&stack_name, &template).await?;
            let action = if change.is_identical() {
                StackAction::Unchanged
            } else {
                log::info!("(plan) would update IAM stack {:?}", stack_name);
                StackAction::WouldUpdate
            };
            return Ok(ResolvedRole {
                arn: existing[0].first_output().map(str::to_owned),
                source: RoleSource::Stack {
                    name: stack_name,
                    action,
                },
            });
        }

        let input = UpdateStackInput {
            name: stack_name.clone(),
            change_set_name: CHANGE_SET_NAME.to_owned(),
            description: CHANGE_DESCRIPTION.to_owned(),
            template,
            parameters: BTreeMap::new(),
        };
        let action = match self.stacks.update_stack(input, true).await? {
            StackOperation::Unchanged => StackAction::Unchanged,
            _ => StackAction::Updated,
        };

        let refreshed = self.stacks.list_stacks_matching(&pattern).await?;
        let arn = refreshed
            .first()
            .and_then(|stack| stack.first_output())
            .map(str::to_owned)
            .ok_or_else(|| StackError::MissingOutput {
                stack: stack_name.clone(),
                key: None,
            })?;
        Ok(ResolvedRole {
            arn: Some(arn),
            source: RoleSource::Stack {
                name: stack_name,
                action,
            },
        })
    }

    fn render_template(&self, addon: &Addon) -> Result<TemplateBody, ReconcileError> {
        let oidc = self.oidc.as_ref().ok_or_else(|| {
            ReconcileError::validation(format!(
                "addon {:?} declares policies, but the cluster has no OIDC provider",
                addon.name
            ))
        })?;
        let input = RoleTemplateInput {
            resource_name: addon.name.as_str(),
            service_account: known_service_account_location(&addon.name),
            attach_policy_arns: &addon.attach_policy_arns,
            attach_policy: addon.attach_policy.as_ref(),
            oidc,
        };
        build_iam_role_template(&input)
    }

    async fn create_new_role(
        &self,
        addon: &Addon,
        stack_name: &str,
        template: TemplateBody,
    ) -> Result<String, ReconcileError> {
        if !addon.attach_policy_arns.is_empty() {
            log::info!("creating role using provided policies ARNs");
        } else {
            log::info!("creating role using provided policies");
        }
        let input = CreateStackInput {
            name: stack_name.to_owned(),
            template,
            tags: self
                .stacks
                .tags_for(ResourceKind::Addon, &addon.canonical_name()),
            parameters: BTreeMap::new(),
        };
        self.stacks.create_stack(input, true).await?;
        let arn = self.stacks.output(stack_name, None).await?;
        Ok(arn)
    }
}

fn resolve_version(addon: &Addon, summary: &AddonSummary) -> String {
    if addon.version.is_empty() {
        log::info!(
            "no new version provided, preserving existing version: {}",
            summary.version
        );
        summary.version.clone()
    } else {
        if summary.version != addon.version {
            log::info!("new version provided {}", addon.version);
        }
        addon.version.clone()
    }
}

fn plan_message(input: &UpdateAddonInput, role: &ResolvedRole) -> String {
    match &role.source {
        RoleSource::Stack {
            name,
            action: StackAction::WouldCreate,
        } => format!(
            "would create IAM stack {:?} and update addon {:?} with its role, {}",
            name, input.addon_name, input
        ),
        RoleSource::Stack {
            name,
            action: StackAction::WouldUpdate,
        } => format!(
            "would update IAM stack {:?} and update addon {:?}, {}",
            name, input.addon_name, input
        ),
        _ => format!("would update addon {:?}, {}", input.addon_name, input),
    }
}

/// Updates one add-on. Runs the same reads in plan mode, but never mutates anything.
pub struct UpdateAddonTask {
    manager: AddonManager,
    addon: Addon,
}

impl UpdateAddonTask {
    pub fn new(manager: AddonManager, addon: Addon) -> UpdateAddonTask {
        UpdateAddonTask { manager, addon }
    }
}

#[async_trait]
impl Task for UpdateAddonTask {
    fn describe(&self) -> String {
        format!("update addon {:?}", self.addon.name)
    }

    async fn run(&self, ctx: &TaskContext) -> Result<TaskOutcome, Error> {
        let outcome = self.manager.update(&self.addon, ctx.plan_mode()).await?;
        Ok(outcome)
    }
}

//! Reconciles managed add-ons. An add-on itself always lives in the control plane, but the IAM
//! role that it runs with may be backed by a stack that we manage. See `update` for how the
//! role is chosen, and `delete` for how the two are torn down together.
mod delete;
mod update;

pub use self::delete::{DeleteAddonStackTask, DeleteAddonTask};
pub use self::update::UpdateAddonTask;

use crate::config::Addon;
use crate::control_plane::{AddonSummary, ControlPlane};
use crate::error::ReconcileError;
use crate::runner::TaskTree;
use crate::stack::{ResourceKind, StackManager};
use crate::template::OidcBinding;

use std::fmt::{self, Debug};
use std::sync::Arc;

/// The service accounts that well known add-ons run as. The IAM role of these add-ons is
/// bound to exactly this subject. Roles for any other add-on are bound only to the audience.
const KNOWN_SERVICE_ACCOUNTS: &[(&str, &str, &str)] = &[("vpc-cni", "kube-system", "aws-node")];

pub fn known_service_account_location(addon_name: &str) -> Option<(&'static str, &'static str)> {
    let name = addon_name.to_lowercase();
    KNOWN_SERVICE_ACCOUNTS
        .iter()
        .find(|(addon, _, _)| *addon == name)
        .map(|(_, namespace, sa)| (*namespace, *sa))
}

/// A cheaply cloneable handle that builds and runs add-on tasks for one cluster
#[derive(Clone)]
pub struct AddonManager {
    cluster_name: String,
    control_plane: Arc<dyn ControlPlane>,
    stacks: StackManager,
    oidc: Option<OidcBinding>,
}

impl Debug for AddonManager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AddonManager")
            .field("cluster_name", &self.cluster_name)
            .field("oidc", &self.oidc)
            .finish()
    }
}

impl AddonManager {
    /// The OIDC binding is only needed for add-ons that declare policies. Without it, those
    /// add-ons fail validation.
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        stacks: StackManager,
        oidc: Option<OidcBinding>,
    ) -> AddonManager {
        AddonManager {
            cluster_name: stacks.config().cluster_name.clone(),
            control_plane,
            stacks,
            oidc,
        }
    }

    pub fn cluster_name(&self) -> &str {
        self.cluster_name.as_str()
    }

    /// The deterministic name of the stack that holds the add-on's IAM role
    pub fn stack_name(&self, addon: &Addon) -> String {
        self.stacks
            .stack_name(ResourceKind::Addon, &addon.canonical_name())
    }

    /// Fetches the observed state of the add-on, which must exist
    pub async fn get(&self, addon: &Addon) -> Result<AddonSummary, ReconcileError> {
        let name = addon.canonical_name();
        self.control_plane
            .describe_addon(&self.cluster_name, &name)
            .await
            .map_err(|e| ReconcileError::remote("describe addon", name.as_str(), e))?
            .ok_or_else(|| ReconcileError::not_found("addon", name))
    }

    /// One update task per add-on, all run in parallel
    pub fn update_tasks(&self, addons: &[Addon]) -> TaskTree {
        let mut tasks = TaskTree::parallel();
        for addon in addons {
            tasks.append(UpdateAddonTask::new(self.clone(), addon.clone()));
        }
        tasks
    }

    /// Deleting an add-on is a two step chain that is run in parallel with the chains of
    /// every other add-on. The stack is only deleted once the add-on itself is gone.
    pub fn delete_tasks(&self, addons: &[Addon], wait: bool) -> TaskTree {
        let mut tasks = TaskTree::parallel();
        for addon in addons {
            let chain = TaskTree::sequential_stop_on_error()
                .with_task(DeleteAddonTask::new(self.clone(), addon.clone()))
                .with_task(DeleteAddonStackTask::new(self.clone(), addon.clone(), wait));
            tasks.append_tree(chain);
        }
        tasks
    }
}

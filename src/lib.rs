//! Stackctl reconciles the infrastructure that hangs off of a managed Kubernetes cluster
//! (add-ons, node groups, IAM-bound service accounts, and the cluster itself) against a
//! declarative `ClusterConfig`. Each piece of infrastructure is owned by a deterministically
//! named stack, so the set of resources we manage can always be rediscovered by listing stacks.
//!
//! The cloud APIs are abstracted behind three traits: `StackBackend`, `ControlPlane`, and
//! `KubeClient`. Reconcilers turn the desired state into a `TaskTree`, which the runner executes
//! with parallel and sequential groups, collecting every failure.
//!
//! Updating the add-ons of a cluster:
//! ```no_run
//! use stackctl::prelude::*;
//! use std::sync::Arc;
//!
//! async fn update_addons(
//!     control_plane: Arc<dyn ControlPlane>,
//!     backend: Arc<dyn StackBackend>,
//! ) -> Result<RunReport, Error> {
//!     let cfg = ClusterConfig::from_file("cluster.yaml").map_err(ReconcileError::from)?;
//!     let config = ReconcilerConfig::for_cluster(&cfg);
//!     let summary = refresh_cluster_status(&*control_plane, &cfg.metadata.name).await?;
//!     let oidc = summary
//!         .oidc_issuer
//!         .as_ref()
//!         .map(|issuer| OidcBinding::from_issuer_url(issuer, &summary.account_id))
//!         .transpose()?;
//!
//!     let stacks = StackManager::new(backend, config.clone());
//!     let addons = AddonManager::new(control_plane, stacks, oidc);
//!     addons
//!         .update_tasks(&cfg.addons)
//!         .do_all(config.plan_mode)
//!         .await
//!         .into_result("update", "addon(s)")
//! }
//! ```
//!
//! Plan mode never changes which tasks are built, only what they do: every task reports what
//! it would have done instead of doing it.

#[macro_use]
extern crate serde_derive;

pub mod addon;
pub mod cluster;
pub mod config;
pub mod control_plane;
pub mod error;
pub mod iam_service_account;
pub mod kube;
pub mod nodegroup;
pub mod runner;
pub mod stack;
pub mod template;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub use serde;
pub use serde_json;
pub use serde_yaml;

pub mod prelude {
    pub use crate::addon::AddonManager;
    pub use crate::cluster::{self, Cluster, ClusterProvider};
    pub use crate::config::{
        Addon, ClusterConfig, ManagedNodeGroup, NodeGroup, ReconcilerConfig, ServiceAccountSpec,
        WaitConfig,
    };
    pub use crate::control_plane::{refresh_cluster_status, ClusterSummary, ControlPlane};
    pub use crate::error::{Error, ReconcileError};
    pub use crate::iam_service_account::ServiceAccountManager;
    pub use crate::kube::{KubeClient, KubeClientProvider};
    pub use crate::nodegroup::NodeGroupManager;
    pub use crate::runner::{RunReport, Task, TaskContext, TaskOutcome, TaskTree};
    pub use crate::stack::{StackBackend, StackManager};
    pub use crate::template::OidcBinding;
}

//! The narrow interface to the managed Kubernetes control-plane API. Implementations are
//! transports only, and return exactly what the remote API returned. A resource that does not
//! exist is reported as `Ok(None)` rather than as an error.
use crate::error::{Error, ReconcileError};

use async_trait::async_trait;

use std::fmt::{self, Display};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterStatus {
    Creating,
    Active,
    Updating,
    Deleting,
    Failed,
    Pending,
}

impl Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ClusterStatus::Creating => "CREATING",
            ClusterStatus::Active => "ACTIVE",
            ClusterStatus::Updating => "UPDATING",
            ClusterStatus::Deleting => "DELETING",
            ClusterStatus::Failed => "FAILED",
            ClusterStatus::Pending => "PENDING",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSummary {
    pub name: String,
    pub status: ClusterStatus,
    pub version: String,
    #[serde(default)]
    pub oidc_issuer: Option<String>,
    #[serde(default)]
    pub account_id: String,
}

/// The observed state of an installed add-on. Empty strings mean the value is not set.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddonSummary {
    pub name: String,
    pub version: String,
    #[serde(default, rename = "serviceAccountRoleARN")]
    pub iam_role: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveConflicts {
    Overwrite,
    None,
}

impl ResolveConflicts {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolveConflicts::Overwrite => "overwrite",
            ResolveConflicts::None => "none",
        }
    }
}

/// An add-on update request. Fields set to `None` are left for the control plane to default.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateAddonInput {
    pub cluster_name: String,
    pub addon_name: String,
    pub version: String,
    pub service_account_role_arn: Option<String>,
    pub resolve_conflicts: Option<ResolveConflicts>,
}

impl Display for UpdateAddonInput {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ cluster: {:?}, addon: {:?}, version: {:?}",
            self.cluster_name, self.addon_name, self.version
        )?;
        if let Some(arn) = self.service_account_role_arn.as_ref() {
            write!(f, ", serviceAccountRoleARN: {:?}", arn)?;
        }
        if let Some(resolve) = self.resolve_conflicts {
            write!(f, ", resolveConflicts: {:?}", resolve.as_str())?;
        }
        f.write_str(" }")
    }
}

#[async_trait]
pub trait ControlPlane: Send + Sync + 'static {
    async fn describe_cluster(&self, cluster: &str) -> Result<Option<ClusterSummary>, Error>;

    async fn update_cluster_version(&self, cluster: &str, version: &str) -> Result<(), Error>;

    async fn delete_cluster(&self, cluster: &str) -> Result<(), Error>;

    async fn describe_addon(&self, cluster: &str, addon: &str) -> Result<Option<AddonSummary>, Error>;

    async fn update_addon(&self, input: UpdateAddonInput) -> Result<(), Error>;

    async fn delete_addon(&self, cluster: &str, addon: &str) -> Result<(), Error>;

    async fn delete_nodegroup(&self, cluster: &str, nodegroup: &str) -> Result<(), Error>;
}

/// Fetches the current state of the cluster. A cluster that does not exist is an error, since
/// nothing else can be reconciled without it.
pub async fn refresh_cluster_status(
    control_plane: &dyn ControlPlane,
    cluster: &str,
) -> Result<ClusterSummary, ReconcileError> {
    let summary = control_plane
        .describe_cluster(cluster)
        .await
        .map_err(|e| ReconcileError::remote("describe cluster", cluster, e))?
        .ok_or_else(|| ReconcileError::not_found("cluster", cluster))?;
    log::debug!(
        "cluster {:?} is {} at version {}",
        summary.name,
        summary.status,
        summary.version
    );
    Ok(summary)
}

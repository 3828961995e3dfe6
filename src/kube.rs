//! The Kubernetes collaborator. Objects are passed around as plain json `Value`s, and the
//! reconcilers only ever read or write the handful of fields that they care about.
use crate::control_plane::ClusterSummary;
use crate::error::{Error, ReconcileError};
use crate::runner::{Task, TaskContext, TaskOutcome};

use async_trait::async_trait;
use serde_json::{json, Value};

use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::sync::Arc;

pub const KUBE_SYSTEM_NAMESPACE: &str = "kube-system";
pub const KUBE_PROXY: &str = "kube-proxy";
pub const ROLE_ARN_ANNOTATION: &str = "eks.amazonaws.com/role-arn";

const KUBE_PROXY_IMAGE_POINTER: &str = "/spec/template/spec/containers/0/image";

/// The namespace and name of a Kubernetes object. Displays as `namespace/name`.
#[derive(Debug, PartialEq, Eq, Hash, Clone, PartialOrd, Ord)]
pub struct ObjectId {
    pub namespace: String,
    pub name: String,
}

impl ObjectId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> ObjectId {
        ObjectId {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    ServiceAccount,
    DaemonSet,
}

impl ObjectKind {
    pub fn api_version(&self) -> &'static str {
        match self {
            ObjectKind::ServiceAccount => "v1",
            ObjectKind::DaemonSet => "apps/v1",
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ObjectKind::ServiceAccount => "ServiceAccount",
            ObjectKind::DaemonSet => "DaemonSet",
        }
    }
}

impl Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.kind())
    }
}

#[async_trait]
pub trait KubeClient: Send + Sync + 'static {
    async fn get(&self, kind: ObjectKind, id: &ObjectId) -> Result<Option<Value>, Error>;

    /// Creates the object, or replaces it if it already exists
    async fn apply(&self, kind: ObjectKind, object: Value) -> Result<(), Error>;
}

/// Builds Kubernetes clients for a cluster, once the cluster's endpoint is known
pub trait KubeClientProvider: Send + Sync + 'static {
    fn client_for(&self, cluster: &ClusterSummary) -> Result<Arc<dyn KubeClient>, Error>;
}

/// Returns the string at the given json pointer, if there is one
pub fn str_value<'a>(json: &'a Value, pointer: &str) -> Option<&'a str> {
    json.pointer(pointer).and_then(Value::as_str)
}

pub fn service_account(id: &ObjectId, annotations: &BTreeMap<String, String>) -> Value {
    json!({
        "apiVersion": ObjectKind::ServiceAccount.api_version(),
        "kind": ObjectKind::ServiceAccount.kind(),
        "metadata": {
            "namespace": id.namespace,
            "name": id.name,
            "annotations": annotations,
        }
    })
}

pub fn kube_proxy_image_tag(control_plane_version: &str) -> String {
    format!("v{}-eksbuild.1", control_plane_version)
}

/// Splits an image like `repo/kube-proxy:v1.18.8-eksbuild.1` into the repository and the tag.
/// Images that don't have exactly one tag separator are rejected.
pub fn split_image(image: &str) -> Result<(&str, &str), ReconcileError> {
    let parts = image.split(':').collect::<Vec<_>>();
    if parts.len() != 2 {
        return Err(ReconcileError::validation(format!(
            "unexpected image format {:?} for {:?}",
            image, KUBE_PROXY
        )));
    }
    Ok((parts[0], parts[1]))
}

fn kube_proxy_id() -> ObjectId {
    ObjectId::new(KUBE_SYSTEM_NAMESPACE, KUBE_PROXY)
}

async fn get_kube_proxy(client: &dyn KubeClient) -> Result<Option<Value>, ReconcileError> {
    let id = kube_proxy_id();
    let daemonset = client
        .get(ObjectKind::DaemonSet, &id)
        .await
        .map_err(|e| ReconcileError::remote("get daemonset", id.to_string(), e))?;
    if daemonset.is_none() {
        log::warn!("{:?} was not found", KUBE_PROXY);
    }
    Ok(daemonset)
}

fn first_container_image(daemonset: &Value) -> Result<&str, ReconcileError> {
    str_value(daemonset, KUBE_PROXY_IMAGE_POINTER).ok_or_else(|| {
        let count = daemonset
            .pointer("/spec/template/spec/containers")
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0);
        ReconcileError::validation(format!(
            "{} has {} containers, expected at least 1",
            KUBE_PROXY, count
        ))
    })
}

/// Returns true if the kube-proxy daemonset runs the image for the given control plane version.
/// A missing daemonset is treated as up to date.
pub async fn is_kube_proxy_up_to_date(
    client: &dyn KubeClient,
    control_plane_version: &str,
) -> Result<bool, ReconcileError> {
    let daemonset = match get_kube_proxy(client).await? {
        Some(ds) => ds,
        None => return Ok(true),
    };
    let (_, tag) = split_image(first_container_image(&daemonset)?)?;
    Ok(tag == kube_proxy_image_tag(control_plane_version))
}

/// Updates the image tag of the kube-proxy daemonset to match the control plane version.
/// Returns true if the daemonset was out of date. In plan mode, nothing is written, and the
/// return value says whether an update would have been made.
pub async fn update_kube_proxy_image_tag(
    client: &dyn KubeClient,
    control_plane_version: &str,
    plan: bool,
) -> Result<bool, ReconcileError> {
    let mut daemonset = match get_kube_proxy(client).await? {
        Some(ds) => ds,
        None => return Ok(false),
    };
    log::debug!("{} [current] = {}", KUBE_PROXY, daemonset);

    let desired_tag = kube_proxy_image_tag(control_plane_version);
    let new_image = {
        let (repository, tag) = split_image(first_container_image(&daemonset)?)?;
        if tag == desired_tag {
            log::info!("{:?} is already up-to-date", KUBE_PROXY);
            return Ok(false);
        }
        format!("{}:{}", repository, desired_tag)
    };

    if plan {
        log::error!("(plan) {:?} is not up-to-date", KUBE_PROXY);
        return Ok(true);
    }

    if let Some(image) = daemonset.pointer_mut(KUBE_PROXY_IMAGE_POINTER) {
        *image = Value::String(new_image);
    }
    log::debug!("{} [updated] = {}", KUBE_PROXY, daemonset);
    client
        .apply(ObjectKind::DaemonSet, daemonset)
        .await
        .map_err(|e| ReconcileError::remote("update daemonset", kube_proxy_id().to_string(), e))?;
    log::info!("{:?} is now up-to-date", KUBE_PROXY);
    Ok(true)
}

/// Brings the kube-proxy image in line with the control plane version
pub struct UpdateKubeProxyTask {
    client: Arc<dyn KubeClient>,
    control_plane_version: String,
}

impl UpdateKubeProxyTask {
    pub fn new(client: Arc<dyn KubeClient>, control_plane_version: impl Into<String>) -> Self {
        UpdateKubeProxyTask {
            client,
            control_plane_version: control_plane_version.into(),
        }
    }
}

#[async_trait]
impl Task for UpdateKubeProxyTask {
    fn describe(&self) -> String {
        format!(
            "update {:?} image tag to {:?}",
            KUBE_PROXY,
            kube_proxy_image_tag(&self.control_plane_version)
        )
    }

    async fn run(&self, ctx: &TaskContext) -> Result<TaskOutcome, Error> {
        let client = &*self.client;
        let out_of_date =
            update_kube_proxy_image_tag(client, &self.control_plane_version, ctx.plan_mode()).await?;
        if ctx.plan_mode() {
            let message = if out_of_date {
                format!("would update {:?} to {}", KUBE_PROXY, kube_proxy_image_tag(&self.control_plane_version))
            } else {
                format!("{:?} is already up-to-date", KUBE_PROXY)
            };
            return Ok(TaskOutcome::Planned(message));
        }
        if out_of_date {
            Ok(TaskOutcome::Completed)
        } else {
            Ok(TaskOutcome::Unchanged)
        }
    }
}

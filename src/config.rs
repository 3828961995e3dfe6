mod cluster_config;

pub use self::cluster_config::{
    Addon, ClusterConfig, ClusterIam, ClusterMeta, ManagedNodeGroup, NodeGroup,
    ServiceAccountMeta, ServiceAccountSpec,
};

use std::time::Duration;

pub const DEFAULT_STACK_NAME_PREFIX: &str = "stackctl";
pub const STACK_NAME_PREFIX_ENV_VAR: &str = "STACKCTL_STACK_PREFIX";

pub const DEFAULT_CLUSTER_NAME_TAG: &str = "stackctl.io/cluster-name";
pub const DEFAULT_RESOURCE_KIND_TAG: &str = "stackctl.io/resource-kind";
pub const DEFAULT_RESOURCE_NAME_TAG: &str = "stackctl.io/resource-name";

/// Controls how long, and how often, we poll the stack backend while waiting for a stack to
/// reach a terminal state. Polling uses an exponential backoff that starts at
/// `initial_interval` and never exceeds `max_interval`.
#[derive(Debug, Clone, PartialEq)]
pub struct WaitConfig {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// Give up waiting after this long. `None` means wait for as long as it takes.
    pub timeout: Option<Duration>,
}

impl Default for WaitConfig {
    fn default() -> WaitConfig {
        WaitConfig {
            initial_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(30),
            timeout: Some(Duration::from_secs(3600)),
        }
    }
}

impl WaitConfig {
    /// Polls at exactly `interval`, with no growth between attempts.
    pub fn fixed_interval(interval: Duration) -> WaitConfig {
        WaitConfig {
            initial_interval: interval,
            max_interval: interval,
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Settings shared by every reconciler for one invocation. Stack names and tags are derived
/// from these values, so two runs with the same config always compute the same names.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcilerConfig {
    pub cluster_name: String,
    pub stack_name_prefix: String,
    pub cluster_name_tag: String,
    pub resource_kind_tag: String,
    pub resource_name_tag: String,
    pub wait: WaitConfig,
    pub plan_mode: bool,
}

impl ReconcilerConfig {
    pub fn new(cluster_name: impl Into<String>) -> ReconcilerConfig {
        let stack_name_prefix = std::env::var(STACK_NAME_PREFIX_ENV_VAR)
            .ok()
            .filter(|prefix| !prefix.is_empty())
            .unwrap_or_else(|| DEFAULT_STACK_NAME_PREFIX.to_owned());
        ReconcilerConfig {
            cluster_name: cluster_name.into(),
            stack_name_prefix,
            cluster_name_tag: DEFAULT_CLUSTER_NAME_TAG.to_owned(),
            resource_kind_tag: DEFAULT_RESOURCE_KIND_TAG.to_owned(),
            resource_name_tag: DEFAULT_RESOURCE_NAME_TAG.to_owned(),
            wait: WaitConfig::default(),
            plan_mode: false,
        }
    }

    pub fn for_cluster(cluster: &ClusterConfig) -> ReconcilerConfig {
        ReconcilerConfig::new(cluster.metadata.name.as_str())
    }

    pub fn with_stack_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.stack_name_prefix = prefix.into();
        self
    }

    pub fn with_wait(mut self, wait: WaitConfig) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_plan_mode(mut self, plan_mode: bool) -> Self {
        self.plan_mode = plan_mode;
        self
    }
}

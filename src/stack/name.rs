//! Stack names are derived from the cluster name, the kind of resource, and the resource name.
//! This is what lets us answer "does this resource already have managed infrastructure?" by
//! listing stacks, without keeping any local state. The same inputs always produce the same
//! name, across runs and across processes.
use lazy_static::lazy_static;
use regex::Regex;

use std::fmt::{self, Display};

lazy_static! {
    static ref INVALID_NAME_CHARS: Regex = Regex::new("[^-a-zA-Z0-9]+").unwrap();
}

// What follows `addon-` in the name of a service account stack
const SERVICE_ACCOUNT_INFIX: &str = "iamserviceaccount-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Cluster,
    Addon,
    NodeGroup,
    IamServiceAccount,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match *self {
            ResourceKind::Cluster => "cluster",
            ResourceKind::Addon => "addon",
            ResourceKind::NodeGroup => "nodegroup",
            ResourceKind::IamServiceAccount => "addon-iamserviceaccount",
        }
    }
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Computes stack names for a single cluster
#[derive(Debug, Clone, PartialEq)]
pub struct StackNames {
    prefix: String,
    cluster: String,
}

impl StackNames {
    pub fn new(prefix: &str, cluster: &str) -> StackNames {
        StackNames {
            prefix: sanitize(prefix),
            cluster: sanitize(cluster),
        }
    }

    /// The name of the root stack of a cluster that was created by us
    pub fn cluster(&self) -> String {
        format!("{}-{}-cluster", self.prefix, self.cluster)
    }

    pub fn resource(&self, kind: ResourceKind, name: &str) -> String {
        if kind == ResourceKind::Cluster {
            return self.cluster();
        }
        format!("{}-{}-{}-{}", self.prefix, self.cluster, kind, sanitize(name))
    }

    /// A pattern that matches only the stack with exactly the given name
    pub fn exact_pattern(stack_name: &str) -> String {
        format!("^{}$", regex::escape(stack_name))
    }

    /// A pattern that matches every stack of the given kind for this cluster. Add-on stacks share
    /// a prefix with service account stacks, so matches must still be checked with
    /// `resource_name`.
    pub fn kind_pattern(&self, kind: ResourceKind) -> String {
        format!("^{}.+$", regex::escape(&self.kind_prefix(kind)))
    }

    /// A pattern that matches every stack that belongs to this cluster, including the root stack
    pub fn cluster_pattern(&self) -> String {
        format!("^{}-.+$", regex::escape(&format!("{}-{}", self.prefix, self.cluster)))
    }

    /// Extracts the (sanitized) resource name from the name of a stack of the given kind
    pub fn resource_name<'a>(&self, kind: ResourceKind, stack_name: &'a str) -> Option<&'a str> {
        let prefix = self.kind_prefix(kind);
        if !stack_name.starts_with(prefix.as_str()) || stack_name.len() == prefix.len() {
            return None;
        }
        let name = &stack_name[prefix.len()..];
        if kind == ResourceKind::Addon && name.starts_with(SERVICE_ACCOUNT_INFIX) {
            return None;
        }
        Some(name)
    }

    fn kind_prefix(&self, kind: ResourceKind) -> String {
        format!("{}-{}-{}-", self.prefix, self.cluster, kind)
    }
}

/// Stack names may only contain alphanumerics and hyphens, so anything else is collapsed into a
/// single hyphen. `kube-system/aws-node` becomes `kube-system-aws-node`.
pub fn sanitize(name: &str) -> String {
    INVALID_NAME_CHARS.replace_all(name, "-").into_owned()
}

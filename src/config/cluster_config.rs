//! The desired state of a cluster, as declared by the operator in a YAML file. Field names
//! follow the usual camelCase convention of cluster config files, for example:
//!
//! ```yaml
//! metadata:
//!   name: prod
//!   region: us-west-2
//!   version: "1.19"
//! addons:
//!   - name: vpc-cni
//!     attachPolicyARNs:
//!       - arn:aws:iam::aws:policy/AmazonEKS_CNI_Policy
//! managedNodeGroups:
//!   - name: workers
//! ```
use anyhow::{bail, Context};
use serde_json::Value;

use std::collections::HashSet;
use std::fs::File;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    pub metadata: ClusterMeta,
    #[serde(default)]
    pub addons: Vec<Addon>,
    #[serde(default)]
    pub node_groups: Vec<NodeGroup>,
    #[serde(default)]
    pub managed_node_groups: Vec<ManagedNodeGroup>,
    #[serde(default)]
    pub iam: ClusterIam,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMeta {
    pub name: String,
    #[serde(default)]
    pub region: String,
    /// Desired control plane version. `None` keeps whatever is currently running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Desired state of a single managed add-on.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Addon {
    pub name: String,
    /// An empty version means "keep whatever version is currently installed"
    #[serde(default)]
    pub version: String,
    #[serde(default, rename = "serviceAccountRoleARN")]
    pub service_account_role_arn: String,
    #[serde(default, rename = "attachPolicyARNs")]
    pub attach_policy_arns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attach_policy: Option<Value>,
    #[serde(default)]
    pub force: bool,
}

impl Addon {
    pub fn new(name: impl Into<String>) -> Addon {
        Addon {
            name: name.into(),
            ..Default::default()
        }
    }

    /// The control plane treats add-on names case insensitively
    pub fn canonical_name(&self) -> String {
        self.name.to_lowercase()
    }

    /// Returns true if the desired state carries IAM permissions that need a backing role
    pub fn has_policies(&self) -> bool {
        !self.attach_policy_arns.is_empty() || self.attach_policy.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroup {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedNodeGroup {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterIam {
    #[serde(default, rename = "withOIDC")]
    pub with_oidc: bool,
    #[serde(default)]
    pub service_accounts: Vec<ServiceAccountSpec>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccountMeta {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

fn default_namespace() -> String {
    "default".to_owned()
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccountSpec {
    pub metadata: ServiceAccountMeta,
    #[serde(default, rename = "attachPolicyARNs")]
    pub attach_policy_arns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attach_policy: Option<Value>,
}

impl ServiceAccountSpec {
    /// `namespace/name`, which is how service accounts are referred to in task descriptions
    pub fn name_string(&self) -> String {
        format!("{}/{}", self.metadata.namespace, self.metadata.name)
    }
}

impl ClusterConfig {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<ClusterConfig> {
        let path = path.as_ref();
        let reader = File::open(path)
            .with_context(|| format!("opening cluster config file '{}'", path.display()))?;
        let config: ClusterConfig = serde_yaml::from_reader(reader)
            .with_context(|| format!("parsing cluster config file '{}'", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<ClusterConfig> {
        let config: ClusterConfig =
            serde_yaml::from_str(yaml).context("parsing cluster config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.metadata.name.is_empty() {
            bail!("metadata.name must be set");
        }

        let mut addon_names = HashSet::new();
        for addon in self.addons.iter() {
            if addon.name.is_empty() {
                bail!("every addon must have a name");
            }
            if !addon_names.insert(addon.canonical_name()) {
                bail!("addon {:?} is declared more than once", addon.name);
            }
        }

        let mut nodegroup_names = HashSet::new();
        let all_nodegroups = self
            .node_groups
            .iter()
            .map(|ng| ng.name.as_str())
            .chain(self.managed_node_groups.iter().map(|ng| ng.name.as_str()));
        for name in all_nodegroups {
            if name.is_empty() {
                bail!("every nodegroup must have a name");
            }
            if !nodegroup_names.insert(name) {
                bail!("nodegroup {:?} is declared more than once", name);
            }
        }

        if !self.iam.service_accounts.is_empty() && !self.iam.with_oidc {
            bail!("iam.withOIDC must be enabled in order to create iam.serviceAccounts");
        }
        for sa in self.iam.service_accounts.iter() {
            if sa.metadata.name.is_empty() {
                bail!("every iam.serviceAccounts entry must have metadata.name");
            }
            if sa.attach_policy_arns.is_empty() && sa.attach_policy.is_none() {
                bail!(
                    "serviceaccount {:?} must set either attachPolicyARNs or attachPolicy",
                    sa.name_string()
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const EXAMPLE: &str = r#"
metadata:
  name: prod
  region: us-west-2
  version: "1.19"
addons:
  - name: vpc-cni
    attachPolicyARNs:
      - arn:aws:iam::aws:policy/AmazonEKS_CNI_Policy
  - name: coredns
    version: v1.8.0-eksbuild.1
    serviceAccountRoleARN: arn:aws:iam::123456789012:role/coredns
    force: true
nodeGroups:
  - name: ng-1
managedNodeGroups:
  - name: mng-1
iam:
  withOIDC: true
  serviceAccounts:
    - metadata:
        name: s3-reader
        namespace: backend
      attachPolicy:
        Version: "2012-10-17"
        Statement:
          - Effect: Allow
            Action: ["s3:GetObject"]
            Resource: "*"
"#;

    #[test]
    fn parses_a_complete_cluster_config() {
        let config = ClusterConfig::from_yaml_str(EXAMPLE).expect("failed to parse config");
        assert_eq!("prod", config.metadata.name);
        assert_eq!(Some("1.19".to_owned()), config.metadata.version);
        assert_eq!(2, config.addons.len());

        let vpc_cni = &config.addons[0];
        assert_eq!("", vpc_cni.version);
        assert!(vpc_cni.has_policies());
        assert!(!vpc_cni.force);

        let coredns = &config.addons[1];
        assert!(coredns.force);
        assert!(!coredns.has_policies());
        assert_eq!("arn:aws:iam::123456789012:role/coredns", coredns.service_account_role_arn);

        assert_eq!("ng-1", config.node_groups[0].name);
        assert_eq!("mng-1", config.managed_node_groups[0].name);
        assert_eq!("backend/s3-reader", config.iam.service_accounts[0].name_string());
    }

    #[test]
    fn rejects_duplicate_addons() {
        let yaml = r#"
metadata:
  name: prod
addons:
  - name: vpc-cni
  - name: VPC-CNI
"#;
        let err = ClusterConfig::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn rejects_service_accounts_without_oidc() {
        let yaml = r#"
metadata:
  name: prod
iam:
  serviceAccounts:
    - metadata:
        name: foo
      attachPolicyARNs: ["arn:aws:iam::aws:policy/X"]
"#;
        let err = ClusterConfig::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("withOIDC"));
    }

    #[test]
    fn service_accounts_default_to_the_default_namespace() {
        let yaml = r#"
metadata:
  name: prod
iam:
  withOIDC: true
  serviceAccounts:
    - metadata:
        name: foo
      attachPolicyARNs: ["arn:aws:iam::aws:policy/X"]
"#;
        let config = ClusterConfig::from_yaml_str(yaml).unwrap();
        assert_eq!("default/foo", config.iam.service_accounts[0].name_string());
    }
}

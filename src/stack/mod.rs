//! The Stack Store. Every piece of infrastructure that we provision for a cluster lives in a
//! named stack in a remote backend, and the presence of a stack is the only record we keep
//! that a resource is managed by us. The `StackBackend` trait is the narrow interface to that
//! remote backend, and `StackManager` layers naming, tagging, template diffing, and waiting for
//! convergence on top of it.
pub mod compare;
pub mod name;
pub(crate) mod wait;

pub use self::name::{ResourceKind, StackNames};

use self::compare::compare_templates;
use self::wait::{wait_for_stack, WaitFor};
use crate::config::{ReconcilerConfig, WaitConfig};
use crate::error::Error;
use crate::runner::TaskOutcome;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

use std::collections::BTreeMap;
use std::fmt::{self, Debug, Display};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StackStatus {
    CreateInProgress,
    CreateFailed,
    CreateComplete,
    RollbackInProgress,
    RollbackFailed,
    RollbackComplete,
    DeleteInProgress,
    DeleteFailed,
    DeleteComplete,
    UpdateInProgress,
    UpdateCompleteCleanupInProgress,
    UpdateComplete,
    UpdateFailed,
    UpdateRollbackInProgress,
    UpdateRollbackFailed,
    UpdateRollbackCompleteCleanupInProgress,
    UpdateRollbackComplete,
}

impl StackStatus {
    pub fn as_str(&self) -> &'static str {
        use StackStatus::*;
        match *self {
            CreateInProgress => "CREATE_IN_PROGRESS",
            CreateFailed => "CREATE_FAILED",
            CreateComplete => "CREATE_COMPLETE",
            RollbackInProgress => "ROLLBACK_IN_PROGRESS",
            RollbackFailed => "ROLLBACK_FAILED",
            RollbackComplete => "ROLLBACK_COMPLETE",
            DeleteInProgress => "DELETE_IN_PROGRESS",
            DeleteFailed => "DELETE_FAILED",
            DeleteComplete => "DELETE_COMPLETE",
            UpdateInProgress => "UPDATE_IN_PROGRESS",
            UpdateCompleteCleanupInProgress => "UPDATE_COMPLETE_CLEANUP_IN_PROGRESS",
            UpdateComplete => "UPDATE_COMPLETE",
            UpdateFailed => "UPDATE_FAILED",
            UpdateRollbackInProgress => "UPDATE_ROLLBACK_IN_PROGRESS",
            UpdateRollbackFailed => "UPDATE_ROLLBACK_FAILED",
            UpdateRollbackCompleteCleanupInProgress => {
                "UPDATE_ROLLBACK_COMPLETE_CLEANUP_IN_PROGRESS"
            }
            UpdateRollbackComplete => "UPDATE_ROLLBACK_COMPLETE",
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.as_str().ends_with("_IN_PROGRESS")
    }

    /// A stack that is not in the middle of an operation, and so can be safely updated
    pub fn is_stable(&self) -> bool {
        !self.is_in_progress()
    }
}

impl Display for StackStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackOutput {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stack {
    pub name: String,
    pub status: StackStatus,
    #[serde(default)]
    pub status_reason: Option<String>,
    #[serde(default)]
    pub outputs: Vec<StackOutput>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl Stack {
    pub fn output(&self, key: &str) -> Option<&str> {
        self.outputs
            .iter()
            .find(|o| o.key == key)
            .map(|o| o.value.as_str())
    }

    /// The first output of the stack, which is where single-resource stacks put their result
    pub fn first_output(&self) -> Option<&str> {
        self.outputs.first().map(|o| o.value.as_str())
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

/// A serialized stack template. Two bodies rendered from the same input are byte-for-byte
/// identical.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateBody(String);

impl TemplateBody {
    pub fn new(body: impl Into<String>) -> TemplateBody {
        TemplateBody(body.into())
    }

    pub fn from_value(value: &Value) -> TemplateBody {
        // serde_json maps are sorted by key, so this is deterministic
        TemplateBody(value.to_string())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn parse(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_str(self.0.as_str())
    }
}

impl Display for TemplateBody {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateStackInput {
    pub name: String,
    pub template: TemplateBody,
    pub tags: BTreeMap<String, String>,
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStackInput {
    pub name: String,
    pub change_set_name: String,
    pub description: String,
    pub template: TemplateBody,
    pub parameters: BTreeMap<String, String>,
}

/// The remote infrastructure-state backend. Implementations are thin transports: they don't
/// wait for anything, and they report exactly what the backend returned.
#[async_trait]
pub trait StackBackend: Send + Sync + 'static {
    /// Returns every stack known to the backend, including deleted ones
    async fn list_stacks(&self) -> Result<Vec<Stack>, Error>;

    async fn describe_stack(&self, name: &str) -> Result<Option<Stack>, Error>;

    async fn get_template(&self, name: &str) -> Result<Option<TemplateBody>, Error>;

    async fn create_stack(&self, input: CreateStackInput) -> Result<(), Error>;

    async fn update_stack(&self, input: UpdateStackInput) -> Result<(), Error>;

    /// Starts deleting the stack. Deleting a stack that does not exist is not an error.
    async fn delete_stack(&self, name: &str) -> Result<(), Error>;
}

#[derive(Debug)]
pub enum StackError {
    InvalidPattern {
        pattern: String,
        source: regex::Error,
    },
    Backend {
        operation: &'static str,
        stack: String,
        source: Error,
    },
    FailedState {
        stack: String,
        status: StackStatus,
        reason: Option<String>,
    },
    Timeout {
        stack: String,
        elapsed: Duration,
    },
    NotFound(String),
    MissingOutput {
        stack: String,
        key: Option<String>,
    },
    InvalidTemplate {
        stack: String,
        source: serde_json::Error,
    },
}

impl StackError {
    pub(crate) fn backend(operation: &'static str, stack: &str, source: Error) -> StackError {
        StackError::Backend {
            operation,
            stack: stack.to_owned(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StackError::NotFound(_))
    }
}

impl Display for StackError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StackError::InvalidPattern { pattern, source } => {
                write!(f, "invalid stack name pattern {:?}: {}", pattern, source)
            }
            StackError::Backend {
                operation,
                stack,
                source,
            } => write!(f, "failed to {} {:?}: {}", operation, stack, source),
            StackError::FailedState {
                stack,
                status,
                reason,
            } => {
                write!(f, "stack {:?} reached state {}", stack, status)?;
                if let Some(reason) = reason {
                    write!(f, ": {}", reason)?;
                }
                Ok(())
            }
            StackError::Timeout { stack, elapsed } => write!(
                f,
                "timed out after {}s waiting for stack {:?}",
                elapsed.as_secs(),
                stack
            ),
            StackError::NotFound(stack) => write!(f, "stack {:?} not found", stack),
            StackError::MissingOutput { stack, key } => match key {
                Some(key) => write!(f, "stack {:?} has no output {:?}", stack, key),
                None => write!(f, "stack {:?} has no outputs", stack),
            },
            StackError::InvalidTemplate { stack, source } => {
                write!(f, "deployed template of stack {:?} is invalid: {}", stack, source)
            }
        }
    }
}

impl std::error::Error for StackError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StackError::InvalidPattern { source, .. } => Some(source),
            StackError::Backend { source, .. } => Some(source.as_std_error()),
            StackError::InvalidTemplate { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// The result of a mutating Stack Store operation
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StackOperation {
    /// The operation finished and the stack reached its terminal state
    Completed,
    /// The operation was started, but we did not wait for it to finish
    Initiated,
    /// The desired template was identical to the deployed one, so nothing was submitted
    Unchanged,
}

impl From<StackOperation> for TaskOutcome {
    fn from(op: StackOperation) -> TaskOutcome {
        match op {
            StackOperation::Completed => TaskOutcome::Completed,
            StackOperation::Initiated => TaskOutcome::Initiated,
            StackOperation::Unchanged => TaskOutcome::Unchanged,
        }
    }
}

/// Result of comparing a desired template against the deployed one
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateChange {
    Identical,
    Changed { summary: String },
}

impl TemplateChange {
    pub fn is_identical(&self) -> bool {
        *self == TemplateChange::Identical
    }
}

/// A cheaply cloneable handle to the Stack Store for a single cluster. Safe to share between
/// concurrently running tasks.
#[derive(Clone)]
pub struct StackManager(Arc<StackManagerInner>);

struct StackManagerInner {
    backend: Arc<dyn StackBackend>,
    config: ReconcilerConfig,
    names: StackNames,
}

impl Debug for StackManager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("StackManager")
            .field("names", &self.0.names)
            .finish()
    }
}

impl StackManager {
    pub fn new(backend: Arc<dyn StackBackend>, config: ReconcilerConfig) -> StackManager {
        let names = StackNames::new(&config.stack_name_prefix, &config.cluster_name);
        StackManager(Arc::new(StackManagerInner {
            backend,
            config,
            names,
        }))
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.0.config
    }

    /// Returns a handle to the same backend that waits for convergence using `wait`
    pub fn with_wait(&self, wait: WaitConfig) -> StackManager {
        let config = self.0.config.clone().with_wait(wait);
        StackManager::new(self.0.backend.clone(), config)
    }

    pub fn names(&self) -> &StackNames {
        &self.0.names
    }

    pub fn stack_name(&self, kind: ResourceKind, resource_name: &str) -> String {
        self.0.names.resource(kind, resource_name)
    }

    pub fn cluster_stack_name(&self) -> String {
        self.0.names.cluster()
    }

    /// The tags that every stack for the given resource is created with
    pub fn tags_for(&self, kind: ResourceKind, resource_name: &str) -> BTreeMap<String, String> {
        let config = &self.0.config;
        let mut tags = BTreeMap::new();
        tags.insert(config.cluster_name_tag.clone(), config.cluster_name.clone());
        tags.insert(config.resource_kind_tag.clone(), kind.as_str().to_owned());
        tags.insert(config.resource_name_tag.clone(), resource_name.to_owned());
        tags
    }

    /// Returns the live stacks whose names match the given regex, ordered by name. Deleted
    /// stacks are never returned. An empty result means that nothing matching is managed by us.
    pub async fn list_stacks_matching(&self, pattern: &str) -> Result<Vec<Stack>, StackError> {
        let regex = Regex::new(pattern).map_err(|source| StackError::InvalidPattern {
            pattern: pattern.to_owned(),
            source,
        })?;
        let all = self
            .0
            .backend
            .list_stacks()
            .await
            .map_err(|e| StackError::backend("list stacks", pattern, e))?;
        let mut matching = all
            .into_iter()
            .filter(|s| s.status != StackStatus::DeleteComplete && regex.is_match(&s.name))
            .collect::<Vec<_>>();
        matching.sort_by(|a, b| a.name.cmp(&b.name));
        log::debug!(
            "found {} stack(s) matching pattern {:?}",
            matching.len(),
            pattern
        );
        Ok(matching)
    }

    pub async fn list_stacks_of_kind(&self, kind: ResourceKind) -> Result<Vec<Stack>, StackError> {
        let pattern = self.0.names.kind_pattern(kind);
        let stacks = self.list_stacks_matching(&pattern).await?;
        Ok(stacks
            .into_iter()
            .filter(|s| self.0.names.resource_name(kind, &s.name).is_some())
            .collect())
    }

    /// Lists the stacks for exactly one resource, which is either empty or has a single entry
    pub async fn list_stacks_for(
        &self,
        kind: ResourceKind,
        resource_name: &str,
    ) -> Result<Vec<Stack>, StackError> {
        let pattern = StackNames::exact_pattern(&self.stack_name(kind, resource_name));
        self.list_stacks_matching(&pattern).await
    }

    pub async fn describe_stack(&self, name: &str) -> Result<Option<Stack>, StackError> {
        let stack = self
            .0
            .backend
            .describe_stack(name)
            .await
            .map_err(|e| StackError::backend("describe stack", name, e))?;
        Ok(stack.filter(|s| s.status != StackStatus::DeleteComplete))
    }

    /// Returns true if the cluster's root stack exists, meaning that the control plane was
    /// provisioned by us
    pub async fn has_cluster_stack(&self) -> Result<bool, StackError> {
        let pattern = StackNames::exact_pattern(&self.cluster_stack_name());
        let stacks = self.list_stacks_matching(&pattern).await?;
        Ok(!stacks.is_empty())
    }

    pub async fn create_stack(
        &self,
        input: CreateStackInput,
        wait: bool,
    ) -> Result<StackOperation, StackError> {
        let name = input.name.clone();
        log::info!("creating stack {:?}", name);
        log::debug!("template for stack {:?}: {}", name, input.template);
        self.0
            .backend
            .create_stack(input)
            .await
            .map_err(|e| StackError::backend("create stack", &name, e))?;
        self.maybe_wait(&name, WaitFor::Create, wait).await
    }

    /// Compares the desired template with the one currently deployed for the stack, without
    /// making any changes
    pub async fn diff_template(
        &self,
        name: &str,
        desired: &TemplateBody,
    ) -> Result<TemplateChange, StackError> {
        let deployed = self
            .0
            .backend
            .get_template(name)
            .await
            .map_err(|e| StackError::backend("get template", name, e))?;
        let deployed = match deployed {
            Some(body) => body,
            None => {
                return Ok(TemplateChange::Changed {
                    summary: "no template is deployed".to_owned(),
                });
            }
        };
        if deployed == *desired {
            return Ok(TemplateChange::Identical);
        }

        let deployed_value = deployed.parse().map_err(|source| StackError::InvalidTemplate {
            stack: name.to_owned(),
            source,
        })?;
        let desired_value = desired.parse().map_err(|source| StackError::InvalidTemplate {
            stack: name.to_owned(),
            source,
        })?;
        let diffs = compare_templates(&deployed_value, &desired_value);
        if diffs.is_empty() {
            Ok(TemplateChange::Identical)
        } else {
            Ok(TemplateChange::Changed {
                summary: diffs.to_string(),
            })
        }
    }

    /// Updates the stack in place. If the desired template is identical to the deployed one,
    /// then nothing is submitted and `StackOperation::Unchanged` is returned.
    pub async fn update_stack(
        &self,
        input: UpdateStackInput,
        wait: bool,
    ) -> Result<StackOperation, StackError> {
        let name = input.name.clone();
        match self.diff_template(&name, &input.template).await? {
            TemplateChange::Identical => {
                log::info!("no changes for stack {:?}, skipping update", name);
                return Ok(StackOperation::Unchanged);
            }
            TemplateChange::Changed { summary } => {
                log::info!("{} for stack {:?}", input.description, name);
                log::debug!("changes for stack {:?}: {}", name, summary);
            }
        }
        self.0
            .backend
            .update_stack(input)
            .await
            .map_err(|e| StackError::backend("update stack", &name, e))?;
        self.maybe_wait(&name, WaitFor::Update, wait).await
    }

    pub async fn delete_stack_by_name(
        &self,
        name: &str,
        wait: bool,
    ) -> Result<StackOperation, StackError> {
        log::info!("deleting stack {:?}", name);
        self.0
            .backend
            .delete_stack(name)
            .await
            .map_err(|e| StackError::backend("delete stack", name, e))?;
        self.maybe_wait(name, WaitFor::Delete, wait).await
    }

    /// Reads an output of the stack. With no key, returns the first output.
    pub async fn output(&self, name: &str, key: Option<&str>) -> Result<String, StackError> {
        let stack = self
            .describe_stack(name)
            .await?
            .ok_or_else(|| StackError::NotFound(name.to_owned()))?;
        let value = match key {
            Some(k) => stack.output(k),
            None => stack.first_output(),
        };
        value
            .map(str::to_owned)
            .ok_or_else(|| StackError::MissingOutput {
                stack: name.to_owned(),
                key: key.map(str::to_owned),
            })
    }

    async fn maybe_wait(
        &self,
        name: &str,
        wait_for: WaitFor,
        wait: bool,
    ) -> Result<StackOperation, StackError> {
        if !wait {
            log::debug!("not waiting for stack {:?}", name);
            return Ok(StackOperation::Initiated);
        }
        wait_for_stack(&*self.0.backend, name, wait_for, &self.0.config.wait).await?;
        Ok(StackOperation::Completed)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testkit::InMemoryStackBackend;
    use serde_json::json;

    fn run<F: std::future::Future>(future: F) -> F::Output {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(future)
    }

    fn manager(backend: &InMemoryStackBackend) -> StackManager {
        let config = ReconcilerConfig::new("prod")
            .with_stack_name_prefix("stackctl")
            .with_wait(WaitConfig::fixed_interval(Duration::from_millis(1)));
        StackManager::new(Arc::new(backend.clone()), config)
    }

    fn create_input(manager: &StackManager, name: &str, template: Value) -> CreateStackInput {
        CreateStackInput {
            name: manager.stack_name(ResourceKind::Addon, name),
            template: TemplateBody::from_value(&template),
            tags: manager.tags_for(ResourceKind::Addon, name),
            parameters: BTreeMap::new(),
        }
    }

    #[test]
    fn create_waits_for_the_stack_to_complete() {
        let backend = InMemoryStackBackend::new().with_polls_until_complete(3);
        let manager = manager(&backend);
        let input = create_input(&manager, "vpc-cni", json!({"Resources": {}}));

        let result = run(manager.create_stack(input, true)).unwrap();
        assert_eq!(StackOperation::Completed, result);
        let stack = run(manager.describe_stack("stackctl-prod-addon-vpc-cni"))
            .unwrap()
            .unwrap();
        assert_eq!(StackStatus::CreateComplete, stack.status);
        assert_eq!(Some("vpc-cni"), stack.tag(&manager.config().resource_name_tag));
    }

    #[test]
    fn create_without_waiting_is_only_initiated() {
        let backend = InMemoryStackBackend::new().with_polls_until_complete(3);
        let manager = manager(&backend);
        let input = create_input(&manager, "coredns", json!({"Resources": {}}));
        let result = run(manager.create_stack(input, false)).unwrap();
        assert_eq!(StackOperation::Initiated, result);
    }

    #[test]
    fn failed_creation_is_an_error() {
        let backend = InMemoryStackBackend::new();
        backend.fail_stack_creation("stackctl-prod-addon-coredns");
        let manager = manager(&backend);
        let input = create_input(&manager, "coredns", json!({"Resources": {}}));
        let err = run(manager.create_stack(input, true)).unwrap_err();
        match err {
            StackError::FailedState { status, .. } => {
                assert_eq!(StackStatus::RollbackComplete, status)
            }
            other => panic!("expected failed state, got: {}", other),
        }
    }

    #[test]
    fn wait_times_out_when_the_stack_never_converges() {
        let backend = InMemoryStackBackend::new().with_polls_until_complete(usize::MAX);
        let config = ReconcilerConfig::new("prod").with_wait(
            WaitConfig::fixed_interval(Duration::from_millis(5))
                .with_timeout(Some(Duration::from_millis(30))),
        );
        let manager = StackManager::new(Arc::new(backend.clone()), config);
        let input = create_input(&manager, "kube-proxy", json!({}));
        let err = run(manager.create_stack(input, true)).unwrap_err();
        assert!(matches!(err, StackError::Timeout { .. }), "got: {}", err);
    }

    #[test]
    fn update_with_identical_template_is_not_submitted() {
        let backend = InMemoryStackBackend::new();
        let manager = manager(&backend);
        let template = json!({"Resources": {"Role1": {"Type": "AWS::IAM::Role"}}});
        run(manager.create_stack(create_input(&manager, "vpc-cni", template.clone()), true))
            .unwrap();

        let update = UpdateStackInput {
            name: manager.stack_name(ResourceKind::Addon, "vpc-cni"),
            change_set_name: "updating-policy".to_owned(),
            description: "updating policies".to_owned(),
            template: TemplateBody::from_value(&template),
            parameters: BTreeMap::new(),
        };
        let result = run(manager.update_stack(update.clone(), true)).unwrap();
        assert_eq!(StackOperation::Unchanged, result);
        assert!(backend.updated_stacks().is_empty());

        let changed = UpdateStackInput {
            template: TemplateBody::from_value(&json!({"Resources": {}})),
            ..update
        };
        let result = run(manager.update_stack(changed, true)).unwrap();
        assert_eq!(StackOperation::Completed, result);
        assert_eq!(vec!["stackctl-prod-addon-vpc-cni".to_owned()], backend.updated_stacks());
    }

    #[test]
    fn listing_ignores_deleted_stacks_and_sorts_by_name() {
        let backend = InMemoryStackBackend::new();
        let manager = manager(&backend);
        for name in &["ng-b", "ng-a", "ng-c"] {
            backend.insert_stack(
                &manager.stack_name(ResourceKind::NodeGroup, name),
                StackStatus::CreateComplete,
                json!({}),
            );
        }
        let deleted = manager.stack_name(ResourceKind::NodeGroup, "ng-c");
        run(manager.delete_stack_by_name(&deleted, true)).unwrap();

        let stacks = run(manager.list_stacks_of_kind(ResourceKind::NodeGroup)).unwrap();
        let names = stacks.iter().map(|s| s.name.as_str()).collect::<Vec<_>>();
        assert_eq!(vec!["stackctl-prod-nodegroup-ng-a", "stackctl-prod-nodegroup-ng-b"], names);
        assert!(!run(manager.has_cluster_stack()).unwrap());
    }

    #[test]
    fn addon_listing_excludes_service_account_stacks() {
        let backend = InMemoryStackBackend::new();
        let manager = manager(&backend);
        for (kind, name) in &[
            (ResourceKind::Addon, "vpc-cni"),
            (ResourceKind::IamServiceAccount, "kube-system/aws-node"),
        ] {
            backend.insert_stack(&manager.stack_name(*kind, name), StackStatus::CreateComplete, json!({}));
        }

        let addons = run(manager.list_stacks_of_kind(ResourceKind::Addon)).unwrap();
        let names = addons.iter().map(|s| s.name.as_str()).collect::<Vec<_>>();
        assert_eq!(vec!["stackctl-prod-addon-vpc-cni"], names);

        let accounts = run(manager.list_stacks_of_kind(ResourceKind::IamServiceAccount)).unwrap();
        assert_eq!(1, accounts.len());
    }

    #[test]
    fn invalid_patterns_are_rejected() {
        let backend = InMemoryStackBackend::new();
        let manager = manager(&backend);
        let err = run(manager.list_stacks_matching("^(unclosed")).unwrap_err();
        assert!(matches!(err, StackError::InvalidPattern { .. }));
    }

    #[test]
    fn backend_errors_are_returned() {
        let backend = InMemoryStackBackend::new();
        backend.fail_deletion("stackctl-prod-nodegroup-ng-1");
        let manager = manager(&backend);
        let err = run(manager.delete_stack_by_name("stackctl-prod-nodegroup-ng-1", false))
            .unwrap_err();
        assert!(err.to_string().starts_with("failed to delete stack"));
    }

    #[test]
    fn listing_errors_name_the_pattern() {
        let backend = InMemoryStackBackend::new();
        backend.fail_listing();
        let manager = manager(&backend);
        let err = run(manager.list_stacks_of_kind(ResourceKind::Addon)).unwrap_err();
        assert!(matches!(err, StackError::Backend { .. }), "got: {}", err);
    }

    #[test]
    fn reads_outputs() {
        let backend = InMemoryStackBackend::new();
        let manager = manager(&backend);
        let name = manager.stack_name(ResourceKind::Addon, "vpc-cni");
        backend.insert_stack(&name, StackStatus::CreateComplete, json!({}));
        backend.set_outputs(&name, vec![("Role1", "arn:aws:iam::123:role/x")]);
        assert_eq!("arn:aws:iam::123:role/x", run(manager.output(&name, None)).unwrap());
        let err = run(manager.output(&name, Some("Missing"))).unwrap_err();
        assert!(matches!(err, StackError::MissingOutput { .. }));
    }
}

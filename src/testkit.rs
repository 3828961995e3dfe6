//! In-memory implementations of every collaborator, for use in tests. Each fake is a cheap
//! handle to shared state, so a test can hand a clone to the code under test and keep another
//! clone around to set up state and inspect the calls that were made.
//!
//! **This module is only available when the `testkit` feature is enabled in your Cargo.toml**
use crate::control_plane::{
    AddonSummary, ClusterStatus, ClusterSummary, ControlPlane, UpdateAddonInput,
};
use crate::error::Error;
use crate::kube::{KubeClient, KubeClientProvider, ObjectId, ObjectKind};
use crate::stack::{
    CreateStackInput, Stack, StackBackend, StackOutput, StackStatus, TemplateBody,
    UpdateStackInput,
};

use async_trait::async_trait;
use serde_json::Value;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::{self, Display};
use std::sync::{Arc, Mutex};

macro_rules! test_error {
    ($($arg:tt)*) => {{
        Box::new(TestKitError(format!($($arg)*))) as Error
    }};
}

#[derive(Debug)]
pub struct TestKitError(String);

impl Display for TestKitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Test Error: {}", self.0)
    }
}
impl std::error::Error for TestKitError {}

#[derive(Debug)]
struct StoredStack {
    stack: Stack,
    template: TemplateBody,
    /// polls remaining until the stack leaves its in-progress state, and the state it ends in
    pending: Option<(usize, StackStatus)>,
}

#[derive(Debug, Default)]
struct BackendState {
    stacks: BTreeMap<String, StoredStack>,
    polls_until_complete: usize,
    failing_creates: HashSet<String>,
    failing_deletes: HashSet<String>,
    fail_listing: bool,
    created: Vec<String>,
    updated: Vec<String>,
    deleted: Vec<String>,
    list_calls: usize,
}

/// A stack backend that keeps everything in memory. Every mutation puts the stack into an
/// in-progress state, which it leaves after a configurable number of `describe_stack` calls.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStackBackend(Arc<Mutex<BackendState>>);

fn outputs_for(name: &str, template: &Value) -> Vec<StackOutput> {
    template
        .get("Outputs")
        .and_then(Value::as_object)
        .map(|outputs| {
            outputs
                .keys()
                .map(|key| StackOutput {
                    key: key.clone(),
                    value: format!("arn:aws:iam::000000000000:role/{}-{}", name, key),
                })
                .collect()
        })
        .unwrap_or_default()
}

impl InMemoryStackBackend {
    pub fn new() -> InMemoryStackBackend {
        InMemoryStackBackend::default()
    }

    /// Sets how many times `describe_stack` reports a mutated stack as in progress before it
    /// reaches its terminal state. Use `usize::MAX` for a stack that never converges.
    pub fn with_polls_until_complete(self, polls: usize) -> Self {
        self.state().polls_until_complete = polls;
        self
    }

    /// Creating the stack with the given name will end in `ROLLBACK_COMPLETE`
    pub fn fail_stack_creation(&self, name: &str) {
        self.state().failing_creates.insert(name.to_owned());
    }

    /// Deleting the stack with the given name will return an error
    pub fn fail_deletion(&self, name: &str) {
        self.state().failing_deletes.insert(name.to_owned());
    }

    pub fn fail_listing(&self) {
        self.state().fail_listing = true;
    }

    /// Adds a stack directly, without recording a create call
    pub fn insert_stack(&self, name: &str, status: StackStatus, template: Value) {
        let stack = Stack {
            name: name.to_owned(),
            status,
            status_reason: None,
            outputs: outputs_for(name, &template),
            tags: BTreeMap::new(),
        };
        self.state().stacks.insert(
            name.to_owned(),
            StoredStack {
                stack,
                template: TemplateBody::from_value(&template),
                pending: None,
            },
        );
    }

    pub fn set_outputs(&self, name: &str, outputs: Vec<(&str, &str)>) {
        let mut state = self.state();
        let stored = state
            .stacks
            .get_mut(name)
            .unwrap_or_else(|| panic!("no such stack: {}", name));
        stored.stack.outputs = outputs
            .into_iter()
            .map(|(key, value)| StackOutput {
                key: key.to_owned(),
                value: value.to_owned(),
            })
            .collect();
    }

    pub fn stack(&self, name: &str) -> Option<Stack> {
        self.state().stacks.get(name).map(|s| s.stack.clone())
    }

    pub fn created_stacks(&self) -> Vec<String> {
        self.state().created.clone()
    }

    pub fn updated_stacks(&self) -> Vec<String> {
        self.state().updated.clone()
    }

    pub fn deleted_stacks(&self) -> Vec<String> {
        self.state().deleted.clone()
    }

    pub fn list_calls(&self) -> usize {
        self.state().list_calls
    }

    fn state(&self) -> std::sync::MutexGuard<BackendState> {
        self.0.lock().expect("in-memory stack backend lock poisoned")
    }
}

#[async_trait]
impl StackBackend for InMemoryStackBackend {
    async fn list_stacks(&self) -> Result<Vec<Stack>, Error> {
        let mut state = self.state();
        state.list_calls += 1;
        if state.fail_listing {
            return Err(test_error!("listing stacks is broken"));
        }
        Ok(state.stacks.values().map(|s| s.stack.clone()).collect())
    }

    async fn describe_stack(&self, name: &str) -> Result<Option<Stack>, Error> {
        let mut state = self.state();
        let stored = match state.stacks.get_mut(name) {
            Some(s) => s,
            None => return Ok(None),
        };
        match stored.pending.take() {
            Some((0, terminal)) => {
                stored.stack.status = terminal;
                if terminal == StackStatus::RollbackComplete {
                    stored.stack.status_reason =
                        Some("The following resource(s) failed to create: [Role1]".to_owned());
                }
            }
            Some((usize::MAX, terminal)) => stored.pending = Some((usize::MAX, terminal)),
            Some((remaining, terminal)) => stored.pending = Some((remaining - 1, terminal)),
            None => {}
        }
        Ok(Some(stored.stack.clone()))
    }

    async fn get_template(&self, name: &str) -> Result<Option<TemplateBody>, Error> {
        Ok(self.state().stacks.get(name).map(|s| s.template.clone()))
    }

    async fn create_stack(&self, input: CreateStackInput) -> Result<(), Error> {
        let mut state = self.state();
        if let Some(existing) = state.stacks.get(&input.name) {
            if existing.stack.status != StackStatus::DeleteComplete {
                return Err(test_error!("stack {:?} already exists", input.name));
            }
        }
        let template = input
            .template
            .parse()
            .map_err(|e| test_error!("invalid template: {}", e))?;
        let terminal = if state.failing_creates.contains(&input.name) {
            StackStatus::RollbackComplete
        } else {
            StackStatus::CreateComplete
        };
        let stack = Stack {
            name: input.name.clone(),
            status: StackStatus::CreateInProgress,
            status_reason: None,
            outputs: outputs_for(&input.name, &template),
            tags: input.tags,
        };
        let polls = state.polls_until_complete;
        state.created.push(input.name.clone());
        state.stacks.insert(
            input.name,
            StoredStack {
                stack,
                template: input.template,
                pending: Some((polls, terminal)),
            },
        );
        Ok(())
    }

    async fn update_stack(&self, input: UpdateStackInput) -> Result<(), Error> {
        let mut state = self.state();
        let polls = state.polls_until_complete;
        let stored = state
            .stacks
            .get_mut(&input.name)
            .ok_or_else(|| test_error!("stack {:?} does not exist", input.name))?;
        let template = input
            .template
            .parse()
            .map_err(|e| test_error!("invalid template: {}", e))?;
        let outputs = outputs_for(&input.name, &template);
        if !outputs.is_empty() {
            stored.stack.outputs = outputs;
        }
        stored.stack.status = StackStatus::UpdateInProgress;
        stored.template = input.template;
        stored.pending = Some((polls, StackStatus::UpdateComplete));
        state.updated.push(input.name);
        Ok(())
    }

    async fn delete_stack(&self, name: &str) -> Result<(), Error> {
        let mut state = self.state();
        if state.failing_deletes.contains(name) {
            return Err(test_error!("access denied deleting stack {:?}", name));
        }
        let polls = state.polls_until_complete;
        let stored = match state.stacks.get_mut(name) {
            Some(s) if s.stack.status != StackStatus::DeleteComplete => s,
            _ => return Ok(()),
        };
        stored.stack.status = StackStatus::DeleteInProgress;
        stored.pending = Some((polls, StackStatus::DeleteComplete));
        state.deleted.push(name.to_owned());
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ControlPlaneState {
    cluster: Option<ClusterSummary>,
    addons: BTreeMap<String, AddonSummary>,
    addon_updates: Vec<UpdateAddonInput>,
    deleted_addons: Vec<String>,
    deleted_nodegroups: Vec<String>,
    version_updates: Vec<String>,
    cluster_deleted: bool,
    /// when set, deleting the cluster leaves it in place with this status
    stalled_cluster_status: Option<ClusterStatus>,
    failing_addon_deletes: HashSet<String>,
    failing_nodegroup_deletes: HashSet<String>,
}

/// A control plane for a single cluster. The cluster doesn't exist until `set_cluster` is
/// called, but add-ons can be installed regardless.
#[derive(Debug, Clone)]
pub struct FakeControlPlane {
    cluster_name: String,
    state: Arc<Mutex<ControlPlaneState>>,
}

impl FakeControlPlane {
    pub fn new(cluster_name: impl Into<String>) -> FakeControlPlane {
        FakeControlPlane {
            cluster_name: cluster_name.into(),
            state: Arc::new(Mutex::new(ControlPlaneState::default())),
        }
    }

    pub fn set_cluster(&self, summary: ClusterSummary) {
        self.state().cluster = Some(summary);
    }

    pub fn install_addon(&self, summary: AddonSummary) {
        self.state().addons.insert(summary.name.clone(), summary);
    }

    /// Deleting the cluster is accepted, but the cluster is never removed. It stays around with
    /// the given status instead.
    pub fn stall_cluster_deletion(&self, status: ClusterStatus) {
        self.state().stalled_cluster_status = Some(status);
    }

    pub fn fail_addon_deletion(&self, name: &str) {
        self.state().failing_addon_deletes.insert(name.to_owned());
    }

    pub fn fail_nodegroup_deletion(&self, name: &str) {
        self.state().failing_nodegroup_deletes.insert(name.to_owned());
    }

    pub fn addon_updates(&self) -> Vec<UpdateAddonInput> {
        self.state().addon_updates.clone()
    }

    pub fn deleted_addons(&self) -> Vec<String> {
        self.state().deleted_addons.clone()
    }

    pub fn deleted_nodegroups(&self) -> Vec<String> {
        self.state().deleted_nodegroups.clone()
    }

    pub fn version_updates(&self) -> Vec<String> {
        self.state().version_updates.clone()
    }

    pub fn cluster_deleted(&self) -> bool {
        self.state().cluster_deleted
    }

    fn state(&self) -> std::sync::MutexGuard<ControlPlaneState> {
        self.state.lock().expect("fake control plane lock poisoned")
    }

    fn check_cluster(&self, cluster: &str) -> Result<(), Error> {
        if cluster == self.cluster_name {
            Ok(())
        } else {
            Err(test_error!("no such cluster: {:?}", cluster))
        }
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn describe_cluster(&self, cluster: &str) -> Result<Option<ClusterSummary>, Error> {
        let state = self.state();
        Ok(state.cluster.clone().filter(|c| c.name == cluster))
    }

    async fn update_cluster_version(&self, cluster: &str, version: &str) -> Result<(), Error> {
        self.check_cluster(cluster)?;
        let mut state = self.state();
        state.version_updates.push(version.to_owned());
        if let Some(summary) = state.cluster.as_mut() {
            summary.version = version.to_owned();
        }
        Ok(())
    }

    async fn delete_cluster(&self, cluster: &str) -> Result<(), Error> {
        self.check_cluster(cluster)?;
        let mut state = self.state();
        state.cluster_deleted = true;
        let stalled = state.stalled_cluster_status;
        match stalled {
            Some(status) => {
                if let Some(summary) = state.cluster.as_mut() {
                    summary.status = status;
                }
            }
            None => state.cluster = None,
        }
        Ok(())
    }

    async fn describe_addon(&self, cluster: &str, addon: &str) -> Result<Option<AddonSummary>, Error> {
        self.check_cluster(cluster)?;
        Ok(self.state().addons.get(addon).cloned())
    }

    async fn update_addon(&self, input: UpdateAddonInput) -> Result<(), Error> {
        self.check_cluster(&input.cluster_name)?;
        let mut state = self.state();
        let summary = state
            .addons
            .get_mut(&input.addon_name)
            .ok_or_else(|| test_error!("no such addon: {:?}", input.addon_name))?;
        summary.version = input.version.clone();
        if let Some(arn) = input.service_account_role_arn.as_ref() {
            summary.iam_role = arn.clone();
        }
        state.addon_updates.push(input);
        Ok(())
    }

    async fn delete_addon(&self, cluster: &str, addon: &str) -> Result<(), Error> {
        self.check_cluster(cluster)?;
        let mut state = self.state();
        if state.failing_addon_deletes.contains(addon) {
            return Err(test_error!("addon {:?} could not be deleted", addon));
        }
        state.addons.remove(addon);
        state.deleted_addons.push(addon.to_owned());
        Ok(())
    }

    async fn delete_nodegroup(&self, cluster: &str, nodegroup: &str) -> Result<(), Error> {
        self.check_cluster(cluster)?;
        let mut state = self.state();
        if state.failing_nodegroup_deletes.contains(nodegroup) {
            return Err(test_error!("nodegroup {:?} could not be deleted", nodegroup));
        }
        state.deleted_nodegroups.push(nodegroup.to_owned());
        Ok(())
    }
}

#[derive(Debug, Default)]
struct KubeState {
    objects: HashMap<(ObjectKind, ObjectId), Value>,
    applies: usize,
    clients_created: usize,
}

/// A Kubernetes API that stores objects in memory. Also acts as its own client provider.
#[derive(Debug, Clone, Default)]
pub struct FakeKubeClient(Arc<Mutex<KubeState>>);

fn object_id(object: &Value) -> Option<ObjectId> {
    let metadata = object.get("metadata")?;
    let name = metadata.get("name").and_then(Value::as_str)?;
    let namespace = metadata
        .get("namespace")
        .and_then(Value::as_str)
        .unwrap_or("");
    Some(ObjectId::new(namespace, name))
}

impl FakeKubeClient {
    pub fn new() -> FakeKubeClient {
        FakeKubeClient::default()
    }

    /// Adds an object directly, without counting it as an apply
    pub fn insert(&self, kind: ObjectKind, object: Value) {
        let id = object_id(&object).expect("object must have metadata.name");
        self.state().objects.insert((kind, id), object);
    }

    pub fn object(&self, kind: ObjectKind, id: &ObjectId) -> Option<Value> {
        self.state().objects.get(&(kind, id.clone())).cloned()
    }

    pub fn apply_count(&self) -> usize {
        self.state().applies
    }

    pub fn clients_created(&self) -> usize {
        self.state().clients_created
    }

    fn state(&self) -> std::sync::MutexGuard<KubeState> {
        self.0.lock().expect("fake kube client lock poisoned")
    }
}

#[async_trait]
impl KubeClient for FakeKubeClient {
    async fn get(&self, kind: ObjectKind, id: &ObjectId) -> Result<Option<Value>, Error> {
        Ok(self.object(kind, id))
    }

    async fn apply(&self, kind: ObjectKind, object: Value) -> Result<(), Error> {
        let id = object_id(&object).ok_or_else(|| test_error!("object has no name: {}", object))?;
        let mut state = self.state();
        state.applies += 1;
        state.objects.insert((kind, id), object);
        Ok(())
    }
}

impl KubeClientProvider for FakeKubeClient {
    fn client_for(&self, _cluster: &ClusterSummary) -> Result<Arc<dyn KubeClient>, Error> {
        self.state().clients_created += 1;
        Ok(Arc::new(self.clone()))
    }
}

//! IAM roles for Kubernetes service accounts. Each service account is reconciled as a strictly
//! ordered chain: first the stack holding its role, then the service account itself, annotated
//! with the role's ARN. The service account can't be created without the role, so a failed
//! role stack stops the chain. Chains for different service accounts run in parallel.
use crate::config::ServiceAccountSpec;
use crate::error::{Error, ReconcileError};
use crate::kube::{self, KubeClient, ObjectId, ObjectKind, ROLE_ARN_ANNOTATION};
use crate::runner::{Task, TaskContext, TaskOutcome, TaskTree};
use crate::stack::{
    CreateStackInput, ResourceKind, StackManager, StackNames, TemplateBody, UpdateStackInput,
};
use crate::template::{build_iam_role_template, OidcBinding, RoleTemplateInput, ROLE_ARN_OUTPUT};

use async_trait::async_trait;
use serde_json::Value;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

#[derive(Clone)]
pub struct ServiceAccountManager {
    stacks: StackManager,
    kube: Arc<dyn KubeClient>,
    oidc: OidcBinding,
}

impl ServiceAccountManager {
    pub fn new(stacks: StackManager, kube: Arc<dyn KubeClient>, oidc: OidcBinding) -> Self {
        ServiceAccountManager { stacks, kube, oidc }
    }

    pub fn stack_name(&self, sa: &ServiceAccountSpec) -> String {
        self.stacks
            .stack_name(ResourceKind::IamServiceAccount, &sa.name_string())
    }

    /// Returns the names of the stacks that already exist for any of the given service accounts
    pub async fn existing_stacks(&self) -> Result<HashSet<String>, ReconcileError> {
        let stacks = self
            .stacks
            .list_stacks_of_kind(ResourceKind::IamServiceAccount)
            .await?;
        Ok(stacks.into_iter().map(|s| s.name).collect())
    }

    /// Builds one chain per service account. Service accounts that already have a role stack
    /// are left out, unless `override_existing` is set, in which case their stack is updated in
    /// place.
    pub async fn create_tasks(
        &self,
        service_accounts: &[ServiceAccountSpec],
        override_existing: bool,
    ) -> Result<TaskTree, ReconcileError> {
        let existing = self.existing_stacks().await?;
        let mut tasks = TaskTree::parallel();
        for sa in service_accounts {
            let stack_name = self.stack_name(sa);
            let exists = existing.contains(&stack_name);
            if exists && !override_existing {
                log::info!(
                    "serviceaccount {:?} already exists and will be excluded",
                    sa.name_string()
                );
                continue;
            }
            let chain = TaskTree::sequential_stop_on_error()
                .with_task(CreateRoleTask {
                    manager: self.clone(),
                    spec: sa.clone(),
                    stack_name: stack_name.clone(),
                    update_existing: exists,
                })
                .with_task(CreateServiceAccountTask {
                    manager: self.clone(),
                    spec: sa.clone(),
                    stack_name,
                });
            tasks.append_tree(chain);
        }
        Ok(tasks)
    }

    fn render_template(&self, sa: &ServiceAccountSpec) -> Result<TemplateBody, ReconcileError> {
        let meta = &sa.metadata;
        let resource_name = sa.name_string();
        let input = RoleTemplateInput {
            resource_name: &resource_name,
            service_account: Some((meta.namespace.as_str(), meta.name.as_str())),
            attach_policy_arns: &sa.attach_policy_arns,
            attach_policy: sa.attach_policy.as_ref(),
            oidc: &self.oidc,
        };
        build_iam_role_template(&input)
    }
}

struct CreateRoleTask {
    manager: ServiceAccountManager,
    spec: ServiceAccountSpec,
    stack_name: String,
    update_existing: bool,
}

#[async_trait]
impl Task for CreateRoleTask {
    fn describe(&self) -> String {
        format!(
            "create IAM role for serviceaccount {:?}",
            self.spec.name_string()
        )
    }

    async fn run(&self, ctx: &TaskContext) -> Result<TaskOutcome, Error> {
        let stacks = &self.manager.stacks;
        let template = self.manager.render_template(&self.spec)?;

        if self.update_existing {
            if ctx.plan_mode() {
                let change = stacks
                    .diff_template(&self.stack_name, &template)
                    .await
                    .map_err(ReconcileError::from)?;
                return Ok(if change.is_identical() {
                    TaskOutcome::Unchanged
                } else {
                    TaskOutcome::Planned(format!("would update IAM stack {:?}", self.stack_name))
                });
            }
            let input = UpdateStackInput {
                name: self.stack_name.clone(),
                change_set_name: "updating-policy".to_owned(),
                description: "updating policies".to_owned(),
                template,
                parameters: BTreeMap::new(),
            };
            let op = stacks
                .update_stack(input, true)
                .await
                .map_err(ReconcileError::from)?;
            return Ok(op.into());
        }

        if ctx.plan_mode() {
            return Ok(TaskOutcome::Planned(format!(
                "would create IAM stack {:?}",
                self.stack_name
            )));
        }
        let input = CreateStackInput {
            name: self.stack_name.clone(),
            template,
            tags: stacks.tags_for(ResourceKind::IamServiceAccount, &self.spec.name_string()),
            parameters: BTreeMap::new(),
        };
        // the next step needs the role ARN, so this always waits
        let op = stacks
            .create_stack(input, true)
            .await
            .map_err(ReconcileError::from)?;
        Ok(op.into())
    }
}

struct CreateServiceAccountTask {
    manager: ServiceAccountManager,
    spec: ServiceAccountSpec,
    stack_name: String,
}

#[async_trait]
impl Task for CreateServiceAccountTask {
    fn describe(&self) -> String {
        format!("create serviceaccount {:?}", self.spec.name_string())
    }

    async fn run(&self, ctx: &TaskContext) -> Result<TaskOutcome, Error> {
        let meta = &self.spec.metadata;
        let id = ObjectId::new(meta.namespace.as_str(), meta.name.as_str());
        let kube_client = &*self.manager.kube;

        let current = kube_client
            .get(ObjectKind::ServiceAccount, &id)
            .await
            .map_err(|e| ReconcileError::remote("get serviceaccount", id.to_string(), e))?;
        let mut annotations = current
            .as_ref()
            .and_then(|sa| sa.pointer("/metadata/annotations"))
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_owned())))
                    .collect::<BTreeMap<_, _>>()
            })
            .unwrap_or_default();

        if ctx.plan_mode() {
            let verb = if current.is_some() { "update" } else { "create" };
            return Ok(TaskOutcome::Planned(format!(
                "would {} serviceaccount {:?} with the role from stack {:?}",
                verb, id.to_string(), self.stack_name
            )));
        }

        let pattern = StackNames::exact_pattern(&self.stack_name);
        if self
            .manager
            .stacks
            .list_stacks_matching(&pattern)
            .await
            .map_err(ReconcileError::from)?
            .is_empty()
        {
            return Err(ReconcileError::not_found("stack", self.stack_name.as_str()).into());
        }
        let role_arn = self
            .manager
            .stacks
            .output(&self.stack_name, Some(ROLE_ARN_OUTPUT))
            .await
            .map_err(ReconcileError::from)?;

        if annotations.get(ROLE_ARN_ANNOTATION) == Some(&role_arn) {
            log::info!("serviceaccount {:?} is already annotated with role {:?}", id.to_string(), role_arn);
            return Ok(TaskOutcome::Unchanged);
        }
        annotations.insert(ROLE_ARN_ANNOTATION.to_owned(), role_arn);

        let object = match current {
            Some(mut existing) => {
                if let Some(metadata) = existing.get_mut("metadata").and_then(Value::as_object_mut) {
                    metadata.insert("annotations".to_owned(), serde_json::json!(annotations));
                }
                existing
            }
            None => kube::service_account(&id, &annotations),
        };
        log::info!("creating serviceaccount {:?}", id.to_string());
        kube_client
            .apply(ObjectKind::ServiceAccount, object)
            .await
            .map_err(|e| ReconcileError::remote("apply serviceaccount", id.to_string(), e))?;
        Ok(TaskOutcome::Completed)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{ReconcilerConfig, ServiceAccountMeta, WaitConfig};
    use crate::kube::str_value;
    use crate::stack::StackStatus;
    use crate::testkit::{FakeKubeClient, InMemoryStackBackend};

    use serde_json::json;
    use std::time::Duration;

    fn run<F: std::future::Future>(future: F) -> F::Output {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(future)
    }

    fn setup() -> (InMemoryStackBackend, FakeKubeClient, ServiceAccountManager) {
        let backend = InMemoryStackBackend::new();
        let kube = FakeKubeClient::new();
        let config = ReconcilerConfig::new("prod")
            .with_stack_name_prefix("stackctl")
            .with_wait(WaitConfig::fixed_interval(Duration::from_millis(1)));
        let stacks = StackManager::new(Arc::new(backend.clone()), config);
        let oidc = OidcBinding::from_issuer_url("https://oidc.example.com/id/ABC", "123456789012").unwrap();
        let manager = ServiceAccountManager::new(stacks, Arc::new(kube.clone()), oidc);
        (backend, kube, manager)
    }

    fn spec(namespace: &str, name: &str) -> ServiceAccountSpec {
        ServiceAccountSpec {
            metadata: ServiceAccountMeta {
                name: name.to_owned(),
                namespace: namespace.to_owned(),
            },
            attach_policy_arns: vec!["arn:aws:iam::aws:policy/AmazonS3ReadOnlyAccess".to_owned()],
            attach_policy: None,
        }
    }

    #[test]
    fn creates_role_then_annotated_service_account() {
        let (backend, kube, manager) = setup();
        let tree = run(manager.create_tasks(&[spec("baz", "fooo")], false)).unwrap();
        assert_eq!(
            "1 task: { 2 sequential sub-tasks: { create IAM role for serviceaccount \"baz/fooo\", create serviceaccount \"baz/fooo\" } }",
            tree.describe()
        );
        let report = run(tree.do_all(false));
        assert!(report.is_success(), "failures: {:?}", report.failures);
        assert_eq!(
            vec!["stackctl-prod-addon-iamserviceaccount-baz-fooo".to_owned()],
            backend.created_stacks()
        );

        let sa = kube
            .object(ObjectKind::ServiceAccount, &ObjectId::new("baz", "fooo"))
            .unwrap();
        let arn = str_value(&sa, "/metadata/annotations/eks.amazonaws.com~1role-arn").unwrap();
        assert!(arn.starts_with("arn:aws:iam::"), "unexpected arn: {}", arn);
    }

    #[test]
    fn failed_role_stack_never_creates_the_service_account() {
        let (backend, kube, manager) = setup();
        backend.fail_stack_creation("stackctl-prod-addon-iamserviceaccount-baz-fooo");
        let tree = run(manager.create_tasks(&[spec("baz", "fooo"), spec("default", "ok")], false)).unwrap();
        let report = run(tree.do_all(false));
        assert_eq!(1, report.failures.len());
        assert_eq!(vec!["create serviceaccount \"baz/fooo\"".to_owned()], report.skipped);
        assert!(kube
            .object(ObjectKind::ServiceAccount, &ObjectId::new("baz", "fooo"))
            .is_none());
        assert!(kube
            .object(ObjectKind::ServiceAccount, &ObjectId::new("default", "ok"))
            .is_some());
    }

    #[test]
    fn existing_service_accounts_are_excluded_unless_overridden() {
        let (backend, _kube, manager) = setup();
        backend.insert_stack(
            "stackctl-prod-addon-iamserviceaccount-baz-fooo",
            StackStatus::CreateComplete,
            json!({}),
        );
        let tree = run(manager.create_tasks(&[spec("baz", "fooo")], false)).unwrap();
        assert!(tree.is_empty());

        let tree = run(manager.create_tasks(&[spec("baz", "fooo")], true)).unwrap();
        assert_eq!(1, tree.len());
    }

    #[test]
    fn plan_mode_builds_the_same_tasks_and_changes_nothing() {
        let (backend, kube, manager) = setup();
        let sas = [spec("baz", "fooo")];
        let planned = run(manager.create_tasks(&sas, false)).unwrap();
        let real = run(manager.create_tasks(&sas, false)).unwrap();
        assert_eq!(real.task_descriptions(), planned.task_descriptions());

        let report = run(planned.do_all(true));
        assert!(report.is_success());
        assert!(backend.created_stacks().is_empty());
        assert_eq!(0, kube.apply_count());
    }
}

use stackctl::config::{Addon, ManagedNodeGroup, NodeGroup, ServiceAccountMeta};
use stackctl::control_plane::{AddonSummary, ResolveConflicts};
use stackctl::kube::{ObjectId, ObjectKind, ROLE_ARN_ANNOTATION};
use stackctl::prelude::*;
use stackctl::stack::{ResourceKind, StackNames, StackStatus};
use stackctl::testkit::{FakeControlPlane, FakeKubeClient, InMemoryStackBackend};

use stackctl::serde_json::json;

use std::sync::Arc;
use std::time::Duration;

const CLUSTER: &str = "prod";
const POLICY_ARN: &str = "arn:aws:iam::aws:policy/AmazonEKS_CNI_Policy";

fn run<F: std::future::Future>(future: F) -> F::Output {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build runtime");
    runtime.block_on(future)
}

struct TestKit {
    control_plane: FakeControlPlane,
    backend: InMemoryStackBackend,
    kube: FakeKubeClient,
    stacks: StackManager,
}

fn setup() -> TestKit {
    std::env::set_var("RUST_LOG", "stackctl=debug");
    let _ = env_logger::try_init();

    let control_plane = FakeControlPlane::new(CLUSTER);
    let backend = InMemoryStackBackend::new().with_polls_until_complete(2);
    let kube = FakeKubeClient::new();
    let config = ReconcilerConfig::new(CLUSTER)
        .with_stack_name_prefix("stackctl")
        .with_wait(WaitConfig::fixed_interval(Duration::from_millis(1)));
    let stacks = StackManager::new(Arc::new(backend.clone()), config);
    TestKit {
        control_plane,
        backend,
        kube,
        stacks,
    }
}

impl TestKit {
    fn oidc(&self) -> OidcBinding {
        OidcBinding::from_issuer_url("https://oidc.eks.us-west-2.amazonaws.com/id/ABC123", "123456789012")
            .expect("invalid issuer")
    }

    fn addons(&self) -> AddonManager {
        AddonManager::new(Arc::new(self.control_plane.clone()), self.stacks.clone(), Some(self.oidc()))
    }

    fn service_accounts(&self) -> ServiceAccountManager {
        ServiceAccountManager::new(self.stacks.clone(), Arc::new(self.kube.clone()), self.oidc())
    }

    fn nodegroups(&self) -> NodeGroupManager {
        NodeGroupManager::new(Arc::new(self.control_plane.clone()), self.stacks.clone())
    }

    fn install_vpc_cni(&self) {
        self.control_plane.install_addon(AddonSummary {
            name: "vpc-cni".to_owned(),
            version: "1.9.0".to_owned(),
            iam_role: String::new(),
            status: "ACTIVE".to_owned(),
        });
    }
}

fn vpc_cni_with_policy() -> Addon {
    Addon {
        attach_policy_arns: vec![POLICY_ARN.to_owned()],
        ..Addon::new("vpc-cni")
    }
}

fn service_account(namespace: &str, name: &str) -> ServiceAccountSpec {
    ServiceAccountSpec {
        metadata: ServiceAccountMeta {
            namespace: namespace.to_owned(),
            name: name.to_owned(),
        },
        attach_policy_arns: vec!["arn:aws:iam::aws:policy/AmazonS3ReadOnlyAccess".to_owned()],
        attach_policy: None,
    }
}

#[test]
fn vpc_cni_addon_gets_a_new_role_and_keeps_its_version() {
    let kit = setup();
    kit.install_vpc_cni();

    let report = run(kit.addons().update_tasks(&[vpc_cni_with_policy()]).do_all(false));
    assert!(report.is_success(), "failures: {:?}", report.failures);

    let stack_name = "stackctl-prod-addon-vpc-cni";
    assert_eq!(vec![stack_name.to_owned()], kit.backend.created_stacks());
    let stack = kit.backend.stack(stack_name).expect("stack was not created");
    assert_eq!(StackStatus::CreateComplete, stack.status);

    let updates = kit.control_plane.addon_updates();
    assert_eq!(1, updates.len());
    let update = &updates[0];
    assert_eq!("vpc-cni", update.addon_name);
    assert_eq!("1.9.0", update.version);
    assert_eq!(stack.output("Role1").map(str::to_owned), update.service_account_role_arn);
    assert_eq!(None::<ResolveConflicts>, update.resolve_conflicts);
}

#[test]
fn second_run_is_unchanged() {
    let kit = setup();
    kit.install_vpc_cni();
    let tasks = kit.addons().update_tasks(&[vpc_cni_with_policy()]);

    let first = run(tasks.do_all(false));
    assert_eq!(Some(&TaskOutcome::Completed), first.outcome_of("update addon \"vpc-cni\""));

    let second = run(tasks.do_all(false));
    assert!(second.is_success());
    assert_eq!(Some(&TaskOutcome::Unchanged), second.outcome_of("update addon \"vpc-cni\""));
    assert_eq!(1, kit.control_plane.addon_updates().len());
    assert_eq!(1, kit.backend.created_stacks().len());
    assert!(kit.backend.updated_stacks().is_empty());
}

#[test]
fn plan_mode_builds_the_same_tasks_and_changes_nothing() {
    let kit = setup();
    kit.install_vpc_cni();
    let addons = vec![vpc_cni_with_policy()];
    let service_accounts = vec![service_account("default", "app")];

    let addon_tasks = kit.addons().update_tasks(&addons);
    let sa_tasks = run(kit.service_accounts().create_tasks(&service_accounts, false)).unwrap();
    let mut tasks = TaskTree::parallel();
    tasks.append_tree(addon_tasks);
    tasks.append_tree(sa_tasks);
    let described = tasks.describe();

    let report = run(tasks.do_all(true));
    assert!(report.is_success(), "failures: {:?}", report.failures);
    assert!(report.completed.iter().all(|task| task.outcome.is_planned()));
    assert!(kit.backend.created_stacks().is_empty());
    assert!(kit.control_plane.addon_updates().is_empty());
    assert_eq!(0, kit.kube.apply_count());

    // the same desired state builds the same tree whether or not it runs in plan mode
    let rebuilt = {
        let mut tree = TaskTree::parallel();
        tree.append_tree(kit.addons().update_tasks(&addons));
        tree.append_tree(run(kit.service_accounts().create_tasks(&service_accounts, false)).unwrap());
        tree
    };
    assert_eq!(described, rebuilt.describe());
}

#[test]
fn nodegroups_are_partitioned_by_stack_ownership() {
    let kit = setup();
    for name in &["ng-1", "ng-2", "mng-1"] {
        let stack_name = kit.stacks.stack_name(ResourceKind::NodeGroup, name);
        kit.backend.insert_stack(&stack_name, StackStatus::CreateComplete, json!({}));
    }
    let node_groups = vec![NodeGroup { name: "ng-1".to_owned() }, NodeGroup { name: "ng-2".to_owned() }];
    let managed = vec![
        ManagedNodeGroup { name: "mng-1".to_owned() },
        ManagedNodeGroup { name: "mng-2".to_owned() },
    ];

    let manager = kit.nodegroups();
    let tasks = run(manager.delete_tasks(&node_groups, &managed, true)).unwrap();
    let descriptions = tasks.task_descriptions();
    assert_eq!(
        vec![
            "delete nodegroup \"ng-1\"",
            "delete nodegroup \"ng-2\"",
            "delete nodegroup \"mng-1\"",
            "delete unowned nodegroup \"mng-2\"",
        ],
        descriptions
    );

    let report = run(tasks.do_all(false));
    assert!(report.is_success(), "failures: {:?}", report.failures);
    assert_eq!(3, kit.backend.deleted_stacks().len());
    assert_eq!(vec!["mng-2".to_owned()], kit.control_plane.deleted_nodegroups());
}

#[test]
fn explicit_role_arn_takes_precedence_over_policies() {
    let kit = setup();
    kit.install_vpc_cni();
    let addon = Addon {
        service_account_role_arn: "arn:aws:iam::123456789012:role/explicit".to_owned(),
        ..vpc_cni_with_policy()
    };

    let report = run(kit.addons().update_tasks(&[addon]).do_all(false));
    assert!(report.is_success());
    assert!(kit.backend.created_stacks().is_empty());
    let update = kit.control_plane.addon_updates().pop().unwrap();
    assert_eq!(
        Some("arn:aws:iam::123456789012:role/explicit".to_owned()),
        update.service_account_role_arn
    );
}

#[test]
fn stack_names_are_deterministic() {
    let names = StackNames::new("stackctl", "prod");
    assert_eq!("stackctl-prod-cluster", names.cluster());
    assert_eq!(
        names.resource(ResourceKind::Addon, "vpc-cni"),
        StackNames::new("stackctl", "prod").resource(ResourceKind::Addon, "vpc-cni")
    );
    assert_eq!(
        "stackctl-prod-addon-iamserviceaccount-kube-system-aws-node",
        names.resource(ResourceKind::IamServiceAccount, "kube-system/aws-node")
    );

    let kit = setup();
    assert_eq!(
        kit.addons().stack_name(&Addon::new("vpc-cni")),
        kit.addons().stack_name(&Addon::new("vpc-cni"))
    );
}

#[test]
fn serviceaccount_is_not_annotated_when_its_role_fails() {
    let kit = setup();
    let failing = service_account("default", "broken");
    let working = service_account("default", "app");
    let manager = kit.service_accounts();
    kit.backend.fail_stack_creation(&manager.stack_name(&failing));

    let tasks = run(manager.create_tasks(&[failing, working], false)).unwrap();
    let report = run(tasks.do_all(false));

    assert_eq!(1, report.failures.len());
    assert_eq!(
        "create IAM role for serviceaccount \"default/broken\"",
        report.failures[0].description
    );
    assert_eq!(vec!["create serviceaccount \"default/broken\"".to_owned()], report.skipped);
    assert!(kit
        .kube
        .object(ObjectKind::ServiceAccount, &ObjectId::new("default", "broken"))
        .is_none());

    let annotated = kit
        .kube
        .object(ObjectKind::ServiceAccount, &ObjectId::new("default", "app"))
        .expect("serviceaccount was not created");
    let role_arn = annotated
        .pointer(&format!("/metadata/annotations/{}", ROLE_ARN_ANNOTATION.replace('/', "~1")))
        .and_then(|v| v.as_str());
    assert_eq!(
        Some("arn:aws:iam::000000000000:role/stackctl-prod-addon-iamserviceaccount-default-app-Role1"),
        role_arn
    );

    let err = report.into_result("create", "iamserviceaccount(s)").unwrap_err();
    assert_eq!("failed to create iamserviceaccount(s)", err.to_string());
}

#[test]
fn one_failing_addon_does_not_stop_the_others() {
    let kit = setup();
    for name in &["vpc-cni", "coredns"] {
        kit.control_plane.install_addon(AddonSummary {
            name: name.to_string(),
            version: "1.0.0".to_owned(),
            iam_role: String::new(),
            status: "ACTIVE".to_owned(),
        });
    }
    kit.control_plane.fail_addon_deletion("vpc-cni");

    let tasks = kit
        .addons()
        .delete_tasks(&[Addon::new("vpc-cni"), Addon::new("coredns")], true);
    let report = run(tasks.do_all(false));
    assert_eq!(1, report.failures.len());
    assert_eq!(vec!["delete IAM stack for addon \"vpc-cni\"".to_owned()], report.skipped);
    assert_eq!(vec!["coredns".to_owned()], kit.control_plane.deleted_addons());
}

#[test]
fn upgrade_updates_control_plane_then_kube_proxy() {
    let kit = setup();
    kit.control_plane.set_cluster(ClusterSummary {
        name: CLUSTER.to_owned(),
        status: stackctl::control_plane::ClusterStatus::Active,
        version: "1.18".to_owned(),
        oidc_issuer: None,
        account_id: "123456789012".to_owned(),
    });
    kit.backend
        .insert_stack("stackctl-prod-cluster", StackStatus::CreateComplete, json!({}));
    kit.kube.insert(
        ObjectKind::DaemonSet,
        json!({
            "metadata": { "namespace": "kube-system", "name": "kube-proxy" },
            "spec": { "template": { "spec": { "containers": [
                { "name": "kube-proxy", "image": "eks/kube-proxy:v1.18-eksbuild.1" }
            ] } } }
        }),
    );
    let cfg = ClusterConfig::from_yaml_str("metadata:\n  name: prod\n  version: \"1.19\"\n").unwrap();
    let provider = ClusterProvider {
        control_plane: Arc::new(kit.control_plane.clone()),
        stack_backend: Arc::new(kit.backend.clone()),
        kube_clients: Arc::new(kit.kube.clone()),
    };
    let config = kit.stacks.config().clone();

    let report = run(async {
        let cluster = cluster::new(cfg, &provider, config).await?;
        cluster.upgrade(false).await
    })
    .unwrap();
    assert!(report.is_success());
    assert_eq!(vec!["1.19".to_owned()], kit.control_plane.version_updates());
    let daemonset = kit
        .kube
        .object(ObjectKind::DaemonSet, &ObjectId::new("kube-system", "kube-proxy"))
        .unwrap();
    assert_eq!(
        Some("eks/kube-proxy:v1.19-eksbuild.1"),
        daemonset
            .pointer("/spec/template/spec/containers/0/image")
            .and_then(|v| v.as_str())
    );
}

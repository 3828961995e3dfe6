//! The task orchestration engine. Reconcilers describe the work they need done as a tree of
//! `Task`s, composed into sequential and parallel groups, and the engine runs the whole tree
//! to completion, collecting every failure instead of stopping at the first one.
//!
//! - Children of a parallel group all run concurrently. Each child reports independently, and
//!   no child can cancel another.
//! - Children of a sequential group run one at a time in declaration order. A failure does not
//!   stop the group unless it was created with `TaskTree::sequential_stop_on_error`, in which
//!   case every later step is reported as skipped and never started.
//! - Every leaf runs on its own spawned future, so a leaf that is waiting on a remote operation
//!   never holds up its siblings, and a panicking leaf is reported as a failure of that leaf.
//!
//! Plan mode is passed to the tasks through the `TaskContext`. It never changes the shape of
//! the tree, only what each task does when it runs.
pub mod metrics;
pub mod task;

pub use self::metrics::Metrics;
pub use self::task::{FnTask, Task, TaskContext, TaskOutcome};

use crate::error::{Error, ReconcileError};

use futures_util::future::{join_all, BoxFuture, FutureExt};

use std::fmt::{self, Debug, Display};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Mode {
    Sequential { stop_on_error: bool },
    Parallel,
}

enum Node {
    Task(Arc<dyn Task>),
    Tree(TaskTree),
}

impl Node {
    fn describe(&self) -> String {
        match self {
            Node::Task(task) => task.describe(),
            Node::Tree(tree) => tree.describe_at_depth(1),
        }
    }

    fn leaf_descriptions(&self, into: &mut Vec<String>) {
        match self {
            Node::Task(task) => into.push(task.describe()),
            Node::Tree(tree) => {
                for child in tree.children.iter() {
                    child.leaf_descriptions(into);
                }
            }
        }
    }
}

/// A group of tasks, which may themselves be groups. The root of every run is a `TaskTree`.
pub struct TaskTree {
    mode: Mode,
    children: Vec<Node>,
}

impl Debug for TaskTree {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TaskTree({})", self.describe())
    }
}

impl TaskTree {
    pub fn parallel() -> TaskTree {
        TaskTree {
            mode: Mode::Parallel,
            children: Vec::new(),
        }
    }

    /// A sequential group where a failed child does not prevent later children from running
    pub fn sequential() -> TaskTree {
        TaskTree {
            mode: Mode::Sequential {
                stop_on_error: false,
            },
            children: Vec::new(),
        }
    }

    /// A sequential group for strictly dependent steps. Once a child fails, none of the
    /// remaining children are started.
    pub fn sequential_stop_on_error() -> TaskTree {
        TaskTree {
            mode: Mode::Sequential {
                stop_on_error: true,
            },
            children: Vec::new(),
        }
    }

    pub fn append(&mut self, task: impl Task) {
        self.children.push(Node::Task(Arc::new(task)));
    }

    pub fn append_boxed(&mut self, task: Box<dyn Task>) {
        self.children.push(Node::Task(Arc::from(task)));
    }

    /// Nests another group inside of this one. Empty groups are dropped, since they would
    /// only add noise to the description.
    pub fn append_tree(&mut self, tree: TaskTree) {
        if !tree.is_empty() {
            self.children.push(Node::Tree(tree));
        }
    }

    pub fn with_task(mut self, task: impl Task) -> Self {
        self.append(task);
        self
    }

    pub fn with_tree(mut self, tree: TaskTree) -> Self {
        self.append_tree(tree);
        self
    }

    pub fn is_parallel(&self) -> bool {
        self.mode == Mode::Parallel
    }

    /// The number of direct children of this group
    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// The descriptions of every leaf task in the tree, in declaration order
    pub fn task_descriptions(&self) -> Vec<String> {
        let mut descriptions = Vec::new();
        for child in self.children.iter() {
            child.leaf_descriptions(&mut descriptions);
        }
        descriptions
    }

    /// Renders the tree in a single line, like:
    /// `2 parallel tasks: { delete addon "coredns", 2 sequential sub-tasks: { a, b } }`
    pub fn describe(&self) -> String {
        self.describe_at_depth(0)
    }

    fn describe_at_depth(&self, depth: usize) -> String {
        if self.children.is_empty() {
            return "no tasks".to_owned();
        }
        let count = self.children.len();
        let mut noun = if count == 1 { "task" } else { "tasks" }.to_owned();
        if depth > 0 {
            noun.insert_str(0, "sub-");
        }
        let descriptions = self
            .children
            .iter()
            .map(Node::describe)
            .collect::<Vec<_>>()
            .join(", ");
        if count == 1 {
            format!("{} {}: {{ {} }}", count, noun, descriptions)
        } else {
            let mode = match self.mode {
                Mode::Parallel => "parallel",
                Mode::Sequential { .. } => "sequential",
            };
            format!("{} {} {}: {{ {} }}", count, mode, noun, descriptions)
        }
    }

    /// Runs every task in the tree and returns once all of them have finished. Must be called
    /// from within a tokio runtime, since each leaf is spawned onto it.
    pub async fn run(&self, ctx: &TaskContext) -> RunReport {
        let start_time = Instant::now();
        if ctx.plan_mode() {
            log::info!("(plan) {}", self.describe());
        } else {
            log::info!("{}", self.describe());
        }
        let report = run_tree(self, ctx).await;
        log::debug!(
            "Finished running {} tasks in {}ms with {} failures",
            report.completed.len() + report.failures.len() + report.skipped.len(),
            duration_to_millis(start_time.elapsed()),
            report.failures.len()
        );
        report
    }

    /// Convenience for running the tree with a fresh `TaskContext`
    pub async fn do_all(&self, plan_mode: bool) -> RunReport {
        self.run(&TaskContext::new(plan_mode)).await
    }
}

fn run_tree<'a>(tree: &'a TaskTree, ctx: &'a TaskContext) -> BoxFuture<'a, RunReport> {
    async move {
        match tree.mode {
            Mode::Parallel => {
                let reports = join_all(tree.children.iter().map(|child| run_node(child, ctx))).await;
                let mut report = RunReport::default();
                for child_report in reports {
                    report.merge(child_report);
                }
                report
            }
            Mode::Sequential { stop_on_error } => {
                let mut report = RunReport::default();
                let mut children = tree.children.iter();
                while let Some(child) = children.next() {
                    let child_report = run_node(child, ctx).await;
                    let failed = child_report.has_failures();
                    report.merge(child_report);

                    if failed && stop_on_error {
                        let mut skipped = Vec::new();
                        for remaining in children.by_ref() {
                            remaining.leaf_descriptions(&mut skipped);
                        }
                        for description in skipped.iter() {
                            ctx.metrics().task_skipped();
                            log::warn!("skipping {:?} because a previous step failed", description);
                        }
                        report.skipped.extend(skipped);
                        break;
                    }
                }
                report
            }
        }
    }
    .boxed()
}

fn run_node<'a>(node: &'a Node, ctx: &'a TaskContext) -> BoxFuture<'a, RunReport> {
    match node {
        Node::Tree(tree) => run_tree(tree, ctx),
        Node::Task(task) => run_leaf(task.clone(), ctx).boxed(),
    }
}

async fn run_leaf(task: Arc<dyn Task>, ctx: &TaskContext) -> RunReport {
    let description = task.describe();
    let start_time = Instant::now();
    let timer = ctx.metrics().task_started();
    log::debug!("Starting task: {:?}", description);

    let task_ctx = ctx.clone();
    let handle = tokio::spawn(async move { task.run(&task_ctx).await });
    // the join handle is the single point where the leaf's result is observed
    let result = match handle.await {
        Ok(result) => result,
        Err(join_err) => Err(ReconcileError::from(join_err).into()),
    };
    timer.observe_duration();

    let duration = start_time.elapsed();
    let mut report = RunReport::default();
    match result {
        Ok(outcome) => {
            log::debug!(
                "Finished task: {:?} in {}ms, outcome: {}",
                description,
                duration_to_millis(duration),
                outcome
            );
            ctx.metrics().task_succeeded(outcome_label(&outcome));
            report.completed.push(CompletedTask {
                description,
                outcome,
                duration,
            });
        }
        Err(error) => {
            log::debug!(
                "Task: {:?} failed after {}ms: {}",
                description,
                duration_to_millis(duration),
                error
            );
            ctx.metrics().task_failed();
            report.failures.push(TaskFailure { description, error });
        }
    }
    report
}

fn outcome_label(outcome: &TaskOutcome) -> &'static str {
    match outcome {
        TaskOutcome::Completed => "completed",
        TaskOutcome::Initiated => "initiated",
        TaskOutcome::Planned(_) => "planned",
        TaskOutcome::Unchanged => "unchanged",
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletedTask {
    pub description: String,
    pub outcome: TaskOutcome,
    pub duration: Duration,
}

#[derive(Debug)]
pub struct TaskFailure {
    pub description: String,
    pub error: Error,
}

impl Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.description, self.error)
    }
}

/// The aggregated result of running a `TaskTree`. Entries appear in declaration order, no
/// matter what order the tasks actually finished in.
#[derive(Debug, Default)]
pub struct RunReport {
    pub completed: Vec<CompletedTask>,
    pub failures: Vec<TaskFailure>,
    /// Tasks that were never started because an earlier step of a stop-on-error group failed
    pub skipped: Vec<String>,
}

impl RunReport {
    pub fn merge(&mut self, other: RunReport) {
        let RunReport {
            completed,
            failures,
            skipped,
        } = other;
        self.completed.extend(completed);
        self.failures.extend(failures);
        self.skipped.extend(skipped);
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    pub fn is_success(&self) -> bool {
        !self.has_failures()
    }

    /// Returns the outcome of the completed task with the given description, if there is one
    pub fn outcome_of(&self, description: &str) -> Option<&TaskOutcome> {
        self.completed
            .iter()
            .find(|task| task.description == description)
            .map(|task| &task.outcome)
    }

    /// Logs every failure and converts them into a single summary error, naming the kind of
    /// operation that failed, for example "failed to delete nodegroup(s)"
    pub fn into_result(self, verb: &'static str, subject: &str) -> Result<RunReport, Error> {
        if self.failures.is_empty() {
            Ok(self)
        } else {
            Err(handle_errors(&self.failures, verb, subject))
        }
    }
}

pub fn handle_errors(failures: &[TaskFailure], verb: &'static str, subject: &str) -> Error {
    log::info!("{} error(s) occurred while {} {}", failures.len(), gerund(verb), subject);
    for failure in failures {
        log::error!("{}", failure);
    }
    ReconcileError::Aggregate {
        subject: subject.to_owned(),
        verb,
        count: failures.len(),
    }
    .into()
}

fn gerund(verb: &str) -> String {
    match verb.strip_suffix('e') {
        Some(stem) => format!("{}ing", stem),
        None => format!("{}ing", verb),
    }
}

/// Runs the tree on a new multi-threaded runtime, blocking the current thread until every task
/// has finished. This is for callers that don't already have a runtime, and it must not be
/// called from within one.
pub fn do_all_sync(tree: &TaskTree, plan_mode: bool) -> Result<RunReport, std::io::Error> {
    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    Ok(runtime.block_on(tree.do_all(plan_mode)))
}

pub(crate) fn duration_to_millis(duration: Duration) -> u64 {
    let mut millis = duration.as_secs() * 1000;
    let nanos = duration.subsec_nanos() as u64;
    if nanos > 1_000_000 {
        millis = millis.saturating_add(nanos / 1_000_000)
    }
    millis
}

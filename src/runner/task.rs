use crate::error::Error;
use crate::runner::metrics::Metrics;

use async_trait::async_trait;

use std::fmt::{self, Debug, Display};
use std::sync::Arc;

/// A single unit of work. Tasks are built by the reconcilers immediately before a run and are
/// never reused across runs.
///
/// Implementations must honor `TaskContext::plan_mode`: when it is set, a task performs only
/// the read/diff portion of its work and returns `TaskOutcome::Planned` with a description of
/// what it would have done. Whether or not a task exists must never depend on plan mode.
#[async_trait]
pub trait Task: Send + Sync + 'static {
    /// Human readable description, used in task tree descriptions and in reports
    fn describe(&self) -> String;

    async fn run(&self, ctx: &TaskContext) -> Result<TaskOutcome, Error>;
}

/// The terminal outcome of a successful task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// The work was done, and any remote state it waited on has converged
    Completed,
    /// The remote operation was started, but the caller opted out of waiting for it
    Initiated,
    /// Plan mode: nothing was changed, and the message describes what would have been done
    Planned(String),
    /// The observed state already matched the desired state, so nothing needed to be done
    Unchanged,
}

impl TaskOutcome {
    pub fn is_planned(&self) -> bool {
        matches!(self, TaskOutcome::Planned(_))
    }
}

impl Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TaskOutcome::Completed => f.write_str("completed"),
            TaskOutcome::Initiated => f.write_str("initiated"),
            TaskOutcome::Planned(msg) => write!(f, "(plan) {}", msg),
            TaskOutcome::Unchanged => f.write_str("no changes"),
        }
    }
}

/// Passed to every task when it runs. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct TaskContext {
    plan_mode: bool,
    metrics: Arc<Metrics>,
}

impl TaskContext {
    pub fn new(plan_mode: bool) -> TaskContext {
        TaskContext {
            plan_mode,
            metrics: Arc::new(Metrics::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> TaskContext {
        self.metrics = metrics;
        self
    }

    pub fn plan_mode(&self) -> bool {
        self.plan_mode
    }

    pub fn metrics(&self) -> &Metrics {
        &*self.metrics
    }
}

type TaskFn = dyn Fn(TaskContext) -> futures_util::future::BoxFuture<'static, Result<TaskOutcome, Error>>
    + Send
    + Sync;

/// A task built from a description and a closure. Handy for one-off steps that don't warrant
/// their own type. The closure receives the `TaskContext` and must check plan mode itself.
pub struct FnTask {
    description: String,
    action: Box<TaskFn>,
}

impl FnTask {
    pub fn new<F, Fut>(description: impl Into<String>, action: F) -> FnTask
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<TaskOutcome, Error>> + Send + 'static,
    {
        use futures_util::FutureExt;

        FnTask {
            description: description.into(),
            action: Box::new(move |ctx| action(ctx).boxed()),
        }
    }
}

impl Debug for FnTask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FnTask")
            .field("description", &self.description)
            .finish()
    }
}

#[async_trait]
impl Task for FnTask {
    fn describe(&self) -> String {
        self.description.clone()
    }

    async fn run(&self, ctx: &TaskContext) -> Result<TaskOutcome, Error> {
        (self.action)(ctx.clone()).await
    }
}

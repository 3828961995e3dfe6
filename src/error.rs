use crate::stack::StackError;

use std::any::Any;
use std::fmt::{self, Display};
use std::time::Duration;

/// Trait for errors that may be returned by tasks and collaborators. This just sets up the
/// trait bounds that are required, since tasks run on spawned futures and their errors
/// need to be sent between threads before they're aggregated into a `RunReport`.
pub trait TaskError: std::error::Error + Send + Sync + 'static + Any {
    fn as_any(&self) -> &dyn Any;
    fn as_std_error(&self) -> &(dyn std::error::Error + 'static);
}
impl<T> TaskError for T
where
    T: std::error::Error + Send + Sync + 'static + Any,
{
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_std_error(&self) -> &(dyn std::error::Error + 'static) {
        self
    }
}

pub type Error = Box<dyn TaskError>;

impl dyn TaskError {
    /// convenience function for downcasting the error to a concrete type
    pub fn as_type<T: TaskError>(&self) -> Option<&T> {
        let as_any = self.as_any();
        as_any.downcast_ref::<T>()
    }

    /// convenience function for checking whether the error is of the given concrete type.
    /// If `is_type::<MyType>()` returns true, then calling `as_type::<MyType>()` will return
    /// `Some`.
    pub fn is_type<T: TaskError>(&self) -> bool {
        let as_any = self.as_any();
        as_any.is::<T>()
    }
}

impl<T> From<T> for Error
where
    T: TaskError,
{
    fn from(e: T) -> Error {
        Box::new(e)
    }
}

/// The error taxonomy shared by every reconciler. Collaborator errors are wrapped in
/// `Remote` together with the resource and operation they belong to, so that a single
/// line in an aggregated report is enough to tell what failed.
#[derive(Debug)]
pub enum ReconcileError {
    /// The desired state is unusable. No remote calls were made.
    Validation(String),
    Remote {
        resource: String,
        operation: &'static str,
        source: Error,
    },
    NotFound {
        kind: &'static str,
        name: String,
    },
    Stack(StackError),
    /// A remote resource reached a state that it will not recover from on its own
    FailedState {
        kind: &'static str,
        name: String,
        state: String,
    },
    Timeout {
        kind: &'static str,
        name: String,
        elapsed: Duration,
    },
    Config(anyhow::Error),
    TaskPanicked,
    Aggregate {
        subject: String,
        verb: &'static str,
        count: usize,
    },
}

impl ReconcileError {
    pub fn validation(message: impl Into<String>) -> ReconcileError {
        ReconcileError::Validation(message.into())
    }

    pub fn remote(
        operation: &'static str,
        resource: impl Into<String>,
        source: impl Into<Error>,
    ) -> ReconcileError {
        ReconcileError::Remote {
            resource: resource.into(),
            operation,
            source: source.into(),
        }
    }

    pub fn not_found(kind: &'static str, name: impl Into<String>) -> ReconcileError {
        ReconcileError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, ReconcileError::Validation(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ReconcileError::NotFound { .. })
    }
}

impl Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ReconcileError::Validation(msg) => write!(f, "validation error: {}", msg),
            ReconcileError::Remote {
                resource,
                operation,
                source,
            } => write!(f, "failed to {} {:?}: {}", operation, resource, source),
            ReconcileError::NotFound { kind, name } => write!(f, "{} {:?} not found", kind, name),
            ReconcileError::Stack(e) => Display::fmt(e, f),
            ReconcileError::FailedState { kind, name, state } => {
                write!(f, "{} {:?} is in state {}", kind, name, state)
            }
            ReconcileError::Timeout {
                kind,
                name,
                elapsed,
            } => write!(
                f,
                "timed out after {}s waiting for {} {:?}",
                elapsed.as_secs(),
                kind,
                name
            ),
            ReconcileError::Config(e) => write!(f, "invalid configuration: {:#}", e),
            ReconcileError::TaskPanicked => f.write_str("task panicked"),
            ReconcileError::Aggregate { subject, verb, .. } => {
                write!(f, "failed to {} {}", verb, subject)
            }
        }
    }
}

impl std::error::Error for ReconcileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReconcileError::Remote { source, .. } => Some(source.as_std_error()),
            ReconcileError::Stack(e) => std::error::Error::source(e),
            _ => None,
        }
    }
}

impl From<StackError> for ReconcileError {
    fn from(err: StackError) -> ReconcileError {
        ReconcileError::Stack(err)
    }
}

impl From<anyhow::Error> for ReconcileError {
    fn from(err: anyhow::Error) -> ReconcileError {
        ReconcileError::Config(err)
    }
}

impl From<tokio::task::JoinError> for ReconcileError {
    fn from(_err: tokio::task::JoinError) -> ReconcileError {
        // tasks are never aborted, so the only way for a join to fail is a panic
        ReconcileError::TaskPanicked
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn boxed_errors_can_be_downcast() {
        let err: Error = ReconcileError::not_found("addon", "vpc-cni").into();
        assert!(err.is_type::<ReconcileError>());
        let inner = err.as_type::<ReconcileError>().unwrap();
        assert!(inner.is_not_found());
        assert_eq!("addon \"vpc-cni\" not found", err.to_string());
    }

    #[test]
    fn remote_errors_name_the_operation_and_resource() {
        let source = ReconcileError::validation("boom");
        let err = ReconcileError::remote("delete addon", "coredns", source);
        assert_eq!(
            "failed to delete addon \"coredns\": validation error: boom",
            err.to_string()
        );
    }
}

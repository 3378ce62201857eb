//! Lifecycle management for long-running processes.
//!
//! A [`Manager`] wraps a process's startup, run, and shutdown functions and
//! gives every subsystem one authoritative answer to "am I starting,
//! running, paused, or shutting down". Pause and resume are delegated to a
//! [`PauseResumer`], and many independent PauseResumers may be composed into
//! a single atomic unit with [`MultiPauseResume`].
use std::sync::Arc;

mod manager;
mod pause;

pub use manager::{Manager, Status};
pub use pause::{FnPauseResumer, MultiPauseResume, Pausable, PauseResumer};

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("already started")]
    AlreadyStarted,
    #[error("shutting down")]
    Shutdown,
    #[error("not started")]
    NotStarted,
    #[error("pause not supported or unset")]
    PauseUnsupported,
    #[error("cannot set PauseResumer during a pause operation")]
    PauseInProgress,
    #[error("operation cancelled")]
    Cancelled,
    // Errors are shared by every waiter of a startup or shutdown,
    // so the underlying error is reference-counted.
    #[error("{0:#}")]
    Failed(Arc<anyhow::Error>),
}

impl Error {
    pub(crate) fn failed(err: anyhow::Error) -> Self {
        Self::Failed(Arc::new(err))
    }
}

/// MultiError aggregates the failures of many independent subsystems.
#[derive(Debug, thiserror::Error)]
#[error("{}", join_errors(.0))]
pub struct MultiError(pub Vec<anyhow::Error>);

fn join_errors(errors: &[anyhow::Error]) -> String {
    errors
        .iter()
        .map(|err| format!("{err:#}"))
        .collect::<Vec<_>>()
        .join("; ")
}

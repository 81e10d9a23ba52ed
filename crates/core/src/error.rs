//! Control-flow error values shared across the workspace.

use thiserror::Error;

/// Error raised when a script reports a `<FATAL …>` condition.
///
/// Distinguished from ordinary task errors so the orchestrator can abort
/// the whole run instead of failing a single task.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct FatalError(pub String);

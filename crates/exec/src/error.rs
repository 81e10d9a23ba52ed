//! Errors surfaced by local script execution.

use std::io;

use thiserror::Error;

use spread_core::FatalError;

/// Errors from the local script runner and its supervisor.
#[derive(Debug, Error)]
pub enum Error {
    /// The local bash process could not be spawned.
    #[error("cannot start local command: {0}")]
    StartCommand(#[source] io::Error),

    /// Waiting for the local command failed.
    #[error("cannot wait for local command: {0}")]
    Wait(#[source] io::Error),

    /// The kill deadline fired before the command completed.
    #[error("kill-timeout reached")]
    KillTimeout,

    /// The script reported an `<ERROR …>` condition.
    #[error("{0}")]
    Task(String),

    /// The script reported a `<FATAL …>` condition; the whole run aborts.
    #[error(transparent)]
    Fatal(#[from] FatalError),

    /// A failure replaced by the command's output excerpt.
    #[error("{0}")]
    Output(String),

    /// The command exited with a non-zero status and produced no output.
    #[error("command exited with status {0}")]
    ExitStatus(i32),

    /// Shell mode needs a remote session and a terminal.
    #[error("shell mode requires a remote session")]
    ShellMode,

    /// The completion monitor died without reporting a result.
    #[error("command monitor exited unexpectedly")]
    Monitor,
}

impl Error {
    /// Returns `true` for `<FATAL …>` conditions, which abort the whole
    /// harness run rather than a single task.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

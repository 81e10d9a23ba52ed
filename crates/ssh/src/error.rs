//! Error taxonomy for client operations.
//!
//! Every message that can reach the harness operator names the target
//! server; failures of commands that produced output are replaced by the
//! output excerpt, matching the way the supervisor reports progress.

use std::io;

use thiserror::Error;

/// Failure establishing the SSH transport.
#[derive(Debug, Error)]
pub enum DialError {
    /// TCP-level connect or resolution failure.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Handshake or authentication exchange failure.
    #[error(transparent)]
    Ssh(#[from] ssh2::Error),

    /// The server rejected the password for `user`.
    #[error("authentication failed for user {user}")]
    Auth {
        /// Username presented to the server.
        user: String,
    },
}

/// Errors surfaced by [`Client`](crate::Client) operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The initial dial failed.
    #[error("cannot connect to {server}: {source}")]
    Connect {
        /// Target identity.
        server: String,
        /// Underlying dial failure.
        #[source]
        source: DialError,
    },

    /// Channel-level SSH failure.
    #[error(transparent)]
    Ssh(#[from] ssh2::Error),

    /// Session I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The remote command exited non-zero without producing output.
    #[error("remote command exited with status {0}")]
    ExitStatus(i32),

    /// A failure replaced by the command's output excerpt.
    #[error("{0}")]
    Output(String),

    /// The kill deadline fired before the command completed.
    #[error("kill-timeout reached")]
    KillTimeout,

    /// The target never dropped the link after a reboot request.
    #[error("kill-timeout reached, {server} did not reboot after request")]
    RebootDown {
        /// Target identity.
        server: String,
    },

    /// The reboot command outlived the kill deadline without effect.
    #[error("kill-timeout reached while waiting for {server} to reboot")]
    RebootWait {
        /// Target identity.
        server: String,
    },

    /// The target did not come back after a reboot.
    #[error("kill-timeout reached, cannot reconnect to {server} after reboot: {source}")]
    Reconnect {
        /// Target identity.
        server: String,
        /// Last dial failure observed.
        #[source]
        source: DialError,
    },

    /// The reboot command returned as if nothing happened.
    #[error("reboot request on {server} failed")]
    RebootFailed {
        /// Target identity.
        server: String,
    },

    /// A script kept requesting reboots past the attempt ceiling.
    #[error("{server} rebooted more than {limit} times")]
    TooManyReboots {
        /// Target identity.
        server: String,
        /// Attempt ceiling.
        limit: u32,
    },

    /// Upload target directory already has content.
    #[error("remote directory {dir} is not empty")]
    NotEmpty {
        /// Remote directory path.
        dir: String,
    },

    /// File upload failure.
    #[error("cannot write to {server} at {path}: {source}")]
    WriteFile {
        /// Target identity.
        server: String,
        /// Remote path.
        path: String,
        /// Underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// File download failure.
    #[error("cannot read from {server} at {path}: {source}")]
    ReadFile {
        /// Target identity.
        server: String,
        /// Remote path.
        path: String,
        /// Underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// Emptiness probe failure.
    #[error("cannot check if {dir} on {server} is empty: {source}")]
    DirCheck {
        /// Target identity.
        server: String,
        /// Remote directory path.
        dir: String,
        /// Underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// Root login could not be provisioned.
    #[error("cannot setup root access: {0}")]
    RootAccess(#[source] Box<Error>),

    /// The controlling terminal's dimensions are unavailable.
    #[error("cannot get local terminal size: {0}")]
    TerminalSize(#[source] io::Error),

    /// The controlling terminal rejected raw mode.
    #[error("cannot put local terminal in raw mode: {0}")]
    RawMode(#[source] io::Error),

    /// The server rejected the pty request.
    #[error("cannot get remote pseudo terminal: {0}")]
    Pty(#[source] ssh2::Error),

    /// The local archiver could not be spawned.
    #[error("cannot start local tar command: {0}")]
    TarStart(#[source] io::Error),

    /// The local archiver failed mid-stream.
    #[error("local tar command returned error: {0}")]
    LocalTar(String),

    /// A port never came up within the probe deadline.
    #[error("cannot connect to {what}: {source}")]
    PortTimeout {
        /// What was being waited for.
        what: String,
        /// Last connect failure observed.
        #[source]
        source: io::Error,
    },

    /// The session monitor died without reporting a result.
    #[error("command monitor exited unexpectedly on {server}")]
    Monitor {
        /// Target identity.
        server: String,
    },
}

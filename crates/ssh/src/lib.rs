#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `spread-ssh` drives one test target over SSH: password-authenticated
//! dial with a cached transport, per-call sessions running arbitrary shell
//! fragments under the warn/kill timeout discipline, four output-capture
//! modes (including an interactive pty shell), the in-band `<REBOOT …>`
//! protocol with automatic re-dial, compressed directory uploads, and the
//! small file helpers the harness needs around them.
//!
//! # Design
//!
//! Sessions are one-shot: every operation opens a fresh channel on the
//! cached transport and closes it on all exit paths. The transport pointer
//! is replaced in place when a script requests a reboot; `Client` methods
//! take `&mut self` so the type system enforces that no other operation on
//! the same client is in flight while that happens.

mod client;
mod error;
mod files;
mod net;
mod run;
mod send;
mod shell;

pub use client::{Client, Config};
pub use error::Error;
pub use net::wait_port_up;

pub use spread_exec::OutputMode;

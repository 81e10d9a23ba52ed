#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `spread-exec` turns a task's shell fragment into a supervised execution:
//! [`script`] assembles the bash program that is piped to `/bin/bash -eu -`
//! (control-marker functions, environment exports, stdin isolation),
//! [`supervisor`] watches a started command under the warn/kill timeout
//! discipline, and [`local`] runs scripts on the harness host itself,
//! recognising the `<FATAL …>` and `<ERROR …>` control markers.
//!
//! The remote executor in `spread-ssh` reuses the same assembler and
//! supervisor, so local and remote scripts share one grammar and one
//! timeout behavior.

pub mod error;
pub mod local;
pub mod script;
pub mod supervisor;

pub use error::Error;
pub use local::run_script;
pub use script::OutputMode;

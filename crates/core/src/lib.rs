#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `spread-core` provides the primitives shared by the local and remote
//! script executors of the spread harness: the [`SafeBuffer`] output
//! accumulator with its incremental [`since`](SafeBuffer::since) view, the
//! ordered [`Environment`] map handed to script assembly, the
//! [`Timeouts`](timeout::Timeouts) warn/kill pair, and the small error
//! vocabulary (`FatalError`, output excerpts) that crosses crate boundaries.
//!
//! # Design
//!
//! Everything here is a dependency leaf. The buffer is the only type with
//! interior mutability: pump threads append captured output while the
//! command supervisor takes incremental views for its liveness reports, so
//! all accessors take `&self` and synchronize on an internal mutex.

pub mod buffer;
pub mod env;
pub mod error;
pub mod output;
pub mod timeout;

pub use buffer::{SafeBuffer, UNCHANGED_MARKER};
pub use env::Environment;
pub use error::FatalError;
pub use timeout::{TimeoutSetting, Timeouts};

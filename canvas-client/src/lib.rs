//! # Canvas Client
//!
//! Session layer for the canvas editor. A [`SyncSession`] owns one
//! connection monitor, one operation queue, one lock coordinator and one
//! presence reconciler for a single user on a single board, and routes every
//! edit through them.
//!
//! This library is used by both the demo binary and integration tests.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod hook;
pub mod session;

pub use hook::ForwardingHook;
pub use session::{Backends, SelectionResult, SessionEvent, SyncSession, WriteOutcome};

//! # ensign-core
//!
//! Core library for ensign - a device daemon that establishes and maintains
//! a device's cryptographic identity.
//!
//! This crate provides the building blocks the daemon managers are written
//! against:
//!
//! - **State engine**: a single shared state document with changes, tasks
//!   and a task runner that re-dispatches interrupted or retried work
//! - **Assertions**: the signed-statement envelope, typed assertions and
//!   the in-memory assertion database
//! - **Device keys**: RSA device keypairs and their filesystem-backed store
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use ensign_core::state::{State, StateLock, TaskRunner};
//!
//! let state = Arc::new(StateLock::new(State::new()));
//! let mut runner = TaskRunner::new(Arc::clone(&state));
//! runner.add_handler("noop", |_task| Ok(ensign_core::state::HandlerOutcome::Done));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod asserts;
pub mod state;

pub use asserts::{Assertion, AssertionType, Database, DeviceKey, FsKeypairManager};
pub use state::{State, StateLock, TaskRunner};

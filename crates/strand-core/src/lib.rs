//! # strand-core — shared types for the strand runtime
//!
//! Small leaf crate holding the types every other strand crate agrees on:
//! coroutine ids, the coroutine state machine, error enums, and environment
//! parsing helpers. No OS surface lives here.

pub mod env;
pub mod error;
pub mod id;
pub mod state;

pub use error::{NetError, NetResult, SchedError, SchedResult};
pub use id::CoroutineId;
pub use state::{CoState, WakeReason};

pub use env::{env_get, env_get_bool};

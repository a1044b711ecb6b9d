//! Hierarchical worker-thread runtime.
//!
//! Application threads spawned through [`open`] form a dynamic tree: each
//! worker returns one result through its [`Pipe`], parents collect results
//! with [`Pipe::read`] or [`select`], and kill/truncate requests propagate
//! cooperatively down the tree. Scopes ([`enter_scope`]/[`exit_scope`])
//! narrow a thread's attention to the pipes it opened since. Every thread
//! the library creates is joined by the time the process exits.

pub mod config;
pub mod error;
pub mod logger;
pub mod prelude;

mod api;
mod context;
mod list;
mod pipe;
mod plumbing;
mod pool;
mod protocol;
mod runtime;
mod scope;
mod sync;
mod test;

pub use api::{
    Pipe, blocked, enter_scope, exit_scope, kill_all, killed, open, select, send, sync, truncate_all,
    truncated,
};
pub use config::RuntimeConfig;
pub use error::PipeError;
pub use pipe::PipeValue;

//! Executor, tasks and the thread-local runtime context.

pub(crate) mod block_on;
pub(crate) mod context;
pub(crate) mod executor;
pub(crate) mod queue;
pub(crate) mod spawn;
pub(crate) mod task;
mod waker;

pub(crate) use block_on::block_on_for;
pub use executor::{Executor, Handle};
pub use spawn::JoinHandle;
pub use task::{Task, TaskState};

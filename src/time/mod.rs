//! Time utilities: async sleep, deadlines and the re-armable timeout timer.
//!
//! - [`sleep`] / [`sleep_until`] for non-blocking delays
//! - [`timeout`] for running a future with a deadline
//! - [`TimeoutTimer`] for a callback that fires unless re-armed or stopped
//!
//! The futures use the reactor of the current thread's context, so they
//! must be polled on an executor worker, inside `Handle::block_on`, or by a
//! synchronous socket call.

pub mod sleep;
pub mod timeout;
pub mod timer;

pub use sleep::{Sleep, sleep, sleep_until};
pub use timeout::{Timeout, timeout};
pub use timer::TimeoutTimer;

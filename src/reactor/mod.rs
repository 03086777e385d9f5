//! Event-driven I/O reactor.
//!
//! Readiness comes from epoll on Linux. The reactor also owns the timer
//! wheel used by [`crate::time`] and [`crate::TimeoutTimer`].
//!
//! - [`core`]: the shared reactor, its sources and timers
//! - [`poller`]: epoll and eventfd wrappers
//! - [`registration`]: per-descriptor binding used by sockets

pub(crate) mod core;
pub(crate) mod poller;
pub(crate) mod registration;

pub(crate) use self::core::{Direction, Reactor, TimerAction, TimerKey};
pub(crate) use self::registration::Registration;

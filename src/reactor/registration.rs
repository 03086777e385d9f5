//! Binding between a non-blocking descriptor and the reactor.

use crate::reactor::core::{Direction, Reactor};

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::task::{Context, Poll};

/// A descriptor registered with a [`Reactor`].
///
/// Owners must declare the registration before the descriptor it tracks so
/// that it is dropped, and the descriptor removed from epoll, first.
pub(crate) struct Registration {
    reactor: Arc<Reactor>,
    token: usize,
}

impl Registration {
    pub(crate) fn new(reactor: Arc<Reactor>, fd: RawFd) -> io::Result<Self> {
        let token = reactor.register(fd)?;
        Ok(Self { reactor, token })
    }

    /// Runs `op` and, if it would block, parks the task until the descriptor
    /// is ready in `direction`.
    ///
    /// The descriptor is re-armed in level-triggered mode after the waker is
    /// stored, so readiness that arrives between `op` and the arm is still
    /// reported.
    pub(crate) fn poll_io<R>(
        &self,
        cx: &mut Context<'_>,
        direction: Direction,
        mut op: impl FnMut() -> io::Result<R>,
    ) -> Poll<io::Result<R>> {
        match op() {
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                if let Err(err) = self.reactor.arm(self.token, direction, cx.waker()) {
                    return Poll::Ready(Err(err));
                }
                Poll::Pending
            }
            result => Poll::Ready(result),
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.reactor.deregister(self.token);
    }
}

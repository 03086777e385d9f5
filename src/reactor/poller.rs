//! epoll wrapper used by the reactor.
//!
//! Descriptors are registered in level-triggered one-shot mode: each wait
//! re-arms the descriptor for the directions that currently have a waiter,
//! and a descriptor that is already ready reports immediately.

use libc::{
    EFD_CLOEXEC, EFD_NONBLOCK, EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD,
    EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLRDHUP, epoll_create1, epoll_ctl,
    epoll_event, epoll_wait, eventfd,
};
use parking_lot::Mutex;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// Token reserved for the eventfd that interrupts a blocked wait.
pub(crate) const WAKE_TOKEN: u64 = u64::MAX;

const MAX_EVENTS: usize = 256;

/// Directions a source is waiting on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Interest {
    pub(crate) read: bool,
    pub(crate) write: bool,
}

impl Interest {
    fn bits(self) -> u32 {
        let mut bits = EPOLLONESHOT as u32;
        if self.read {
            bits |= (EPOLLIN | EPOLLRDHUP) as u32;
        }
        if self.write {
            bits |= EPOLLOUT as u32;
        }
        bits
    }
}

/// One readiness report.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Event {
    pub(crate) token: u64,
    pub(crate) readable: bool,
    pub(crate) writable: bool,
}

impl Event {
    fn from_raw(raw: &epoll_event) -> Self {
        let bits = raw.events;
        let token = raw.u64;
        let failed = bits & (EPOLLHUP | EPOLLERR) as u32 != 0;

        Self {
            token,
            readable: failed || bits & (EPOLLIN | EPOLLRDHUP) as u32 != 0,
            writable: failed || bits & EPOLLOUT as u32 != 0,
        }
    }
}

pub(crate) struct Poller {
    epoll: OwnedFd,
    wake: OwnedFd,
    buffer: Mutex<Vec<epoll_event>>,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Self> {
        let epoll = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        if epoll < 0 {
            return Err(io::Error::last_os_error());
        }
        let epoll = unsafe { OwnedFd::from_raw_fd(epoll) };

        let wake = unsafe { eventfd(0, EFD_CLOEXEC | EFD_NONBLOCK) };
        if wake < 0 {
            return Err(io::Error::last_os_error());
        }
        let wake = unsafe { OwnedFd::from_raw_fd(wake) };

        let poller = Self {
            epoll,
            wake,
            buffer: Mutex::new(Vec::with_capacity(MAX_EVENTS)),
        };
        poller.ctl(
            EPOLL_CTL_ADD,
            poller.wake.as_raw_fd(),
            EPOLLIN as u32,
            WAKE_TOKEN,
        )?;

        Ok(poller)
    }

    fn ctl(&self, op: i32, fd: RawFd, events: u32, token: u64) -> io::Result<()> {
        let mut event = epoll_event { events, u64: token };
        let ret = unsafe { epoll_ctl(self.epoll.as_raw_fd(), op, fd, &mut event) };

        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    /// Adds a descriptor with no interest yet.
    pub(crate) fn add(&self, fd: RawFd, token: u64) -> io::Result<()> {
        self.ctl(EPOLL_CTL_ADD, fd, Interest::default().bits(), token)
    }

    pub(crate) fn rearm(&self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        self.ctl(EPOLL_CTL_MOD, fd, interest.bits(), token)
    }

    pub(crate) fn delete(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(EPOLL_CTL_DEL, fd, 0, 0)
    }

    /// Blocks until readiness, the timeout, or [`Poller::notify`].
    pub(crate) fn wait(&self, out: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()> {
        let timeout_ms = match timeout {
            None => -1,
            Some(d) => {
                // Round up so a pending timer is never polled early.
                let ms = d.as_nanos().div_ceil(1_000_000);
                ms.min(i32::MAX as u128) as i32
            }
        };

        let mut buffer = self.buffer.lock();
        buffer.clear();
        let n = unsafe {
            epoll_wait(
                self.epoll.as_raw_fd(),
                buffer.as_mut_ptr(),
                MAX_EVENTS as i32,
                timeout_ms,
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        unsafe { buffer.set_len(n as usize) };

        for raw in buffer.iter() {
            let event = Event::from_raw(raw);
            if event.token == WAKE_TOKEN {
                self.drain_wake();
                continue;
            }
            out.push(event);
        }

        Ok(())
    }

    /// Interrupts a blocked [`Poller::wait`] from any thread.
    pub(crate) fn notify(&self) -> io::Result<()> {
        let one: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.wake.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };

        if ret < 0 {
            let err = io::Error::last_os_error();
            // A saturated counter already guarantees a wake-up.
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(());
            }
            return Err(err);
        }

        Ok(())
    }

    fn drain_wake(&self) {
        let mut value: u64 = 0;
        unsafe {
            libc::read(
                self.wake.as_raw_fd(),
                &mut value as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }
}

//! Waker for spawned futures.
//!
//! Waking re-posts the future to its executor's run queue. Repeated wakes
//! before the next poll enqueue it only once.

use crate::runtime::queue::Job;
use crate::runtime::spawn::Spawned;

use futures::task::ArcWake;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::Ordering;

impl<F> ArcWake for Spawned<F>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn wake_by_ref(arc_self: &Arc<Self>) {
        if arc_self.scheduled.swap(true, Ordering::AcqRel) {
            return;
        }

        // A stopped or dropped executor abandons the future instead.
        if let Some(shared) = arc_self.shared.upgrade() {
            shared.schedule(Job::Poll(arc_self.clone()));
        }
    }
}

//! Consumer side: hands queued events to the watch callback
//!
//! Runs on the event-loop thread whenever the watch's wake fires. Pending
//! batches are swapped out under the lock first and filtered afterwards, so
//! every queued event is consumed exactly once even if the watch closes
//! half way through a batch.

use crate::handle::{FsEvent, HandleInner, HandleState};
use crate::translate::EventKind;
use std::rc::Weak;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

/// Wake task body; holds the watch weakly so it never keeps it alive
pub(crate) async fn wake_loop(wake: Arc<Notify>, handle: Weak<HandleInner>) {
    loop {
        wake.notified().await;
        let Some(inner) = handle.upgrade() else {
            return;
        };
        FsEvent { inner }.dispatch();
    }
}

impl FsEvent {
    pub(crate) fn dispatch(&self) {
        let batches = self.inner.shared.take_pending();
        let mut delivered = 0usize;
        let mut discarded = 0usize;

        for event in batches.into_iter().flatten() {
            if self.inner.state.get() != HandleState::Active || !self.inner.watching.get() {
                discarded += 1;
                continue;
            }

            {
                let mut callback = self.inner.callback.borrow_mut();
                (&mut *callback)(self, event.relative_path(), event.kind, 0);
            }
            delivered += 1;

            if event.is_root() && event.kind == EventKind::Rename && self.root_is_gone() {
                debug!(path = %self.path().display(), "watched root is gone");
                self.inner.watching.set(false);
            }
        }

        trace!(delivered, discarded, "dispatched pending events");

        if self.inner.state.get() == HandleState::Active && !self.inner.watching.get() {
            if let Err(err) = self.inner.close() {
                warn!(path = %self.path().display(), "cannot close watch after root went away: {}", err);
            }
        }
    }

    fn root_is_gone(&self) -> bool {
        let root = self.resolved_path().unwrap_or_else(|| self.path());
        std::fs::symlink_metadata(root).is_err()
    }
}

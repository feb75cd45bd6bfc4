//! Deferred work posted to the notification thread
//!
//! Any thread may push; only the notification thread drains. Draining swaps
//! the whole queue out under the lock and runs the batch with the lock released.

use crate::error::{Result, WatchError};
use crate::handle::WatcherShared;
use crate::platform::NativeStream;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// One unit of deferred work for the notification thread
pub(crate) enum Signal {
    /// Arbitrary closure
    Perform(Box<dyn FnOnce() + Send>),
    /// Attach a watcher's stream to the run loop, start it, post `started`
    Subscribe(Arc<WatcherShared>),
    /// Stop, invalidate and release a stream, then acknowledge on `done`
    Unsubscribe {
        stream: Box<dyn NativeStream>,
        done: Sender<()>,
    },
    /// Stop the run loop; the notification thread exits afterwards
    Terminate,
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Perform(_) => f.write_str("Perform"),
            Signal::Subscribe(_) => f.write_str("Subscribe"),
            Signal::Unsubscribe { .. } => f.write_str("Unsubscribe"),
            Signal::Terminate => f.write_str("Terminate"),
        }
    }
}

/// Lock-protected FIFO of pending signals
#[derive(Default)]
pub(crate) struct SignalQueue {
    items: Mutex<Vec<Signal>>,
}

impl SignalQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append a signal; insertion order is execution order
    pub(crate) fn push(&self, signal: Signal) -> Result<()> {
        let mut items = self.items.lock();
        items
            .try_reserve(1)
            .map_err(|_| WatchError::OutOfMemory("deferred work item"))?;
        items.push(signal);
        Ok(())
    }

    /// Swap out everything queued so far
    pub(crate) fn take(&self) -> Vec<Signal> {
        std::mem::take(&mut *self.items.lock())
    }

    pub(crate) fn len(&self) -> usize {
        self.items.lock().len()
    }
}

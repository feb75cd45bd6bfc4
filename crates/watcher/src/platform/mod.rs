//! Native notification facility contract and implementations
//!
//! A backend creates streams; a stream is attached to a [`RunLoop`] and
//! delivers batches of raw records on that run loop's thread. All stream
//! operations after creation happen on the notification thread.

pub mod manual;
pub mod native;
pub mod null;

use crate::config::BackendKind;
use crate::error::Result;
use crate::runloop::RunLoop;
use crate::translate::EventFlags;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub use manual::ManualBackend;
pub use native::NativeBackend;
pub use null::NullBackend;

/// One raw record as reported by the native facility
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    /// Absolute path the record is about
    pub path: PathBuf,
    pub flags: EventFlags,
}

impl RawRecord {
    pub fn new(path: impl Into<PathBuf>, flags: EventFlags) -> Self {
        Self {
            path: path.into(),
            flags,
        }
    }
}

/// What a stream subscribes to
#[derive(Debug, Clone)]
pub struct StreamSpec {
    pub path: PathBuf,
    /// Coalescing window; changes within it are delivered as one batch
    pub latency: Duration,
}

/// Native delivery callback, invoked on the run loop's thread once per batch
pub type Delivery = Arc<dyn Fn(&[RawRecord]) + Send + Sync>;

/// A native notification facility
pub trait Backend: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Capability check made when a watch is created
    fn is_supported(&self) -> bool;

    /// Create a subscription; nothing is delivered until it is scheduled and started
    fn create_stream(&self, spec: StreamSpec, delivery: Delivery) -> Result<Box<dyn NativeStream>>;
}

/// A native subscription. Dropping it releases it.
pub trait NativeStream: Send {
    /// Attach to the run loop deliveries will be made on
    fn schedule(&mut self, run_loop: &RunLoop);

    fn start(&mut self) -> Result<()>;

    /// Stop delivering; batches not yet delivered are dropped
    fn stop(&mut self);

    /// Detach from the run loop
    fn invalidate(&mut self);
}

/// Stop, invalidate and release a stream
pub(crate) fn release(mut stream: Box<dyn NativeStream>) {
    stream.stop();
    stream.invalidate();
    drop(stream);
}

/// Backend for a configured kind
pub fn backend_for(kind: BackendKind) -> Arc<dyn Backend> {
    match kind {
        BackendKind::Auto | BackendKind::Native => Arc::new(NativeBackend::new()),
        BackendKind::Null => Arc::new(NullBackend),
    }
}

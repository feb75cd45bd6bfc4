//! No-op facility for platforms without native notifications

use super::{Backend, Delivery, NativeStream, StreamSpec};
use crate::error::Result;
use crate::runloop::RunLoop;

/// Backend whose streams never deliver anything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullBackend;

impl Backend for NullBackend {
    fn name(&self) -> &'static str {
        "null"
    }

    fn is_supported(&self) -> bool {
        true
    }

    fn create_stream(&self, _spec: StreamSpec, _delivery: Delivery) -> Result<Box<dyn NativeStream>> {
        Ok(Box::new(NullStream))
    }
}

struct NullStream;

impl NativeStream for NullStream {
    fn schedule(&mut self, _run_loop: &RunLoop) {}

    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) {}

    fn invalidate(&mut self) {}
}

//! File system change notifications relayed onto a single-threaded event loop
//!
//! This crate provides:
//! - A lazily started notification thread per event loop, pumping a run loop
//!   that hosts native subscriptions
//! - A cross-thread signal queue for posting work onto that thread
//! - Translation of native records into `change` / `rename` events, with
//!   root-prefix stripping and immediate-child filtering
//! - Watch handles whose callbacks only ever run on the event-loop thread
//!
//! ```no_run
//! use watcher::EventLoop;
//!
//! let event_loop = EventLoop::new()?;
//! let _watch = event_loop.watch(".", true, |_, path, kind, _| {
//!     println!("{} {:?}", kind.as_str(), path);
//! })?;
//! event_loop.run();
//! # Ok::<(), watcher::WatchError>(())
//! ```

pub mod config;
mod dispatch;
pub mod error;
pub mod event_loop;
pub mod fsevents;
pub mod handle;
pub mod platform;
pub mod runloop;
mod signal;
pub mod sync;
pub mod translate;

pub use config::{BackendKind, WatchConfig};
pub use error::{Result, WatchError};
pub use event_loop::EventLoop;
pub use fsevents::NotificationRunLoop;
pub use handle::{EventCallback, FsEvent, HandleState};
pub use platform::{Backend, ManualBackend, NativeBackend, NativeStream, NullBackend, RawRecord, StreamSpec};
pub use runloop::{RunLoop, RunLoopSource};
pub use sync::Semaphore;
pub use translate::{EventFlags, EventKind, TranslatedEvent};

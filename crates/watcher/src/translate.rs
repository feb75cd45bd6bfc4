//! Raw native records to logical events
//!
//! Runs on the notification thread once per delivery:
//! - Drops bookkeeping records (dropped events, id wraparound, mounts, ...)
//! - Strips the watched root from each path
//! - Drops deeper-than-immediate-child records for non-recursive watches
//! - Classifies what remains as `Change` or `Rename`

use crate::platform::RawRecord;
use bitflags::bitflags;
use std::path::{Path, PathBuf};
use tracing::warn;

bitflags! {
    /// Per-record flags in the native facility's bit layout
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventFlags: u32 {
        const MUST_SCAN_SUBDIRS  = 0x0000_0001;
        const USER_DROPPED       = 0x0000_0002;
        const KERNEL_DROPPED     = 0x0000_0004;
        const EVENT_IDS_WRAPPED  = 0x0000_0008;
        const HISTORY_DONE       = 0x0000_0010;
        const ROOT_CHANGED       = 0x0000_0020;
        const MOUNT              = 0x0000_0040;
        const UNMOUNT            = 0x0000_0080;
        const ITEM_CREATED       = 0x0000_0100;
        const ITEM_REMOVED       = 0x0000_0200;
        const ITEM_INODE_META_MOD = 0x0000_0400;
        const ITEM_RENAMED       = 0x0000_0800;
        const ITEM_MODIFIED      = 0x0000_1000;
        const ITEM_FINDER_INFO_MOD = 0x0000_2000;
        const ITEM_CHANGE_OWNER  = 0x0000_4000;
        const ITEM_XATTR_MOD     = 0x0000_8000;
        const ITEM_IS_FILE       = 0x0001_0000;
        const ITEM_IS_DIR        = 0x0002_0000;
        const ITEM_IS_SYMLINK    = 0x0004_0000;

        /// Facility bookkeeping, never a logical event
        const NOISE = Self::USER_DROPPED.bits()
            | Self::KERNEL_DROPPED.bits()
            | Self::EVENT_IDS_WRAPPED.bits()
            | Self::HISTORY_DONE.bits()
            | Self::MOUNT.bits()
            | Self::UNMOUNT.bits()
            | Self::ROOT_CHANGED.bits();

        /// Content or metadata changed in place
        const CONTENT = Self::ITEM_FINDER_INFO_MOD.bits()
            | Self::ITEM_MODIFIED.bits()
            | Self::ITEM_INODE_META_MOD.bits()
            | Self::ITEM_CHANGE_OWNER.bits()
            | Self::ITEM_XATTR_MOD.bits();

        /// Entry appeared, disappeared or moved
        const STRUCTURE = Self::ITEM_CREATED.bits()
            | Self::ITEM_REMOVED.bits()
            | Self::ITEM_RENAMED.bits();
    }
}

impl EventFlags {
    /// Whether the record is facility bookkeeping
    pub fn is_noise(self) -> bool {
        self.intersects(EventFlags::NOISE)
    }
}

/// Two-valued logical event vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Content or metadata changed
    Change,
    /// Created, removed or renamed
    Rename,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Change => "change",
            EventKind::Rename => "rename",
        }
    }
}

/// A logical event waiting to be delivered to a watch callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslatedEvent {
    pub kind: EventKind,
    /// Path relative to the watched root; empty for the root itself
    pub path: PathBuf,
}

impl TranslatedEvent {
    /// Whether the event concerns the watched root itself
    pub fn is_root(&self) -> bool {
        self.path.as_os_str().is_empty()
    }

    /// The relative path, or `None` for the root itself
    pub fn relative_path(&self) -> Option<&Path> {
        if self.is_root() {
            None
        } else {
            Some(&self.path)
        }
    }
}

/// Classify native flags into a logical event kind
pub fn classify(flags: EventFlags) -> EventKind {
    if flags.intersects(EventFlags::CONTENT) && !flags.intersects(EventFlags::STRUCTURE) {
        EventKind::Change
    } else {
        EventKind::Rename
    }
}

/// Strip `root` from `path`
///
/// Paths outside `root` (or any path when the root is unknown) come back unchanged.
pub fn strip_root(path: &Path, root: Option<&Path>) -> PathBuf {
    match root.map(|root| path.strip_prefix(root)) {
        Some(Ok(relative)) => relative.to_path_buf(),
        _ => path.to_path_buf(),
    }
}

/// Whether a relative path names the root or one of its immediate children
pub fn is_immediate(relative: &Path) -> bool {
    relative.components().count() <= 1
}

/// Translate one delivery's raw records, preserving their order
///
/// If the output cannot be allocated for every record, translation stops
/// early and the events translated so far are returned.
pub fn translate(records: &[RawRecord], root: Option<&Path>, recursive: bool) -> Vec<TranslatedEvent> {
    let mut events = Vec::new();
    let reserved = events.try_reserve_exact(records.len()).is_ok();

    for record in records {
        if record.flags.is_noise() {
            continue;
        }

        let path = strip_root(&record.path, root);

        // Root events are always kept
        if !recursive && !path.as_os_str().is_empty() && !is_immediate(&path) {
            continue;
        }

        if !reserved && events.try_reserve(1).is_err() {
            warn!(
                translated = events.len(),
                total = records.len(),
                "allocation failed mid-delivery, delivering partial batch"
            );
            break;
        }

        events.push(TranslatedEvent {
            kind: classify(record.flags),
            path,
        });
    }

    events
}

//! File system monitoring for build-system input files.
//!
//! Watched paths are kept in a [`FileWatchTree`]. Native watchers post raw
//! events to the loop, which resolves them to the registered callbacks.

pub mod tree;

pub use tree::{FileWatchTree, WatchCallback};

use crate::config::SignalNames;
use notify::event::{EventKind, ModifyKind};

/// What happened to a watched file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileChange {
    /// The file was created, removed or renamed.
    pub rename: bool,
    /// The file content or metadata changed.
    pub change: bool,
}

impl FileChange {
    pub const RENAMED: FileChange = FileChange {
        rename: true,
        change: false,
    };
    pub const CHANGED: FileChange = FileChange {
        rename: false,
        change: true,
    };

    /// Map a native event kind. Access events are not changes.
    pub fn from_event_kind(kind: &EventKind) -> Option<Self> {
        match kind {
            EventKind::Access(_) => None,
            EventKind::Create(_) | EventKind::Remove(_) => Some(Self::RENAMED),
            EventKind::Modify(ModifyKind::Name(_)) => Some(Self::RENAMED),
            EventKind::Modify(_) | EventKind::Any | EventKind::Other => Some(Self::CHANGED),
        }
    }

    /// Values of the `properties` array of a `fileChange` signal.
    pub fn properties(&self) -> Vec<&'static str> {
        let mut properties = Vec::with_capacity(2);
        if self.rename {
            properties.push(SignalNames::RENAME_PROPERTY);
        }
        if self.change {
            properties.push(SignalNames::CHANGE_PROPERTY);
        }
        properties
    }
}

//! Orchestration between the mirror and the filesystem watch mechanism.

mod monitor;
mod watch;

pub use monitor::{Monitor, MonitorError};
pub use watch::{
    DirectoryEvent, DirectoryWatcher, ManualWatcher, NotifyWatcher, WatchEntry, WatchEntryKind,
    WatchError,
};

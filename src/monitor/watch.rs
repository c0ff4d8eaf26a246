use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use derive_more::Display;
use futures_channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use snafu::Snafu;
use tracing::{debug, warn};

use crate::ext::BestEffortPathExt;

/// What happened to one entry of a watched directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum WatchEntryKind {
    #[display("create")]
    Create,
    #[display("modify")]
    Modify,
    #[display("delete")]
    Delete,
    /// The watch mechanism dropped notifications; the directory needs a
    /// full re-sync.
    #[display("overflow")]
    Overflow,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEntry {
    pub kind: WatchEntryKind,
    /// Entry name relative to the watched directory.
    pub relative_name: PathBuf,
}

/// One raw event batch for a single watched directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEvent {
    pub watched_path: PathBuf,
    pub entries: Vec<WatchEntry>,
    /// False when the watch registration became invalid, typically because
    /// the watched directory itself was removed.
    pub was_reset: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum WatchError {
    #[snafu(display("Failed to install watch for {}: {message}", path.best_effort_path_display()))]
    InstallError { path: PathBuf, message: String },
    #[snafu(display("Watch backend failure: {message}"))]
    BackendError { message: String },
}

/// Source of per-directory change notifications.
///
/// Installation failures do not surface as return values; they land on the
/// error stream so consumers keep a single handling policy. The event and
/// error streams can each be taken exactly once.
pub trait DirectoryWatcher {
    fn watch(&mut self, dir: &Path);

    fn is_watched(&self, dir: &Path) -> bool;

    /// The event stream. Yields the receiver on the first call only.
    fn events(&mut self) -> Option<UnboundedReceiver<DirectoryEvent>>;

    /// The error stream. Yields the receiver on the first call only.
    fn errors(&mut self) -> Option<UnboundedReceiver<WatchError>>;

    /// Releases backend resources; both streams end afterwards.
    fn close(&mut self);
}

/// Deterministic in-process watcher for tests: events are injected by hand
/// and watch registrations are recorded instead of touching the OS.
#[derive(Debug)]
pub struct ManualWatcher {
    watched: HashSet<PathBuf>,
    watch_calls: Vec<PathBuf>,
    event_tx: UnboundedSender<DirectoryEvent>,
    event_rx: Option<UnboundedReceiver<DirectoryEvent>>,
    error_tx: UnboundedSender<WatchError>,
    error_rx: Option<UnboundedReceiver<WatchError>>,
}

impl ManualWatcher {
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::unbounded();
        let (error_tx, error_rx) = mpsc::unbounded();
        Self {
            watched: HashSet::new(),
            watch_calls: Vec::new(),
            event_tx,
            event_rx: Some(event_rx),
            error_tx,
            error_rx: Some(error_rx),
        }
    }

    /// Injects a synthetic event batch.
    pub fn push(&self, event: DirectoryEvent) {
        let _ = self.event_tx.unbounded_send(event);
    }

    /// Injects a synthetic backend error.
    pub fn push_error(&self, error: WatchError) {
        let _ = self.error_tx.unbounded_send(error);
    }

    /// Sender for injecting events after the watcher moved elsewhere.
    pub fn handle(&self) -> UnboundedSender<DirectoryEvent> {
        self.event_tx.clone()
    }

    /// Paths passed to `watch`, in call order.
    pub fn watch_calls(&self) -> &[PathBuf] {
        &self.watch_calls
    }
}

impl Default for ManualWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectoryWatcher for ManualWatcher {
    fn watch(&mut self, dir: &Path) {
        self.watch_calls.push(dir.to_path_buf());
        self.watched.insert(dir.to_path_buf());
    }

    fn is_watched(&self, dir: &Path) -> bool {
        self.watched.contains(dir)
    }

    fn events(&mut self) -> Option<UnboundedReceiver<DirectoryEvent>> {
        self.event_rx.take()
    }

    fn errors(&mut self) -> Option<UnboundedReceiver<WatchError>> {
        self.error_rx.take()
    }

    fn close(&mut self) {
        self.watched.clear();
    }
}

/// `notify`-backed watcher. Every directory is watched non-recursively; raw
/// backend events are translated into per-directory batches on the
/// backend's own thread and handed over through an unbounded channel, so
/// the consumer drains them on whatever thread it mutates the mirror from.
pub struct NotifyWatcher {
    backend: Option<RecommendedWatcher>,
    watched: Arc<Mutex<HashSet<PathBuf>>>,
    error_tx: UnboundedSender<WatchError>,
    event_rx: Option<UnboundedReceiver<DirectoryEvent>>,
    error_rx: Option<UnboundedReceiver<WatchError>>,
}

impl NotifyWatcher {
    pub fn new() -> Result<Self, WatchError> {
        let (event_tx, event_rx) = mpsc::unbounded();
        let (error_tx, error_rx) = mpsc::unbounded();
        let watched = Arc::new(Mutex::new(HashSet::new()));

        let translator_watched = Arc::clone(&watched);
        let translator_errors = error_tx.clone();
        let backend = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| match result {
                Ok(event) => {
                    for directory_event in translate(&translator_watched, event) {
                        let _ = event_tx.unbounded_send(directory_event);
                    }
                }
                Err(error) => {
                    let _ = translator_errors.unbounded_send(WatchError::BackendError {
                        message: error.to_string(),
                    });
                }
            },
            NotifyConfig::default(),
        )
        .map_err(|error| WatchError::BackendError {
            message: error.to_string(),
        })?;

        Ok(Self {
            backend: Some(backend),
            watched,
            error_tx,
            event_rx: Some(event_rx),
            error_rx: Some(error_rx),
        })
    }
}

impl DirectoryWatcher for NotifyWatcher {
    fn watch(&mut self, dir: &Path) {
        if self.is_watched(dir) {
            return;
        }
        let Some(backend) = self.backend.as_mut() else {
            let _ = self.error_tx.unbounded_send(WatchError::InstallError {
                path: dir.to_path_buf(),
                message: "watcher is closed".to_string(),
            });
            return;
        };
        match backend.watch(dir, RecursiveMode::NonRecursive) {
            Ok(()) => {
                if let Ok(mut watched) = self.watched.lock() {
                    watched.insert(dir.to_path_buf());
                }
            }
            Err(error) => {
                let _ = self.error_tx.unbounded_send(WatchError::InstallError {
                    path: dir.to_path_buf(),
                    message: error.to_string(),
                });
            }
        }
    }

    fn is_watched(&self, dir: &Path) -> bool {
        self.watched
            .lock()
            .is_ok_and(|watched| watched.contains(dir))
    }

    fn events(&mut self) -> Option<UnboundedReceiver<DirectoryEvent>> {
        self.event_rx.take()
    }

    fn errors(&mut self) -> Option<UnboundedReceiver<WatchError>> {
        self.error_rx.take()
    }

    fn close(&mut self) {
        // Dropping the backend stops its thread and, with it, the senders
        // captured by the event callback.
        self.backend = None;
    }
}

/// Translates one raw backend event into per-directory batches, keyed by
/// the watched directory that contains each affected path.
fn translate(watched: &Arc<Mutex<HashSet<PathBuf>>>, event: Event) -> Vec<DirectoryEvent> {
    let Ok(mut watched) = watched.lock() else {
        warn!("Watch registry lock poisoned; dropping event");
        return Vec::new();
    };

    if event.need_rescan() {
        // The backend dropped notifications; every watched directory needs
        // overflow recovery.
        return watched
            .iter()
            .map(|dir| DirectoryEvent {
                watched_path: dir.clone(),
                entries: vec![WatchEntry {
                    kind: WatchEntryKind::Overflow,
                    relative_name: PathBuf::new(),
                }],
                was_reset: true,
            })
            .collect();
    }

    let mut out = Vec::new();
    for (index, path) in event.paths.iter().enumerate() {
        let Some(kind) = entry_kind(&event.kind, index) else {
            continue;
        };

        if kind == WatchEntryKind::Delete && watched.contains(path) {
            // The watched directory itself is gone; its registration is dead.
            watched.remove(path);
            out.push(DirectoryEvent {
                watched_path: path.clone(),
                entries: Vec::new(),
                was_reset: false,
            });
            continue;
        }

        let Some(parent) = path.parent() else {
            continue;
        };
        if !watched.contains(parent) {
            debug!("Dropping event for unwatched path {}", path.display());
            continue;
        }
        let Some(name) = path.file_name() else {
            continue;
        };
        out.push(DirectoryEvent {
            watched_path: parent.to_path_buf(),
            entries: vec![WatchEntry {
                kind,
                relative_name: PathBuf::from(name),
            }],
            was_reset: true,
        });
    }
    out
}

/// Maps a raw backend event kind onto the entry kind for the path at
/// `path_index` within the event.
fn entry_kind(kind: &EventKind, path_index: usize) -> Option<WatchEntryKind> {
    match kind {
        EventKind::Create(_) => Some(WatchEntryKind::Create),
        EventKind::Remove(_) => Some(WatchEntryKind::Delete),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => Some(if path_index == 0 {
            WatchEntryKind::Delete
        } else {
            WatchEntryKind::Create
        }),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Some(WatchEntryKind::Delete),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some(WatchEntryKind::Create),
        // The backend could not tell which side of the rename this path is
        // on; a full re-sync of the directory sorts it out.
        EventKind::Modify(ModifyKind::Name(_)) => Some(WatchEntryKind::Overflow),
        EventKind::Modify(_) | EventKind::Any => Some(WatchEntryKind::Modify),
        EventKind::Other => Some(WatchEntryKind::Overflow),
        EventKind::Access(_) => None,
    }
}

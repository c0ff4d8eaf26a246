use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use futures::stream::{FusedStream, StreamExt};
use futures_channel::mpsc::UnboundedReceiver;
use snafu::{OptionExt, Snafu, ensure};
use tracing::{debug, warn};

use crate::ext::BestEffortPathExt;
use crate::monitor::watch::{
    DirectoryEvent, DirectoryWatcher, WatchEntry, WatchEntryKind, WatchError,
};
use crate::snapshot::modified_or_now;
use crate::tree::{Mirror, MirrorError, Update};

/// Connects one mirror to one watcher.
///
/// Raw per-directory event batches are translated into mirror operations
/// tagged with the fixed external initiator supplied at construction, so
/// consumers can tell externally detected changes from the ones this
/// process performed itself. Dropped-notification conditions are recovered
/// by a full re-sync of the affected directory.
///
/// All mirror mutation happens on the thread that calls
/// [`Monitor::process_batch`] or drains [`Monitor::run`]; the watcher only
/// feeds the channel from its own thread.
pub struct Monitor<I, W: DirectoryWatcher> {
    mirror: Mirror<I>,
    watcher: W,
    external: I,
    events: UnboundedReceiver<DirectoryEvent>,
    watch_errors: UnboundedReceiver<WatchError>,
}

#[derive(Debug, Snafu)]
pub enum MonitorError {
    #[snafu(display("The watcher's event streams were already taken"))]
    StreamsTakenError,
    #[snafu(display("Top-level root {} is not an absolute path", path.display()))]
    RelativeRootError { path: PathBuf },
}

impl<I: Clone, W: DirectoryWatcher> Monitor<I, W> {
    pub fn new(mut watcher: W, external: I) -> Result<Self, MonitorError> {
        let events = watcher.events().context(StreamsTakenSnafu)?;
        let watch_errors = watcher.errors().context(StreamsTakenSnafu)?;
        Ok(Self {
            mirror: Mirror::new(),
            watcher,
            external,
            events,
            watch_errors,
        })
    }

    /// Read access to the mirrored forest and its notification channels.
    pub fn mirror(&self) -> &Mirror<I> {
        &self.mirror
    }

    pub(crate) fn mirror_mut(&mut self) -> &mut Mirror<I> {
        &mut self.mirror
    }

    /// Registers a top-level root and performs its initial sync. The
    /// directory watch itself is installed once the root is first expanded
    /// through [`Monitor::expand`].
    ///
    /// A non-absolute path is a caller error and fails immediately instead
    /// of landing on the error channel.
    pub fn add_root(&mut self, path: &Path) -> Result<(), MonitorError> {
        ensure!(path.is_absolute(), RelativeRootSnafu { path });
        if !self.mirror.add_root(path) {
            warn!("Root {} is already registered", path.best_effort_path_display());
            return Ok(());
        }
        self.mirror.sync(path, &self.external, None);
        Ok(())
    }

    /// Marks `path` observed in the mirror, runs any parked diff, and
    /// installs its directory watch.
    pub fn expand(&mut self, path: &Path) {
        self.mirror.expand(path);
        self.watch_directory(path);
    }

    pub fn collapse(&mut self, path: &Path) {
        self.mirror.collapse(path);
    }

    /// Installs a watch for `path`. A no-op when the path is already
    /// watched; a path that is not currently a directory is reported on the
    /// error channel rather than thrown.
    pub fn watch_directory(&mut self, path: &Path) {
        if self.watcher.is_watched(path) {
            return;
        }
        if !path.is_dir() {
            self.mirror.report_error(MirrorError::NotADirectory {
                path: path.to_path_buf(),
            });
            return;
        }
        self.watcher.watch(path);
    }

    /// Applies one raw watch batch to the mirror.
    pub fn process_batch(&mut self, event: DirectoryEvent) {
        if !self.mirror.contains_prefix_of(&event.watched_path) {
            // The covering root may have been removed while the batch was
            // in flight.
            debug!(
                "Ignoring batch for uncovered path {}",
                event.watched_path.display()
            );
            return;
        }

        if event
            .entries
            .iter()
            .any(|entry| entry.kind == WatchEntryKind::Overflow)
        {
            // Notifications were dropped; a full re-sync recovers the
            // directory instead of trusting the surviving entries.
            debug!(
                "Overflow on {}; running full sync",
                event.watched_path.display()
            );
            self.mirror.sync(&event.watched_path, &self.external, None);
        } else {
            for entry in &event.entries {
                self.apply_entry(&event.watched_path, entry);
            }
        }

        if !event.was_reset {
            self.mirror.remove(&event.watched_path, &self.external);
        }
    }

    fn apply_entry(&mut self, watched_path: &Path, entry: &WatchEntry) {
        let path = watched_path.join(&entry.relative_name);
        match entry.kind {
            WatchEntryKind::Modify => match fs::metadata(&path) {
                Ok(metadata) => {
                    let time = modified_or_now(&path, &metadata);
                    self.mirror.update_modification_time(&path, time, &self.external);
                }
                Err(error) => {
                    debug!("Skipping modify of unreadable {}: {}", path.display(), error);
                }
            },
            WatchEntryKind::Create => {
                if path.is_dir() {
                    if self.mirror.contains_prefix_of(&path) {
                        self.mirror.add_directory(&path, &self.external);
                    }
                } else {
                    let time = match fs::metadata(&path) {
                        Ok(metadata) => modified_or_now(&path, &metadata),
                        Err(_) => SystemTime::now(),
                    };
                    self.mirror.add_file(&path, time, &self.external);
                }
            }
            WatchEntryKind::Delete => self.mirror.remove(&path, &self.external),
            WatchEntryKind::Overflow => {
                // Handled at batch level before individual entries.
            }
        }
    }

    /// Waits for the next raw batch, forwarding backend errors onto the
    /// mirror's error channel as they arrive.
    pub async fn next_batch(&mut self) -> Option<DirectoryEvent> {
        loop {
            self.forward_watch_errors();
            if self.watch_errors.is_terminated() {
                return self.events.next().await;
            }
            futures::select! {
                event = self.events.next() => return event,
                error = self.watch_errors.next() => {
                    if let Some(error) = error {
                        self.mirror.report_error(MirrorError::WatchFailure {
                            message: error.to_string(),
                        });
                    }
                }
            }
        }
    }

    /// Forwards every backend error that is already queued.
    fn forward_watch_errors(&mut self) {
        while let Ok(Some(error)) = self.watch_errors.try_next() {
            self.mirror.report_error(MirrorError::WatchFailure {
                message: error.to_string(),
            });
        }
    }

    /// Drains and applies batches until the watcher closes.
    pub async fn run(&mut self) {
        while let Some(event) = self.next_batch().await {
            self.process_batch(event);
        }
    }

    /// Recoverable errors, one subscription per call.
    pub fn errors(&self) -> UnboundedReceiver<MirrorError> {
        self.mirror.errors()
    }

    /// Creation events, one subscription per call.
    pub fn creations(&self) -> UnboundedReceiver<Update<I>> {
        self.mirror.creations()
    }

    /// Deletion events, one subscription per call.
    pub fn deletions(&self) -> UnboundedReceiver<Update<I>> {
        self.mirror.deletions()
    }

    /// Modification events, one subscription per call.
    pub fn modifications(&self) -> UnboundedReceiver<Update<I>> {
        self.mirror.modifications()
    }

    /// Shuts the watcher down, releasing its backend resources and ending
    /// the event streams. Must be called before the monitor is dropped;
    /// skipping it leaks the watch thread.
    pub fn dispose(mut self) {
        self.watcher.close();
    }
}

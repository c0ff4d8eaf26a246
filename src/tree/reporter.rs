use std::cell::RefCell;
use std::path::{Path, PathBuf};

use derive_more::Display;
use futures_channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use snafu::Snafu;
use tracing::debug;

use crate::ext::BestEffortPathExt;

/// Kind of change applied to the mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum UpdateKind {
    #[display("created")]
    Creation,
    #[display("deleted")]
    Deletion,
    #[display("modified")]
    Modification,
}

/// One reconciled change. Emitted exactly once, never mutated afterwards.
///
/// `initiator` is `None` for cleanup the reconciliation discovered on its
/// own rather than performed on behalf of a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Update<I> {
    pub kind: UpdateKind,
    pub base_dir: PathBuf,
    pub relative_path: PathBuf,
    pub initiator: Option<I>,
}

/// Recoverable mirror errors. All of them funnel through one channel so a
/// consumer can implement a single handling policy.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum MirrorError {
    #[snafu(display("Parent directory for {} does not exist in the mirror", path.best_effort_path_display()))]
    MissingParent { path: PathBuf },
    #[snafu(display("Top-level root {} cannot be replaced by a file", path.best_effort_path_display()))]
    RootReplacedByFile { path: PathBuf },
    #[snafu(display("{} is not a directory", path.best_effort_path_display()))]
    NotADirectory { path: PathBuf },
    #[snafu(display("Filesystem watch failure: {message}"))]
    WatchFailure { message: String },
}

/// Sink for everything the reconciliation produces: three change channels
/// and one error channel, each independent, multicast, and replay-free.
///
/// Owned by the mirror; every root node holds a shared reference.
pub struct Reporter<I> {
    creations: Channel<Update<I>>,
    deletions: Channel<Update<I>>,
    modifications: Channel<Update<I>>,
    errors: Channel<MirrorError>,
}

impl<I: Clone> Reporter<I> {
    pub(crate) fn new() -> Self {
        Self {
            creations: Channel::new(),
            deletions: Channel::new(),
            modifications: Channel::new(),
            errors: Channel::new(),
        }
    }

    pub(crate) fn subscribe_creations(&self) -> UnboundedReceiver<Update<I>> {
        self.creations.subscribe()
    }

    pub(crate) fn subscribe_deletions(&self) -> UnboundedReceiver<Update<I>> {
        self.deletions.subscribe()
    }

    pub(crate) fn subscribe_modifications(&self) -> UnboundedReceiver<Update<I>> {
        self.modifications.subscribe()
    }

    pub(crate) fn subscribe_errors(&self) -> UnboundedReceiver<MirrorError> {
        self.errors.subscribe()
    }

    pub(crate) fn report_creation(
        &self,
        base_dir: &Path,
        relative_path: PathBuf,
        initiator: Option<I>,
    ) {
        self.creations
            .publish(update(UpdateKind::Creation, base_dir, relative_path, initiator));
    }

    pub(crate) fn report_deletion(
        &self,
        base_dir: &Path,
        relative_path: PathBuf,
        initiator: Option<I>,
    ) {
        self.deletions
            .publish(update(UpdateKind::Deletion, base_dir, relative_path, initiator));
    }

    pub(crate) fn report_modification(
        &self,
        base_dir: &Path,
        relative_path: PathBuf,
        initiator: Option<I>,
    ) {
        self.modifications.publish(update(
            UpdateKind::Modification,
            base_dir,
            relative_path,
            initiator,
        ));
    }

    pub(crate) fn report_error(&self, error: MirrorError) {
        debug!("Reporting mirror error: {error}");
        self.errors.publish(error);
    }
}

fn update<I>(
    kind: UpdateKind,
    base_dir: &Path,
    relative_path: PathBuf,
    initiator: Option<I>,
) -> Update<I> {
    Update {
        kind,
        base_dir: base_dir.to_path_buf(),
        relative_path,
        initiator,
    }
}

/// Multicast fan-out over unbounded senders. Subscribers that dropped their
/// receiver are pruned as they are discovered.
struct Channel<T> {
    subscribers: RefCell<Vec<UnboundedSender<T>>>,
}

impl<T: Clone> Channel<T> {
    fn new() -> Self {
        Self {
            subscribers: RefCell::new(Vec::new()),
        }
    }

    fn subscribe(&self) -> UnboundedReceiver<T> {
        let (sender, receiver) = mpsc::unbounded();
        self.subscribers.borrow_mut().push(sender);
        receiver
    }

    fn publish(&self, value: T) {
        self.subscribers
            .borrow_mut()
            .retain(|subscriber| subscriber.unbounded_send(value.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain<T>(receiver: &mut UnboundedReceiver<T>) -> Vec<T> {
        let mut out = Vec::new();
        while let Ok(Some(value)) = receiver.try_next() {
            out.push(value);
        }
        out
    }

    #[test]
    fn every_subscriber_sees_every_event_once() {
        let reporter: Reporter<&str> = Reporter::new();
        let mut first = reporter.subscribe_creations();
        let mut second = reporter.subscribe_creations();

        reporter.report_creation(Path::new("/r"), PathBuf::from("a"), Some("test"));

        for receiver in [&mut first, &mut second] {
            let updates = drain(receiver);
            assert_eq!(updates.len(), 1);
            assert_eq!(updates[0].kind, UpdateKind::Creation);
            assert_eq!(updates[0].base_dir, PathBuf::from("/r"));
            assert_eq!(updates[0].relative_path, PathBuf::from("a"));
            assert_eq!(updates[0].initiator, Some("test"));
        }
    }

    #[test]
    fn channels_are_independent() {
        let reporter: Reporter<&str> = Reporter::new();
        let mut creations = reporter.subscribe_creations();
        let mut deletions = reporter.subscribe_deletions();

        reporter.report_deletion(Path::new("/r"), PathBuf::from("gone"), None);

        assert!(drain(&mut creations).is_empty());
        let deleted = drain(&mut deletions);
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].initiator, None);
    }

    #[test]
    fn dropped_subscribers_do_not_block_delivery() {
        let reporter: Reporter<&str> = Reporter::new();
        let dropped = reporter.subscribe_modifications();
        drop(dropped);
        let mut alive = reporter.subscribe_modifications();

        reporter.report_modification(Path::new("/r"), PathBuf::from("f"), Some("test"));

        assert_eq!(drain(&mut alive).len(), 1);
    }

    #[test]
    fn there_is_no_replay_for_late_subscribers() {
        let reporter: Reporter<&str> = Reporter::new();
        reporter.report_creation(Path::new("/r"), PathBuf::from("early"), Some("test"));

        let mut late = reporter.subscribe_creations();

        assert!(drain(&mut late).is_empty());
    }
}

use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::SystemTime;

use futures_channel::mpsc::UnboundedReceiver;
use hashlink::LinkedHashMap;
use tracing::debug;

use crate::ext::BestEffortPathExt;
use crate::tree::reporter::{MirrorError, Reporter, Update};
use crate::tree::root::RootNode;

/// Facade over the forest of mirrored roots.
///
/// Path-addressed operations are routed to every root whose path is a
/// prefix of the argument, so overlapping and nested roots all stay
/// consistent. Change notifications fan out through four independent,
/// multicast, replay-free channels.
///
/// Not thread-safe: all mutation must happen on a single designated thread.
pub struct Mirror<I> {
    roots: LinkedHashMap<PathBuf, RootNode<I>>,
    reporter: Rc<Reporter<I>>,
}

impl<I: Clone> Mirror<I> {
    pub fn new() -> Self {
        Self {
            roots: LinkedHashMap::new(),
            reporter: Rc::new(Reporter::new()),
        }
    }

    /// Registers a new top-level root. Returns false when the path is
    /// already registered.
    pub fn add_root(&mut self, path: &Path) -> bool {
        if self.roots.contains_key(path) {
            return false;
        }
        debug!("Registering root {}", path.best_effort_path_display());
        let root = RootNode::new(path.to_path_buf(), Rc::clone(&self.reporter));
        self.roots.insert(path.to_path_buf(), root);
        true
    }

    /// Drops a top-level root, reporting a deletion for every node it still
    /// tracked. Returns false when the path was not a registered root.
    pub fn remove_root(&mut self, path: &Path, initiator: Option<I>) -> bool {
        match self.roots.remove(path) {
            Some(mut root) => {
                root.tear_down(initiator);
                true
            }
            None => false,
        }
    }

    pub fn root_paths(&self) -> impl Iterator<Item = &Path> {
        self.roots.keys().map(PathBuf::as_path)
    }

    /// Read-only view of the mirrored forest, in registration order.
    pub fn roots(&self) -> impl Iterator<Item = &RootNode<I>> {
        self.roots.values()
    }

    /// Whether some registered root path is a prefix of `path`. Decides
    /// whether an externally observed path is relevant at all, even before
    /// any root has synced that far.
    pub fn contains_prefix_of(&self, path: &Path) -> bool {
        self.roots.keys().any(|root| path.starts_with(root))
    }

    /// Whether any root currently tracks a node for `path`.
    pub fn contains(&self, path: &Path) -> bool {
        self.roots.values().any(|root| {
            path.strip_prefix(root.path())
                .is_ok_and(|relative| root.contains(relative))
        })
    }

    /// Reconciles `path` in every root that covers it.
    pub fn sync(&mut self, path: &Path, initiator: &I, known_mod_time: Option<SystemTime>) {
        for root in self.roots.values_mut() {
            if path.starts_with(root.path()) {
                root.sync(path, initiator, known_mod_time);
            }
        }
    }

    pub fn add_directory(&mut self, path: &Path, initiator: &I) {
        for root in self.roots.values_mut() {
            let Ok(relative) = path.strip_prefix(root.path()) else {
                continue;
            };
            let relative = relative.to_path_buf();
            root.add_directory(&relative, initiator);
        }
    }

    pub fn add_file(&mut self, path: &Path, last_modified: SystemTime, initiator: &I) {
        for root in self.roots.values_mut() {
            let Ok(relative) = path.strip_prefix(root.path()) else {
                continue;
            };
            let relative = relative.to_path_buf();
            root.add_file(&relative, last_modified, initiator);
        }
    }

    /// Drops `path` from every covering root. Dropping a root path itself
    /// unregisters the whole root.
    pub fn remove(&mut self, path: &Path, initiator: &I) {
        if self.roots.contains_key(path) {
            self.remove_root(path, Some(initiator.clone()));
        }
        for root in self.roots.values_mut() {
            let Ok(relative) = path.strip_prefix(root.path()) else {
                continue;
            };
            if relative.as_os_str().is_empty() {
                continue;
            }
            let relative = relative.to_path_buf();
            root.remove(&relative, initiator);
        }
    }

    pub fn update_modification_time(
        &mut self,
        path: &Path,
        last_modified: SystemTime,
        initiator: &I,
    ) {
        for root in self.roots.values_mut() {
            let Ok(relative) = path.strip_prefix(root.path()) else {
                continue;
            };
            let relative = relative.to_path_buf();
            root.update_modification_time(&relative, last_modified, initiator);
        }
    }

    /// Marks `path` observed in every covering root, running any parked
    /// diff. Returns whether some node went from collapsed to expanded.
    pub fn expand(&mut self, path: &Path) -> bool {
        let mut newly_expanded = false;
        for root in self.roots.values_mut() {
            let Ok(relative) = path.strip_prefix(root.path()) else {
                continue;
            };
            let relative = relative.to_path_buf();
            newly_expanded |= root.expand(&relative);
        }
        newly_expanded
    }

    pub fn collapse(&mut self, path: &Path) {
        for root in self.roots.values_mut() {
            let Ok(relative) = path.strip_prefix(root.path()) else {
                continue;
            };
            let relative = relative.to_path_buf();
            root.collapse(&relative);
        }
    }

    /// Mirror-ordered child names of the directory at `path`, from the
    /// first root that tracks it.
    pub fn child_names(&self, path: &Path) -> Option<Vec<String>> {
        self.roots.values().find_map(|root| {
            let relative = path.strip_prefix(root.path()).ok()?;
            root.child_names(relative)
        })
    }

    /// Creation events, one subscription per call.
    pub fn creations(&self) -> UnboundedReceiver<Update<I>> {
        self.reporter.subscribe_creations()
    }

    /// Deletion events, one subscription per call.
    pub fn deletions(&self) -> UnboundedReceiver<Update<I>> {
        self.reporter.subscribe_deletions()
    }

    /// Modification events, one subscription per call.
    pub fn modifications(&self) -> UnboundedReceiver<Update<I>> {
        self.reporter.subscribe_modifications()
    }

    /// Recoverable errors, one subscription per call.
    pub fn errors(&self) -> UnboundedReceiver<MirrorError> {
        self.reporter.subscribe_errors()
    }

    pub(crate) fn report_error(&self, error: MirrorError) {
        self.reporter.report_error(error);
    }
}

impl<I: Clone> Default for Mirror<I> {
    fn default() -> Self {
        Self::new()
    }
}

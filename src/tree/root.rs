use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::rc::Rc;
use std::time::SystemTime;

use snafu::location;
use tracing::{debug, error, warn};

use crate::ext::BestEffortPathExt;
use crate::snapshot::{Snapshot, modified_or_now};
use crate::tree::node::{DeferredSync, Node, NodeArena, NodeId, NodeKind};
use crate::tree::reporter::{MirrorError, Reporter};

/// Mirror subtree anchored at one watched root directory.
///
/// Owns the node arena for everything under the root and drives the
/// reconciliation: diffing live filesystem state against the mirrored tree,
/// applying the minimal mutation, and reporting every change through the
/// shared [`Reporter`]. Collapsed directories are not diffed eagerly; their
/// diff is parked as a one-shot continuation that fires on the next expand.
pub struct RootNode<I> {
    path: PathBuf,
    arena: NodeArena<I>,
    root: NodeId,
    reporter: Rc<Reporter<I>>,
}

/// Outcome of resolving a sync target against the mirrored tree.
enum Resolution {
    /// The path is this root itself.
    Root,
    /// The parent directory resolved; the child may or may not exist yet.
    Child {
        parent: NodeId,
        name: String,
        existing: Option<NodeId>,
    },
    /// An ancestor is missing from the mirror or is not a directory.
    Unresolved,
}

impl<I: Clone> RootNode<I> {
    pub(crate) fn new(path: PathBuf, reporter: Rc<Reporter<I>>) -> Self {
        let mut arena = NodeArena::new();
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let root = arena.insert(Node::directory(name, None));
        Self {
            path,
            arena,
            root,
            reporter,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reconciles the mirrored subtree so it reflects the live filesystem at
    /// `absolute`, which must lie under this root.
    ///
    /// Structural problems (an ancestor that was never added, a root path
    /// turned into a file) are reported on the error channel and the
    /// offending mutation is not applied. Re-running with unchanged
    /// filesystem state emits nothing.
    pub fn sync(&mut self, absolute: &Path, initiator: &I, known_mod_time: Option<SystemTime>) {
        let Ok(relative) = absolute.strip_prefix(&self.path) else {
            debug!(
                "Ignoring sync for {} outside root {}",
                absolute.best_effort_path_display(),
                self.path.best_effort_path_display()
            );
            return;
        };

        match self.resolve_target(relative) {
            Resolution::Root => self.sync_root(initiator),
            Resolution::Child {
                parent,
                name,
                existing,
            } => self.sync_child(parent, &name, absolute, existing, initiator, known_mod_time),
            Resolution::Unresolved => self.reporter.report_error(MirrorError::MissingParent {
                path: absolute.to_path_buf(),
            }),
        }
    }

    /// Registers `relative` as a directory. Reduces to [`Self::sync`].
    pub fn add_directory(&mut self, relative: &Path, initiator: &I) {
        let absolute = self.path.join(relative);
        self.sync(&absolute, initiator, None);
    }

    /// Registers `relative` as a file with a known timestamp. Reduces to
    /// [`Self::sync`].
    pub fn add_file(&mut self, relative: &Path, last_modified: SystemTime, initiator: &I) {
        let absolute = self.path.join(relative);
        self.sync(&absolute, initiator, Some(last_modified));
    }

    /// Drops the node at `relative` and all of its descendants, reporting a
    /// deletion for each, deepest first. Untracked paths are ignored.
    pub fn remove(&mut self, relative: &Path, initiator: &I) {
        match self.resolve(relative) {
            Some(id) if id != self.root => self.remove_node(id, Some(initiator.clone())),
            Some(_) => debug!(
                "Refusing to detach the root node of {}",
                self.path.best_effort_path_display()
            ),
            None => debug!(
                "Ignoring removal of untracked path {} under {}",
                relative.display(),
                self.path.best_effort_path_display()
            ),
        }
    }

    /// Advances the timestamp of the file at `relative`, reporting a
    /// modification when it actually moved forward.
    pub fn update_modification_time(
        &mut self,
        relative: &Path,
        last_modified: SystemTime,
        initiator: &I,
    ) {
        let Some(id) = self.resolve(relative) else {
            debug!(
                "Ignoring timestamp update for untracked path {}",
                relative.display()
            );
            return;
        };
        let changed = self
            .arena
            .get_mut(id)
            .is_some_and(|node| node.update_modification_time(last_modified));
        if changed {
            self.reporter.report_modification(
                &self.path,
                self.relative_of(id),
                Some(initiator.clone()),
            );
        }
    }

    pub fn contains(&self, relative: &Path) -> bool {
        self.resolve(relative).is_some()
    }

    /// Marks the directory at `relative` as observed and runs any diff that
    /// was parked while it was collapsed. Returns whether the node went from
    /// collapsed to expanded.
    pub fn expand(&mut self, relative: &Path) -> bool {
        let Some(id) = self.resolve(relative) else {
            return false;
        };
        let (newly_expanded, fired) = match self.arena.get_mut(id) {
            Some(Node {
                kind:
                    NodeKind::Directory {
                        expanded, deferred, ..
                    },
                ..
            }) => {
                let newly_expanded = !*expanded;
                *expanded = true;
                (newly_expanded, deferred.take())
            }
            _ => return false,
        };
        if let Some(DeferredSync { initiator }) = fired {
            let absolute = self.absolute_of(id);
            self.diff_children(id, &absolute, &initiator);
        }
        newly_expanded
    }

    pub fn collapse(&mut self, relative: &Path) {
        let Some(id) = self.resolve(relative) else {
            return;
        };
        if let Some(Node {
            kind: NodeKind::Directory { expanded, .. },
            ..
        }) = self.arena.get_mut(id)
        {
            *expanded = false;
        }
    }

    /// Names of the children of the directory at `relative`, in mirror
    /// order: directories first, each group case-insensitively sorted.
    pub fn child_names(&self, relative: &Path) -> Option<Vec<String>> {
        let id = self.resolve(relative)?;
        match &self.arena.get(id)?.kind {
            NodeKind::Directory { children, .. } => Some(
                children
                    .iter()
                    .filter_map(|&child| self.arena.get(child))
                    .map(|child| child.name.clone())
                    .collect(),
            ),
            NodeKind::File { .. } => None,
        }
    }

    /// Number of tracked nodes, the root included.
    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.len() <= 1
    }

    /// Drops every tracked descendant, reporting deletions bottom-up. The
    /// root node itself stays registered.
    pub(crate) fn tear_down(&mut self, initiator: Option<I>) {
        for child in self.children_of(self.root) {
            self.remove_node(child, initiator.clone());
        }
    }

    fn sync_root(&mut self, initiator: &I) {
        match fs::metadata(&self.path) {
            Ok(metadata) if metadata.is_dir() => self.reconcile_contents(self.root, initiator),
            Ok(_) => self.reporter.report_error(MirrorError::RootReplacedByFile {
                path: self.path.clone(),
            }),
            Err(error) => warn!(
                "Failed to stat root {}: {}",
                self.path.best_effort_path_display(),
                error
            ),
        }
    }

    /// Step one of reconciliation for a non-root target: bring the single
    /// child `name` of `parent` in line with the filesystem at `absolute`.
    fn sync_child(
        &mut self,
        parent: NodeId,
        name: &str,
        absolute: &Path,
        existing: Option<NodeId>,
        initiator: &I,
        known_mod_time: Option<SystemTime>,
    ) {
        let metadata = match fs::metadata(absolute) {
            Ok(metadata) => Some(metadata),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => None,
            Err(error) => {
                warn!(
                    "Failed to stat {}: {}",
                    absolute.best_effort_path_display(),
                    error
                );
                return;
            }
        };

        let Some(metadata) = metadata else {
            // The path is gone; drop whatever the mirror still tracks for it.
            if let Some(existing) = existing {
                self.remove_node(existing, Some(initiator.clone()));
            }
            return;
        };
        let is_directory = metadata.is_dir();

        // A path can never be tracked as a file and a directory at once.
        let existing = match existing {
            Some(id) if self.arena.get(id).is_some_and(Node::is_directory) != is_directory => {
                self.remove_node(id, Some(initiator.clone()));
                None
            }
            other => other,
        };

        match existing {
            None => {
                let id = if is_directory {
                    self.insert_directory(parent, name)
                } else {
                    let last_modified =
                        known_mod_time.unwrap_or_else(|| modified_or_now(absolute, &metadata));
                    self.insert_file(parent, name, last_modified)
                };
                let Some(id) = id else {
                    return;
                };
                self.reporter.report_creation(
                    &self.path,
                    self.relative_of(id),
                    Some(initiator.clone()),
                );
                if is_directory {
                    self.reconcile_contents(id, initiator);
                }
            }
            Some(id) if is_directory => self.reconcile_contents(id, initiator),
            Some(id) => {
                let last_modified =
                    known_mod_time.unwrap_or_else(|| modified_or_now(absolute, &metadata));
                let changed = self
                    .arena
                    .get_mut(id)
                    .is_some_and(|node| node.update_modification_time(last_modified));
                if changed {
                    self.reporter.report_modification(
                        &self.path,
                        self.relative_of(id),
                        Some(initiator.clone()),
                    );
                }
            }
        }
    }

    /// Diffs the children of an expanded directory against the filesystem,
    /// or parks the diff until the next expand when the directory is
    /// collapsed. The parked diff fires at most once.
    fn reconcile_contents(&mut self, dir: NodeId, initiator: &I) {
        let expanded = match self.arena.get(dir) {
            Some(Node {
                kind: NodeKind::Directory { expanded, .. },
                ..
            }) => *expanded,
            _ => {
                error!("Reconcile target {dir} is not a directory {}", location!());
                return;
            }
        };

        if !expanded {
            if let Some(Node {
                kind: NodeKind::Directory { deferred, .. },
                ..
            }) = self.arena.get_mut(dir)
            {
                *deferred = Some(DeferredSync {
                    initiator: initiator.clone(),
                });
            }
            return;
        }

        let absolute = self.absolute_of(dir);
        self.diff_children(dir, &absolute, initiator);
    }

    fn diff_children(&mut self, dir: NodeId, absolute: &Path, initiator: &I) {
        let mut listing = match Snapshot::capture_children(absolute) {
            Ok(listing) => listing,
            Err(error) => {
                // A failed listing leaves the subtree stale instead of
                // wiping it; a transient permission error must not cascade
                // into a recursive delete.
                warn!(
                    "Leaving {} unreconciled: {}",
                    absolute.best_effort_path_display(),
                    error
                );
                return;
            }
        };
        listing.sort_by(|a, b| {
            b.is_directory()
                .cmp(&a.is_directory())
                .then_with(|| a.file_name().to_lowercase().cmp(&b.file_name().to_lowercase()))
        });

        let live_names: HashSet<String> =
            listing.iter().map(Snapshot::file_name).collect();
        let stale: Vec<NodeId> = self
            .children_of(dir)
            .into_iter()
            .filter(|&child| {
                self.arena
                    .get(child)
                    .is_some_and(|node| !live_names.contains(&node.name))
            })
            .collect();
        for child in stale {
            self.remove_node(child, None);
        }

        for entry in &listing {
            let name = entry.file_name();
            let child_absolute = absolute.join(&name);
            let existing = self.lookup_child(dir, &name);
            self.sync_child(
                dir,
                &name,
                &child_absolute,
                existing,
                initiator,
                entry.last_modified(),
            );
        }
    }

    /// Detaches a node, reporting a deletion for every tracked descendant
    /// before the node itself.
    fn remove_node(&mut self, id: NodeId, initiator: Option<I>) {
        let parent = match self.arena.get(id) {
            Some(node) => node.parent,
            None => {
                error!("Removal of vacant node {id} {}", location!());
                return;
            }
        };

        self.report_deletions(id, &initiator);

        if let Some(parent_id) = parent
            && let Some(Node {
                kind: NodeKind::Directory { children, .. },
                ..
            }) = self.arena.get_mut(parent_id)
        {
            children.retain(|&child| child != id);
        }

        self.discard(id);
    }

    fn report_deletions(&self, id: NodeId, initiator: &Option<I>) {
        let Some(node) = self.arena.get(id) else {
            return;
        };
        if let NodeKind::Directory { children, .. } = &node.kind {
            for &child in children {
                self.report_deletions(child, initiator);
            }
        }
        self.reporter
            .report_deletion(&self.path, self.relative_of(id), initiator.clone());
    }

    fn discard(&mut self, id: NodeId) {
        if let Some(node) = self.arena.remove(id)
            && let NodeKind::Directory { children, .. } = node.kind
        {
            for child in children {
                self.discard(child);
            }
        }
    }

    fn insert_directory(&mut self, parent: NodeId, name: &str) -> Option<NodeId> {
        let id = self
            .arena
            .insert(Node::directory(name.to_string(), Some(parent)));
        self.attach(parent, id, true)
    }

    fn insert_file(
        &mut self,
        parent: NodeId,
        name: &str,
        last_modified: SystemTime,
    ) -> Option<NodeId> {
        let id = self
            .arena
            .insert(Node::file(name.to_string(), Some(parent), last_modified));
        self.attach(parent, id, false)
    }

    /// Splices a freshly inserted node into its parent's ordered child list.
    fn attach(&mut self, parent: NodeId, id: NodeId, directory: bool) -> Option<NodeId> {
        let name = self.arena.get(id)?.name.clone();
        let index = match self.arena.get(parent) {
            Some(Node {
                kind: NodeKind::Directory { children, .. },
                ..
            }) => {
                if directory {
                    self.arena.insertion_index_for_directory(children, &name)
                } else {
                    self.arena.insertion_index_for_file(children, &name)
                }
            }
            _ => {
                error!("Attach target {parent} is not a directory {}", location!());
                self.arena.remove(id);
                return None;
            }
        };

        match self.arena.get_mut(parent) {
            Some(Node {
                kind: NodeKind::Directory { children, .. },
                ..
            }) => {
                children.insert(index, id);
                Some(id)
            }
            _ => {
                self.arena.remove(id);
                None
            }
        }
    }

    /// Resolves a relative path to the node tracking it.
    fn resolve(&self, relative: &Path) -> Option<NodeId> {
        let mut current = self.root;
        for segment in Self::segments(relative)? {
            current = self.lookup_child(current, &segment)?;
        }
        Some(current)
    }

    /// Resolves a sync target to `(parent, child)`: the empty path is the
    /// root itself; otherwise every ancestor must already be tracked as a
    /// directory for the resolution to succeed.
    fn resolve_target(&self, relative: &Path) -> Resolution {
        let Some(segments) = Self::segments(relative) else {
            return Resolution::Unresolved;
        };
        let Some((leaf, ancestors)) = segments.split_last() else {
            return Resolution::Root;
        };

        let mut parent = self.root;
        for segment in ancestors {
            match self.lookup_child(parent, segment) {
                Some(child) if self.arena.get(child).is_some_and(Node::is_directory) => {
                    parent = child;
                }
                _ => return Resolution::Unresolved,
            }
        }

        Resolution::Child {
            parent,
            name: leaf.clone(),
            existing: self.lookup_child(parent, leaf),
        }
    }

    fn lookup_child(&self, dir: NodeId, name: &str) -> Option<NodeId> {
        let NodeKind::Directory { children, .. } = &self.arena.get(dir)?.kind else {
            return None;
        };
        children
            .iter()
            .copied()
            .find(|&child| self.arena.get(child).is_some_and(|node| node.name == name))
    }

    fn children_of(&self, dir: NodeId) -> Vec<NodeId> {
        match self.arena.get(dir) {
            Some(Node {
                kind: NodeKind::Directory { children, .. },
                ..
            }) => children.clone(),
            _ => Vec::new(),
        }
    }

    /// Path of a node relative to this root, rebuilt from the parent chain.
    fn relative_of(&self, id: NodeId) -> PathBuf {
        let mut segments = Vec::new();
        let mut current = Some(id);
        while let Some(node_id) = current {
            if node_id == self.root {
                break;
            }
            let Some(node) = self.arena.get(node_id) else {
                break;
            };
            segments.push(node.name.clone());
            current = node.parent;
        }
        segments.iter().rev().collect()
    }

    fn absolute_of(&self, id: NodeId) -> PathBuf {
        self.path.join(self.relative_of(id))
    }

    fn segments(relative: &Path) -> Option<Vec<String>> {
        let mut out = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(segment) => out.push(segment.to_string_lossy().into_owned()),
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(out)
    }
}

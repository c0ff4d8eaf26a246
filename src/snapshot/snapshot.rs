use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use snafu::{ResultExt, Snafu};
use tracing::warn;

use crate::ext::BestEffortPathExt;

/// Immutable record of the on-disk state of one path at one instant.
///
/// Children carry no particular order; ordering is imposed by whoever
/// consumes the snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    path: PathBuf,
    kind: SnapshotKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SnapshotKind {
    File { last_modified: SystemTime },
    Directory { children: Vec<Snapshot> },
}

impl Snapshot {
    /// Walks the filesystem under `path`, recording every reachable entry.
    ///
    /// Only a failure to stat `path` itself is an error. An entry whose
    /// timestamp cannot be read gets the current time substituted, an
    /// entry that cannot be stat'd at all is kept with the oldest
    /// possible timestamp, and a directory whose listing fails
    /// contributes no children. Everything is logged and the walk
    /// continues.
    pub fn capture(path: impl Into<PathBuf>) -> Result<Self, SnapshotError> {
        let path = path.into();
        let metadata = fs::metadata(&path).context(StatSnafu { path: path.clone() })?;

        if metadata.is_dir() {
            let mut children = match Self::capture_children(&path) {
                Ok(children) => children,
                Err(error) => {
                    warn!("Treating unlistable directory as empty: {error}");
                    Vec::new()
                }
            };
            for child in &mut children {
                if child.is_directory() {
                    match Self::capture(child.path().to_path_buf()) {
                        Ok(deep) => *child = deep,
                        Err(error) => warn!(
                            "Leaving {} shallow: {}",
                            child.path().best_effort_path_display(),
                            error
                        ),
                    }
                }
            }
            Ok(Self::directory(path, children))
        } else {
            let last_modified = modified_or_now(&path, &metadata);
            Ok(Self::file(path, last_modified))
        }
    }

    /// Single-level capture of the entries of one directory: child
    /// directories appear without their own children.
    pub fn capture_children(path: &Path) -> Result<Vec<Snapshot>, SnapshotError> {
        let entries = fs::read_dir(path).context(ListSnafu { path })?;

        let mut children = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(error) => {
                    warn!(
                        "Skipping unreadable entry of {}: {}",
                        path.best_effort_path_display(),
                        error
                    );
                    continue;
                }
            };

            let child_path = entry.path();
            match entry.metadata() {
                Ok(metadata) if metadata.is_dir() => {
                    children.push(Self::directory(child_path, Vec::new()));
                }
                Ok(metadata) => {
                    let last_modified = modified_or_now(&child_path, &metadata);
                    children.push(Self::file(child_path, last_modified));
                }
                Err(error) => {
                    // The entry is still there even while it cannot be
                    // stat'd; dropping it from the listing would read as a
                    // deletion. The epoch timestamp never advances an
                    // existing node's modification time.
                    warn!(
                        "Failed to stat entry {}: {}",
                        child_path.best_effort_path_display(),
                        error
                    );
                    if entry.file_type().is_ok_and(|kind| kind.is_dir()) {
                        children.push(Self::directory(child_path, Vec::new()));
                    } else {
                        children.push(Self::file(child_path, SystemTime::UNIX_EPOCH));
                    }
                }
            }
        }

        Ok(children)
    }

    /// Leaf constructor for a directory snapshot.
    pub fn directory(path: impl Into<PathBuf>, children: Vec<Snapshot>) -> Self {
        Self {
            path: path.into(),
            kind: SnapshotKind::Directory { children },
        }
    }

    /// Leaf constructor for a file snapshot.
    pub fn file(path: impl Into<PathBuf>, last_modified: SystemTime) -> Self {
        Self {
            path: path.into(),
            kind: SnapshotKind::File { last_modified },
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Final path component, lossily decoded.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, SnapshotKind::Directory { .. })
    }

    /// Present only for files.
    pub fn last_modified(&self) -> Option<SystemTime> {
        match self.kind {
            SnapshotKind::File { last_modified } => Some(last_modified),
            SnapshotKind::Directory { .. } => None,
        }
    }

    pub fn children(&self) -> &[Snapshot] {
        match &self.kind {
            SnapshotKind::Directory { children } => children,
            SnapshotKind::File { .. } => &[],
        }
    }
}

/// Modification time of `path`, substituting the current time when the
/// filesystem refuses to report one.
pub(crate) fn modified_or_now(path: &Path, metadata: &fs::Metadata) -> SystemTime {
    match metadata.modified() {
        Ok(time) => time,
        Err(error) => {
            warn!(
                "Failed to read modification time of {}: {}",
                path.best_effort_path_display(),
                error
            );
            SystemTime::now()
        }
    }
}

#[derive(Debug, Snafu)]
pub enum SnapshotError {
    #[snafu(display("Failed to stat {}", path.best_effort_path_display()))]
    StatError {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Failed to list directory {}", path.best_effort_path_display()))]
    ListError {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn sample_tree() -> TempDir {
        let tmp = TempDir::new().expect("Failed to create temp directory");
        fs::create_dir(tmp.path().join("sub")).expect("Failed to create subdirectory");
        fs::write(tmp.path().join("sub/inner.txt"), "inner").expect("Failed to write file");
        fs::write(tmp.path().join("top.txt"), "top").expect("Failed to write file");
        tmp
    }

    #[test]
    fn capture_records_the_whole_tree() {
        let tmp = sample_tree();

        let snapshot = Snapshot::capture(tmp.path()).expect("Failed to capture");

        assert!(snapshot.is_directory());
        let names: HashSet<String> = snapshot
            .children()
            .iter()
            .map(Snapshot::file_name)
            .collect();
        assert_eq!(names, HashSet::from(["sub".to_string(), "top.txt".to_string()]));

        let sub = snapshot
            .children()
            .iter()
            .find(|child| child.file_name() == "sub")
            .expect("Missing sub directory");
        assert!(sub.is_directory());
        assert_eq!(sub.children().len(), 1);
        assert_eq!(sub.children()[0].file_name(), "inner.txt");
        assert!(sub.children()[0].last_modified().is_some());
    }

    #[test]
    fn capture_children_stays_on_one_level() {
        let tmp = sample_tree();

        let children =
            Snapshot::capture_children(tmp.path()).expect("Failed to capture children");

        let sub = children
            .iter()
            .find(|child| child.file_name() == "sub")
            .expect("Missing sub directory");
        assert!(sub.is_directory());
        assert!(sub.children().is_empty());
    }

    #[test]
    fn capture_of_missing_path_is_an_error() {
        let result = Snapshot::capture("/this/path/does/not/exist");

        assert!(matches!(result, Err(SnapshotError::StatError { .. })));
    }

    #[test]
    fn capture_children_of_a_file_is_an_error() {
        let tmp = sample_tree();

        let result = Snapshot::capture_children(&tmp.path().join("top.txt"));

        assert!(matches!(result, Err(SnapshotError::ListError { .. })));
    }

    #[test]
    fn leaf_constructors_build_the_expected_shape() {
        let file = Snapshot::file("/r/a.txt", SystemTime::UNIX_EPOCH);
        let directory = Snapshot::directory("/r", vec![file.clone()]);

        assert!(!file.is_directory());
        assert_eq!(file.last_modified(), Some(SystemTime::UNIX_EPOCH));
        assert!(directory.is_directory());
        assert_eq!(directory.last_modified(), None);
        assert_eq!(directory.children(), &[file]);
    }
}

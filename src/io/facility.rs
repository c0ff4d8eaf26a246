use std::path::{Path, PathBuf};
use std::time::SystemTime;

use compio::fs;
use snafu::{ResultExt, Snafu};
use tracing::debug;

use crate::ext::BestEffortPathExt;
use crate::snapshot::{Snapshot, SnapshotError};
use crate::tree::Mirror;

/// Performs filesystem mutations on behalf of the application and feeds the
/// resulting mirror updates with a fixed internal initiator identity, so
/// consumers of the shared notification channels can tell self-caused
/// changes from externally detected ones.
///
/// The filesystem work runs on the completion-based runtime; the mirror
/// mutation happens on the calling thread once the operation succeeded.
pub struct IoFacility<I> {
    initiator: I,
}

impl<I: Clone> IoFacility<I> {
    pub fn new(initiator: I) -> Self {
        Self { initiator }
    }

    pub fn initiator(&self) -> &I {
        &self.initiator
    }

    pub async fn create_directory(
        &self,
        mirror: &mut Mirror<I>,
        path: &Path,
    ) -> Result<(), IoFacilityError> {
        fs::create_dir(path).await.context(CreateDirectorySnafu { path })?;
        mirror.sync(path, &self.initiator, None);
        Ok(())
    }

    pub async fn create_file(
        &self,
        mirror: &mut Mirror<I>,
        path: &Path,
    ) -> Result<(), IoFacilityError> {
        self.write_file(mirror, path, Vec::new()).await
    }

    /// Writes `contents` to `path`, creating the file when necessary, and
    /// reconciles the path with the written timestamp.
    pub async fn write_file(
        &self,
        mirror: &mut Mirror<I>,
        path: &Path,
        contents: Vec<u8>,
    ) -> Result<(), IoFacilityError> {
        let written = fs::write(path, contents).await;
        written.0.context(WriteSnafu { path })?;

        let last_modified = match fs::metadata(path).await {
            Ok(metadata) => metadata.modified().unwrap_or_else(|_| SystemTime::now()),
            Err(error) => {
                debug!(
                    "Failed to re-read timestamp of {}: {}",
                    path.best_effort_path_display(),
                    error
                );
                SystemTime::now()
            }
        };
        mirror.sync(path, &self.initiator, Some(last_modified));
        Ok(())
    }

    /// Deletes the file or directory subtree at `path`, then drops it from
    /// the mirror. Descendants are removed before their parent.
    pub async fn delete(
        &self,
        mirror: &mut Mirror<I>,
        path: &Path,
    ) -> Result<(), IoFacilityError> {
        let snapshot = Snapshot::capture(path).context(InspectSnafu { path })?;

        // Pre-order with reversal gives children-before-parent removal.
        let mut stack = vec![&snapshot];
        let mut order = Vec::new();
        while let Some(node) = stack.pop() {
            order.push(node);
            stack.extend(node.children());
        }
        for node in order.iter().rev() {
            if node.is_directory() {
                fs::remove_dir(node.path())
                    .await
                    .context(RemoveSnafu { path: node.path() })?;
            } else {
                fs::remove_file(node.path())
                    .await
                    .context(RemoveSnafu { path: node.path() })?;
            }
        }

        mirror.remove(path, &self.initiator);
        Ok(())
    }

    /// Moves `from` to `to` and applies the equivalent mirror mutation.
    pub async fn rename(
        &self,
        mirror: &mut Mirror<I>,
        from: &Path,
        to: &Path,
    ) -> Result<(), IoFacilityError> {
        fs::rename(from, to).await.context(RenameSnafu { from, to })?;
        mirror.remove(from, &self.initiator);
        mirror.sync(to, &self.initiator, None);
        Ok(())
    }
}

#[derive(Debug, Snafu)]
pub enum IoFacilityError {
    #[snafu(display("Failed to create directory {}", path.best_effort_path_display()))]
    CreateDirectoryError {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Failed to write {}", path.best_effort_path_display()))]
    WriteError {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Failed to inspect {} before deletion", path.best_effort_path_display()))]
    InspectError {
        path: PathBuf,
        source: SnapshotError,
    },
    #[snafu(display("Failed to remove {}", path.best_effort_path_display()))]
    RemoveError {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Failed to rename {} to {}", from.best_effort_path_display(), to.best_effort_path_display()))]
    RenameError {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::Update;
    use futures_channel::mpsc::UnboundedReceiver;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        root: PathBuf,
        mirror: Mirror<&'static str>,
        facility: IoFacility<&'static str>,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().expect("Failed to create temp directory");
        let root = tmp
            .path()
            .canonicalize()
            .expect("Failed to canonicalize temp directory");
        let mut mirror: Mirror<&'static str> = Mirror::new();
        mirror.add_root(&root);
        mirror.expand(&root);
        Fixture {
            _tmp: tmp,
            root,
            mirror,
            facility: IoFacility::new("app"),
        }
    }

    fn drain<T>(receiver: &mut UnboundedReceiver<T>) -> Vec<T> {
        let mut out = Vec::new();
        while let Ok(Some(value)) = receiver.try_next() {
            out.push(value);
        }
        out
    }

    fn relative_paths(updates: &[Update<&'static str>]) -> Vec<PathBuf> {
        updates
            .iter()
            .map(|update| update.relative_path.clone())
            .collect()
    }

    #[compio::test]
    async fn created_files_carry_the_internal_initiator() {
        let mut fx = fixture();
        let mut creations = fx.mirror.creations();

        fx.facility
            .create_file(&mut fx.mirror, &fx.root.join("f.txt"))
            .await
            .expect("Failed to create file");

        assert!(fx.root.join("f.txt").is_file());
        let created = drain(&mut creations);
        assert_eq!(relative_paths(&created), vec![PathBuf::from("f.txt")]);
        assert_eq!(created[0].initiator, Some("app"));
    }

    #[compio::test]
    async fn created_directories_enter_the_mirror() {
        let mut fx = fixture();
        let mut creations = fx.mirror.creations();

        fx.facility
            .create_directory(&mut fx.mirror, &fx.root.join("sub"))
            .await
            .expect("Failed to create directory");

        assert!(fx.root.join("sub").is_dir());
        let created = drain(&mut creations);
        assert_eq!(relative_paths(&created), vec![PathBuf::from("sub")]);
        assert_eq!(
            fx.mirror.child_names(&fx.root.join("sub")),
            Some(Vec::new())
        );
    }

    #[compio::test]
    async fn rewriting_a_tracked_file_reports_a_modification() {
        let mut fx = fixture();
        let path = fx.root.join("f.txt");
        std::fs::write(&path, "before").expect("Failed to write file");
        // Track the file far in the past so the rewrite is strictly newer.
        fx.mirror.add_file(&path, SystemTime::UNIX_EPOCH, &"app");
        let mut modifications = fx.mirror.modifications();

        fx.facility
            .write_file(&mut fx.mirror, &path, b"after".to_vec())
            .await
            .expect("Failed to rewrite file");

        let modified = drain(&mut modifications);
        assert_eq!(relative_paths(&modified), vec![PathBuf::from("f.txt")]);
        assert_eq!(modified[0].initiator, Some("app"));
        assert_eq!(
            std::fs::read_to_string(&path).expect("Failed to read file"),
            "after"
        );
    }

    #[compio::test]
    async fn deleting_a_subtree_reports_descendants_first() {
        let mut fx = fixture();
        std::fs::create_dir(fx.root.join("sub")).expect("Failed to create directory");
        std::fs::write(fx.root.join("sub/a.txt"), "a").expect("Failed to write file");
        fx.mirror.sync(&fx.root.clone(), &"app", None);
        fx.mirror.expand(&fx.root.join("sub"));
        let mut deletions = fx.mirror.deletions();

        fx.facility
            .delete(&mut fx.mirror, &fx.root.join("sub"))
            .await
            .expect("Failed to delete subtree");

        assert!(!fx.root.join("sub").exists());
        let deleted = drain(&mut deletions);
        assert_eq!(
            relative_paths(&deleted),
            vec![PathBuf::from("sub/a.txt"), PathBuf::from("sub")]
        );
        assert!(deleted.iter().all(|update| update.initiator == Some("app")));
    }

    #[compio::test]
    async fn renames_report_a_deletion_then_a_creation() {
        let mut fx = fixture();
        let from = fx.root.join("old.txt");
        let to = fx.root.join("new.txt");
        std::fs::write(&from, "x").expect("Failed to write file");
        fx.mirror.sync(&fx.root.clone(), &"app", None);
        let mut creations = fx.mirror.creations();
        let mut deletions = fx.mirror.deletions();

        fx.facility
            .rename(&mut fx.mirror, &from, &to)
            .await
            .expect("Failed to rename");

        assert!(!from.exists());
        assert!(to.is_file());
        assert_eq!(
            relative_paths(&drain(&mut deletions)),
            vec![PathBuf::from("old.txt")]
        );
        assert_eq!(
            relative_paths(&drain(&mut creations)),
            vec![PathBuf::from("new.txt")]
        );
    }

    #[compio::test]
    async fn deleting_a_missing_path_is_an_error() {
        let mut fx = fixture();

        let result = fx
            .facility
            .delete(&mut fx.mirror, &fx.root.join("ghost"))
            .await;

        assert!(matches!(result, Err(IoFacilityError::InspectError { .. })));
    }
}

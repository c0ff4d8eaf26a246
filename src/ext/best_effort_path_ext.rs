use std::path::{Component, Path, PathBuf};

/// Renders a path for logs and error messages, falling back to a lexically
/// normalized absolute form when the path cannot be canonicalized (for
/// example because it no longer exists).
pub trait BestEffortPathExt {
    fn best_effort_path_display(&self) -> String;
}

impl BestEffortPathExt for Path {
    fn best_effort_path_display(&self) -> String {
        match self.canonicalize() {
            Ok(canonical) => canonical.display().to_string(),
            Err(_) => normalize(&absolutize(self)).display().to_string(),
        }
    }
}

impl BestEffortPathExt for PathBuf {
    fn best_effort_path_display(&self) -> String {
        self.as_path().best_effort_path_display()
    }
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(current_dir) => current_dir.join(path),
        Err(_) => path.to_path_buf(),
    }
}

/// Resolves `.` and `..` components lexically, without touching the
/// filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut components: Vec<Component> = Vec::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !matches!(components.last(), None | Some(Component::RootDir)) {
                    components.pop();
                }
            }
            other => components.push(other),
        }
    }

    components.iter().collect()
}

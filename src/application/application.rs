use std::path::PathBuf;

use colored::Colorize;
use futures::{FutureExt, StreamExt};
use snafu::Snafu;
use snafu::prelude::*;
use tracing::{debug, info, warn};

use crate::application::RuntimeConfig;
use crate::application::data::EventSource;
use crate::config::{WatchConfig, WatchConfigError};
use crate::ext::BestEffortPathExt;
use crate::monitor::{DirectoryEvent, Monitor, MonitorError, NotifyWatcher, WatchError};
use crate::tree::{MirrorError, Update, UpdateKind};

enum Step {
    Batch(Option<DirectoryEvent>),
    Update(Option<Update<EventSource>>),
    Failure(Option<MirrorError>),
}

pub struct Application;

impl Application {
    pub async fn run(runtime_config: impl Into<RuntimeConfig>) -> Result<(), ApplicationError> {
        let runtime_config: RuntimeConfig = runtime_config.into();
        let config = Self::load_config(&runtime_config).await?;
        debug!("Loaded config: {:?}", config);

        let roots = Self::collect_roots(&runtime_config, &config)?;

        let watcher = NotifyWatcher::new().context(WatcherSnafu)?;
        let mut monitor = Monitor::new(watcher, EventSource::Watch).context(MonitorSetupSnafu)?;

        let mut creations = monitor.creations();
        let mut deletions = monitor.deletions();
        let mut modifications = monitor.modifications();
        let mut errors = monitor.errors();

        for root in &roots {
            monitor.add_root(root).context(MonitorSetupSnafu)?;
            monitor.expand(root);
        }
        info!("Mirroring {} root(s)", roots.len());

        let colorize = supports_color::on(supports_color::Stream::Stdout).is_some();
        loop {
            let step = {
                // The batch future borrows the monitor mutably and must be
                // gone again before the step is applied below.
                let batch_fut = monitor.next_batch().fuse();
                futures::pin_mut!(batch_fut);
                futures::select! {
                    batch = batch_fut => Step::Batch(batch),
                    update = creations.next() => Step::Update(update),
                    update = deletions.next() => Step::Update(update),
                    update = modifications.next() => Step::Update(update),
                    error = errors.next() => Step::Failure(error),
                }
            };
            match step {
                Step::Batch(Some(batch)) => monitor.process_batch(batch),
                Step::Update(Some(update)) => {
                    Self::print_update(&update, colorize);
                    if config.expand_all && update.kind == UpdateKind::Creation {
                        let path = update.base_dir.join(&update.relative_path);
                        if path.is_dir() {
                            monitor.expand(&path);
                        }
                    }
                }
                Step::Failure(Some(error)) => warn!("{error}"),
                Step::Batch(None) | Step::Update(None) | Step::Failure(None) => break,
            }
        }

        monitor.dispose();
        Ok(())
    }

    async fn load_config(runtime_config: &RuntimeConfig) -> Result<WatchConfig, ApplicationError> {
        if runtime_config.config_path.exists() {
            WatchConfig::read(&runtime_config.config_path)
                .await
                .context(ConfigSnafu)
        } else {
            info!(
                "No config file at {}, using defaults",
                runtime_config.config_path.best_effort_path_display()
            );
            Ok(WatchConfig::default())
        }
    }

    /// Canonicalized union of the CLI roots and the configured roots, in
    /// the order given, without duplicates.
    fn collect_roots(
        runtime_config: &RuntimeConfig,
        config: &WatchConfig,
    ) -> Result<Vec<PathBuf>, ApplicationError> {
        let mut roots = Vec::new();
        for root in runtime_config.roots.iter().chain(config.roots.iter()) {
            let canonical = root.canonicalize().context(RootResolutionSnafu { path: root })?;
            if !roots.contains(&canonical) {
                roots.push(canonical);
            }
        }
        ensure!(!roots.is_empty(), NoRootsSnafu);
        Ok(roots)
    }

    fn print_update(update: &Update<EventSource>, colorize: bool) {
        let path = update.base_dir.join(&update.relative_path);
        let source = update
            .initiator
            .map(|initiator| initiator.to_string())
            .unwrap_or_else(|| "sync".to_string());
        // Pad before coloring; escape sequences would throw the width off.
        let label = format!("{:>8}", update.kind.to_string());
        if colorize {
            let label = match update.kind {
                UpdateKind::Creation => label.green(),
                UpdateKind::Deletion => label.red(),
                UpdateKind::Modification => label.yellow(),
            };
            println!("{label} [{source}] {}", path.display());
        } else {
            println!("{label} [{source}] {}", path.display());
        }
    }
}

#[derive(Debug, Snafu)]
pub enum ApplicationError {
    #[snafu(display("Critical failure encountered during configuration stage"))]
    ConfigError { source: WatchConfigError },
    #[snafu(display("Critical failure encountered while starting the filesystem watcher"))]
    WatcherError { source: WatchError },
    #[snafu(display("Critical failure encountered during monitor setup"))]
    MonitorSetupError { source: MonitorError },
    #[snafu(display("Failed to resolve root {}", path.best_effort_path_display()))]
    RootResolutionError {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("No roots to mirror; pass paths or list them in the config file"))]
    NoRootsError,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn runtime_config(roots: Vec<PathBuf>) -> RuntimeConfig {
        RuntimeConfig {
            roots,
            config_path: PathBuf::from("mirra.yaml"),
        }
    }

    #[test]
    fn collect_roots_requires_at_least_one_root() {
        let result = Application::collect_roots(&runtime_config(Vec::new()), &WatchConfig::default());

        assert!(matches!(result, Err(ApplicationError::NoRootsError)));
    }

    #[test]
    fn collect_roots_canonicalizes_and_deduplicates() {
        let tmp = TempDir::new().expect("Failed to create temp directory");
        let root = tmp.path().to_path_buf();
        let canonical = root.canonicalize().expect("Failed to canonicalize");
        let config = WatchConfig {
            roots: vec![root.clone()],
            expand_all: true,
        };

        let roots = Application::collect_roots(&runtime_config(vec![root]), &config)
            .expect("Failed to collect roots");

        assert_eq!(roots, vec![canonical]);
    }

    #[test]
    fn collect_roots_rejects_missing_paths() {
        let result = Application::collect_roots(
            &runtime_config(vec![PathBuf::from("/no/such/root")]),
            &WatchConfig::default(),
        );

        assert!(matches!(
            result,
            Err(ApplicationError::RootResolutionError { .. })
        ));
    }

    #[compio::test]
    async fn missing_config_file_falls_back_to_defaults() {
        let tmp = TempDir::new().expect("Failed to create temp directory");
        let config_path = tmp.path().join("absent.yaml");
        let runtime_config = RuntimeConfig {
            roots: Vec::new(),
            config_path,
        };

        let config = Application::load_config(&runtime_config)
            .await
            .expect("Failed to load config");

        assert_eq!(config, WatchConfig::default());
    }

    #[compio::test]
    async fn present_config_file_is_parsed() {
        let tmp = TempDir::new().expect("Failed to create temp directory");
        let config_path = tmp.path().join("mirra.yaml");
        fs::write(&config_path, "roots:\n  - /srv/media\nexpand_all: false")
            .expect("Failed to write config");
        let runtime_config = RuntimeConfig {
            roots: Vec::new(),
            config_path,
        };

        let config = Application::load_config(&runtime_config)
            .await
            .expect("Failed to load config");

        assert_eq!(config.roots, vec![PathBuf::from("/srv/media")]);
        assert!(!config.expand_all);
    }
}

use std::path::PathBuf;

use crate::cli::Cli;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub roots: Vec<PathBuf>,
    pub config_path: PathBuf,
}

impl From<Cli> for RuntimeConfig {
    fn from(cli: Cli) -> Self {
        Self {
            roots: cli.roots,
            config_path: cli.config,
        }
    }
}

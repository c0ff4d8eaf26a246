use std::path::PathBuf;

use clap::Parser;

use crate::application::data::LogLevel;
use crate::config::CONFIG_FILE_NAME;

/// Mirrors directories in memory and prints every change it reconciles.
#[derive(Parser, Debug, Clone)]
#[command(version)]
pub struct Cli {
    /// Directories to mirror, in addition to the ones from the config file
    pub roots: Vec<PathBuf>,

    #[clap(long, short, default_value = "warn", value_enum)]
    pub log_level: LogLevel,

    /// Path to the configuration file
    #[clap(long, short, default_value = CONFIG_FILE_NAME)]
    pub config: PathBuf,
}

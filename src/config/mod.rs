mod watch_config;

pub use watch_config::{CONFIG_FILE_NAME, WatchConfig, WatchConfigError};

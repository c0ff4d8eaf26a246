use std::borrow::Cow;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use compio::fs::File;
use compio::io::{AsyncReadExt, BufReader};
use hashlink::LinkedHashMap;
use saphyr::{LoadableYamlNode, Scalar, Yaml};
use snafu::prelude::*;
use tracing::debug;

use crate::ext::BestEffortPathExt;

pub const CONFIG_FILE_NAME: &str = "mirra.yaml";

/// Settings for the command-line mirror: which roots to watch and whether
/// newly discovered directories are expanded automatically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchConfig {
    pub roots: Vec<PathBuf>,
    pub expand_all: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            expand_all: true,
        }
    }
}

impl WatchConfig {
    pub async fn read(path: &Path) -> Result<Self, WatchConfigError> {
        debug!("Opening config file: {}", path.best_effort_path_display());
        let file = File::open(path).await.context(ReadSnafu {
            file_path: path.best_effort_path_display(),
        })?;

        debug!("Reading config file");
        let cursor = Cursor::new(file);
        let mut reader = BufReader::new(cursor);
        let res = reader.read_to_string(String::new()).await;
        match res.0 {
            Ok(n) => debug!("Successfully read config file: {n} bytes"),
            _ => {
                res.0.context(ReadSnafu {
                    file_path: path.best_effort_path_display(),
                })?;
            }
        }
        res.1.as_str().try_into()
    }

    fn parse_roots(
        top_level: &LinkedHashMap<Yaml, Yaml>,
    ) -> Result<Vec<PathBuf>, WatchConfigError> {
        let Some(roots) = top_level.get(&Yaml::Value(Scalar::String(Cow::Borrowed("roots"))))
        else {
            return Ok(Vec::new());
        };
        let entries = roots.as_sequence().ok_or(WatchConfigError::RootsNotList)?;

        Ok(entries
            .iter()
            .filter_map(|entry| match entry.as_str() {
                Some(root) => Some(PathBuf::from(root)),
                None => {
                    debug!("Skipping invalid root entry: {:?}", entry);
                    None
                }
            })
            .collect())
    }

    fn parse_expand_all(top_level: &LinkedHashMap<Yaml, Yaml>) -> Result<bool, WatchConfigError> {
        match top_level.get(&Yaml::Value(Scalar::String(Cow::Borrowed("expand_all")))) {
            None => Ok(true),
            Some(Yaml::Value(Scalar::Boolean(value))) => Ok(*value),
            Some(_) => Err(WatchConfigError::ExpandAllNotBool),
        }
    }
}

impl TryFrom<&str> for WatchConfig {
    type Error = WatchConfigError;

    fn try_from(contents: &str) -> Result<Self, Self::Error> {
        let documents = Yaml::load_from_str(contents)
            .map_err(|e| WatchConfigError::ParseError { source: e })?;
        let document = documents.first().ok_or(WatchConfigError::MalformedConfig)?;

        let top_level = document
            .as_mapping()
            .ok_or(WatchConfigError::TopLevelNotMap)?;

        Ok(WatchConfig {
            roots: Self::parse_roots(top_level)?,
            expand_all: Self::parse_expand_all(top_level)?,
        })
    }
}

#[derive(Debug, Snafu)]
pub enum WatchConfigError {
    #[snafu(display("Failed to read the config file: {}", file_path))]
    ReadError {
        file_path: String,
        source: std::io::Error,
    },
    #[snafu(display("Failed to parse the config file"))]
    ParseError { source: saphyr::ScanError },
    #[snafu(display("Improperly formatted config file"))]
    MalformedConfig,
    #[snafu(display("Top level of config should be a map"))]
    TopLevelNotMap,
    #[snafu(display("The roots section should be a list"))]
    RootsNotList,
    #[snafu(display("expand_all should be a boolean"))]
    ExpandAllNotBool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[compio::test]
    async fn config_returns_error_on_nonexistent_file() {
        let result = WatchConfig::read(Path::new("nonexistent.yaml")).await;
        assert!(result.is_err());
        assert!(matches!(result, Err(WatchConfigError::ReadError { .. })));
    }

    #[test]
    fn config_returns_error_on_invalid_yaml() {
        let invalid_yaml = "invalid: yaml: content: [unclosed";
        let result: Result<WatchConfig, _> = invalid_yaml.try_into();
        assert!(matches!(result, Err(WatchConfigError::ParseError { .. })));
    }

    #[test]
    fn config_returns_error_on_empty_file() {
        let result: Result<WatchConfig, _> = "".try_into();
        assert!(matches!(result, Err(WatchConfigError::MalformedConfig)));
    }

    #[test]
    fn config_returns_error_when_top_level_is_not_map() {
        let result: Result<WatchConfig, _> = "- item1\n- item2".try_into();
        assert!(matches!(result, Err(WatchConfigError::TopLevelNotMap)));
    }

    #[test]
    fn config_returns_error_when_roots_is_not_list() {
        let result: Result<WatchConfig, _> = "roots: just-a-string".try_into();
        assert!(matches!(result, Err(WatchConfigError::RootsNotList)));
    }

    #[test]
    fn config_parses_roots_in_order() {
        let yaml = "roots:\n  - /srv/media\n  - /home/someone/projects";
        let config: WatchConfig = yaml.try_into().expect("Failed to parse config");
        assert_eq!(
            config.roots,
            vec![
                PathBuf::from("/srv/media"),
                PathBuf::from("/home/someone/projects"),
            ]
        );
        assert!(config.expand_all);
    }

    #[test]
    fn config_skips_invalid_root_entries() {
        let yaml = "roots:\n  - /valid\n  - 42\n  - {nested: map}";
        let config: WatchConfig = yaml.try_into().expect("Failed to parse config");
        assert_eq!(config.roots, vec![PathBuf::from("/valid")]);
    }

    #[test]
    fn config_handles_missing_sections() {
        let config: WatchConfig = "other_setting: value".try_into().expect("Failed to parse");
        assert!(config.roots.is_empty());
        assert!(config.expand_all);
    }

    #[test]
    fn config_parses_expand_all() {
        let config: WatchConfig = "expand_all: false".try_into().expect("Failed to parse");
        assert!(!config.expand_all);

        let result: Result<WatchConfig, _> = "expand_all: sometimes".try_into();
        assert!(matches!(result, Err(WatchConfigError::ExpandAllNotBool)));
    }
}

use std::path::{Path, PathBuf};

use config::{Config, Environment, File};
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::flattener::DEFAULT_SEPARATOR;
use crate::record::NullMarker;
use crate::simple_flattener::FieldSelection;

pub const ENV_PREFIX: &str = "FEEDMERGE";

/// One XML feed to flatten into `<artifact_dir>/<name>.parquet`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct FeedConfig {
    pub name: String,
    pub path: PathBuf,
    pub record_tag: String,
    /// Leaf elements for the allow-list flattener.
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub nested_fields: Vec<String>,
}

impl FeedConfig {
    /// The allow-list to flatten with, if the feed names one.
    pub fn selection(&self) -> Option<FieldSelection> {
        if self.fields.is_empty() && self.nested_fields.is_empty() {
            None
        } else {
            Some(FieldSelection::new(self.fields.clone(), self.nested_fields.clone()))
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default)]
    pub null_marker: NullMarker,
    #[serde(default = "default_separator")]
    pub separator: String,
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub drop_empty_columns: bool,
    #[serde(default)]
    pub feeds: Vec<FeedConfig>,
}

fn default_chunk_size() -> usize {
    10_000
}

fn default_page_size() -> usize {
    crate::merger::DEFAULT_PAGE_SIZE
}

fn default_separator() -> String {
    DEFAULT_SEPARATOR.to_string()
}

fn default_artifact_dir() -> PathBuf {
    PathBuf::from("artifacts")
}

fn default_db_path() -> PathBuf {
    PathBuf::from("feeds.db")
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            page_size: default_page_size(),
            null_marker: NullMarker::default(),
            separator: default_separator(),
            artifact_dir: default_artifact_dir(),
            db_path: default_db_path(),
            log_dir: None,
            drop_empty_columns: true,
            feeds: Vec::new(),
        }
    }
}

impl Settings {
    /// Built-in defaults, then the TOML file at `path` if given, then
    /// `FEEDMERGE_*` environment variables (`__` separates nested keys).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            debug!(path = %path.display(), "loading settings file");
            builder = builder.add_source(File::from(path).required(true));
        }
        let cfg = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let settings: Settings = cfg.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::InvalidChunkSize);
        }
        Ok(())
    }
}

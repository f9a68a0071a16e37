use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use documented::{Documented, DocumentedFields};
use serde::{Deserialize, Serialize};
use stowage_utils::{
    bytes::parse_bytes,
    path::{resolve_path, xdg_config_home, xdg_data_home},
    time::parse_duration,
};
use toml_edit::DocumentMut;
use tracing::{debug, info};

use crate::{
    annotations::annotate_toml_table,
    error::{ConfigError, Result},
};

pub const DEFAULT_MAX_BODY_SIZE: &str = "10mb";
pub const DEFAULT_BUFFER_SIZE: &str = "64KiB";
pub const DEFAULT_LOCK_TIMEOUT: &str = "5s";

/// Registry storage configuration
#[derive(Clone, Debug, Deserialize, Serialize, Documented, DocumentedFields)]
pub struct Config {
    /// Directory holding package documents and tarballs.
    /// Default: $XDG_DATA_HOME/stowage/storage
    pub storage_path: Option<String>,

    /// Flush files and directory entries to disk before a commit is reported.
    /// Default: true
    pub fsync: Option<bool>,

    /// How long a writer waits for another writer's commit on the same package.
    /// Default: 5s
    pub lock_timeout: Option<String>,

    /// Tarball upload limits.
    #[serde(default)]
    pub uploads: Uploads,
}

/// Limits applied while streaming tarball uploads
#[derive(Clone, Debug, Default, Deserialize, Serialize, Documented, DocumentedFields)]
pub struct Uploads {
    /// Largest tarball accepted; larger uploads are aborted.
    /// Default: 10mb
    pub max_body_size: Option<String>,

    /// Size of the read buffer used when piping an upload to disk.
    /// Default: 64KiB
    pub buffer_size: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}

/// Location of the configuration file: `$STOWAGE_CONFIG`, else
/// `$XDG_CONFIG_HOME/stowage/config.toml`.
pub fn config_path() -> PathBuf {
    match std::env::var("STOWAGE_CONFIG") {
        Ok(path) => PathBuf::from(path),
        Err(_) => xdg_config_home().join("stowage").join("config.toml"),
    }
}

impl Config {
    pub fn default_config() -> Self {
        Self {
            storage_path: Some(format!("{}/stowage/storage", xdg_data_home().display())),
            fsync: Some(true),
            lock_timeout: Some(DEFAULT_LOCK_TIMEOUT.to_string()),
            uploads: Uploads {
                max_body_size: Some(DEFAULT_MAX_BODY_SIZE.to_string()),
                buffer_size: Some(DEFAULT_BUFFER_SIZE.to_string()),
            },
        }
    }

    /// Loads the configuration from `path`, falling back to defaults when the file is missing.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no config at {}, using defaults", path.display());
                Self::default_config()
            }
            Err(err) => return Err(ConfigError::IoError(err)),
        };

        config.resolve()?;

        Ok(config)
    }

    /// Fills unset fields with defaults and validates every value that is parsed later.
    pub fn resolve(&mut self) -> Result<()> {
        self.fsync.get_or_insert(true);
        self.lock_timeout
            .get_or_insert_with(|| DEFAULT_LOCK_TIMEOUT.to_string());
        self.uploads
            .max_body_size
            .get_or_insert_with(|| DEFAULT_MAX_BODY_SIZE.to_string());
        self.uploads
            .buffer_size
            .get_or_insert_with(|| DEFAULT_BUFFER_SIZE.to_string());

        self.max_body_size()?;
        self.lock_timeout()?;
        if self.buffer_size()? == 0 {
            return Err(ConfigError::ZeroValue {
                field: "uploads.buffer_size",
            });
        }

        Ok(())
    }

    pub fn get_storage_path(&self) -> Result<PathBuf> {
        if let Ok(env_path) = std::env::var("STOWAGE_STORAGE") {
            return Ok(resolve_path(&env_path)?);
        }
        match &self.storage_path {
            Some(path) => Ok(resolve_path(path)?),
            None => Ok(xdg_data_home().join("stowage").join("storage")),
        }
    }

    pub fn max_body_size(&self) -> Result<u64> {
        let value = self
            .uploads
            .max_body_size
            .as_deref()
            .unwrap_or(DEFAULT_MAX_BODY_SIZE);
        parse_bytes(value).map_err(|_| {
            ConfigError::InvalidSize {
                field: "uploads.max_body_size",
                value: value.to_string(),
            }
        })
    }

    pub fn buffer_size(&self) -> Result<usize> {
        let value = self
            .uploads
            .buffer_size
            .as_deref()
            .unwrap_or(DEFAULT_BUFFER_SIZE);
        parse_bytes(value)
            .ok()
            .and_then(|size| usize::try_from(size).ok())
            .ok_or_else(|| {
                ConfigError::InvalidSize {
                    field: "uploads.buffer_size",
                    value: value.to_string(),
                }
            })
    }

    pub fn lock_timeout(&self) -> Result<Duration> {
        let value = self.lock_timeout.as_deref().unwrap_or(DEFAULT_LOCK_TIMEOUT);
        parse_duration(value).ok_or_else(|| {
            ConfigError::InvalidDuration {
                field: "lock_timeout",
                value: value.to_string(),
            }
        })
    }

    pub fn fsync(&self) -> bool {
        self.fsync.unwrap_or(true)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let serialized = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serialized)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    pub fn to_annotated_document(&self) -> Result<DocumentMut> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut doc = toml_string.parse::<DocumentMut>()?;

        annotate_toml_table::<Config>(doc.as_table_mut(), true)?;

        if let Some(uploads) = doc.get_mut("uploads").and_then(|item| item.as_table_mut()) {
            annotate_toml_table::<Uploads>(uploads, false)?;
        }

        Ok(doc)
    }
}

/// Writes a documented default configuration to `path`.
pub fn generate_default_config(path: &Path) -> Result<()> {
    if path.exists() {
        return Err(ConfigError::ConfigAlreadyExists(path.display().to_string()));
    }

    let annotated_doc = Config::default_config().to_annotated_document()?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    fs::write(path, annotated_doc.to_string())?;
    info!(
        "Default configuration file generated with documentation at: {}",
        path.display()
    );
    Ok(())
}

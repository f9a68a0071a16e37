use miette::Diagnostic;
use stowage_utils::error::{BytesError, FileSystemError, PathError, UtilsError};
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum ConfigError {
    #[error("TOML serialization error: {0}")]
    #[diagnostic(
        code(stowage_config::toml_serialize),
        help("Check your configuration structure for invalid values")
    )]
    TomlSerError(#[from] toml::ser::Error),

    #[error("TOML deserialization error: {0}")]
    #[diagnostic(
        code(stowage_config::toml_deserialize),
        help("Check your config.toml syntax and structure")
    )]
    TomlDeError(#[from] toml::de::Error),

    #[error("Configuration file already exists: {0}")]
    #[diagnostic(
        code(stowage_config::already_exists),
        help("Remove the existing config file or use a different location")
    )]
    ConfigAlreadyExists(String),

    #[error("Invalid size for `{field}`: {value}")]
    #[diagnostic(
        code(stowage_config::invalid_size),
        help("Use a plain byte count or a unit suffix such as 64KiB or 10mb")
    )]
    InvalidSize { field: &'static str, value: String },

    #[error("Invalid duration for `{field}`: {value}")]
    #[diagnostic(
        code(stowage_config::invalid_duration),
        help("Use a duration such as 500ms, 5s or 1m30s")
    )]
    InvalidDuration { field: &'static str, value: String },

    #[error("`{field}` must be greater than zero")]
    #[diagnostic(code(stowage_config::zero_value))]
    ZeroValue { field: &'static str },

    #[error("IO error: {0}")]
    #[diagnostic(code(stowage_config::io))]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    #[diagnostic(code(stowage_config::utils))]
    Utils(#[from] UtilsError),

    #[error("Failed to parse TOML: {0}")]
    #[diagnostic(code(stowage_config::toml))]
    Toml(#[from] toml_edit::TomlError),

    #[error("Encountered unexpected TOML item: {0}")]
    #[diagnostic(code(stowage_config::unexpected_toml_item))]
    UnexpectedTomlItem(String),
}

impl From<PathError> for ConfigError {
    fn from(err: PathError) -> Self {
        Self::Utils(UtilsError::Path(err))
    }
}

impl From<BytesError> for ConfigError {
    fn from(err: BytesError) -> Self {
        Self::Utils(UtilsError::Bytes(err))
    }
}

impl From<FileSystemError> for ConfigError {
    fn from(err: FileSystemError) -> Self {
        Self::Utils(UtilsError::FileSystem(err))
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;

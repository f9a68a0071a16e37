//! Error types for stowage-core.

use std::time::Duration;

use miette::Diagnostic;
use stowage_config::error::ConfigError;
use stowage_utils::error::{FileSystemError, LockError, NameError};
use thiserror::Error;

/// Every failure the storage engine and the publish adapter report.
#[derive(Error, Diagnostic, Debug)]
pub enum StoreError {
    #[error("Package '{0}' already exists")]
    #[diagnostic(
        code(stowage::package_conflict),
        help("Fetch the document and update it with its current revision instead")
    )]
    PackageConflict(String),

    #[error("Version '{version}' of '{name}' already exists")]
    #[diagnostic(
        code(stowage::version_conflict),
        help("Published versions are immutable; bump the version number")
    )]
    VersionConflict { name: String, version: String },

    #[error("Revision '{given}' of '{name}' is not the current revision")]
    #[diagnostic(
        code(stowage::revision_mismatch),
        help("Another writer changed the package; fetch it again and retry")
    )]
    RevisionMismatch { name: String, given: String },

    #[error("{0} not found")]
    #[diagnostic(code(stowage::not_found))]
    NotFound(String),

    #[error("Invalid package name '{name}': {reason}")]
    #[diagnostic(
        code(stowage::invalid_package_name),
        help("Use a lower-case, URL safe name such as 'left-pad' or '@scope/left-pad'")
    )]
    InvalidPackageName { name: String, reason: &'static str },

    #[error("Invalid tarball filename '{filename}': {reason}")]
    #[diagnostic(code(stowage::invalid_filename))]
    InvalidFilename {
        filename: String,
        reason: &'static str,
    },

    #[error("Invalid version '{version}'")]
    #[diagnostic(
        code(stowage::invalid_version),
        help("Versions must be valid semver, e.g. 1.2.3 or 2.0.0-beta.1")
    )]
    InvalidVersion {
        version: String,
        #[source]
        source: semver::Error,
    },

    #[error("Version '{version}' of '{name}' references missing tarball '{filename}'")]
    #[diagnostic(
        code(stowage::missing_attachment),
        help("Upload the tarball before publishing the version that points at it")
    )]
    MissingAttachment {
        name: String,
        version: String,
        filename: String,
    },

    #[error("Tarball '{filename}' of '{name}' is still referenced by version '{version}'")]
    #[diagnostic(
        code(stowage::tarball_in_use),
        help("Remove the version from the package document first")
    )]
    TarballInUse {
        name: String,
        filename: String,
        version: String,
    },

    #[error("Tarball '{filename}' of '{name}' already exists")]
    #[diagnostic(code(stowage::tarball_conflict))]
    TarballConflict { name: String, filename: String },

    #[error("Tarball '{filename}' is empty")]
    #[diagnostic(code(stowage::empty_tarball))]
    EmptyTarball { filename: String },

    #[error("Tarball '{filename}' exceeds the {limit} byte limit")]
    #[diagnostic(
        code(stowage::tarball_too_large),
        help("Raise uploads.max_body_size in the configuration")
    )]
    TarballTooLarge { filename: String, limit: u64 },

    #[error("Upload of '{filename}' was aborted: {reason}")]
    #[diagnostic(code(stowage::upload_aborted))]
    UploadAborted { filename: String, reason: String },

    #[error("{0}")]
    #[diagnostic(code(stowage::unsupported))]
    UnsupportedOperation(String),

    #[error("{0}")]
    #[diagnostic(code(stowage::bad_data))]
    BadPackageData(String),

    #[error("Timed out after {waited:?} waiting for the lock on '{name}'")]
    #[diagnostic(
        code(stowage::lock_timeout),
        help("Another writer is holding the package; retry shortly or raise lock_timeout")
    )]
    LockTimeout { name: String, waited: Duration },

    #[error("Error while {action}")]
    #[diagnostic(code(stowage::io), help("Check file permissions and disk space"))]
    IoError {
        action: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    #[diagnostic(code(stowage::json))]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    #[diagnostic(code(stowage::filesystem), help("Check file permissions and disk space"))]
    FileSystem(#[from] FileSystemError),

    #[error(transparent)]
    #[diagnostic(code(stowage::lock))]
    Lock(#[from] LockError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(
        code(stowage::task),
        help("This is an internal error, please report it")
    )]
    Task(#[from] tokio::task::JoinError),
}

impl StoreError {
    /// Failures that carry no meaning for a client and must not leak to one.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::IoError { .. }
                | Self::Json(_)
                | Self::FileSystem(_)
                | Self::Lock(_)
                | Self::Config(_)
                | Self::Task(_)
        )
    }

    /// HTTP status an upstream transport should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::PackageConflict(_)
            | Self::VersionConflict { .. }
            | Self::RevisionMismatch { .. }
            | Self::TarballInUse { .. }
            | Self::TarballConflict { .. } => 409,
            Self::NotFound(_) => 404,
            Self::InvalidPackageName { .. }
            | Self::InvalidFilename { .. }
            | Self::InvalidVersion { .. }
            | Self::MissingAttachment { .. }
            | Self::EmptyTarball { .. }
            | Self::UploadAborted { .. }
            | Self::BadPackageData(_) => 400,
            Self::TarballTooLarge { .. } => 413,
            Self::UnsupportedOperation(_) => 501,
            Self::LockTimeout { .. } => 503,
            Self::IoError { .. }
            | Self::Json(_)
            | Self::FileSystem(_)
            | Self::Lock(_)
            | Self::Config(_)
            | Self::Task(_) => 500,
        }
    }

    pub(crate) fn package_not_found(name: &str) -> Self {
        Self::NotFound(format!("Package '{name}'"))
    }

    pub(crate) fn tarball_not_found(name: &str, filename: &str) -> Self {
        Self::NotFound(format!("Tarball '{filename}' of '{name}'"))
    }
}

impl From<NameError> for StoreError {
    fn from(err: NameError) -> Self {
        match err {
            NameError::InvalidPackageName {
                name,
                reason,
            } => {
                Self::InvalidPackageName {
                    name,
                    reason,
                }
            }
            NameError::InvalidFilename {
                filename,
                reason,
            } => {
                Self::InvalidFilename {
                    filename,
                    reason,
                }
            }
        }
    }
}

/// Trait for adding context to IO errors.
pub trait ErrorContext<T> {
    fn with_context<C>(self, context: C) -> std::result::Result<T, StoreError>
    where
        C: FnOnce() -> String;
}

impl<T> ErrorContext<T> for std::io::Result<T> {
    fn with_context<C>(self, context: C) -> std::result::Result<T, StoreError>
    where
        C: FnOnce() -> String,
    {
        self.map_err(|err| {
            StoreError::IoError {
                action: context(),
                source: err,
            }
        })
    }
}

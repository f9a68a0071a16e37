//! Storage engine owning package documents and tarball blobs.

use std::{path::PathBuf, time::Duration};

use async_trait::async_trait;
use stowage_config::config::Config;

use crate::{
    document::{PackageDocument, PackageManifest, VersionMetadata},
    upload::UploadStream,
    StoreResult,
};

mod engine;
pub mod layout;
mod recovery;

pub use engine::StorageEngine;

const DEFAULT_MAX_BODY_SIZE: u64 = 10 * 1024 * 1024;
const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Runtime knobs of a [`StorageEngine`].
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub root: PathBuf,
    pub max_body_size: u64,
    pub buffer_size: usize,
    pub lock_timeout: Duration,
    pub fsync: bool,
}

impl EngineOptions {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: root.into(),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            fsync: true,
        }
    }

    pub fn from_config(config: &Config) -> StoreResult<Self> {
        Ok(Self {
            root: config.get_storage_path()?,
            max_body_size: config.max_body_size()?,
            buffer_size: config.buffer_size()?,
            lock_timeout: config.lock_timeout()?,
            fsync: config.fsync(),
        })
    }
}

/// Publish-path operations the request adapter drives.
///
/// Every mutation either commits completely, bumping the document revision, or leaves the
/// package untouched.
#[async_trait]
pub trait PackageStorage: Send + Sync {
    /// Creates a package; inline attachments commit together with the document.
    async fn add_package(
        &self,
        name: &str,
        manifest: PackageManifest,
    ) -> StoreResult<PackageDocument>;

    /// Replaces versions, dist-tags and extra fields if `revision` is still current.
    async fn change_package(
        &self,
        name: &str,
        manifest: PackageManifest,
        revision: &str,
    ) -> StoreResult<PackageDocument>;

    /// Inserts a new version and points `tag` at it.
    async fn add_version(
        &self,
        name: &str,
        version: &str,
        metadata: VersionMetadata,
        tag: &str,
    ) -> StoreResult<PackageDocument>;

    /// Opens an upload stream for a new attachment.
    async fn add_tarball(&self, name: &str, filename: &str) -> StoreResult<UploadStream>;

    async fn remove_tarball(
        &self,
        name: &str,
        filename: &str,
        revision: &str,
    ) -> StoreResult<PackageDocument>;

    /// Deletes the document and every attachment it owns.
    async fn remove_package(&self, name: &str) -> StoreResult<()>;

    async fn get_package(&self, name: &str) -> StoreResult<PackageDocument>;
}

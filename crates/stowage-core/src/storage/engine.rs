use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
    time::Instant,
};

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use stowage_config::config::Config;
use stowage_events::{EventSinkHandle, StoreEvent};
use stowage_utils::{
    fs::{ensure_dir_exists, replace_file, safe_remove, sync_dir, write_atomic},
    hash::checksum_bytes,
    lock::{FileLock, LOCK_POLL_INTERVAL},
    name::{validate_package_name, validate_tarball_filename},
};
use tracing::{debug, trace, warn};

use super::{layout::Layout, recovery, EngineOptions, PackageStorage};
use crate::{
    document::{PackageDocument, PackageManifest, TarballRef, VersionMetadata},
    error::{ErrorContext, StoreError},
    upload::UploadStream,
    StoreResult,
};

/// Filesystem-backed package store.
///
/// Cloning is cheap and every clone works on the same storage root. Writers on one package
/// serialize through a per-package file lock that is held only while a document is read,
/// checked and renamed into place; streaming uploads never hold it.
#[derive(Clone)]
pub struct StorageEngine {
    layout: Layout,
    options: EngineOptions,
    events: EventSinkHandle,
}

impl StorageEngine {
    /// Opens the storage root named by `config` and recovers it from interrupted writes.
    pub async fn open(config: &Config, events: EventSinkHandle) -> StoreResult<Self> {
        Self::open_with(EngineOptions::from_config(config)?, events).await
    }

    pub async fn open_with(options: EngineOptions, events: EventSinkHandle) -> StoreResult<Self> {
        let engine = Self {
            layout: Layout::new(options.root.clone()),
            options,
            events,
        };

        let root = engine.layout.root().to_path_buf();
        tokio::task::spawn_blocking(move || ensure_dir_exists(root)).await??;

        let removed = engine.recover().await?;
        debug!(
            root = %engine.layout.root().display(),
            removed,
            "storage engine ready"
        );
        Ok(engine)
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn root(&self) -> &Path {
        self.layout.root()
    }

    /// Deletes temp files, trashed packages and blobs no document references.
    ///
    /// Returns the number of entries removed. Runs on open; uploads in flight while it runs
    /// are aborted. A package whose commit lock stays busy for `lock_timeout` is skipped.
    pub async fn recover(&self) -> StoreResult<usize> {
        let layout = self.layout.clone();
        let lock_timeout = self.options.lock_timeout;
        let removed =
            tokio::task::spawn_blocking(move || recovery::recover_root(&layout, lock_timeout))
                .await??;
        if removed > 0 {
            self.emit(StoreEvent::Recovered {
                removed,
            });
        }
        Ok(removed)
    }

    pub(crate) fn emit(&self, event: StoreEvent) {
        self.events.emit(event);
    }

    async fn lock_package(&self, name: &str) -> StoreResult<FileLock> {
        let started = Instant::now();
        loop {
            let lock_dir = self.layout.lock_dir();
            let package = name.to_string();
            let acquired =
                tokio::task::spawn_blocking(move || FileLock::try_acquire(&lock_dir, &package))
                    .await??;

            if let Some(lock) = acquired {
                trace!(package = name, waited = ?started.elapsed(), "commit lock acquired");
                return Ok(lock);
            }
            if started.elapsed() >= self.options.lock_timeout {
                return Err(StoreError::LockTimeout {
                    name: name.to_string(),
                    waited: started.elapsed(),
                });
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }

    /// Runs `f` on the blocking pool while holding the commit lock of `name`.
    ///
    /// The closure keeps running to completion even if the calling future is dropped, so a
    /// commit is never cut in half.
    async fn commit<T, F>(&self, name: &str, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Layout, bool) -> StoreResult<T> + Send + 'static,
    {
        let lock = self.lock_package(name).await?;
        let layout = self.layout.clone();
        let durable = self.options.fsync;
        tokio::task::spawn_blocking(move || {
            let _lock = lock;
            f(&layout, durable)
        })
        .await?
    }

    /// Commits an uploaded temp file as attachment `filename`.
    pub(crate) async fn commit_tarball(
        &self,
        name: &str,
        filename: &str,
        temp: PathBuf,
        shasum: String,
        size: u64,
    ) -> StoreResult<(TarballRef, PackageDocument)> {
        let package = name.to_string();
        let filename = filename.to_string();
        self.commit(name, move |layout, durable| {
            let mut doc = load_document(layout, &package)?;
            if doc.attachments.contains_key(&filename) {
                return Err(StoreError::TarballConflict {
                    name: package,
                    filename,
                });
            }

            let tarball = TarballRef {
                shasum,
                size,
                version: doc.version_referencing(&filename).map(str::to_string),
            };
            doc.attachments.insert(filename.clone(), tarball.clone());
            doc.touch();

            let blob = layout.blob_path(&package, &filename);
            replace_file(&temp, &blob, durable)?;
            if let Err(err) = write_document(layout, &doc, durable) {
                let _ = fs::remove_file(&blob);
                return Err(err);
            }
            Ok((tarball, doc))
        })
        .await
    }
}

#[async_trait]
impl PackageStorage for StorageEngine {
    async fn add_package(
        &self,
        name: &str,
        manifest: PackageManifest,
    ) -> StoreResult<PackageDocument> {
        validate_package_name(name)?;
        let PackageManifest {
            versions,
            dist_tags,
            attachments,
            extra,
        } = manifest;
        let versions = bind_versions(name, versions)?;

        let mut blobs = Vec::with_capacity(attachments.len());
        for (filename, attachment) in &attachments {
            validate_tarball_filename(filename)?;
            let bytes = attachment.decode(filename)?;
            if bytes.is_empty() {
                return Err(StoreError::EmptyTarball {
                    filename: filename.clone(),
                });
            }
            if bytes.len() as u64 > self.options.max_body_size {
                return Err(StoreError::TarballTooLarge {
                    filename: filename.clone(),
                    limit: self.options.max_body_size,
                });
            }
            blobs.push((filename.clone(), bytes));
        }

        let package = name.to_string();
        let doc = self
            .commit(name, move |layout, durable| {
                if layout.document_path(&package).exists() {
                    return Err(StoreError::PackageConflict(package));
                }

                let mut doc = PackageDocument::new(&package);
                for (filename, bytes) in &blobs {
                    doc.attachments.insert(
                        filename.clone(),
                        TarballRef {
                            shasum: checksum_bytes(bytes),
                            size: bytes.len() as u64,
                            version: None,
                        },
                    );
                }
                doc.replace_contents(versions, dist_tags, extra);
                doc.check_references()?;

                let dir = layout.package_dir(&package);
                ensure_dir_exists(&dir)?;
                let committed = commit_blobs(layout, &package, &blobs, durable)?;
                if let Err(err) = write_document(layout, &doc, durable) {
                    for blob in committed {
                        let _ = fs::remove_file(blob);
                    }
                    return Err(err);
                }
                Ok(doc)
            })
            .await?;

        debug!(package = name, rev = %doc.rev, versions = doc.versions.len(), "package created");
        self.emit(StoreEvent::PackageCreated {
            name: doc.name.clone(),
            rev: doc.rev.to_string(),
        });
        Ok(doc)
    }

    async fn change_package(
        &self,
        name: &str,
        manifest: PackageManifest,
        revision: &str,
    ) -> StoreResult<PackageDocument> {
        validate_package_name(name)?;
        let PackageManifest {
            versions,
            dist_tags,
            extra,
            ..
        } = manifest;
        let versions = bind_versions(name, versions)?;

        let package = name.to_string();
        let given = revision.to_string();
        let doc = self
            .commit(name, move |layout, durable| {
                let mut doc = load_document(layout, &package)?;
                if !doc.rev.matches(&given) {
                    return Err(StoreError::RevisionMismatch {
                        name: package,
                        given,
                    });
                }

                doc.replace_contents(versions, dist_tags, extra);
                doc.check_references()?;
                doc.touch();
                write_document(layout, &doc, durable)?;
                Ok(doc)
            })
            .await?;

        debug!(package = name, rev = %doc.rev, "package changed");
        self.emit(StoreEvent::PackageChanged {
            name: doc.name.clone(),
            rev: doc.rev.to_string(),
        });
        Ok(doc)
    }

    async fn add_version(
        &self,
        name: &str,
        version: &str,
        metadata: VersionMetadata,
        tag: &str,
    ) -> StoreResult<PackageDocument> {
        validate_package_name(name)?;
        parse_version(version)?;
        if tag.trim().is_empty() {
            return Err(StoreError::BadPackageData(
                "dist-tag cannot be empty".to_string(),
            ));
        }

        let metadata = metadata.bind(name, version);
        let package = name.to_string();
        let version_key = version.to_string();
        let tag_key = tag.to_string();
        let doc = self
            .commit(name, move |layout, durable| {
                let mut doc = load_document(layout, &package)?;
                if doc.versions.contains_key(&version_key) {
                    return Err(StoreError::VersionConflict {
                        name: package,
                        version: version_key,
                    });
                }

                if let Some(filename) = metadata.tarball_filename() {
                    match doc.attachments.get_mut(filename) {
                        Some(tarball) => tarball.version = Some(version_key.clone()),
                        None => {
                            return Err(StoreError::MissingAttachment {
                                name: package,
                                version: version_key,
                                filename: filename.to_string(),
                            });
                        }
                    }
                }

                doc.versions.insert(version_key.clone(), metadata);
                doc.dist_tags.insert(tag_key, version_key.clone());
                doc.time.insert(version_key, Utc::now());
                doc.touch();
                write_document(layout, &doc, durable)?;
                Ok(doc)
            })
            .await?;

        debug!(package = name, version, tag, rev = %doc.rev, "version added");
        self.emit(StoreEvent::VersionAdded {
            name: doc.name.clone(),
            version: version.to_string(),
            tag: tag.to_string(),
            rev: doc.rev.to_string(),
        });
        Ok(doc)
    }

    async fn add_tarball(&self, name: &str, filename: &str) -> StoreResult<UploadStream> {
        validate_tarball_filename(filename)?;
        validate_package_name(name)?;

        let layout = self.layout.clone();
        let package = name.to_string();
        let file_name = filename.to_string();
        let temp = tokio::task::spawn_blocking(move || {
            let doc = load_document(&layout, &package)?;
            if doc.attachments.contains_key(&file_name) {
                return Err(StoreError::TarballConflict {
                    name: package,
                    filename: file_name,
                });
            }
            Ok(layout.upload_temp(&package, &file_name))
        })
        .await??;

        let file = tokio::fs::File::create(&temp)
            .await
            .with_context(|| format!("creating upload file {}", temp.display()))?;

        Ok(UploadStream::new(self.clone(), name, filename, temp, file))
    }

    async fn remove_tarball(
        &self,
        name: &str,
        filename: &str,
        revision: &str,
    ) -> StoreResult<PackageDocument> {
        validate_tarball_filename(filename)?;
        validate_package_name(name)?;

        let package = name.to_string();
        let file_name = filename.to_string();
        let given = revision.to_string();
        let doc = self
            .commit(name, move |layout, durable| {
                let mut doc = load_document(layout, &package)?;
                if !doc.rev.matches(&given) {
                    return Err(StoreError::RevisionMismatch {
                        name: package,
                        given,
                    });
                }
                if !doc.attachments.contains_key(&file_name) {
                    return Err(StoreError::tarball_not_found(&package, &file_name));
                }
                if let Some(version) = doc.version_referencing(&file_name) {
                    return Err(StoreError::TarballInUse {
                        name: package.clone(),
                        filename: file_name,
                        version: version.to_string(),
                    });
                }

                doc.attachments.remove(&file_name);
                doc.touch();
                write_document(layout, &doc, durable)?;

                let blob = layout.blob_path(&package, &file_name);
                if let Err(err) = safe_remove(&blob) {
                    warn!(blob = %blob.display(), "{err}; left for recovery");
                }
                Ok(doc)
            })
            .await?;

        debug!(package = name, filename, rev = %doc.rev, "tarball removed");
        self.emit(StoreEvent::TarballRemoved {
            name: doc.name.clone(),
            filename: filename.to_string(),
            rev: doc.rev.to_string(),
        });
        Ok(doc)
    }

    async fn remove_package(&self, name: &str) -> StoreResult<()> {
        validate_package_name(name)?;

        let package = name.to_string();
        self.commit(name, move |layout, durable| {
            if !layout.document_path(&package).exists() {
                return Err(StoreError::package_not_found(&package));
            }

            let trash = layout.trash_dir();
            ensure_dir_exists(&trash)?;
            let nonce: u64 = rand::thread_rng().gen();
            let target = trash.join(format!("{nonce:016x}"));
            let dir = layout.package_dir(&package);
            fs::rename(&dir, &target)
                .with_context(|| format!("moving {} to trash", dir.display()))?;
            if durable {
                if let Some(parent) = dir.parent() {
                    sync_dir(parent)?;
                }
            }

            if let Err(err) = safe_remove(&target) {
                warn!(trash = %target.display(), "{err}; left for recovery");
            }
            Ok(())
        })
        .await?;

        debug!(package = name, "package removed");
        self.emit(StoreEvent::PackageRemoved {
            name: name.to_string(),
        });
        Ok(())
    }

    async fn get_package(&self, name: &str) -> StoreResult<PackageDocument> {
        validate_package_name(name)?;
        let layout = self.layout.clone();
        let package = name.to_string();
        tokio::task::spawn_blocking(move || load_document(&layout, &package)).await?
    }
}

fn parse_version(version: &str) -> StoreResult<semver::Version> {
    semver::Version::parse(version).map_err(|err| {
        StoreError::InvalidVersion {
            version: version.to_string(),
            source: err,
        }
    })
}

fn bind_versions(
    name: &str,
    versions: BTreeMap<String, VersionMetadata>,
) -> StoreResult<BTreeMap<String, VersionMetadata>> {
    versions
        .into_iter()
        .map(|(version, metadata)| {
            parse_version(&version)?;
            let metadata = metadata.bind(name, &version);
            Ok((version, metadata))
        })
        .collect()
}

/// Reads the document of `name`, `None` if the package does not exist.
pub(super) fn read_document(layout: &Layout, name: &str) -> StoreResult<Option<PackageDocument>> {
    let path = layout.document_path(name);
    match fs::read(&path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}

fn load_document(layout: &Layout, name: &str) -> StoreResult<PackageDocument> {
    read_document(layout, name)?.ok_or_else(|| StoreError::package_not_found(name))
}

fn write_document(layout: &Layout, doc: &PackageDocument, durable: bool) -> StoreResult<()> {
    let bytes = serde_json::to_vec_pretty(doc)?;
    write_atomic(&layout.document_path(&doc.name), &bytes, durable)?;
    Ok(())
}

fn stage_blob(
    layout: &Layout,
    name: &str,
    filename: &str,
    bytes: &[u8],
    durable: bool,
) -> StoreResult<PathBuf> {
    let temp = layout.upload_temp(name, filename);
    let written = File::create(&temp).and_then(|mut file| {
        file.write_all(bytes)?;
        if durable {
            file.sync_all()?;
        }
        Ok(())
    });

    if let Err(err) = written {
        let _ = fs::remove_file(&temp);
        return Err(err).with_context(|| format!("staging {}", temp.display()));
    }
    Ok(temp)
}

/// Writes every blob to a temp file, then renames them all into place.
///
/// Returns the committed blob paths. On failure nothing staged is left behind.
fn commit_blobs(
    layout: &Layout,
    name: &str,
    blobs: &[(String, Vec<u8>)],
    durable: bool,
) -> StoreResult<Vec<PathBuf>> {
    let mut staged = Vec::with_capacity(blobs.len());
    for (filename, bytes) in blobs {
        match stage_blob(layout, name, filename, bytes, durable) {
            Ok(temp) => staged.push((temp, layout.blob_path(name, filename))),
            Err(err) => {
                for (temp, _) in &staged {
                    let _ = fs::remove_file(temp);
                }
                return Err(err);
            }
        }
    }

    let mut committed = Vec::with_capacity(staged.len());
    for (index, (temp, blob)) in staged.iter().enumerate() {
        if let Err(err) = replace_file(temp, blob, false) {
            for (temp, _) in &staged[index..] {
                let _ = fs::remove_file(temp);
            }
            for blob in &committed {
                let _ = fs::remove_file(blob);
            }
            return Err(err.into());
        }
        committed.push(blob.clone());
    }

    if durable && !committed.is_empty() {
        sync_dir(layout.package_dir(name))?;
    }
    Ok(committed)
}

#[cfg(test)]
mod tests {
    use std::{
        pin::Pin,
        sync::Arc,
        task::{Context, Poll},
        time::Duration,
    };

    use serde_json::json;
    use stowage_events::CollectorSink;
    use tempfile::{tempdir, TempDir};
    use tokio::io::{AsyncRead, ReadBuf};

    use super::*;
    use crate::upload::UploadState;

    struct Fixture {
        _dir: TempDir,
        engine: StorageEngine,
        events: Arc<CollectorSink>,
    }

    async fn fixture_with(configure: impl FnOnce(&mut EngineOptions)) -> Fixture {
        let dir = tempdir().unwrap();
        let mut options = EngineOptions::new(dir.path().join("storage"));
        options.fsync = false;
        configure(&mut options);

        let events = Arc::new(CollectorSink::default());
        let engine = StorageEngine::open_with(options, events.clone())
            .await
            .unwrap();
        Fixture {
            _dir: dir,
            engine,
            events,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(|_| {}).await
    }

    fn manifest(body: serde_json::Value) -> PackageManifest {
        serde_json::from_value(body).unwrap()
    }

    fn version(name: &str, filename: Option<&str>) -> VersionMetadata {
        let mut body = json!({ "name": name, "description": "test" });
        if let Some(filename) = filename {
            body["dist"] = json!({ "tarball": format!("http://localhost/{name}/-/{filename}") });
        }
        serde_json::from_value(body).unwrap()
    }

    async fn upload(engine: &StorageEngine, name: &str, filename: &str, bytes: &[u8]) -> TarballRef {
        let mut stream = engine.add_tarball(name, filename).await.unwrap();
        stream.write(bytes).await.unwrap();
        stream.done().await.unwrap()
    }

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    struct FailingReader {
        served: bool,
    }

    impl AsyncRead for FailingReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.served {
                Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "client went away",
                )))
            } else {
                self.served = true;
                buf.put_slice(b"partial");
                Poll::Ready(Ok(()))
            }
        }
    }

    #[tokio::test]
    async fn test_add_package_and_conflict() {
        let fx = fixture().await;
        let doc = fx
            .engine
            .add_package("left-pad", manifest(json!({ "description": "pads" })))
            .await
            .unwrap();
        assert!(doc.rev.as_str().starts_with("1-"));
        assert_eq!(doc.extra["description"], "pads");

        let err = fx
            .engine
            .add_package("left-pad", PackageManifest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::PackageConflict(_)));

        let stored = fx.engine.get_package("left-pad").await.unwrap();
        assert_eq!(stored, doc);
    }

    #[tokio::test]
    async fn test_add_package_with_inline_attachment() {
        let fx = fixture().await;
        let doc = fx
            .engine
            .add_package(
                "@scope/pkg",
                manifest(json!({
                    "name": "@scope/pkg",
                    "dist-tags": { "latest": "1.0.0" },
                    "versions": {
                        "1.0.0": {
                            "name": "something-else",
                            "dist": { "tarball": "http://r/@scope/pkg/-/pkg-1.0.0.tgz" }
                        }
                    },
                    "_attachments": {
                        "pkg-1.0.0.tgz": { "data": "aGVsbG8=", "length": 5 }
                    }
                })),
            )
            .await
            .unwrap();

        assert_eq!(doc.versions["1.0.0"].name, "@scope/pkg");
        assert_eq!(doc.versions["1.0.0"].version, "1.0.0");
        let tarball = &doc.attachments["pkg-1.0.0.tgz"];
        assert_eq!(tarball.size, 5);
        assert_eq!(tarball.shasum, checksum_bytes(b"hello"));
        assert_eq!(tarball.version.as_deref(), Some("1.0.0"));

        let blob = fx.engine.root().join("@scope/pkg/pkg-1.0.0.tgz");
        assert_eq!(fs::read(blob).unwrap(), b"hello");
        assert_eq!(
            entries(&fx.engine.root().join("@scope/pkg")),
            vec!["package.json", "pkg-1.0.0.tgz"]
        );
    }

    #[tokio::test]
    async fn test_add_package_rejects_dangling_version() {
        let fx = fixture().await;
        let err = fx
            .engine
            .add_package(
                "pkg",
                manifest(json!({
                    "versions": {
                        "1.0.0": { "dist": { "tarball": "http://r/pkg/-/pkg-1.0.0.tgz" } }
                    }
                })),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingAttachment { .. }));
        assert!(!fx.engine.root().join("pkg").exists());
    }

    #[tokio::test]
    async fn test_add_package_validates_input() {
        let fx = fixture().await;
        assert!(matches!(
            fx.engine
                .add_package("../escape", PackageManifest::default())
                .await,
            Err(StoreError::InvalidPackageName { .. })
        ));
        assert!(matches!(
            fx.engine
                .add_package("pkg", manifest(json!({ "versions": { "latest": {} } })))
                .await,
            Err(StoreError::InvalidVersion { .. })
        ));
        assert!(matches!(
            fx.engine
                .add_package(
                    "pkg",
                    manifest(json!({ "_attachments": { "../x.tgz": { "data": "aGk=" } } }))
                )
                .await,
            Err(StoreError::InvalidFilename { .. })
        ));
    }

    #[tokio::test]
    async fn test_change_package_checks_revision() {
        let fx = fixture().await;
        let created = fx
            .engine
            .add_package("pkg", PackageManifest::default())
            .await
            .unwrap();

        let stale = "1-0000000000000000";
        let err = fx
            .engine
            .change_package("pkg", manifest(json!({ "readme": "x" })), stale)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RevisionMismatch { .. }));

        let changed = fx
            .engine
            .change_package(
                "pkg",
                manifest(json!({ "readme": "x" })),
                created.rev.as_str(),
            )
            .await
            .unwrap();
        assert_ne!(changed.rev, created.rev);
        assert_eq!(changed.extra["readme"], "x");

        let err = fx
            .engine
            .change_package("pkg", PackageManifest::default(), created.rev.as_str())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RevisionMismatch { .. }));
    }

    #[tokio::test]
    async fn test_change_package_keeps_attachments() {
        let fx = fixture().await;
        fx.engine
            .add_package("pkg", PackageManifest::default())
            .await
            .unwrap();
        upload(&fx.engine, "pkg", "pkg-1.0.0.tgz", b"abc").await;
        let current = fx.engine.get_package("pkg").await.unwrap();

        let changed = fx
            .engine
            .change_package(
                "pkg",
                manifest(json!({ "_attachments": {} })),
                current.rev.as_str(),
            )
            .await
            .unwrap();
        assert!(changed.attachments.contains_key("pkg-1.0.0.tgz"));
    }

    #[tokio::test]
    async fn test_change_missing_package() {
        let fx = fixture().await;
        let err = fx
            .engine
            .change_package("ghost", PackageManifest::default(), "1-0")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_add_version_conflict_keeps_tags() {
        let fx = fixture().await;
        fx.engine
            .add_package("pkg", PackageManifest::default())
            .await
            .unwrap();

        let doc = fx
            .engine
            .add_version("pkg", "1.0.0", version("pkg", None), "latest")
            .await
            .unwrap();
        assert_eq!(doc.dist_tags["latest"], "1.0.0");
        assert!(doc.time.contains_key("1.0.0"));

        let err = fx
            .engine
            .add_version("pkg", "1.0.0", version("pkg", None), "beta")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));

        let stored = fx.engine.get_package("pkg").await.unwrap();
        assert_eq!(stored.dist_tags.len(), 1);
        assert_eq!(stored.dist_tags["latest"], "1.0.0");
        assert_eq!(stored.rev, doc.rev);
    }

    #[tokio::test]
    async fn test_add_version_requires_uploaded_tarball() {
        let fx = fixture().await;
        fx.engine
            .add_package("pkg", PackageManifest::default())
            .await
            .unwrap();

        let err = fx
            .engine
            .add_version(
                "pkg",
                "1.0.0",
                version("pkg", Some("pkg-1.0.0.tgz")),
                "latest",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingAttachment { .. }));

        upload(&fx.engine, "pkg", "pkg-1.0.0.tgz", b"tarball").await;
        let doc = fx
            .engine
            .add_version(
                "pkg",
                "1.0.0",
                version("pkg", Some("pkg-1.0.0.tgz")),
                "latest",
            )
            .await
            .unwrap();
        assert_eq!(
            doc.attachments["pkg-1.0.0.tgz"].version.as_deref(),
            Some("1.0.0")
        );
    }

    #[tokio::test]
    async fn test_add_version_validation() {
        let fx = fixture().await;
        fx.engine
            .add_package("pkg", PackageManifest::default())
            .await
            .unwrap();

        assert!(matches!(
            fx.engine
                .add_version("pkg", "one", VersionMetadata::default(), "latest")
                .await,
            Err(StoreError::InvalidVersion { .. })
        ));
        assert!(matches!(
            fx.engine
                .add_version("pkg", "1.0.0", VersionMetadata::default(), " ")
                .await,
            Err(StoreError::BadPackageData(_))
        ));
        assert!(matches!(
            fx.engine
                .add_version("ghost", "1.0.0", VersionMetadata::default(), "latest")
                .await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_add_version_all_land() {
        let fx = fixture().await;
        fx.engine
            .add_package("pkg", PackageManifest::default())
            .await
            .unwrap();

        let handles: Vec<_> = (0..8)
            .map(|minor| {
                let engine = fx.engine.clone();
                tokio::spawn(async move {
                    engine
                        .add_version(
                            "pkg",
                            &format!("1.{minor}.0"),
                            VersionMetadata::default(),
                            &format!("tag{minor}"),
                        )
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let doc = fx.engine.get_package("pkg").await.unwrap();
        assert_eq!(doc.versions.len(), 8);
        assert_eq!(doc.dist_tags.len(), 8);
        assert!(doc.rev.as_str().starts_with("9-"));
    }

    #[tokio::test]
    async fn test_upload_commits_exact_bytes() {
        let fx = fixture().await;
        fx.engine
            .add_package("pkg", PackageManifest::default())
            .await
            .unwrap();

        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let mut stream = fx.engine.add_tarball("pkg", "x.tgz").await.unwrap();
        let mut state = stream.subscribe();
        for chunk in payload.chunks(4096) {
            stream.write(chunk).await.unwrap();
        }
        assert_eq!(stream.received(), payload.len() as u64);

        let before = fx.engine.get_package("pkg").await.unwrap();
        assert!(!before.attachments.contains_key("x.tgz"));

        let tarball = stream.done().await.unwrap();
        assert_eq!(tarball.size, payload.len() as u64);
        assert_eq!(tarball.shasum, checksum_bytes(&payload));
        assert!(matches!(*state.borrow_and_update(), UploadState::Done(_)));

        let after = fx.engine.get_package("pkg").await.unwrap();
        assert_eq!(after.attachments["x.tgz"], tarball);
        assert_ne!(after.rev, before.rev);
        assert_eq!(fs::read(fx.engine.root().join("pkg/x.tgz")).unwrap(), payload);
        assert_eq!(
            entries(&fx.engine.root().join("pkg")),
            vec!["package.json", "x.tgz"]
        );
    }

    #[tokio::test]
    async fn test_pipe_from_streams_reader() {
        let fx = fixture_with(|options| options.buffer_size = 7).await;
        fx.engine
            .add_package("pkg", PackageManifest::default())
            .await
            .unwrap();

        let payload = b"a tarball streamed in tiny pieces".to_vec();
        let mut stream = fx.engine.add_tarball("pkg", "x.tgz").await.unwrap();
        let received = stream.pipe_from(payload.as_slice()).await.unwrap();
        assert_eq!(received, payload.len() as u64);
        stream.done().await.unwrap();

        assert_eq!(fs::read(fx.engine.root().join("pkg/x.tgz")).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_abort_leaves_no_trace() {
        let fx = fixture().await;
        fx.engine
            .add_package("pkg", PackageManifest::default())
            .await
            .unwrap();

        let mut stream = fx.engine.add_tarball("pkg", "x.tgz").await.unwrap();
        let state = stream.subscribe();
        stream.write(b"partial bytes").await.unwrap();
        stream.abort("client cancelled");

        assert_eq!(
            *state.borrow(),
            UploadState::Aborted("client cancelled".to_string())
        );
        let doc = fx.engine.get_package("pkg").await.unwrap();
        assert!(doc.attachments.is_empty());
        assert_eq!(entries(&fx.engine.root().join("pkg")), vec!["package.json"]);
    }

    #[tokio::test]
    async fn test_dropped_stream_aborts() {
        let fx = fixture().await;
        fx.engine
            .add_package("pkg", PackageManifest::default())
            .await
            .unwrap();

        let mut stream = fx.engine.add_tarball("pkg", "x.tgz").await.unwrap();
        let state = stream.subscribe();
        stream.write(b"partial").await.unwrap();
        drop(stream);

        assert!(matches!(*state.borrow(), UploadState::Aborted(_)));
        assert_eq!(entries(&fx.engine.root().join("pkg")), vec!["package.json"]);
        assert!(fx
            .events
            .events()
            .iter()
            .any(|event| matches!(event, StoreEvent::UploadAborted { .. })));
    }

    #[tokio::test]
    async fn test_inbound_error_aborts_upload() {
        let fx = fixture().await;
        fx.engine
            .add_package("pkg", PackageManifest::default())
            .await
            .unwrap();

        let mut stream = fx.engine.add_tarball("pkg", "x.tgz").await.unwrap();
        let state = stream.subscribe();
        let err = stream
            .pipe_from(FailingReader {
                served: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UploadAborted { .. }));
        assert!(matches!(*state.borrow(), UploadState::Aborted(_)));

        assert!(matches!(
            stream.done().await,
            Err(StoreError::UploadAborted { .. })
        ));
        assert_eq!(entries(&fx.engine.root().join("pkg")), vec!["package.json"]);
    }

    #[tokio::test]
    async fn test_oversized_upload_aborts() {
        let fx = fixture_with(|options| options.max_body_size = 10).await;
        fx.engine
            .add_package("pkg", PackageManifest::default())
            .await
            .unwrap();

        let mut stream = fx.engine.add_tarball("pkg", "x.tgz").await.unwrap();
        stream.write(b"123456").await.unwrap();
        let err = stream.write(b"789012").await.unwrap_err();
        assert!(matches!(err, StoreError::TarballTooLarge { limit: 10, .. }));
        assert!(matches!(stream.state(), UploadState::Aborted(_)));
        drop(stream);

        assert_eq!(entries(&fx.engine.root().join("pkg")), vec!["package.json"]);
    }

    #[tokio::test]
    async fn test_empty_upload_is_rejected() {
        let fx = fixture().await;
        fx.engine
            .add_package("pkg", PackageManifest::default())
            .await
            .unwrap();

        let stream = fx.engine.add_tarball("pkg", "x.tgz").await.unwrap();
        assert!(matches!(
            stream.done().await,
            Err(StoreError::EmptyTarball { .. })
        ));
        assert!(fx
            .engine
            .get_package("pkg")
            .await
            .unwrap()
            .attachments
            .is_empty());
    }

    #[tokio::test]
    async fn test_add_tarball_preconditions() {
        let fx = fixture().await;

        assert!(matches!(
            fx.engine.add_tarball("ghost", "../../etc/passwd").await,
            Err(StoreError::InvalidFilename { .. })
        ));
        assert!(matches!(
            fx.engine.add_tarball("ghost", "ghost-1.0.0.tgz").await,
            Err(StoreError::NotFound(_))
        ));

        fx.engine
            .add_package("pkg", PackageManifest::default())
            .await
            .unwrap();
        upload(&fx.engine, "pkg", "x.tgz", b"data").await;
        assert!(matches!(
            fx.engine.add_tarball("pkg", "x.tgz").await,
            Err(StoreError::TarballConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_racing_uploads_commit_once() {
        let fx = fixture().await;
        fx.engine
            .add_package("pkg", PackageManifest::default())
            .await
            .unwrap();

        let mut first = fx.engine.add_tarball("pkg", "x.tgz").await.unwrap();
        let mut second = fx.engine.add_tarball("pkg", "x.tgz").await.unwrap();
        first.write(b"first").await.unwrap();
        second.write(b"second").await.unwrap();

        first.done().await.unwrap();
        assert!(matches!(
            second.done().await,
            Err(StoreError::TarballConflict { .. })
        ));

        assert_eq!(fs::read(fx.engine.root().join("pkg/x.tgz")).unwrap(), b"first");
        assert_eq!(
            entries(&fx.engine.root().join("pkg")),
            vec!["package.json", "x.tgz"]
        );
    }

    #[tokio::test]
    async fn test_remove_tarball() {
        let fx = fixture().await;
        fx.engine
            .add_package("pkg", PackageManifest::default())
            .await
            .unwrap();
        upload(&fx.engine, "pkg", "x.tgz", b"data").await;
        let current = fx.engine.get_package("pkg").await.unwrap();

        let err = fx
            .engine
            .remove_tarball("pkg", "x.tgz", "1-0000000000000000")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RevisionMismatch { .. }));
        assert!(fx.engine.root().join("pkg/x.tgz").exists());

        let doc = fx
            .engine
            .remove_tarball("pkg", "x.tgz", current.rev.as_str())
            .await
            .unwrap();
        assert!(!doc.attachments.contains_key("x.tgz"));
        assert!(!fx.engine.root().join("pkg/x.tgz").exists());

        let err = fx
            .engine
            .remove_tarball("pkg", "x.tgz", doc.rev.as_str())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_remove_referenced_tarball_fails() {
        let fx = fixture().await;
        fx.engine
            .add_package("pkg", PackageManifest::default())
            .await
            .unwrap();
        upload(&fx.engine, "pkg", "pkg-1.0.0.tgz", b"data").await;
        let doc = fx
            .engine
            .add_version(
                "pkg",
                "1.0.0",
                version("pkg", Some("pkg-1.0.0.tgz")),
                "latest",
            )
            .await
            .unwrap();

        let err = fx
            .engine
            .remove_tarball("pkg", "pkg-1.0.0.tgz", doc.rev.as_str())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::TarballInUse { .. }));
        assert!(fx.engine.root().join("pkg/pkg-1.0.0.tgz").exists());
    }

    #[tokio::test]
    async fn test_remove_package_then_recreate() {
        let fx = fixture().await;
        fx.engine
            .add_package("@scope/pkg", PackageManifest::default())
            .await
            .unwrap();
        upload(&fx.engine, "@scope/pkg", "pkg-1.0.0.tgz", b"data").await;

        fx.engine.remove_package("@scope/pkg").await.unwrap();
        assert!(!fx.engine.root().join("@scope/pkg").exists());
        assert!(matches!(
            fx.engine.get_package("@scope/pkg").await,
            Err(StoreError::NotFound(_))
        ));
        assert!(entries(&fx.engine.root().join(".trash")).is_empty());

        let doc = fx
            .engine
            .add_package("@scope/pkg", PackageManifest::default())
            .await
            .unwrap();
        assert!(doc.attachments.is_empty());

        assert!(matches!(
            fx.engine.remove_package("ghost").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_lock_timeout() {
        let fx = fixture_with(|options| options.lock_timeout = Duration::from_millis(50)).await;
        fx.engine
            .add_package("pkg", PackageManifest::default())
            .await
            .unwrap();

        let held = FileLock::try_acquire(&fx.engine.root().join(".locks"), "pkg")
            .unwrap()
            .unwrap();
        let err = fx
            .engine
            .add_version("pkg", "1.0.0", VersionMetadata::default(), "latest")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout { .. }));
        assert_eq!(err.status_code(), 503);

        drop(held);
        fx.engine
            .add_version("pkg", "1.0.0", VersionMetadata::default(), "latest")
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelled_done_still_commits() {
        let fx = fixture().await;
        fx.engine
            .add_package("pkg", PackageManifest::default())
            .await
            .unwrap();

        let mut stream = fx.engine.add_tarball("pkg", "x.tgz").await.unwrap();
        let mut state = stream.subscribe();
        stream.write(b"bytes").await.unwrap();

        // the commit waits on this lock while the caller gives up
        let held = FileLock::try_acquire(&fx.engine.root().join(".locks"), "pkg")
            .unwrap()
            .unwrap();
        let cancelled = tokio::time::timeout(Duration::from_millis(200), stream.done()).await;
        assert!(cancelled.is_err());
        assert_eq!(*state.borrow(), UploadState::Open);
        drop(held);

        let terminal = tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(UploadState::is_terminal),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        let UploadState::Done(tarball) = terminal else {
            panic!("expected a committed upload, got {terminal:?}");
        };
        assert_eq!(tarball.size, 5);

        let doc = fx.engine.get_package("pkg").await.unwrap();
        assert_eq!(doc.attachments.get("x.tgz"), Some(&tarball));
        assert_eq!(fs::read(fx.engine.root().join("pkg/x.tgz")).unwrap(), b"bytes");
        assert!(!fx
            .events
            .events()
            .iter()
            .any(|event| matches!(event, StoreEvent::UploadAborted { .. })));
    }

    #[tokio::test]
    async fn test_events_follow_commits() {
        let fx = fixture().await;
        fx.engine
            .add_package("pkg", PackageManifest::default())
            .await
            .unwrap();
        upload(&fx.engine, "pkg", "x.tgz", b"data").await;
        fx.engine.remove_package("pkg").await.unwrap();

        let events = fx.events.events();
        assert!(matches!(events[0], StoreEvent::PackageCreated { .. }));
        assert!(matches!(events[1], StoreEvent::UploadStarted { .. }));
        assert!(matches!(
            events[2],
            StoreEvent::UploadProgress { received: 4, .. }
        ));
        assert!(matches!(
            events[3],
            StoreEvent::UploadCommitted { size: 4, .. }
        ));
        assert!(matches!(events[4], StoreEvent::PackageRemoved { .. }));
        assert_eq!(events.len(), 5);
    }

    #[tokio::test]
    async fn test_documents_survive_reopen() {
        let fx = fixture().await;
        fx.engine
            .add_package("pkg", PackageManifest::default())
            .await
            .unwrap();
        upload(&fx.engine, "pkg", "x.tgz", b"data").await;
        let doc = fx.engine.get_package("pkg").await.unwrap();

        let reopened = StorageEngine::open_with(fx.engine.options().clone(), fx.events.clone())
            .await
            .unwrap();
        assert_eq!(reopened.get_package("pkg").await.unwrap(), doc);
        assert!(reopened.root().join("pkg/x.tgz").exists());
    }
}

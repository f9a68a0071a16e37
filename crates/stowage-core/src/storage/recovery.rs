//! Startup sweep that makes the write-then-rename commit sequence crash consistent.
//!
//! A crash can leave behind upload and document temp files, a package directory moved to the
//! trash but not yet deleted, or blobs renamed into place whose document never got written.
//! None of these are visible through a document, so they are safe to delete.

use std::{collections::BTreeSet, fs, path::Path, time::Duration};

use stowage_utils::{
    fs::safe_remove,
    lock::FileLock,
    name::{validate_package_name, DOCUMENT_FILE},
};
use tracing::{debug, warn};

use super::{engine::read_document, layout::Layout};
use crate::{error::ErrorContext, StoreResult};

pub(super) fn recover_root(layout: &Layout, lock_timeout: Duration) -> StoreResult<usize> {
    let mut removed = empty_trash(&layout.trash_dir())?;

    for entry in read_dir(layout.root())? {
        let entry = entry.with_context(|| format!("reading {}", layout.root().display()))?;
        let entry_name = entry.file_name().to_string_lossy().into_owned();
        if Layout::is_reserved(&entry_name) || !entry.path().is_dir() {
            continue;
        }

        if entry_name.starts_with('@') {
            let scope_dir = entry.path();
            for package in read_dir(&scope_dir)? {
                let package = package.with_context(|| format!("reading {}", scope_dir.display()))?;
                if package.path().is_dir() {
                    let name = format!("{entry_name}/{}", package.file_name().to_string_lossy());
                    removed += recover_package(layout, &name, lock_timeout)?;
                }
            }
            // only succeeds once the scope has no packages left
            let _ = fs::remove_dir(&scope_dir);
        } else {
            removed += recover_package(layout, &entry_name, lock_timeout)?;
        }
    }

    Ok(removed)
}

fn read_dir(dir: &Path) -> StoreResult<fs::ReadDir> {
    fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))
}

fn empty_trash(trash: &Path) -> StoreResult<usize> {
    if !trash.is_dir() {
        return Ok(0);
    }

    let mut removed = 0;
    for entry in read_dir(trash)? {
        let entry = entry.with_context(|| format!("reading {}", trash.display()))?;
        safe_remove(entry.path())?;
        removed += 1;
    }
    Ok(removed)
}

/// Sweeps one package under its commit lock; a package that stays locked is left alone.
fn recover_package(layout: &Layout, name: &str, lock_timeout: Duration) -> StoreResult<usize> {
    if let Err(err) = validate_package_name(name) {
        warn!("skipping {}: {err}", layout.package_dir(name).display());
        return Ok(0);
    }

    let Some(_lock) = FileLock::acquire_within(&layout.lock_dir(), name, lock_timeout)? else {
        warn!(package = name, waited = ?lock_timeout, "package is locked, skipping recovery");
        return Ok(0);
    };
    let document = read_document(layout, name)?;
    let attachments: BTreeSet<String> = document
        .as_ref()
        .map(|doc| doc.attachments.keys().cloned().collect())
        .unwrap_or_default();

    let dir = layout.package_dir(name);
    let mut removed = 0;
    for entry in read_dir(&dir)? {
        let entry = entry.with_context(|| format!("reading {}", dir.display()))?;
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if file_name == DOCUMENT_FILE || !entry.path().is_file() {
            continue;
        }

        if Layout::is_temp_file(&file_name) || !attachments.contains(&file_name) {
            debug!(package = name, file = %file_name, "removing leftover file");
            safe_remove(entry.path())?;
            removed += 1;
        }
    }

    if document.is_none() {
        let _ = fs::remove_dir(&dir);
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use stowage_events::{CollectorSink, StoreEvent};
    use tempfile::tempdir;

    use super::*;
    use crate::{
        document::PackageManifest,
        storage::{EngineOptions, PackageStorage, StorageEngine},
    };

    #[tokio::test]
    async fn test_recovery_removes_leftovers() {
        let dir = tempdir().unwrap();
        let mut options = EngineOptions::new(dir.path());
        options.fsync = false;
        let root = dir.path();

        {
            let engine = StorageEngine::open_with(options.clone(), Arc::new(CollectorSink::default()))
                .await
                .unwrap();
            engine
                .add_package("pkg", PackageManifest::default())
                .await
                .unwrap();
            let mut stream = engine.add_tarball("pkg", "kept.tgz").await.unwrap();
            stream.write(b"kept").await.unwrap();
            stream.done().await.unwrap();
        }

        std::fs::write(root.join("pkg/orphan.tgz"), b"orphan").unwrap();
        std::fs::write(root.join("pkg/.kept.tgz.0011223344556677.upload"), b"half").unwrap();
        std::fs::write(root.join("pkg/.package.json.0011223344556677.tmp"), b"{").unwrap();
        std::fs::create_dir_all(root.join(".trash/0000000000000001")).unwrap();
        std::fs::write(root.join(".trash/0000000000000001/package.json"), b"{}").unwrap();
        std::fs::create_dir_all(root.join("@scope/half-published")).unwrap();
        std::fs::write(root.join("@scope/half-published/x.tgz"), b"blob").unwrap();

        let events = Arc::new(CollectorSink::default());
        let engine = StorageEngine::open_with(options, events.clone())
            .await
            .unwrap();

        let mut left: Vec<_> = std::fs::read_dir(root.join("pkg"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(left, vec!["kept.tgz", "package.json"]);
        assert!(!root.join("@scope").exists());
        assert_eq!(std::fs::read_dir(root.join(".trash")).unwrap().count(), 0);
        assert_eq!(
            events.events(),
            vec![StoreEvent::Recovered {
                removed: 5,
            }]
        );

        assert_eq!(engine.recover().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_recovery_skips_locked_package() {
        let dir = tempdir().unwrap();
        let mut options = EngineOptions::new(dir.path());
        options.fsync = false;
        options.lock_timeout = Duration::from_millis(50);

        let engine = StorageEngine::open_with(options, Arc::new(CollectorSink::default()))
            .await
            .unwrap();
        engine
            .add_package("pkg", PackageManifest::default())
            .await
            .unwrap();
        std::fs::write(dir.path().join("pkg/orphan.tgz"), b"orphan").unwrap();

        let held = FileLock::try_acquire(&dir.path().join(".locks"), "pkg")
            .unwrap()
            .unwrap();
        let removed = tokio::time::timeout(Duration::from_secs(2), engine.recover())
            .await
            .expect("recovery waited on a held lock")
            .unwrap();
        assert_eq!(removed, 0);
        assert!(dir.path().join("pkg/orphan.tgz").exists());

        drop(held);
        assert_eq!(engine.recover().await.unwrap(), 1);
        assert!(!dir.path().join("pkg/orphan.tgz").exists());
    }

    #[tokio::test]
    async fn test_recovery_skips_foreign_directories() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("Not A Package")).unwrap();
        std::fs::write(dir.path().join("Not A Package/keep.txt"), b"mine").unwrap();

        let mut options = EngineOptions::new(dir.path());
        options.fsync = false;
        StorageEngine::open_with(options, Arc::new(CollectorSink::default()))
            .await
            .unwrap();

        assert!(dir.path().join("Not A Package/keep.txt").exists());
    }
}

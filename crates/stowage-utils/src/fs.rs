use std::{
    fs::{self, File},
    path::{Path, PathBuf},
};

use rand::Rng;

use crate::error::{FileSystemError, FileSystemResult};

/// Removes the specified file or directory safely.
///
/// Missing paths are not an error. Directories are removed recursively.
///
/// # Errors
///
/// Returns a [`FileSystemError::File`] if the removal fails for any reason other than
/// the path not existing.
pub fn safe_remove<P: AsRef<Path>>(path: P) -> FileSystemResult<()> {
    let path = path.as_ref();

    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => Err(err),
    };

    match result {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => {
            Err(FileSystemError::File {
                path: path.to_path_buf(),
                action: "remove",
                source: err,
            })
        }
        _ => Ok(()),
    }
}

/// Creates a directory structure if it doesn't exist.
///
/// # Errors
///
/// * [`FileSystemError::Directory`] if the directory could not be created.
/// * [`FileSystemError::NotADirectory`] if the path exists but is not a directory.
pub fn ensure_dir_exists<P: AsRef<Path>>(path: P) -> FileSystemResult<()> {
    let path = path.as_ref();
    if !path.exists() {
        fs::create_dir_all(path).map_err(|err| {
            FileSystemError::Directory {
                path: path.to_path_buf(),
                action: "create",
                source: err,
            }
        })?;
    } else if !path.is_dir() {
        return Err(FileSystemError::NotADirectory {
            path: path.to_path_buf(),
        });
    }

    Ok(())
}

/// Builds a hidden, randomly suffixed sibling path for `name` inside `dir`.
///
/// The result looks like `dir/.name.3f9a0c1d2b4e5f60.suffix`; it never collides with a
/// committed entry because committed names cannot start with a dot.
pub fn temp_path_in(dir: &Path, name: &str, suffix: &str) -> PathBuf {
    let nonce: u64 = rand::thread_rng().gen();
    dir.join(format!(".{name}.{nonce:016x}.{suffix}"))
}

/// Flushes a directory entry table to disk so that a preceding rename is durable.
pub fn sync_dir<P: AsRef<Path>>(path: P) -> FileSystemResult<()> {
    let path = path.as_ref();
    File::open(path)
        .and_then(|dir| dir.sync_all())
        .map_err(|err| {
            FileSystemError::Directory {
                path: path.to_path_buf(),
                action: "sync",
                source: err,
            }
        })
}

/// Atomically moves `from` over `to`, optionally syncing the parent directory afterwards.
///
/// Both paths must live on the same filesystem.
pub fn replace_file(from: &Path, to: &Path, durable: bool) -> FileSystemResult<()> {
    fs::rename(from, to).map_err(|err| {
        FileSystemError::File {
            path: to.to_path_buf(),
            action: "rename",
            source: err,
        }
    })?;

    if durable {
        if let Some(parent) = to.parent() {
            sync_dir(parent)?;
        }
    }

    Ok(())
}

/// Writes `contents` to a temp sibling of `path`, fsyncs it, and renames it into place.
pub fn write_atomic(path: &Path, contents: &[u8], durable: bool) -> FileSystemResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = temp_path_in(dir, &file_name, "tmp");

    let written = fs::write(&temp, contents).and_then(|()| {
        if durable {
            File::open(&temp)?.sync_all()
        } else {
            Ok(())
        }
    });
    if let Err(err) = written {
        let _ = fs::remove_file(&temp);
        return Err(FileSystemError::File {
            path: temp,
            action: "write",
            source: err,
        });
    }

    replace_file(&temp, path, durable).inspect_err(|_| {
        let _ = fs::remove_file(&temp);
    })
}

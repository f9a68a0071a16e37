use std::path::{Path, PathBuf};

use stowage_utils::{
    fs::temp_path_in,
    name::{package_dir, DOCUMENT_FILE},
};

pub const LOCK_DIR: &str = ".locks";
pub const TRASH_DIR: &str = ".trash";
pub const UPLOAD_SUFFIX: &str = "upload";
pub const TEMP_SUFFIX: &str = "tmp";

/// Paths of everything the engine keeps under one storage root.
///
/// Names passed in must already be validated; the layout only joins them.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn package_dir(&self, name: &str) -> PathBuf {
        self.root.join(package_dir(name))
    }

    pub fn document_path(&self, name: &str) -> PathBuf {
        self.package_dir(name).join(DOCUMENT_FILE)
    }

    pub fn blob_path(&self, name: &str, filename: &str) -> PathBuf {
        self.package_dir(name).join(filename)
    }

    /// Fresh temp path an upload of `filename` streams into before commit.
    pub fn upload_temp(&self, name: &str, filename: &str) -> PathBuf {
        temp_path_in(&self.package_dir(name), filename, UPLOAD_SUFFIX)
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.root.join(LOCK_DIR)
    }

    pub fn trash_dir(&self) -> PathBuf {
        self.root.join(TRASH_DIR)
    }

    /// Whether a root entry is engine bookkeeping rather than a package or scope.
    pub fn is_reserved(entry: &str) -> bool {
        entry == LOCK_DIR || entry == TRASH_DIR
    }

    /// Whether a file inside a package directory is left over from an unfinished write.
    pub fn is_temp_file(file_name: &str) -> bool {
        file_name.starts_with('.')
            && (file_name.ends_with(&format!(".{UPLOAD_SUFFIX}"))
                || file_name.ends_with(&format!(".{TEMP_SUFFIX}")))
    }
}

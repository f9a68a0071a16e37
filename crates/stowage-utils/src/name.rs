//! Validation of names that end up as path components inside a storage root.

use std::{path::PathBuf, sync::LazyLock};

use regex::Regex;

use crate::error::{NameError, NameResult};

/// File name reserved for the package document itself.
pub const DOCUMENT_FILE: &str = "package.json";

const MAX_PACKAGE_NAME_LEN: usize = 214;
const MAX_FILENAME_LEN: usize = 255;

static NAME_SEGMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9~-][a-z0-9._~-]*$").expect("unable to compile package name regex")
});

/// Checks a package name against the registry naming rules.
///
/// Accepts `name` and `@scope/name`; both segments must be lower case, URL safe and must not
/// start with `.` or `_`.
///
/// # Example
///
/// ```
/// use stowage_utils::name::validate_package_name;
///
/// assert!(validate_package_name("@scope/left-pad").is_ok());
/// assert!(validate_package_name("../etc").is_err());
/// ```
pub fn validate_package_name(name: &str) -> NameResult<()> {
    let invalid = |reason| {
        Err(NameError::InvalidPackageName {
            name: name.to_string(),
            reason,
        })
    };

    if name.is_empty() {
        return invalid("name cannot be empty");
    }
    if name.len() > MAX_PACKAGE_NAME_LEN {
        return invalid("name is longer than 214 characters");
    }
    if name != name.to_lowercase() {
        return invalid("name must be lower case");
    }

    let segments: Vec<&str> = match name.strip_prefix('@') {
        Some(scoped) => {
            match scoped.split_once('/') {
                Some((scope, pkg)) if !pkg.contains('/') => vec![scope, pkg],
                _ => return invalid("scoped names must look like @scope/name"),
            }
        }
        None if name.contains('/') => return invalid("name cannot contain '/'"),
        None => vec![name],
    };

    for segment in segments {
        if segment == "node_modules" || segment == "favicon.ico" {
            return invalid("name is a reserved word");
        }
        if !NAME_SEGMENT_RE.is_match(segment) {
            return invalid("name contains characters that are not URL safe");
        }
    }

    Ok(())
}

/// Checks that a tarball filename is a single, visible path component.
pub fn validate_tarball_filename(filename: &str) -> NameResult<()> {
    let invalid = |reason| {
        Err(NameError::InvalidFilename {
            filename: filename.to_string(),
            reason,
        })
    };

    if filename.is_empty() {
        return invalid("filename cannot be empty");
    }
    if filename.len() > MAX_FILENAME_LEN {
        return invalid("filename is longer than 255 bytes");
    }
    if filename.contains(['/', '\\']) {
        return invalid("path separators are not allowed");
    }
    if filename.contains('\0') || filename.chars().any(char::is_control) {
        return invalid("control characters are not allowed");
    }
    if filename.starts_with('.') {
        return invalid("filename cannot start with '.'");
    }
    if filename == DOCUMENT_FILE {
        return invalid("filename is reserved for package metadata");
    }

    Ok(())
}

/// Relative directory of a validated package inside a storage root.
///
/// `@scope/name` maps to `@scope/name`, everything else to a single component.
pub fn package_dir(name: &str) -> PathBuf {
    name.split('/').collect()
}

/// Extracts the attachment filename referenced by a `dist.tarball` URL.
///
/// Query strings and fragments are ignored; returns `None` for a URL that ends in `/`.
pub fn tarball_filename_from_url(url: &str) -> Option<&str> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/').next().filter(|name| !name.is_empty())
}

//! Package document model, field names follow the npm registry document.

use std::collections::{BTreeMap, BTreeSet};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use stowage_utils::name::tarball_filename_from_url;

use crate::{error::StoreError, revision::Revision, StoreResult};

/// Fields a publisher sent that the engine does not interpret.
pub type ExtraFields = Map<String, Value>;

/// Top level keys the engine owns; publishers cannot set them through extra fields.
const ENGINE_FIELDS: &[&str] = &[
    "name",
    "_rev",
    "time",
    "versions",
    "dist-tags",
    "_attachments",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dist {
    pub tarball: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shasum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
    #[serde(flatten)]
    pub extra: ExtraFields,
}

/// Metadata published for one version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dist: Option<Dist>,
    #[serde(flatten)]
    pub extra: ExtraFields,
}

impl VersionMetadata {
    /// Attachment filename this version points at through `dist.tarball`.
    pub fn tarball_filename(&self) -> Option<&str> {
        self.dist
            .as_ref()
            .and_then(|dist| tarball_filename_from_url(&dist.tarball))
    }

    /// Forces the package and version fields to the keys the document stores it under.
    pub(crate) fn bind(mut self, name: &str, version: &str) -> Self {
        self.name = name.to_string();
        self.version = version.to_string();
        self
    }
}

/// Attachment entry describing a committed blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TarballRef {
    /// blake3 hex digest of the blob.
    pub shasum: String,
    pub size: u64,
    /// Version whose `dist.tarball` points at this blob, once one does.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// The persisted metadata of one package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageDocument {
    pub name: String,
    #[serde(default)]
    pub versions: BTreeMap<String, VersionMetadata>,
    #[serde(rename = "dist-tags", default)]
    pub dist_tags: BTreeMap<String, String>,
    #[serde(rename = "_attachments", default)]
    pub attachments: BTreeMap<String, TarballRef>,
    #[serde(rename = "_rev")]
    pub rev: Revision,
    #[serde(default)]
    pub time: BTreeMap<String, DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: ExtraFields,
}

impl PackageDocument {
    pub fn new(name: &str) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            versions: BTreeMap::new(),
            dist_tags: BTreeMap::new(),
            attachments: BTreeMap::new(),
            rev: Revision::initial(),
            time: BTreeMap::from([("created".to_string(), now), ("modified".to_string(), now)]),
            extra: ExtraFields::new(),
        }
    }

    /// First version whose `dist.tarball` points at `filename`.
    pub fn version_referencing(&self, filename: &str) -> Option<&str> {
        self.versions
            .iter()
            .find(|(_, meta)| meta.tarball_filename() == Some(filename))
            .map(|(version, _)| version.as_str())
    }

    /// Attachment filenames referenced by any live version.
    pub fn referenced_files(&self) -> BTreeSet<&str> {
        self.versions
            .values()
            .filter_map(VersionMetadata::tarball_filename)
            .collect()
    }

    /// Fails with [`StoreError::MissingAttachment`] if a live version points at a blob the
    /// document does not own.
    pub(crate) fn check_references(&self) -> StoreResult<()> {
        for (version, meta) in &self.versions {
            if let Some(filename) = meta.tarball_filename() {
                if !self.attachments.contains_key(filename) {
                    return Err(StoreError::MissingAttachment {
                        name: self.name.clone(),
                        version: version.clone(),
                        filename: filename.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Records which version owns each referenced attachment.
    pub(crate) fn link_attachments(&mut self) {
        for tarball in self.attachments.values_mut() {
            tarball.version = None;
        }
        for (version, meta) in &self.versions {
            if let Some(tarball) = meta
                .tarball_filename()
                .and_then(|filename| self.attachments.get_mut(filename))
            {
                tarball.version = Some(version.clone());
            }
        }
    }

    /// Replaces the publisher-owned contents, keeping attachments and timestamps.
    pub(crate) fn replace_contents(
        &mut self,
        versions: BTreeMap<String, VersionMetadata>,
        dist_tags: BTreeMap<String, String>,
        extra: ExtraFields,
    ) {
        let now = Utc::now();
        for version in versions.keys() {
            if !self.versions.contains_key(version) {
                self.time.insert(version.clone(), now);
            }
        }
        self.versions = versions;
        self.dist_tags = dist_tags;
        self.extra = strip_engine_fields(extra);
        self.link_attachments();
    }

    /// Assigns a new revision and stamps the modification time.
    pub(crate) fn touch(&mut self) {
        self.rev = self.rev.next();
        self.time.insert("modified".to_string(), Utc::now());
    }
}

/// An attachment sent inline with a publish body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineAttachment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Base64 encoded tarball.
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
}

impl InlineAttachment {
    pub fn decode(&self, filename: &str) -> StoreResult<Vec<u8>> {
        let bytes = STANDARD.decode(self.data.trim()).map_err(|_| {
            StoreError::BadPackageData(format!("attachment '{filename}' is not valid base64"))
        })?;

        if let Some(length) = self.length {
            if length != bytes.len() as u64 {
                return Err(StoreError::BadPackageData(format!(
                    "attachment '{filename}' declares {length} bytes but carries {}",
                    bytes.len()
                )));
            }
        }

        Ok(bytes)
    }
}

/// Body of a publish or package update request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageManifest {
    #[serde(default)]
    pub versions: BTreeMap<String, VersionMetadata>,
    #[serde(rename = "dist-tags", default)]
    pub dist_tags: BTreeMap<String, String>,
    #[serde(rename = "_attachments", default)]
    pub attachments: BTreeMap<String, InlineAttachment>,
    #[serde(flatten)]
    pub extra: ExtraFields,
}

fn strip_engine_fields(mut extra: ExtraFields) -> ExtraFields {
    for field in ENGINE_FIELDS {
        extra.remove(*field);
    }
    extra
}

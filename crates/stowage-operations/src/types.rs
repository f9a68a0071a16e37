use serde::{Deserialize, Serialize};

pub const PACKAGE_PUBLISHED: &str = "package published";
pub const TARBALL_UPLOADED: &str = "tarball uploaded successfully";
pub const TARBALL_REMOVED: &str = "tarball removed";
pub const PACKAGE_REMOVED: &str = "package removed";
pub const PACKAGE_CHANGED: &str = "package changed";
pub const PACKAGE_CREATED: &str = "created new package";

pub const STAR_NOT_IMPLEMENTED: &str = "npm star| un-star calls are not implemented";
pub const BAD_PACKAGE_DATA: &str = "bad incoming package data";

/// Transport-neutral status of a successful operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Created,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Created => 201,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OkMessage {
    pub ok: String,
}

/// Result of a publish protocol operation. Serializes to the `{"ok": ...}` body alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outcome {
    #[serde(skip)]
    pub status: Status,
    #[serde(flatten)]
    pub body: OkMessage,
}

impl Outcome {
    pub fn created(message: &str) -> Self {
        Self {
            status: Status::Created,
            body: OkMessage {
                ok: message.to_string(),
            },
        }
    }

    pub fn message(&self) -> &str {
        &self.body.ok
    }
}

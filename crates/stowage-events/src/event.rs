use crate::OperationId;

/// Every committed change and upload transition the storage engine reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// A new package document was written.
    PackageCreated { name: String, rev: String },
    /// A package document was replaced through a revision check.
    PackageChanged { name: String, rev: String },
    /// A version was inserted and a dist-tag pointed at it.
    VersionAdded {
        name: String,
        version: String,
        tag: String,
        rev: String,
    },
    /// An upload stream was opened.
    UploadStarted {
        op_id: OperationId,
        name: String,
        filename: String,
    },
    /// Bytes durably written to the temp file so far.
    UploadProgress {
        op_id: OperationId,
        name: String,
        filename: String,
        received: u64,
    },
    /// The blob was renamed into place and attached to the document.
    UploadCommitted {
        op_id: OperationId,
        name: String,
        filename: String,
        size: u64,
        rev: String,
    },
    /// The upload ended without a commit; partial bytes were discarded.
    UploadAborted {
        op_id: OperationId,
        name: String,
        filename: String,
        reason: String,
    },
    /// A blob and its attachment entry were deleted.
    TarballRemoved {
        name: String,
        filename: String,
        rev: String,
    },
    /// A package document and all of its blobs were deleted.
    PackageRemoved { name: String },
    /// Startup recovery deleted leftovers of interrupted writes.
    Recovered { removed: usize },
}

impl StoreEvent {
    /// Package the event belongs to, if any.
    pub fn package(&self) -> Option<&str> {
        match self {
            StoreEvent::PackageCreated { name, .. }
            | StoreEvent::PackageChanged { name, .. }
            | StoreEvent::VersionAdded { name, .. }
            | StoreEvent::UploadStarted { name, .. }
            | StoreEvent::UploadProgress { name, .. }
            | StoreEvent::UploadCommitted { name, .. }
            | StoreEvent::UploadAborted { name, .. }
            | StoreEvent::TarballRemoved { name, .. }
            | StoreEvent::PackageRemoved { name } => Some(name),
            StoreEvent::Recovered { .. } => None,
        }
    }
}

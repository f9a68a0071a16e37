use stowage_events::{EventSink, StoreEvent};
use tracing::{debug, info, trace};

/// Reports engine events through the log.
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: StoreEvent) {
        match event {
            StoreEvent::PackageCreated { name, rev } => {
                debug!(package = %name, %rev, "package created")
            }
            StoreEvent::PackageChanged { name, rev } => {
                debug!(package = %name, %rev, "package changed")
            }
            StoreEvent::VersionAdded {
                name,
                version,
                tag,
                rev,
            } => debug!(package = %name, %version, %tag, %rev, "version added"),
            StoreEvent::UploadStarted {
                op_id,
                name,
                filename,
            } => trace!(op_id, package = %name, %filename, "upload started"),
            StoreEvent::UploadProgress {
                op_id,
                received,
                ..
            } => trace!(op_id, received, "upload progress"),
            StoreEvent::UploadCommitted {
                op_id,
                name,
                filename,
                size,
                rev,
            } => debug!(op_id, package = %name, %filename, size, %rev, "upload committed"),
            StoreEvent::UploadAborted {
                op_id,
                name,
                filename,
                reason,
            } => debug!(op_id, package = %name, %filename, %reason, "upload aborted"),
            StoreEvent::TarballRemoved {
                name,
                filename,
                rev,
            } => debug!(package = %name, %filename, %rev, "tarball removed"),
            StoreEvent::PackageRemoved { name } => debug!(package = %name, "package removed"),
            StoreEvent::Recovered { removed } => {
                if removed > 0 {
                    info!("Recovered storage, removed {removed} leftover file(s)");
                }
            }
        }
    }
}

//! Streaming tarball uploads.
//!
//! An [`UploadStream`] writes inbound bytes to a hidden temp file next to the package
//! document. Nothing becomes visible until [`UploadStream::done`] renames the file into place
//! and attaches it to the document under the package commit lock. Every other exit (explicit
//! abort, a failed write, an inbound read error, dropping the stream before it is handed to
//! the commit) deletes the temp file.

use std::{fmt, fs, io, path::PathBuf, sync::Arc};

use stowage_events::{next_op_id, OperationId, StoreEvent};
use stowage_utils::hash::Checksum;
use tokio::{
    fs::File,
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    sync::watch,
};
use tracing::{debug, trace, warn};

use crate::{document::TarballRef, error::StoreError, storage::StorageEngine, StoreResult};

/// Lifecycle of an upload. `Done` and `Aborted` are terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadState {
    Open,
    Done(TarballRef),
    Aborted(String),
}

impl UploadState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, UploadState::Open)
    }
}

/// Identity of one upload and the channel its terminal state is published on.
///
/// Shared between the stream and the task that commits it, so whichever of the two ends the
/// upload reports it.
#[derive(Clone)]
struct UploadTarget {
    op_id: OperationId,
    name: String,
    filename: String,
    temp_path: PathBuf,
    state: Arc<watch::Sender<UploadState>>,
    engine: StorageEngine,
}

impl UploadTarget {
    fn is_open(&self) -> bool {
        matches!(*self.state.borrow(), UploadState::Open)
    }

    fn aborted(&self, reason: String) {
        if let Err(err) = fs::remove_file(&self.temp_path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(
                    temp = %self.temp_path.display(),
                    "failed to remove upload temp file: {err}"
                );
            }
        }

        debug!(op_id = self.op_id, package = %self.name, filename = %self.filename, %reason, "upload aborted");
        self.engine.emit(StoreEvent::UploadAborted {
            op_id: self.op_id,
            name: self.name.clone(),
            filename: self.filename.clone(),
            reason: reason.clone(),
        });
        self.state.send_replace(UploadState::Aborted(reason));
    }

    /// Renames the flushed temp file into place and publishes the terminal state.
    async fn commit(self, shasum: String, size: u64) -> StoreResult<TarballRef> {
        let committed = self
            .engine
            .commit_tarball(
                &self.name,
                &self.filename,
                self.temp_path.clone(),
                shasum,
                size,
            )
            .await;

        match committed {
            Ok((tarball, doc)) => {
                debug!(
                    op_id = self.op_id,
                    package = %self.name,
                    filename = %self.filename,
                    size,
                    rev = %doc.rev,
                    "upload committed"
                );
                self.state.send_replace(UploadState::Done(tarball.clone()));
                self.engine.emit(StoreEvent::UploadCommitted {
                    op_id: self.op_id,
                    name: self.name.clone(),
                    filename: self.filename.clone(),
                    size,
                    rev: doc.rev.to_string(),
                });
                Ok(tarball)
            }
            Err(err) => {
                self.aborted(err.to_string());
                Err(err)
            }
        }
    }
}

pub struct UploadStream {
    target: UploadTarget,
    file: Option<File>,
    checksum: Checksum,
    /// Set once the commit task owns the outcome of the upload.
    committing: bool,
}

impl UploadStream {
    pub(crate) fn new(
        engine: StorageEngine,
        name: &str,
        filename: &str,
        temp_path: PathBuf,
        file: File,
    ) -> Self {
        let op_id = next_op_id();
        let (state, _) = watch::channel(UploadState::Open);

        debug!(op_id, package = name, filename, "upload started");
        engine.emit(StoreEvent::UploadStarted {
            op_id,
            name: name.to_string(),
            filename: filename.to_string(),
        });

        Self {
            target: UploadTarget {
                op_id,
                name: name.to_string(),
                filename: filename.to_string(),
                temp_path,
                state: Arc::new(state),
                engine,
            },
            file: Some(file),
            checksum: Checksum::new(),
            committing: false,
        }
    }

    pub fn op_id(&self) -> OperationId {
        self.target.op_id
    }

    pub fn name(&self) -> &str {
        &self.target.name
    }

    pub fn filename(&self) -> &str {
        &self.target.filename
    }

    /// Bytes accepted so far.
    pub fn received(&self) -> u64 {
        self.checksum.len()
    }

    pub fn state(&self) -> UploadState {
        self.target.state.borrow().clone()
    }

    /// Registers an observer of the state transitions.
    ///
    /// The receiver keeps the terminal state after the stream itself is gone.
    pub fn subscribe(&self) -> watch::Receiver<UploadState> {
        self.target.state.subscribe()
    }

    /// Appends `chunk` to the upload.
    ///
    /// Aborts the stream if the chunk would exceed the configured body size limit or the
    /// write fails.
    pub async fn write(&mut self, chunk: &[u8]) -> StoreResult<()> {
        self.ensure_open()?;

        let limit = self.target.engine.options().max_body_size;
        if self.checksum.len() + chunk.len() as u64 > limit {
            self.discard(format!("body exceeds {limit} bytes"));
            return Err(StoreError::TarballTooLarge {
                filename: self.target.filename.clone(),
                limit,
            });
        }

        let Some(file) = self.file.as_mut() else {
            return Err(self.closed());
        };
        let written = file.write_all(chunk).await;
        if let Err(err) = written {
            self.discard(format!("write failed: {err}"));
            return Err(StoreError::IoError {
                action: format!("writing {}", self.target.temp_path.display()),
                source: err,
            });
        }

        self.checksum.update(chunk);
        trace!(op_id = self.target.op_id, received = self.checksum.len(), "upload progress");
        self.target.engine.emit(StoreEvent::UploadProgress {
            op_id: self.target.op_id,
            name: self.target.name.clone(),
            filename: self.target.filename.clone(),
            received: self.checksum.len(),
        });
        Ok(())
    }

    /// Copies `reader` into the upload until it reports end of stream.
    ///
    /// Reads go through a single buffer of the configured size and the next read only starts
    /// once the previous chunk is written, so a slow disk slows the sender down. A read error
    /// aborts the stream.
    pub async fn pipe_from<R>(&mut self, mut reader: R) -> StoreResult<u64>
    where
        R: AsyncRead + Unpin,
    {
        let mut buffer = vec![0u8; self.target.engine.options().buffer_size];
        loop {
            let read = match reader.read(&mut buffer).await {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    let reason = format!("inbound stream failed: {err}");
                    self.discard(reason.clone());
                    return Err(StoreError::UploadAborted {
                        filename: self.target.filename.clone(),
                        reason,
                    });
                }
            };
            self.write(&buffer[..read]).await?;
        }
        Ok(self.received())
    }

    /// Flushes the upload to disk and commits it as an attachment of the package.
    ///
    /// Once the flush succeeds the commit runs on its own task. Dropping this future after
    /// that point no longer aborts the upload; subscribers still see `Done` or `Aborted` when
    /// the commit finishes.
    pub async fn done(mut self) -> StoreResult<TarballRef> {
        self.ensure_open()?;
        if self.checksum.is_empty() {
            self.discard("no bytes received".to_string());
            return Err(StoreError::EmptyTarball {
                filename: self.target.filename.clone(),
            });
        }

        let Some(mut file) = self.file.take() else {
            return Err(self.closed());
        };
        let durable = self.target.engine.options().fsync;
        let flushed = async {
            file.flush().await?;
            if durable {
                file.sync_all().await?;
            }
            Ok::<_, io::Error>(())
        }
        .await;
        drop(file);

        if let Err(err) = flushed {
            self.discard(format!("flush failed: {err}"));
            return Err(StoreError::IoError {
                action: format!("flushing {}", self.target.temp_path.display()),
                source: err,
            });
        }

        self.committing = true;
        let commit = tokio::spawn(
            self.target
                .clone()
                .commit(self.checksum.finalize_hex(), self.checksum.len()),
        );
        commit.await?
    }

    /// Abandons the upload and deletes every byte written so far.
    pub fn abort(mut self, reason: impl Into<String>) {
        if self.target.is_open() {
            self.discard(reason.into());
        }
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.target.is_open() && self.file.is_some() {
            Ok(())
        } else {
            Err(self.closed())
        }
    }

    fn closed(&self) -> StoreError {
        let reason = match &*self.target.state.borrow() {
            UploadState::Aborted(reason) => reason.clone(),
            _ => "upload is no longer open".to_string(),
        };
        StoreError::UploadAborted {
            filename: self.target.filename.clone(),
            reason,
        }
    }

    fn discard(&mut self, reason: String) {
        self.file.take();
        self.target.aborted(reason);
    }
}

impl Drop for UploadStream {
    fn drop(&mut self) {
        if self.target.is_open() && !self.committing {
            self.discard("upload dropped before completion".to_string());
        }
    }
}

impl fmt::Debug for UploadStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadStream")
            .field("op_id", &self.target.op_id)
            .field("name", &self.target.name)
            .field("filename", &self.target.filename)
            .field("received", &self.received())
            .field("state", &*self.target.state.borrow())
            .finish()
    }
}

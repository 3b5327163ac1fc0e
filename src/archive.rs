use std::{
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use blob_store::BlobStorage;
use bytes::Bytes;
use futures::StreamExt;
use tempfile::NamedTempFile;
use tokio::{sync::mpsc, task::JoinError};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};
use zip::{write::SimpleFileOptions, ZipWriter};

use crate::{
    data_model::{JobId, ObjectKey, ARCHIVE_EXTENSION},
    error::ZipperError,
};

/// Number of chunks buffered between the fetching task and the zip writer.
const CHUNK_BUFFER: usize = 16;

/// A finished archive in the scratch directory. The file is removed when the
/// archive is dropped.
pub struct Archive {
    file: NamedTempFile,
    entries: usize,
    size_bytes: u64,
}

impl Archive {
    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn stream(&self) -> Result<ReaderStream<tokio::fs::File>, ZipperError> {
        let file = self.file.reopen()?;
        Ok(ReaderStream::new(tokio::fs::File::from_std(file)))
    }
}

enum ArchiveOp {
    StartEntry(ObjectKey),
    Chunk(Bytes),
    Finish,
}

fn join_error(e: JoinError) -> ZipperError {
    ZipperError::Scratch {
        source: io::Error::other(e),
    }
}

/// Runs on the blocking pool. Dropping out of this function without a
/// `Finish` drops the temp file with it.
fn write_archive(
    mut rx: mpsc::Receiver<ArchiveOp>,
    file: NamedTempFile,
) -> Result<(NamedTempFile, usize), ZipperError> {
    let mut writer = ZipWriter::new(file);
    let mut entries = 0;
    while let Some(op) = rx.blocking_recv() {
        match op {
            ArchiveOp::StartEntry(key) => {
                writer.start_file(key.as_str(), SimpleFileOptions::default().large_file(true))?;
                entries += 1;
            }
            ArchiveOp::Chunk(bytes) => writer.write_all(&bytes)?,
            ArchiveOp::Finish => return Ok((writer.finish()?, entries)),
        }
    }
    Err(ZipperError::Scratch {
        source: io::Error::new(io::ErrorKind::Interrupted, "archive assembly aborted"),
    })
}

pub struct ZipAssembler {
    storage: Arc<BlobStorage>,
    bucket: String,
    scratch_dir: PathBuf,
}

impl ZipAssembler {
    pub fn new(storage: Arc<BlobStorage>, bucket: &str, scratch_dir: PathBuf) -> Self {
        Self {
            storage,
            bucket: bucket.to_string(),
            scratch_dir,
        }
    }

    /// Builds one archive holding an entry per key, in the order of `keys`.
    /// On error no archive is returned and the scratch file is already gone.
    pub async fn assemble(&self, job_id: &JobId, keys: &[ObjectKey]) -> Result<Archive, ZipperError> {
        let file = tempfile::Builder::new()
            .prefix(&format!("{}-", job_id))
            .suffix(ARCHIVE_EXTENSION)
            .tempfile_in(&self.scratch_dir)?;

        let (tx, rx) = mpsc::channel(CHUNK_BUFFER);
        let writer = tokio::task::spawn_blocking(move || write_archive(rx, file));

        let fetched = self.send_entries(keys, &tx).await;
        if fetched.is_ok() {
            let _ = tx.send(ArchiveOp::Finish).await;
        }
        drop(tx);
        // Wait for the writer even on failure so the scratch file is released
        // before returning.
        let written = writer.await.map_err(join_error)?;
        fetched?;
        let (file, entries) = written?;

        if entries != keys.len() {
            return Err(ZipperError::Scratch {
                source: io::Error::other(format!(
                    "archive has {} entries, expected {}",
                    entries,
                    keys.len()
                )),
            });
        }
        let size_bytes = file.as_file().metadata()?.len();
        info!(job_id = %job_id, entries, size_bytes, "assembled archive");
        Ok(Archive {
            file,
            entries,
            size_bytes,
        })
    }

    async fn send_entries(
        &self,
        keys: &[ObjectKey],
        tx: &mpsc::Sender<ArchiveOp>,
    ) -> Result<(), ZipperError> {
        for key in keys {
            let mut stream = self.storage.get(&self.bucket, key.as_str()).await?;
            debug!(key = %key, "adding archive entry");
            if tx.send(ArchiveOp::StartEntry(key.clone())).await.is_err() {
                // The writer failed, its error is reported instead.
                return Ok(());
            }
            while let Some(chunk) = stream.next().await {
                if tx.send(ArchiveOp::Chunk(chunk?)).await.is_err() {
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

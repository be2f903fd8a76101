//! Staging file for the plaintext output.
//!
//! Pages are written to a hidden sibling of the final path
//! (`.{name}.partial`), which is renamed over the final path only after every
//! page has been written and synced. Dropping an uncommitted [`StagingFile`]
//! deletes it, so an aborted, failed or cancelled run never leaves a file at
//! the final path.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::TranscodeError;

/// Output buffer size; one batch of 4 KiB pages is usually larger.
const WRITE_BUFFER: usize = 1 << 16;

/// Exclusively-owned output handle that becomes the final file on
/// [`commit`](Self::commit).
pub struct StagingFile {
    writer: Option<BufWriter<File>>,
    staging_path: PathBuf,
    final_path: PathBuf,
    bytes_written: u64,
    committed: bool,
}

/// `dir/.name.partial` for `dir/name`.
#[must_use]
pub fn staging_path_for(final_path: &Path) -> PathBuf {
    let name = final_path
        .file_name()
        .map_or_else(|| "output".into(), |n| n.to_string_lossy().into_owned());
    final_path.with_file_name(format!(".{name}.partial"))
}

impl StagingFile {
    /// Create (truncating) the staging file next to `final_path`.
    ///
    /// On Unix the file is created owner-only (0600): it will hold plaintext.
    ///
    /// # Errors
    ///
    /// Returns [`TranscodeError::Io`] if the file cannot be created.
    pub fn create(final_path: &Path) -> Result<Self, TranscodeError> {
        let staging_path = staging_path_for(final_path);

        let mut open = OpenOptions::new();
        open.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            open.mode(0o600);
        }
        let file = open
            .open(&staging_path)
            .map_err(|e| TranscodeError::io("creating", &staging_path, e))?;

        Ok(Self {
            writer: Some(BufWriter::with_capacity(WRITE_BUFFER, file)),
            staging_path,
            final_path: final_path.to_path_buf(),
            bytes_written: 0,
            committed: false,
        })
    }

    /// Path pages are currently being written to.
    #[must_use]
    pub fn staging_path(&self) -> &Path {
        &self.staging_path
    }

    /// Total bytes appended so far.
    #[must_use]
    pub const fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Append `bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`TranscodeError::Io`] on write failure.
    pub fn write_all(&mut self, bytes: &[u8]) -> Result<(), TranscodeError> {
        let writer = self.writer.as_mut().ok_or_else(|| {
            TranscodeError::io(
                "writing",
                &self.staging_path,
                std::io::Error::other("staging file already closed"),
            )
        })?;
        writer
            .write_all(bytes)
            .map_err(|e| TranscodeError::io("writing", &self.staging_path, e))?;
        self.bytes_written = self
            .bytes_written
            .saturating_add(u64::try_from(bytes.len()).unwrap_or(u64::MAX));
        Ok(())
    }

    /// Flush, fsync and atomically rename over the final path.
    ///
    /// # Errors
    ///
    /// Returns [`TranscodeError::Io`] if flushing, syncing or renaming fails;
    /// the staging file is removed in that case.
    pub fn commit(mut self) -> Result<u64, TranscodeError> {
        if let Some(writer) = self.writer.take() {
            let file = writer
                .into_inner()
                .map_err(|e| TranscodeError::io("flushing", &self.staging_path, e.into_error()))?;
            file.sync_all()
                .map_err(|e| TranscodeError::io("syncing", &self.staging_path, e))?;
        }
        fs::rename(&self.staging_path, &self.final_path)
            .map_err(|e| TranscodeError::io("renaming", &self.staging_path, e))?;
        self.committed = true;
        Ok(self.bytes_written)
    }
}

impl Drop for StagingFile {
    fn drop(&mut self) {
        drop(self.writer.take());
        if !self.committed {
            let _ = fs::remove_file(&self.staging_path);
        }
    }
}

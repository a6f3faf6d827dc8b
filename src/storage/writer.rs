use crate::{errors::ImageError, image::ContentDigest};
use pin_project::{pin_project, pinned_drop};
use sha2::{Digest, Sha256};
use std::{
    fs, io,
    path::{Path, PathBuf},
    pin::Pin,
    task::{Context, Poll},
};
use tokio::{fs::File, io::AsyncWrite, io::AsyncWriteExt};

/// A temporary file in the content store, hashed while it's written
///
/// Dropping a writer that was never committed deletes its temp file.
#[pin_project(PinnedDrop)]
#[derive(Debug)]
pub struct StorageWriter {
    #[pin]
    temp_file: File,
    hasher: Sha256,
    len: u64,
    temp_path: Option<PathBuf>,
    io_failed: bool,
}

impl StorageWriter {
    pub(crate) fn new(temp_file: File, temp_path: PathBuf) -> StorageWriter {
        StorageWriter {
            temp_file,
            hasher: Sha256::new(),
            len: 0,
            temp_path: Some(temp_path),
            io_failed: false,
        }
    }

    /// Number of bytes written so far
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Delete the temporary file backing this writer
    pub fn remove_temp(&mut self) -> Result<(), ImageError> {
        if let Some(path) = self.temp_path.take() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Rename the temporary file and detach it from this writer
    pub(crate) fn rename_temp(&mut self, dest_path: &Path) -> Result<(), ImageError> {
        match self.temp_path.take() {
            Some(temp_path) => Ok(fs::rename(&temp_path, dest_path)?),
            None => Err(ImageError::ContentDigestIOError),
        }
    }

    /// Flush buffered I/O and return the final content digest
    pub async fn finalize(&mut self) -> Result<ContentDigest, ImageError> {
        self.flush().await?;
        if self.io_failed {
            Err(ImageError::ContentDigestIOError)
        } else {
            Ok(ContentDigest::from_hasher(self.hasher.clone()))
        }
    }
}

impl AsyncWrite for StorageWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        let this = self.project();
        match this.temp_file.poll_write(cx, buf) {
            Poll::Ready(Ok(actual_size)) => {
                this.hasher.update(&buf[..actual_size]);
                *this.len += actual_size as u64;
                Poll::Ready(Ok(actual_size))
            }
            Poll::Ready(Err(e)) => {
                *this.io_failed = true;
                Poll::Ready(Err(e))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        let this = self.project();
        let result = this.temp_file.poll_flush(cx);
        if let Poll::Ready(Err(_)) = &result {
            *this.io_failed = true;
        }
        result
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        self.project().temp_file.poll_shutdown(cx)
    }
}

#[pinned_drop]
impl PinnedDrop for StorageWriter {
    fn drop(self: Pin<&mut Self>) {
        if let Some(path) = self.project().temp_path.take() {
            log::debug!("discarding uncommitted temp file {:?}", path);
            if let Err(err) = fs::remove_file(&path) {
                log::warn!("error removing temp file {:?}, {:?}", path, err);
            }
        }
    }
}

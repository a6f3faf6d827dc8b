//! Content-addressed blob storage
//!
//! Blobs are immutable once committed. Every write goes to a temp file first
//! and is renamed into place only after its digest is known, so a blob path
//! either holds the full verified content or doesn't exist.

mod key;
mod writer;

pub use key::StorageKey;
pub use writer::StorageWriter;

use crate::{errors::ImageError, image::ContentDigest};
use memmap2::{Mmap, MmapOptions};
use std::{
    fs,
    fs::File,
    io,
    path::{Path, PathBuf},
};
use tokio::{fs::OpenOptions, io::AsyncWriteExt};

pub(crate) fn create_parent_dirs(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Err(err) = fs::create_dir_all(parent) {
            // Log a warning instead of giving up right away, in case this was a race
            // condition.
            log::warn!("error creating directory at {:?}, {:?}", parent, err);
        }
    }
}

/// Summary of a stored blob
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlobInfo {
    pub digest: ContentDigest,
    pub size: u64,
}

#[derive(Clone, Debug)]
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: PathBuf) -> Self {
        FileStorage { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn key_path(&self, key: &StorageKey) -> PathBuf {
        key.to_path(&self.path)
    }

    /// Open one blob from local storage, as a File
    pub fn open(&self, digest: &ContentDigest) -> Result<Option<File>, ImageError> {
        match File::open(self.key_path(&StorageKey::Blob(digest.clone()))) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
            Ok(f) => Ok(Some(f)),
        }
    }

    /// Size of a stored blob, if we have it
    pub fn blob_len(&self, digest: &ContentDigest) -> Result<Option<u64>, ImageError> {
        match fs::metadata(self.key_path(&StorageKey::Blob(digest.clone()))) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
            Ok(metadata) if metadata.is_file() => Ok(Some(metadata.len())),
            Ok(_) => Ok(None),
        }
    }

    /// Check whether a blob exists without actually opening it
    pub fn contains(&self, digest: &ContentDigest) -> bool {
        matches!(self.blob_len(digest), Ok(Some(_)))
    }

    /// Open a blob and memory map it
    pub fn mmap(&self, digest: &ContentDigest) -> Result<Option<Mmap>, ImageError> {
        match self.open(digest)? {
            Some(file) => Ok(Some(unsafe { MmapOptions::new().map(&file) }?)),
            None => Ok(None),
        }
    }

    /// Read a whole blob into memory
    pub async fn read_blob(&self, digest: &ContentDigest) -> Result<Option<Vec<u8>>, ImageError> {
        let path = self.key_path(&StorageKey::Blob(digest.clone()));
        match tokio::fs::read(path).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
            Ok(data) => Ok(Some(data)),
        }
    }

    /// Delete a blob, returning true if it existed
    pub fn remove_blob(&self, digest: &ContentDigest) -> Result<bool, ImageError> {
        match fs::remove_file(self.key_path(&StorageKey::Blob(digest.clone()))) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
            Ok(()) => {
                log::debug!("removed blob {}", digest);
                Ok(true)
            }
        }
    }

    /// Every committed blob, in no particular order
    pub fn list_blobs(&self) -> Result<Vec<BlobInfo>, ImageError> {
        let mut result = vec![];
        for format_dir in read_dir_if_exists(&self.path.join("blobs"))? {
            let format_dir = format_dir?;
            let format = format_dir.file_name();
            for blob in fs::read_dir(format_dir.path())? {
                let blob = blob?;
                let parsed = ContentDigest::parse(&format!(
                    "{}:{}",
                    format.to_string_lossy(),
                    blob.file_name().to_string_lossy()
                ));
                match parsed {
                    Ok(digest) => result.push(BlobInfo {
                        digest,
                        size: blob.metadata()?.len(),
                    }),
                    Err(_) => log::warn!("ignoring unexpected file {:?}", blob.path()),
                }
            }
        }
        Ok(result)
    }

    /// Every temp file, with the process id that created it
    pub fn list_temp(&self) -> Result<Vec<(PathBuf, Option<u32>)>, ImageError> {
        let mut result = vec![];
        for entry in read_dir_if_exists(&self.path.join("tmp"))? {
            let path = entry?.path();
            let pid = StorageKey::temp_pid(&path);
            result.push((path, pid));
        }
        Ok(result)
    }

    /// Begin writing to temporary storage
    pub async fn begin_write(&self) -> Result<StorageWriter, ImageError> {
        let temp_path = self.key_path(&StorageKey::temp());
        create_parent_dirs(&temp_path);
        let temp_file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o440)
            .open(&temp_path)
            .await?;
        Ok(StorageWriter::new(temp_file, temp_path))
    }

    /// Promote a temporary file into a blob named by its digest
    ///
    /// With an `expected` digest, content that hashes to anything else is
    /// discarded and reported as a mismatch. If the blob already exists the
    /// temp file is dropped, since identical digests mean identical bytes.
    pub async fn commit_write(
        &self,
        mut writer: StorageWriter,
        expected: Option<&ContentDigest>,
    ) -> Result<BlobInfo, ImageError> {
        let content_digest = writer.finalize().await?;
        if let Some(expected) = expected {
            if expected != &content_digest {
                writer.remove_temp()?;
                return Err(ImageError::ContentDigestMismatch {
                    expected: expected.clone(),
                    found: content_digest,
                });
            }
        }
        let size = writer.len();
        let dest_path = self.key_path(&StorageKey::Blob(content_digest.clone()));
        if self.contains(&content_digest) {
            log::debug!("storage already has {}", content_digest);
            writer.remove_temp()?;
        } else {
            create_parent_dirs(&dest_path);
            writer.rename_temp(&dest_path)?;
            log::debug!("storage commit, {} -> {:?}", content_digest, dest_path);
        }
        Ok(BlobInfo {
            digest: content_digest,
            size,
        })
    }

    /// Store a complete in-memory blob
    pub async fn insert(
        &self,
        data: &[u8],
        expected: Option<&ContentDigest>,
    ) -> Result<BlobInfo, ImageError> {
        let mut writer = self.begin_write().await?;
        writer.write_all(data).await?;
        self.commit_write(writer, expected).await
    }
}

fn read_dir_if_exists(path: &Path) -> Result<Vec<io::Result<fs::DirEntry>>, ImageError> {
    match fs::read_dir(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(vec![]),
        Err(e) => Err(e.into()),
        Ok(iter) => Ok(iter.collect()),
    }
}

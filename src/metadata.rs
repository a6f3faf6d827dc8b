//! Persistent records for layer chains and pulled images
//!
//! Each record is one small JSON file, replaced atomically with a temp file
//! and a rename. Read-modify-write updates are serialized within a process.

use crate::{
    cache::ChainId,
    errors::ImageError,
    image::{ContentDigest, ImageName},
    storage::{create_parent_dirs, StorageKey},
};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
};

/// One layer applied on top of a parent chain
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChainRecord {
    pub chain_id: ChainId,
    pub parent: Option<ChainId>,
    /// Digest of the uncompressed layer tar
    pub diff_id: ContentDigest,
    /// Digest of the layer blob as the registry serves it
    pub blob_digest: ContentDigest,
    /// Uncompressed size of this layer alone
    pub size: u64,
    /// Uncompressed size of this layer and all of its parents
    pub chain_size: u64,
    /// Persistent references: child chains and image records
    pub ref_count: u64,
}

/// The chain a normalized image name resolved to most recently
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub name: String,
    pub manifest_digest: ContentDigest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_digest: Option<ContentDigest>,
    pub config_digest: ContentDigest,
    pub chain_id: ChainId,
    pub size: u64,
}

#[derive(Debug)]
pub struct MetadataStore {
    path: PathBuf,
    update_lock: Mutex<()>,
}

impl MetadataStore {
    pub fn new(path: PathBuf) -> Self {
        MetadataStore {
            path,
            update_lock: Mutex::new(()),
        }
    }

    pub fn get_chain(&self, chain_id: &ChainId) -> Result<Option<ChainRecord>, ImageError> {
        self.read_json(&StorageKey::Chain(chain_id.digest().clone()))
    }

    pub fn put_chain(&self, record: &ChainRecord) -> Result<(), ImageError> {
        let _guard = self.update_lock.lock();
        self.write_json(&StorageKey::Chain(record.chain_id.digest().clone()), record)
    }

    pub fn remove_chain(&self, chain_id: &ChainId) -> Result<bool, ImageError> {
        let _guard = self.update_lock.lock();
        self.remove(&StorageKey::Chain(chain_id.digest().clone()))
    }

    pub fn list_chains(&self) -> Result<Vec<ChainRecord>, ImageError> {
        self.list_json(&self.path.join("meta").join("chains"))
    }

    /// Adjust a chain's persistent reference count
    ///
    /// The count never drops below zero; an underflow is logged and clamped.
    pub fn add_chain_ref(&self, chain_id: &ChainId, delta: i64) -> Result<ChainRecord, ImageError> {
        let _guard = self.update_lock.lock();
        self.adjust_chain_ref(chain_id, delta)
    }

    /// Point an image name at a chain, moving its chain reference along
    ///
    /// Reading the old record, counting the new reference, and replacing the
    /// record happen under one lock, so racing pins of a name count once.
    /// Returns the record that was replaced.
    pub fn pin_image(
        &self,
        name: &ImageName,
        record: &ImageRecord,
    ) -> Result<Option<ImageRecord>, ImageError> {
        let _guard = self.update_lock.lock();
        let key = StorageKey::Image(name.clone());
        let previous: Option<ImageRecord> = self.read_json(&key)?;
        let same_chain = previous
            .as_ref()
            .map(|previous| previous.chain_id == record.chain_id)
            .unwrap_or(false);
        if !same_chain {
            self.adjust_chain_ref(&record.chain_id, 1)?;
        }
        self.write_json(&key, record)?;
        if let (Some(previous), false) = (&previous, same_chain) {
            self.release_chain_ref(&previous.chain_id)?;
        }
        Ok(previous)
    }

    /// Remove an image record and the chain reference it held
    pub fn unpin_image(&self, name: &ImageName) -> Result<Option<ImageRecord>, ImageError> {
        let _guard = self.update_lock.lock();
        let key = StorageKey::Image(name.clone());
        let previous: Option<ImageRecord> = self.read_json(&key)?;
        if let Some(previous) = &previous {
            self.remove(&key)?;
            self.release_chain_ref(&previous.chain_id)?;
        }
        Ok(previous)
    }

    fn release_chain_ref(&self, chain_id: &ChainId) -> Result<(), ImageError> {
        match self.adjust_chain_ref(chain_id, -1) {
            Ok(_) => Ok(()),
            Err(ImageError::MissingChain(missing)) => {
                log::warn!("released a reference on missing chain {}", missing);
                Ok(())
            }
            Err(other) => Err(other),
        }
    }

    /// Caller holds the update lock
    fn adjust_chain_ref(&self, chain_id: &ChainId, delta: i64) -> Result<ChainRecord, ImageError> {
        let key = StorageKey::Chain(chain_id.digest().clone());
        let mut record: ChainRecord = self
            .read_json(&key)?
            .ok_or_else(|| ImageError::MissingChain(chain_id.clone()))?;
        let updated = record.ref_count as i64 + delta;
        if updated < 0 {
            log::warn!("reference count underflow on chain {}", chain_id);
        }
        record.ref_count = updated.max(0) as u64;
        self.write_json(&key, &record)?;
        log::debug!("chain {} ref_count -> {}", chain_id, record.ref_count);
        Ok(record)
    }

    pub fn get_image(&self, name: &ImageName) -> Result<Option<ImageRecord>, ImageError> {
        self.read_json(&StorageKey::Image(name.clone()))
    }

    pub fn put_image(&self, name: &ImageName, record: &ImageRecord) -> Result<(), ImageError> {
        let _guard = self.update_lock.lock();
        self.write_json(&StorageKey::Image(name.clone()), record)
    }

    pub fn remove_image(&self, name: &ImageName) -> Result<bool, ImageError> {
        let _guard = self.update_lock.lock();
        self.remove(&StorageKey::Image(name.clone()))
    }

    pub fn list_images(&self) -> Result<Vec<ImageRecord>, ImageError> {
        self.list_json(&self.path.join("meta").join("images"))
    }

    fn read_json<T: DeserializeOwned>(&self, key: &StorageKey) -> Result<Option<T>, ImageError> {
        read_json_path(&key.to_path(&self.path))
    }

    fn write_json<T: Serialize>(&self, key: &StorageKey, value: &T) -> Result<(), ImageError> {
        let dest_path = key.to_path(&self.path);
        let temp_path = StorageKey::temp().to_path(&self.path);
        create_parent_dirs(&temp_path);
        create_parent_dirs(&dest_path);
        fs::write(&temp_path, serde_json::to_vec_pretty(value)?)?;
        if let Err(err) = fs::rename(&temp_path, &dest_path) {
            let _ = fs::remove_file(&temp_path);
            return Err(err.into());
        }
        Ok(())
    }

    fn remove(&self, key: &StorageKey) -> Result<bool, ImageError> {
        match fs::remove_file(key.to_path(&self.path)) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
            Ok(()) => Ok(true),
        }
    }

    fn list_json<T: DeserializeOwned>(&self, dir: &Path) -> Result<Vec<T>, ImageError> {
        let entries = match fs::read_dir(dir) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
            Ok(entries) => entries,
        };
        let mut result = vec![];
        for entry in entries {
            let path = entry?.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            // Tolerate a record vanishing between listing and reading
            if let Some(record) = read_json_path(&path)? {
                result.push(record);
            }
        }
        Ok(result)
    }
}

fn read_json_path<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, ImageError> {
    match fs::read(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
        Ok(data) => {
            log::trace!("raw json record {:?}, {}", path, String::from_utf8_lossy(&data));
            Ok(Some(serde_json::from_slice(&data)?))
        }
    }
}

//! Deduplicated layer chains on top of the content store
//!
//! A chain is recorded only after its layer has been fetched, decompressed,
//! verified against its diff id, and read through as an archive, so any
//! chain record found on disk is complete and mountable. Construction is single-flight per chain id and per blob digest
//! within a process. Across processes the same work may happen twice, which
//! is harmless since every write is content-addressed.
//!
//! Garbage collection takes an exclusive lock; anything that creates
//! chains or relies on them staying put holds a [CacheHold] instead.

mod chain;
mod flight;

pub use chain::ChainId;

use crate::{
    errors::{ImageError, SnapshotError},
    image::{ContentDigest, ImageName},
    manifest::media_types,
    metadata::{ChainRecord, ImageRecord, MetadataStore},
    session::Session,
    snapshot::{
        tar::check_layer, vfs::DirEntry, vfs::FileStat, MountHandle, SnapshotLayer, Snapshotter,
    },
    storage::{BlobInfo, FileStorage, StorageKey, StorageWriter},
};
use async_compression::tokio::bufread::GzipDecoder;
use async_trait::async_trait;
use flight::KeyedMutex;
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet},
    fmt, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::{
    io::BufReader,
    sync::{OwnedRwLockReadGuard, RwLock},
};

/// How a layer blob is stored in the registry
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Compression {
    Gzip,
    Uncompressed,
}

impl Compression {
    pub fn for_media_type(media_type: &str) -> Result<Self, ImageError> {
        match media_type {
            media_types::DOCKER_LAYER_TAR_GZIP | media_types::OCI_LAYER_TAR_GZIP => {
                Ok(Compression::Gzip)
            }
            media_types::DOCKER_LAYER_TAR | media_types::OCI_LAYER_TAR => {
                Ok(Compression::Uncompressed)
            }
            other => Err(ImageError::UnsupportedLayerType(other.to_owned())),
        }
    }
}

/// A blob as a manifest describes it
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlobDescriptor {
    pub digest: ContentDigest,
    pub size: u64,
    pub media_type: String,
}

/// One layer of an image: its blob, and the digest of its uncompressed tar
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LayerDescriptor {
    pub blob: BlobDescriptor,
    pub diff_id: ContentDigest,
}

impl LayerDescriptor {
    pub fn compression(&self) -> Result<Compression, ImageError> {
        Compression::for_media_type(&self.blob.media_type)
    }
}

/// Somewhere blobs can be fetched from when they aren't stored locally
#[async_trait]
pub trait BlobProvider: Send + Sync {
    /// Write the blob's bytes; the digest is verified by the caller
    async fn fetch_blob(
        &self,
        blob: &BlobDescriptor,
        writer: &mut StorageWriter,
    ) -> Result<(), ImageError>;
}

type Leases = Arc<Mutex<HashMap<ChainId, usize>>>;

/// A leased reference to a complete chain
///
/// While any lease on a chain exists, garbage collection leaves it alone.
/// Clones hold their own lease; dropping releases it.
pub struct CacheRef {
    record: ChainRecord,
    leases: Leases,
}

impl CacheRef {
    fn new(record: ChainRecord, leases: &Leases) -> Self {
        *leases.lock().entry(record.chain_id.clone()).or_insert(0) += 1;
        CacheRef {
            record,
            leases: leases.clone(),
        }
    }

    pub fn chain_id(&self) -> &ChainId {
        &self.record.chain_id
    }

    /// Uncompressed size of every layer in the chain
    pub fn size(&self) -> u64 {
        self.record.chain_size
    }

    pub fn record(&self) -> &ChainRecord {
        &self.record
    }
}

impl Clone for CacheRef {
    fn clone(&self) -> Self {
        CacheRef::new(self.record.clone(), &self.leases)
    }
}

impl Drop for CacheRef {
    fn drop(&mut self) {
        let mut leases = self.leases.lock();
        if let Some(count) = leases.get_mut(&self.record.chain_id) {
            *count -= 1;
            if *count == 0 {
                leases.remove(&self.record.chain_id);
            }
        }
    }
}

impl fmt::Debug for CacheRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CacheRef").field(&self.record.chain_id).finish()
    }
}

/// Keeps garbage collection from running while held
pub struct CacheHold {
    _guard: OwnedRwLockReadGuard<()>,
}

/// Counts of work done since the cache manager was created
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CacheStats {
    /// Blobs downloaded through a provider
    pub blob_fetches: u64,
    /// Layers applied to create new chains
    pub chain_applies: u64,
    /// Requests for a chain that already existed
    pub chain_hits: u64,
}

#[derive(Default)]
struct Counters {
    blob_fetches: AtomicU64,
    chain_applies: AtomicU64,
    chain_hits: AtomicU64,
}

/// What a garbage collection pass removed
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct GcReport {
    pub chains_removed: Vec<ChainId>,
    pub blobs_removed: usize,
    pub bytes_freed: u64,
    pub temp_files_removed: usize,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DiskUsage {
    pub images: usize,
    pub chains: usize,
    pub blobs: usize,
    pub bytes: u64,
}

pub struct CacheManager {
    storage: FileStorage,
    metadata: MetadataStore,
    backend: Arc<dyn Snapshotter>,
    gc_lock: Arc<RwLock<()>>,
    chain_flight: KeyedMutex<ChainId>,
    blob_flight: KeyedMutex<ContentDigest>,
    leases: Leases,
    counters: Counters,
}

impl CacheManager {
    pub fn new(state_dir: &Path, backend: Arc<dyn Snapshotter>) -> Self {
        CacheManager {
            storage: FileStorage::new(state_dir.to_path_buf()),
            metadata: MetadataStore::new(state_dir.to_path_buf()),
            backend,
            gc_lock: Arc::new(RwLock::new(())),
            chain_flight: KeyedMutex::new(),
            blob_flight: KeyedMutex::new(),
            leases: Arc::new(Mutex::new(HashMap::new())),
            counters: Default::default(),
        }
    }

    pub fn storage(&self) -> &FileStorage {
        &self.storage
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    pub fn backend(&self) -> &Arc<dyn Snapshotter> {
        &self.backend
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            blob_fetches: self.counters.blob_fetches.load(Ordering::SeqCst),
            chain_applies: self.counters.chain_applies.load(Ordering::SeqCst),
            chain_hits: self.counters.chain_hits.load(Ordering::SeqCst),
        }
    }

    /// Wait for any garbage collection in progress, then block new ones
    pub async fn hold(&self) -> CacheHold {
        CacheHold {
            _guard: self.gc_lock.clone().read_owned().await,
        }
    }

    /// Lease an existing chain
    pub fn lookup_chain(
        &self,
        _hold: &CacheHold,
        chain_id: &ChainId,
    ) -> Result<Option<CacheRef>, ImageError> {
        Ok(self
            .metadata
            .get_chain(chain_id)?
            .map(|record| CacheRef::new(record, &self.leases)))
    }

    /// Number of leases currently held on a chain
    pub fn lease_count(&self, chain_id: &ChainId) -> usize {
        self.leases.lock().get(chain_id).copied().unwrap_or(0)
    }

    /// Find or build the chain for a list of layers, bottom first
    ///
    /// Layers whose chain already exists are skipped without touching their
    /// blobs. Each missing chain is built by exactly one caller in this
    /// process; others wait for it and reuse the result.
    pub async fn get_or_create_chain(
        &self,
        hold: &CacheHold,
        layers: &[LayerDescriptor],
        provider: &dyn BlobProvider,
        session: &Session,
    ) -> Result<CacheRef, ImageError> {
        let chain_ids = ChainId::for_diff_ids(layers.iter().map(|layer| &layer.diff_id));
        let top = chain_ids.last().ok_or(ImageError::EmptyImage)?;
        if let Some(existing) = self.lookup_chain(hold, top)? {
            log::debug!("chain {} already exists", top);
            self.counters.chain_hits.fetch_add(1, Ordering::SeqCst);
            return Ok(existing);
        }

        let mut parent: Option<ChainRecord> = None;
        for (layer, chain_id) in layers.iter().zip(chain_ids.iter()) {
            let _flight = session
                .until_shutdown(self.chain_flight.lock(chain_id))
                .await
                .ok_or(ImageError::Interrupted)?;
            let record = match self.metadata.get_chain(chain_id)? {
                Some(record) => record,
                None => {
                    self.apply_layer(parent.as_ref(), layer, chain_id, provider, session)
                        .await?
                }
            };
            parent = Some(record);
        }
        match parent {
            Some(record) => Ok(CacheRef::new(record, &self.leases)),
            None => Err(ImageError::EmptyImage),
        }
    }

    /// Make sure a blob is in the content store, fetching it if needed
    pub async fn ensure_blob(
        &self,
        blob: &BlobDescriptor,
        provider: &dyn BlobProvider,
        session: &Session,
    ) -> Result<BlobInfo, ImageError> {
        let _flight = session
            .until_shutdown(self.blob_flight.lock(&blob.digest))
            .await
            .ok_or(ImageError::Interrupted)?;
        if let Some(size) = self.storage.blob_len(&blob.digest)? {
            if size != blob.size {
                return Err(ImageError::UnexpectedContentSize {
                    digest: blob.digest.clone(),
                    expected: blob.size,
                    found: size,
                });
            }
            log::debug!("{} is already stored", blob.digest);
            return Ok(BlobInfo {
                digest: blob.digest.clone(),
                size,
            });
        }
        self.counters.blob_fetches.fetch_add(1, Ordering::SeqCst);
        let mut writer = self.storage.begin_write().await?;
        session
            .interruptible(provider.fetch_blob(blob, &mut writer))
            .await?;
        self.storage.commit_write(writer, Some(&blob.digest)).await
    }

    /// Fetch, decompress, and verify one layer, then record its chain
    ///
    /// Nothing is recorded unless every step succeeds.
    async fn apply_layer(
        &self,
        parent: Option<&ChainRecord>,
        layer: &LayerDescriptor,
        chain_id: &ChainId,
        provider: &dyn BlobProvider,
        session: &Session,
    ) -> Result<ChainRecord, ImageError> {
        let compression = layer.compression()?;
        self.ensure_blob(&layer.blob, provider, session).await?;
        let diff = match compression {
            Compression::Uncompressed => {
                if layer.blob.digest != layer.diff_id {
                    return Err(ImageError::ContentDigestMismatch {
                        expected: layer.diff_id.clone(),
                        found: layer.blob.digest.clone(),
                    });
                }
                BlobInfo {
                    digest: layer.diff_id.clone(),
                    size: layer.blob.size,
                }
            }
            Compression::Gzip => self.decompress(layer, session).await?,
        };

        let storage = self.storage.clone();
        let diff_id = diff.digest.clone();
        tokio::task::spawn_blocking(move || check_layer(&storage, &diff_id)).await??;

        // Count the parent's reference first; a crash in between leaks a
        // chain instead of orphaning one.
        if let Some(parent) = parent {
            self.metadata.add_chain_ref(&parent.chain_id, 1)?;
        }
        let record = ChainRecord {
            chain_id: chain_id.clone(),
            parent: parent.map(|parent| parent.chain_id.clone()),
            diff_id: layer.diff_id.clone(),
            blob_digest: layer.blob.digest.clone(),
            size: diff.size,
            chain_size: parent.map(|parent| parent.chain_size).unwrap_or(0) + diff.size,
            ref_count: 0,
        };
        self.metadata.put_chain(&record)?;
        self.counters.chain_applies.fetch_add(1, Ordering::SeqCst);
        log::info!(
            "applied layer {} as chain {}, {} bytes",
            layer.diff_id,
            chain_id,
            diff.size
        );
        Ok(record)
    }

    async fn decompress(
        &self,
        layer: &LayerDescriptor,
        session: &Session,
    ) -> Result<BlobInfo, ImageError> {
        if let Some(size) = self.storage.blob_len(&layer.diff_id)? {
            log::debug!("{} is already decompressed", layer.diff_id);
            return Ok(BlobInfo {
                digest: layer.diff_id.clone(),
                size,
            });
        }
        let path = self
            .storage
            .key_path(&StorageKey::Blob(layer.blob.digest.clone()));
        let file = tokio::fs::File::open(&path).await?;
        if layer.blob.size > 512 * 1024 {
            log::info!("decompressing {} bytes ...", layer.blob.size);
        }
        let mut decoder = GzipDecoder::new(BufReader::new(file));
        decoder.multiple_members(true);
        let mut writer = self.storage.begin_write().await?;
        session
            .interruptible(async {
                tokio::io::copy(&mut decoder, &mut writer).await?;
                Ok(())
            })
            .await?;
        let info = self.storage.commit_write(writer, Some(&layer.diff_id)).await?;
        log::debug!(
            "decompressed {} into {}, {} bytes",
            layer.blob.digest,
            info.digest,
            info.size
        );
        Ok(info)
    }

    /// Record that an image name refers to a chain
    ///
    /// The image record counts as a persistent reference on the chain. An
    /// earlier record for the same name is replaced and its reference
    /// dropped.
    pub fn pin_image(
        &self,
        _hold: &CacheHold,
        name: &ImageName,
        record: ImageRecord,
    ) -> Result<(), ImageError> {
        let previous = self.metadata.pin_image(name, &record)?;
        match previous {
            Some(previous) if previous.chain_id != record.chain_id => {
                log::info!("{} moved from {} to {}", name, previous.chain_id, record.chain_id)
            }
            _ => log::debug!("pinned {} -> {}", name, record.chain_id),
        }
        Ok(())
    }

    /// Forget an image record, returning false if there was none
    pub async fn unpin_image(&self, name: &ImageName) -> Result<bool, ImageError> {
        let _hold = self.hold().await;
        match self.metadata.unpin_image(name)? {
            None => Ok(false),
            Some(record) => {
                log::debug!("unpinned {}, was {}", name, record.chain_id);
                Ok(true)
            }
        }
    }

    /// Every layer of a chain, bottom first
    fn chain_layers(&self, top: &ChainRecord) -> Result<Vec<SnapshotLayer>, ImageError> {
        let mut layers = vec![];
        let mut next = Some(top.clone());
        while let Some(record) = next {
            next = match &record.parent {
                Some(parent) => Some(
                    self.metadata
                        .get_chain(parent)?
                        .ok_or_else(|| ImageError::MissingChain(parent.clone()))?,
                ),
                None => None,
            };
            layers.push(SnapshotLayer {
                chain_id: record.chain_id,
                diff_id: record.diff_id,
            });
        }
        layers.reverse();
        Ok(layers)
    }

    /// Mount a chain through the snapshot backend
    pub async fn materialize(&self, cache_ref: &CacheRef) -> Result<Snapshot, SnapshotError> {
        let layers = self.chain_layers(cache_ref.record())?;
        let mount = self.backend.mount(layers).await?;
        log::debug!("materialized {} as {}", cache_ref.chain_id(), mount.id);
        Ok(Snapshot {
            cache_ref: cache_ref.clone(),
            backend: self.backend.clone(),
            mount,
        })
    }

    /// Remove unreferenced chains, orphaned blobs, and stale temp files
    pub async fn gc(&self) -> Result<GcReport, ImageError> {
        let _exclusive = self.gc_lock.write().await;
        let leased: HashSet<ChainId> = self.leases.lock().keys().cloned().collect();
        let mut report = GcReport::default();

        let mut chains: HashMap<ChainId, ChainRecord> = self
            .metadata
            .list_chains()?
            .into_iter()
            .map(|record| (record.chain_id.clone(), record))
            .collect();
        loop {
            let doomed: Vec<ChainId> = chains
                .values()
                .filter(|record| record.ref_count == 0 && !leased.contains(&record.chain_id))
                .map(|record| record.chain_id.clone())
                .collect();
            if doomed.is_empty() {
                break;
            }
            for chain_id in doomed {
                let record = match chains.remove(&chain_id) {
                    Some(record) => record,
                    None => continue,
                };
                self.metadata.remove_chain(&chain_id)?;
                if let Some(parent) = &record.parent {
                    match self.metadata.add_chain_ref(parent, -1) {
                        Ok(updated) => {
                            if let Some(parent_record) = chains.get_mut(parent) {
                                parent_record.ref_count = updated.ref_count;
                            }
                        }
                        Err(ImageError::MissingChain(_)) => {
                            log::warn!("chain {} had a missing parent {}", chain_id, parent)
                        }
                        Err(other) => return Err(other),
                    }
                }
                log::info!("gc removed chain {}", chain_id);
                report.chains_removed.push(chain_id);
            }
        }

        let mut referenced: HashSet<ContentDigest> = HashSet::new();
        for record in chains.values() {
            referenced.insert(record.diff_id.clone());
            referenced.insert(record.blob_digest.clone());
        }
        for image in self.metadata.list_images()? {
            referenced.insert(image.manifest_digest);
            referenced.insert(image.config_digest);
            if let Some(index) = image.index_digest {
                referenced.insert(index);
            }
        }
        for blob in self.storage.list_blobs()? {
            if !referenced.contains(&blob.digest) && self.storage.remove_blob(&blob.digest)? {
                log::debug!("gc removed blob {}", blob.digest);
                report.blobs_removed += 1;
                report.bytes_freed += blob.size;
            }
        }

        let own_pid = std::process::id();
        for (path, pid) in self.storage.list_temp()? {
            let stale = match pid {
                Some(pid) => pid != own_pid && !process_exists(pid),
                None => true,
            };
            if stale && remove_if_exists(&path)? {
                log::debug!("gc removed stale temp file {:?}", path);
                report.temp_files_removed += 1;
            }
        }

        log::info!(
            "gc removed {} chains and {} blobs, {} bytes",
            report.chains_removed.len(),
            report.blobs_removed,
            report.bytes_freed
        );
        Ok(report)
    }

    /// Summarize what the state directory holds
    pub fn disk_usage(&self) -> Result<DiskUsage, ImageError> {
        let blobs = self.storage.list_blobs()?;
        Ok(DiskUsage {
            images: self.metadata.list_images()?.len(),
            chains: self.metadata.list_chains()?.len(),
            blobs: blobs.len(),
            bytes: blobs.iter().map(|blob| blob.size).sum(),
        })
    }
}

fn process_exists(pid: u32) -> bool {
    let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
    result == 0 || io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

fn remove_if_exists(path: &Path) -> Result<bool, ImageError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// A mounted view of a chain
///
/// Holds a lease on its chain until dropped. Dropping does not unmount;
/// call [Snapshot::release], or stop the backend.
pub struct Snapshot {
    cache_ref: CacheRef,
    backend: Arc<dyn Snapshotter>,
    mount: MountHandle,
}

impl Snapshot {
    /// The top chain id, which identifies the snapshot's content
    pub fn id(&self) -> &ChainId {
        self.cache_ref.chain_id()
    }

    /// Uncompressed size of all layers
    pub fn size(&self) -> u64 {
        self.cache_ref.size()
    }

    pub fn mount(&self) -> &MountHandle {
        &self.mount
    }

    pub async fn stat(&self, path: &Path) -> Result<FileStat, SnapshotError> {
        self.backend.stat(&self.mount, path).await
    }

    pub async fn read_dir(&self, path: &Path) -> Result<Vec<DirEntry>, SnapshotError> {
        self.backend.read_dir(&self.mount, path).await
    }

    pub async fn read_file(&self, path: &Path) -> Result<Vec<u8>, SnapshotError> {
        self.backend.read_file(&self.mount, path).await
    }

    pub async fn read_link(&self, path: &Path) -> Result<PathBuf, SnapshotError> {
        self.backend.read_link(&self.mount, path).await
    }

    pub async fn write_file(&self, path: &Path, data: Vec<u8>) -> Result<(), SnapshotError> {
        self.backend.write_file(&self.mount, path, data).await
    }

    pub async fn remove(&self, path: &Path) -> Result<(), SnapshotError> {
        self.backend.remove(&self.mount, path).await
    }

    /// Unmount, returning false if the mount was already gone
    pub async fn release(self) -> Result<bool, SnapshotError> {
        self.backend.unmount(&self.mount).await
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("id", self.id())
            .field("size", &self.size())
            .field("mount", &self.mount.id)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::snapshot::UnprivilegedSnapshotter;
    use flate2::{write::GzEncoder, Compression as GzLevel};
    use std::io::Write;

    struct TestProvider {
        blobs: HashMap<ContentDigest, Vec<u8>>,
        fetches: Mutex<Vec<ContentDigest>>,
    }

    #[async_trait]
    impl BlobProvider for TestProvider {
        async fn fetch_blob(
            &self,
            blob: &BlobDescriptor,
            writer: &mut StorageWriter,
        ) -> Result<(), ImageError> {
            use tokio::io::AsyncWriteExt;
            self.fetches.lock().push(blob.digest.clone());
            let data = self.blobs.get(&blob.digest).cloned().unwrap_or_default();
            writer.write_all(&data).await?;
            Ok(())
        }
    }

    fn tar_of(files: &[(&str, usize)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, len) in files {
            let mut header = tar::Header::new_gnu();
            header.set_mode(0o644);
            header.set_size(*len as u64);
            header.set_cksum();
            builder
                .append_data(&mut header, path, &vec![b'x'; *len][..])
                .unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), GzLevel::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        cache: CacheManager,
        provider: TestProvider,
        layers: Vec<LayerDescriptor>,
        diff_sizes: Vec<u64>,
    }

    fn fixture(tars: Vec<Vec<u8>>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(UnprivilegedSnapshotter::new(FileStorage::new(
            dir.path().to_path_buf(),
        )));
        let cache = CacheManager::new(dir.path(), backend);
        let mut blobs = HashMap::new();
        let mut layers = vec![];
        let mut diff_sizes = vec![];
        for tar in tars {
            let compressed = gzip(&tar);
            let digest = ContentDigest::from_content(&compressed);
            layers.push(LayerDescriptor {
                blob: BlobDescriptor {
                    digest: digest.clone(),
                    size: compressed.len() as u64,
                    media_type: media_types::DOCKER_LAYER_TAR_GZIP.to_owned(),
                },
                diff_id: ContentDigest::from_content(&tar),
            });
            diff_sizes.push(tar.len() as u64);
            blobs.insert(digest, compressed);
        }
        Fixture {
            _dir: dir,
            cache,
            provider: TestProvider {
                blobs,
                fetches: Mutex::new(vec![]),
            },
            layers,
            diff_sizes,
        }
    }

    fn three_layers() -> Fixture {
        fixture(vec![
            tar_of(&[("bin/busybox", 70000), ("etc/os-release", 300)]),
            tar_of(&[]),
            tar_of(&[("etc/motd", 4000)]),
        ])
    }

    #[tokio::test]
    async fn chain_built_once_and_sized() {
        let f = three_layers();
        let session = Session::new("test");
        let hold = f.cache.hold().await;
        let first = f
            .cache
            .get_or_create_chain(&hold, &f.layers, &f.provider, &session)
            .await
            .unwrap();
        let second = f
            .cache
            .get_or_create_chain(&hold, &f.layers, &f.provider, &session)
            .await
            .unwrap();
        assert_eq!(first.chain_id(), second.chain_id());
        assert_eq!(first.size(), f.diff_sizes.iter().sum::<u64>());
        assert_eq!(f.provider.fetches.lock().len(), 3);
        let stats = f.cache.stats();
        assert_eq!(stats.chain_applies, 3);
        assert_eq!(stats.chain_hits, 1);
        assert_eq!(stats.blob_fetches, 3);

        let ids = ChainId::for_diff_ids(f.layers.iter().map(|l| &l.diff_id));
        assert_eq!(first.chain_id(), &ids[2]);
        let bottom = f.cache.metadata().get_chain(&ids[0]).unwrap().unwrap();
        assert_eq!(bottom.ref_count, 1);
        assert_eq!(bottom.parent, None);
        assert_eq!(f.cache.lease_count(&ids[2]), 2);
        drop(first);
        drop(second);
        assert_eq!(f.cache.lease_count(&ids[2]), 0);
    }

    #[tokio::test]
    async fn shared_prefix_reuses_chains() {
        let f = three_layers();
        let session = Session::new("test");
        let hold = f.cache.hold().await;
        let short = f
            .cache
            .get_or_create_chain(&hold, &f.layers[..2], &f.provider, &session)
            .await
            .unwrap();
        let long = f
            .cache
            .get_or_create_chain(&hold, &f.layers, &f.provider, &session)
            .await
            .unwrap();
        assert_ne!(short.chain_id(), long.chain_id());
        assert_eq!(f.cache.stats().chain_applies, 3);
        assert_eq!(f.provider.fetches.lock().len(), 3);
        assert_eq!(long.record().parent.as_ref(), Some(short.chain_id()));
    }

    fn image_record(name: &ImageName, cache_ref: &CacheRef) -> ImageRecord {
        ImageRecord {
            name: name.to_string(),
            manifest_digest: ContentDigest::from_content(b"manifest"),
            index_digest: None,
            config_digest: ContentDigest::from_content(b"config"),
            chain_id: cache_ref.chain_id().clone(),
            size: cache_ref.size(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_builds_converge() {
        let f = Arc::new(three_layers());
        let session = Session::new("test");
        let name: ImageName = "docker.io/library/test:latest".parse().unwrap();
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let (f, session, name) = (f.clone(), session.clone(), name.clone());
                tokio::spawn(async move {
                    let hold = f.cache.hold().await;
                    let cache_ref = f
                        .cache
                        .get_or_create_chain(&hold, &f.layers, &f.provider, &session)
                        .await?;
                    f.cache
                        .pin_image(&hold, &name, image_record(&name, &cache_ref))?;
                    Ok::<_, ImageError>((cache_ref.chain_id().clone(), cache_ref.size()))
                })
            })
            .collect();
        let mut results = vec![];
        for task in tasks {
            results.push(task.await.unwrap().unwrap());
        }
        results.dedup();
        assert_eq!(results.len(), 1);
        assert_eq!(f.cache.stats().chain_applies, 3);
        assert_eq!(f.provider.fetches.lock().len(), 3);

        let top = f.cache.metadata().get_chain(&results[0].0).unwrap().unwrap();
        assert_eq!(top.ref_count, 1);
        assert!(f.cache.unpin_image(&name).await.unwrap());
        let report = f.cache.gc().await.unwrap();
        assert_eq!(report.chains_removed.len(), 3);
        assert_eq!(f.cache.disk_usage().unwrap(), DiskUsage::default());
    }

    #[tokio::test]
    async fn unreadable_layer_records_nothing() {
        let f = fixture(vec![
            tar_of(&[("etc/os-release", 300)]),
            crate::snapshot::tar::garbled_layer(),
        ]);
        let session = Session::new("test");
        let hold = f.cache.hold().await;
        for _ in 0..2 {
            let result = f
                .cache
                .get_or_create_chain(&hold, &f.layers, &f.provider, &session)
                .await;
            assert!(matches!(result, Err(ImageError::Storage(_))));
        }
        let ids = ChainId::for_diff_ids(f.layers.iter().map(|l| &l.diff_id));
        assert!(f.cache.metadata().get_chain(&ids[0]).unwrap().is_some());
        assert!(f.cache.metadata().get_chain(&ids[1]).unwrap().is_none());
        assert_eq!(f.cache.stats().chain_hits, 0);
        assert_eq!(f.cache.stats().chain_applies, 1);
    }

    #[tokio::test]
    async fn wrong_diff_id_records_nothing() {
        let mut f = three_layers();
        f.layers[1].diff_id = ContentDigest::from_content(b"something else");
        let session = Session::new("test");
        let hold = f.cache.hold().await;
        let result = f
            .cache
            .get_or_create_chain(&hold, &f.layers, &f.provider, &session)
            .await;
        assert!(matches!(
            result,
            Err(ImageError::ContentDigestMismatch { .. })
        ));
        assert_eq!(f.cache.metadata().list_chains().unwrap().len(), 1);
        assert!(f.cache.storage().list_temp().unwrap().is_empty());
    }

    #[tokio::test]
    async fn interrupted_before_fetch() {
        let f = three_layers();
        let trigger = crate::session::ShutdownTrigger::new();
        let session = trigger.session("test");
        trigger.trigger();
        let hold = f.cache.hold().await;
        let result = f
            .cache
            .get_or_create_chain(&hold, &f.layers, &f.provider, &session)
            .await;
        assert!(matches!(result, Err(ImageError::Interrupted)));
        assert!(f.cache.metadata().list_chains().unwrap().is_empty());
        assert!(f.provider.fetches.lock().is_empty());
    }

    #[tokio::test]
    async fn uncompressed_layers() {
        let f = three_layers();
        let tar = tar_of(&[("hello", 12)]);
        let digest = ContentDigest::from_content(&tar);
        let provider = TestProvider {
            blobs: vec![(digest.clone(), tar.clone())].into_iter().collect(),
            fetches: Mutex::new(vec![]),
        };
        let layer = LayerDescriptor {
            blob: BlobDescriptor {
                digest: digest.clone(),
                size: tar.len() as u64,
                media_type: media_types::OCI_LAYER_TAR.to_owned(),
            },
            diff_id: digest.clone(),
        };
        let session = Session::new("test");
        let hold = f.cache.hold().await;
        let cache_ref = f
            .cache
            .get_or_create_chain(&hold, &[layer.clone()], &provider, &session)
            .await
            .unwrap();
        assert_eq!(cache_ref.size(), tar.len() as u64);
        assert_eq!(cache_ref.chain_id().digest(), &digest);

        let zstd = LayerDescriptor {
            blob: BlobDescriptor {
                media_type: "application/vnd.oci.image.layer.v1.tar+zstd".to_owned(),
                ..layer.blob
            },
            diff_id: ContentDigest::from_content(b"zstd"),
        };
        assert!(matches!(
            f.cache
                .get_or_create_chain(&hold, &[zstd], &provider, &session)
                .await,
            Err(ImageError::UnsupportedLayerType(_))
        ));
    }

    #[tokio::test]
    async fn gc_keeps_pinned_and_leased_chains() {
        let f = three_layers();
        let session = Session::new("test");
        let name: ImageName = "docker.io/library/test:latest".parse().unwrap();
        let leased = {
            let hold = f.cache.hold().await;
            let cache_ref = f
                .cache
                .get_or_create_chain(&hold, &f.layers, &f.provider, &session)
                .await
                .unwrap();
            let manifest = f.cache.storage().insert(b"{}", None).await.unwrap();
            f.cache
                .pin_image(
                    &hold,
                    &name,
                    ImageRecord {
                        name: name.to_string(),
                        manifest_digest: manifest.digest.clone(),
                        index_digest: None,
                        config_digest: manifest.digest,
                        chain_id: cache_ref.chain_id().clone(),
                        size: cache_ref.size(),
                    },
                )
                .unwrap();
            f.cache
                .get_or_create_chain(&hold, &f.layers[..1], &f.provider, &session)
                .await
                .unwrap()
        };
        f.cache.storage().insert(b"orphan", None).await.unwrap();

        let report = f.cache.gc().await.unwrap();
        assert!(report.chains_removed.is_empty());
        assert_eq!(report.blobs_removed, 1);
        assert_eq!(report.bytes_freed, 6);
        let usage = f.cache.disk_usage().unwrap();
        assert_eq!(usage.chains, 3);
        assert_eq!(usage.images, 1);
        // compressed and uncompressed per layer, plus the manifest
        assert_eq!(usage.blobs, 7);

        assert!(f.cache.unpin_image(&name).await.unwrap());
        assert!(!f.cache.unpin_image(&name).await.unwrap());
        let report = f.cache.gc().await.unwrap();
        assert_eq!(report.chains_removed.len(), 2);
        assert_eq!(f.cache.disk_usage().unwrap().chains, 1);

        drop(leased);
        let report = f.cache.gc().await.unwrap();
        assert_eq!(report.chains_removed.len(), 1);
        let usage = f.cache.disk_usage().unwrap();
        assert_eq!(usage, DiskUsage::default());
    }

    #[tokio::test]
    async fn gc_removes_temp_files_of_dead_processes() {
        let f = three_layers();
        let tmp = f.cache.storage().path().join("tmp");
        std::fs::create_dir_all(&tmp).unwrap();
        let dead = tmp.join(format!("{}-{:016x}.tmp", i32::MAX, 1));
        let ours = tmp.join(format!("{}-{:016x}.tmp", std::process::id(), 2));
        std::fs::write(&dead, b"partial").unwrap();
        std::fs::write(&ours, b"in progress").unwrap();
        let report = f.cache.gc().await.unwrap();
        assert_eq!(report.temp_files_removed, 1);
        assert!(!dead.exists());
        assert!(ours.exists());
    }

    #[tokio::test]
    async fn materialized_snapshot() {
        let f = three_layers();
        let session = Session::new("test");
        f.cache.backend().start().await.unwrap();
        let hold = f.cache.hold().await;
        let cache_ref = f
            .cache
            .get_or_create_chain(&hold, &f.layers, &f.provider, &session)
            .await
            .unwrap();
        let snapshot = f.cache.materialize(&cache_ref).await.unwrap();
        assert_eq!(snapshot.id(), cache_ref.chain_id());
        assert_eq!(snapshot.size(), cache_ref.size());
        assert_eq!(
            snapshot.read_file(Path::new("etc/motd")).await.unwrap().len(),
            4000
        );
        assert_eq!(
            snapshot.stat(Path::new("bin/busybox")).await.unwrap().st_size,
            70000
        );
        let mount = snapshot.mount().id;
        assert_eq!(f.cache.backend().active_mounts().await, vec![mount]);
        assert!(snapshot.release().await.unwrap());
        assert!(f.cache.backend().active_mounts().await.is_empty());
        f.cache.backend().stop().await.unwrap();
    }
}

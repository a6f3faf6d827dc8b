//! Snapshot backends: mounted, writable views of a layer chain
//!
//! The only backend is [UnprivilegedSnapshotter], a user-space overlay that
//! needs no special capabilities. Its mounts live inside a mount server task
//! which must be started before mounting and stopped when done.

mod server;
pub mod tar;
pub mod vfs;

use crate::{
    cache::ChainId,
    config::Config,
    errors::{SnapshotError, VFSError},
    image::ContentDigest,
    storage::FileStorage,
};
use async_trait::async_trait;
use server::{FsOp, MountServer, Request};
use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};
use tokio::{
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
};
use vfs::{DirEntry, FileContent, FileStat, Filesystem, FollowLinks};

/// Which snapshot backend to construct
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum BackendKind {
    /// User-space overlay, no privileges required
    Unprivileged,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Unprivileged => f.write_str("unprivileged"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unprivileged" => Ok(BackendKind::Unprivileged),
            other => Err(format!("unknown snapshot backend {:?}", other)),
        }
    }
}

/// Identifies one mount for as long as its backend is running
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct MountId(u64);

impl fmt::Display for MountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mount-{}", self.0)
    }
}

/// One layer of a chain being mounted, bottom first
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SnapshotLayer {
    pub chain_id: ChainId,
    pub diff_id: ContentDigest,
}

/// A mounted view of a chain
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MountHandle {
    pub id: MountId,
    pub chain: ChainId,
}

/// Mount lifecycle and file access for a snapshot backend
#[async_trait]
pub trait Snapshotter: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn is_running(&self) -> bool;

    /// Start the mount server, must happen before any mount
    async fn start(&self) -> Result<(), SnapshotError>;

    /// Unmount everything and stop the server
    ///
    /// Returns false without doing anything if the server wasn't running.
    async fn stop(&self) -> Result<bool, SnapshotError>;

    /// Mount a chain, given every layer from the bottom up
    async fn mount(&self, layers: Vec<SnapshotLayer>) -> Result<MountHandle, SnapshotError>;

    /// Tear down a mount
    ///
    /// Returns false if the mount wasn't active, which includes mounts that
    /// never completed and mounts already torn down by [Snapshotter::stop].
    async fn unmount(&self, mount: &MountHandle) -> Result<bool, SnapshotError>;

    async fn active_mounts(&self) -> Vec<MountId>;

    /// Metadata for a path, without following a final symlink
    async fn stat(&self, mount: &MountHandle, path: &Path) -> Result<FileStat, SnapshotError>;

    async fn read_dir(&self, mount: &MountHandle, path: &Path) -> Result<Vec<DirEntry>, SnapshotError>;

    async fn read_file(&self, mount: &MountHandle, path: &Path) -> Result<Vec<u8>, SnapshotError>;

    async fn read_link(&self, mount: &MountHandle, path: &Path) -> Result<PathBuf, SnapshotError>;

    /// Replace a file in this mount's writable top
    async fn write_file(
        &self,
        mount: &MountHandle,
        path: &Path,
        data: Vec<u8>,
    ) -> Result<(), SnapshotError>;

    /// Remove a path from this mount only
    async fn remove(&self, mount: &MountHandle, path: &Path) -> Result<(), SnapshotError>;
}

/// Construct a snapshot backend
pub fn new_backend(kind: BackendKind, config: &Config) -> Arc<dyn Snapshotter> {
    match kind {
        BackendKind::Unprivileged => Arc::new(UnprivilegedSnapshotter::new(FileStorage::new(
            config.state_dir.clone(),
        ))),
    }
}

enum ServerState {
    Idle,
    Running {
        sender: mpsc::Sender<Request>,
        task: JoinHandle<()>,
    },
}

/// User-space overlay backend
///
/// Layers are applied into a copy-on-write in-memory tree whose regular
/// files point back into the layer archives in the content store. The
/// server can be started again after it stops.
pub struct UnprivilegedSnapshotter {
    storage: FileStorage,
    state: Mutex<ServerState>,
    running: AtomicBool,
    next_mount: AtomicU64,
}

impl UnprivilegedSnapshotter {
    pub fn new(storage: FileStorage) -> Self {
        UnprivilegedSnapshotter {
            storage,
            state: Mutex::new(ServerState::Idle),
            running: AtomicBool::new(false),
            next_mount: AtomicU64::new(1),
        }
    }

    async fn sender(&self) -> Result<mpsc::Sender<Request>, SnapshotError> {
        match &*self.state.lock().await {
            ServerState::Running { sender, .. } => Ok(sender.clone()),
            ServerState::Idle => Err(SnapshotError::NotStarted),
        }
    }

    async fn request<T, F>(&self, make_request: F) -> Result<T, SnapshotError>
    where
        T: Send,
        F: FnOnce(oneshot::Sender<T>) -> Request + Send,
    {
        let sender = self.sender().await?;
        let (reply, receiver) = oneshot::channel();
        sender
            .send(make_request(reply))
            .await
            .map_err(|_| SnapshotError::ServerStopped)?;
        receiver.await.map_err(|_| SnapshotError::ServerStopped)
    }

    /// Run a closure against a mount's filesystem inside the server task
    async fn with_mount<T, F>(&self, mount: &MountHandle, f: F) -> Result<T, SnapshotError>
    where
        T: Send + 'static,
        F: FnOnce(&FileStorage, &mut Filesystem) -> Result<T, SnapshotError> + Send + 'static,
    {
        let id = mount.id;
        self.request(move |reply| {
            let op: FsOp = Box::new(move |target| {
                let result = match target {
                    Some((storage, fs)) => f(storage, fs),
                    None => Err(SnapshotError::UnknownMount(id)),
                };
                let _ = reply.send(result);
            });
            Request::Fs { id, op }
        })
        .await?
    }
}

#[async_trait]
impl Snapshotter for UnprivilegedSnapshotter {
    fn kind(&self) -> BackendKind {
        BackendKind::Unprivileged
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn start(&self) -> Result<(), SnapshotError> {
        let mut state = self.state.lock().await;
        if let ServerState::Running { .. } = &*state {
            return Err(SnapshotError::AlreadyRunning);
        }
        let (sender, receiver) = mpsc::channel(64);
        let task = MountServer::new(self.storage.clone(), receiver).task();
        *state = ServerState::Running { sender, task };
        self.running.store(true, Ordering::SeqCst);
        log::info!("mount server started");
        Ok(())
    }

    async fn stop(&self) -> Result<bool, SnapshotError> {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, ServerState::Idle) {
            ServerState::Idle => Ok(false),
            ServerState::Running { sender, task } => {
                self.running.store(false, Ordering::SeqCst);
                let (reply, receiver) = oneshot::channel();
                let unmounted = match sender.send(Request::Shutdown { reply }).await {
                    Ok(()) => receiver.await.unwrap_or_default(),
                    Err(_) => vec![],
                };
                drop(sender);
                task.await?;
                log::info!(
                    "mount server stopped, {} active mounts torn down",
                    unmounted.len()
                );
                Ok(true)
            }
        }
    }

    async fn mount(&self, layers: Vec<SnapshotLayer>) -> Result<MountHandle, SnapshotError> {
        let chain = layers
            .last()
            .map(|layer| layer.chain_id.clone())
            .ok_or(SnapshotError::VFS(VFSError::NotFound))?;
        let id = MountId(self.next_mount.fetch_add(1, Ordering::SeqCst));
        self.request(|reply| Request::Mount { id, layers, reply })
            .await??;
        Ok(MountHandle { id, chain })
    }

    async fn unmount(&self, mount: &MountHandle) -> Result<bool, SnapshotError> {
        let id = mount.id;
        match self.request(|reply| Request::Unmount { id, reply }).await {
            Ok(existed) => Ok(existed),
            Err(SnapshotError::NotStarted) | Err(SnapshotError::ServerStopped) => Ok(false),
            Err(other) => Err(other),
        }
    }

    async fn active_mounts(&self) -> Vec<MountId> {
        self.request(|reply| Request::Active { reply })
            .await
            .unwrap_or_default()
    }

    async fn stat(&self, mount: &MountHandle, path: &Path) -> Result<FileStat, SnapshotError> {
        let path = path.to_path_buf();
        self.with_mount(mount, move |_, fs| Ok(fs.stat(&path, FollowLinks::NoFollow)?))
            .await
    }

    async fn read_dir(&self, mount: &MountHandle, path: &Path) -> Result<Vec<DirEntry>, SnapshotError> {
        let path = path.to_path_buf();
        self.with_mount(mount, move |_, fs| Ok(fs.read_dir(&path)?)).await
    }

    async fn read_file(&self, mount: &MountHandle, path: &Path) -> Result<Vec<u8>, SnapshotError> {
        let path = path.to_path_buf();
        self.with_mount(mount, move |storage, fs| {
            Ok(match fs.file_content(&path)? {
                FileContent::Empty => vec![],
                FileContent::Data(data) => data.as_ref().clone(),
                FileContent::Layer { blob, range } => {
                    let map = storage.mmap(&blob)?.ok_or(VFSError::ImageStorageError)?;
                    map.get(range.start as usize..range.end as usize)
                        .ok_or(VFSError::ImageStorageError)?
                        .to_vec()
                }
            })
        })
        .await
    }

    async fn read_link(&self, mount: &MountHandle, path: &Path) -> Result<PathBuf, SnapshotError> {
        let path = path.to_path_buf();
        self.with_mount(mount, move |_, fs| Ok(fs.readlink(&path)?)).await
    }

    async fn write_file(
        &self,
        mount: &MountHandle,
        path: &Path,
        data: Vec<u8>,
    ) -> Result<(), SnapshotError> {
        let path = path.to_path_buf();
        self.with_mount(mount, move |_, fs| Ok(fs.writer().write_data_file(&path, data)?))
            .await
    }

    async fn remove(&self, mount: &MountHandle, path: &Path) -> Result<(), SnapshotError> {
        let path = path.to_path_buf();
        self.with_mount(mount, move |_, fs| Ok(fs.writer().remove(&path)?))
            .await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    async fn one_layer(storage: &FileStorage, path: &str, data: &str) -> Vec<SnapshotLayer> {
        let mut builder = ::tar::Builder::new(Vec::new());
        let mut header = ::tar::Header::new_gnu();
        header.set_mode(0o644);
        header.set_size(data.len() as u64);
        header.set_cksum();
        builder.append_data(&mut header, path, data.as_bytes()).unwrap();
        let archive = builder.into_inner().unwrap();
        let diff_id = storage.insert(&archive, None).await.unwrap().digest;
        vec![SnapshotLayer {
            chain_id: ChainId::next(None, &diff_id),
            diff_id,
        }]
    }

    #[tokio::test]
    async fn lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().to_path_buf());
        let backend = UnprivilegedSnapshotter::new(storage.clone());
        let layers = one_layer(&storage, "hello", "world").await;

        assert!(matches!(
            backend.mount(layers.clone()).await,
            Err(SnapshotError::NotStarted)
        ));
        assert!(!backend.stop().await.unwrap());

        backend.start().await.unwrap();
        assert!(backend.is_running());
        assert!(matches!(
            backend.start().await,
            Err(SnapshotError::AlreadyRunning)
        ));
        let a = backend.mount(layers.clone()).await.unwrap();
        let b = backend.mount(layers).await.unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(backend.active_mounts().await, vec![a.id, b.id]);
        assert!(backend.unmount(&a).await.unwrap());
        assert!(!backend.unmount(&a).await.unwrap());

        assert!(backend.stop().await.unwrap());
        assert!(!backend.is_running());
        assert!(backend.active_mounts().await.is_empty());
        assert!(!backend.unmount(&b).await.unwrap());
        assert!(!backend.stop().await.unwrap());

        // Restartable, with no mounts carried over
        backend.start().await.unwrap();
        assert!(backend.active_mounts().await.is_empty());
        assert!(backend.stop().await.unwrap());
    }

    #[tokio::test]
    async fn mounts_have_private_writable_tops() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().to_path_buf());
        let backend = UnprivilegedSnapshotter::new(storage.clone());
        let layers = one_layer(&storage, "etc/motd", "lower").await;
        backend.start().await.unwrap();
        let a = backend.mount(layers.clone()).await.unwrap();
        let b = backend.mount(layers).await.unwrap();

        backend
            .write_file(&a, Path::new("etc/motd"), b"changed".to_vec())
            .await
            .unwrap();
        backend.remove(&a, Path::new("etc")).await.unwrap();
        backend
            .write_file(&a, Path::new("new"), b"only a".to_vec())
            .await
            .unwrap();

        assert_eq!(backend.read_file(&b, Path::new("etc/motd")).await.unwrap(), b"lower");
        assert!(backend.stat(&b, Path::new("new")).await.is_err());
        assert_eq!(backend.read_file(&a, Path::new("new")).await.unwrap(), b"only a");
        assert!(backend.stat(&a, Path::new("etc")).await.is_err());

        let names: Vec<_> = backend
            .read_dir(&b, Path::new("/"))
            .await
            .unwrap()
            .into_iter()
            .map(|entry| entry.name)
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("etc")]);
        backend.stop().await.unwrap();
    }

    #[tokio::test]
    async fn operations_on_unknown_mounts_fail() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().to_path_buf());
        let backend = UnprivilegedSnapshotter::new(storage.clone());
        let layers = one_layer(&storage, "f", "x").await;
        backend.start().await.unwrap();
        let mount = backend.mount(layers).await.unwrap();
        backend.unmount(&mount).await.unwrap();
        assert!(matches!(
            backend.read_file(&mount, Path::new("f")).await,
            Err(SnapshotError::UnknownMount(_))
        ));
        backend.stop().await.unwrap();
    }
}

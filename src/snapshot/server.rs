use crate::{
    cache::ChainId,
    errors::{SnapshotError, VFSError},
    snapshot::{tar, vfs::Filesystem, MountId, SnapshotLayer},
    storage::FileStorage,
};
use std::collections::{BTreeMap, HashMap};
use tokio::{
    sync::{mpsc, oneshot},
    task,
    task::JoinHandle,
};

pub(crate) enum Request {
    Mount {
        id: MountId,
        layers: Vec<SnapshotLayer>,
        reply: oneshot::Sender<Result<(), SnapshotError>>,
    },
    Unmount {
        id: MountId,
        reply: oneshot::Sender<bool>,
    },
    Active {
        reply: oneshot::Sender<Vec<MountId>>,
    },
    Fs {
        id: MountId,
        op: FsOp,
    },
    Shutdown {
        reply: oneshot::Sender<Vec<MountId>>,
    },
}

/// Work to run against one mount's filesystem, inside the server task
///
/// Called with `None` if the mount isn't active.
pub(crate) type FsOp = Box<dyn FnOnce(Option<(&FileStorage, &mut Filesystem)>) + Send>;

struct Mount {
    chain: ChainId,
    fs: Filesystem,
}

/// Owns every mounted view, one task per running backend
///
/// Lower layers are built once per chain id and shared between mounts and
/// between chains with a common prefix. Each mount gets a clone of its
/// lower filesystem as a private writable top.
pub(crate) struct MountServer {
    storage: FileStorage,
    receiver: mpsc::Receiver<Request>,
    lowers: HashMap<ChainId, Filesystem>,
    mounts: BTreeMap<MountId, Mount>,
}

impl MountServer {
    pub fn new(storage: FileStorage, receiver: mpsc::Receiver<Request>) -> Self {
        MountServer {
            storage,
            receiver,
            lowers: HashMap::new(),
            mounts: BTreeMap::new(),
        }
    }

    pub fn task(mut self) -> JoinHandle<()> {
        task::spawn(async move {
            log::debug!("mount server running");
            while let Some(request) = self.receiver.recv().await {
                if !self.handle_request(request).await {
                    break;
                }
            }
            let leftover = self.unmount_all();
            if !leftover.is_empty() {
                log::warn!("mount server exiting with {} mounts still active", leftover.len());
            }
            log::debug!("mount server exited");
        })
    }

    /// Returns false once the server should exit
    async fn handle_request(&mut self, request: Request) -> bool {
        match request {
            Request::Mount { id, layers, reply } => {
                let result = self.mount(id, layers).await;
                let _ = reply.send(result);
            }
            Request::Unmount { id, reply } => {
                let existed = match self.mounts.remove(&id) {
                    Some(mount) => {
                        log::info!("unmounted {} (chain {})", id, mount.chain);
                        true
                    }
                    None => {
                        log::debug!("unmount {} ignored, not active", id);
                        false
                    }
                };
                let _ = reply.send(existed);
            }
            Request::Active { reply } => {
                let _ = reply.send(self.mounts.keys().copied().collect());
            }
            Request::Fs { id, op } => {
                let storage = &self.storage;
                op(self.mounts.get_mut(&id).map(|mount| (storage, &mut mount.fs)));
            }
            Request::Shutdown { reply } => {
                let _ = reply.send(self.unmount_all());
                return false;
            }
        }
        true
    }

    fn unmount_all(&mut self) -> Vec<MountId> {
        let ids: Vec<MountId> = self.mounts.keys().copied().collect();
        for (id, mount) in std::mem::take(&mut self.mounts) {
            log::info!("unmounted {} (chain {})", id, mount.chain);
        }
        self.lowers.clear();
        ids
    }

    async fn mount(&mut self, id: MountId, layers: Vec<SnapshotLayer>) -> Result<(), SnapshotError> {
        let top = layers
            .last()
            .map(|layer| layer.chain_id.clone())
            .ok_or(SnapshotError::VFS(VFSError::NotFound))?;
        let lower = self.lower(&layers).await?;
        log::info!("mounted {} (chain {})", id, top);
        self.mounts.insert(
            id,
            Mount {
                chain: top,
                fs: lower,
            },
        );
        Ok(())
    }

    /// The read-only filesystem for a whole chain, reusing cached prefixes
    async fn lower(&mut self, layers: &[SnapshotLayer]) -> Result<Filesystem, SnapshotError> {
        let (mut fs, start) = layers
            .iter()
            .enumerate()
            .rev()
            .find_map(|(index, layer)| {
                self.lowers
                    .get(&layer.chain_id)
                    .map(|fs| (fs.clone(), index + 1))
            })
            .unwrap_or_else(|| (Filesystem::new(), 0));
        for layer in &layers[start..] {
            let storage = self.storage.clone();
            let diff = layer.diff_id.clone();
            fs = task::spawn_blocking(move || {
                let mut fs = fs;
                tar::apply_layer(&mut fs, &storage, &diff).map(|()| fs)
            })
            .await??;
            log::debug!("applied layer {} for chain {}", layer.diff_id, layer.chain_id);
            self.lowers.insert(layer.chain_id.clone(), fs.clone());
        }
        Ok(fs)
    }
}

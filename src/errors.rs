//! Error types you might see while pulling and snapshotting an image

use crate::{
    cache::ChainId,
    image::{ContentDigest, ImageName, Registry},
    snapshot::MountId,
    source::SourceKind,
};
use thiserror::Error;

/// Errors while resolving, fetching, and storing image content
#[derive(Error, Debug)]
pub enum ImageError {
    /// invalid image reference format
    #[error("invalid image reference format: {0:?}")]
    InvalidReferenceFormat(String),

    /// storage io error
    #[error("storage io error: {0}")]
    Storage(#[from] std::io::Error),

    /// json error
    #[error("json error: {0}")]
    JSON(#[from] serde_json::Error),

    /// asynchronous task failed
    #[error("asynchronous task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    /// network request error
    #[error("network request error: {0}")]
    NetworkRequest(#[from] reqwest::Error),

    /// registry server is not allowed by the current configuration
    #[error("registry server is not allowed by the current configuration: {0}")]
    RegistryNotAllowed(Registry),

    /// registry server returned an error status
    #[error("registry server returned {status} for {url}")]
    RegistryStatus { status: u16, url: String },

    /// registry server requested an unsupported type of authentication
    #[error("registry server requested an unsupported type of authentication: {0:?}")]
    UnsupportedAuthentication(String),

    /// registry server still refused access after authenticating
    #[error("registry server refused access to {0}")]
    AccessDenied(String),

    /// tar file format error
    #[error("tar file format error")]
    TARFileError,

    /// i/o errors occurred, the content digest is not valid
    #[error("i/o errors occurred, the content digest is not valid")]
    ContentDigestIOError,

    /// can't determine where to keep local state
    #[error("can't determine where to keep local state")]
    NoDefaultStateDir,

    /// unsupported manifest media type
    #[error("unsupported manifest type, {0:?}")]
    UnsupportedManifestType(String),

    /// unsupported manifest schema version
    #[error("unsupported manifest schema version {0}")]
    UnsupportedSchemaVersion(u32),

    /// manifest document is larger than we are willing to parse
    #[error("manifest is too large ({0} bytes)")]
    ManifestTooLarge(u64),

    /// no manifest in the index matches our platform
    #[error("no manifest in the index matches platform {0}")]
    NoMatchingPlatform(String),

    /// unsupported type for runtime config
    #[error("unsupported type for runtime config, {0:?}")]
    UnsupportedRuntimeConfigType(String),

    /// unsupported type for image layer
    #[error("unsupported type for image layer, {0:?}")]
    UnsupportedLayerType(String),

    /// unsupported type for rootfs in image config
    #[error("unsupported type for rootfs in image config, {0:?}")]
    UnsupportedRootFilesystemType(String),

    /// number of layers does not match the number of diff ids
    #[error("manifest lists {layers} layers but the config has {diff_ids} diff ids")]
    LayerCountMismatch { layers: usize, diff_ids: usize },

    /// image has no layers at all
    #[error("image has no layers")]
    EmptyImage,

    /// content size differs from the descriptor
    #[error("unexpected content size for {digest}, expected {expected} bytes, found {found}")]
    UnexpectedContentSize {
        digest: ContentDigest,
        expected: u64,
        found: u64,
    },

    /// calculated digest of downloaded content is not what we asked for
    #[error("calculated digest of downloaded content is not what we asked for, expected {expected}, found {found}")]
    ContentDigestMismatch {
        expected: ContentDigest,
        found: ContentDigest,
    },

    /// chain record refers to a missing parent
    #[error("chain {0} is not in the metadata store")]
    MissingChain(ChainId),

    /// shutdown was requested while waiting
    #[error("interrupted")]
    Interrupted,
}

/// Errors from the virtual filesystem layer, convertible to an errno code
#[derive(Error, Clone, Debug)]
pub enum VFSError {
    #[error("unexpected filesystem image storage error")]
    ImageStorageError,

    #[error("expected a directory, found another node type")]
    DirectoryExpected,

    #[error("expected a file, found another node type")]
    FileExpected,

    #[error("unallocated node")]
    UnallocNode,

    #[error("not found")]
    NotFound,

    #[error("can't remove or replace the root directory")]
    RootDirectory,

    #[error("too many nested path segments")]
    PathSegmentLimitExceeded,

    #[error("too many nested symbolic links")]
    SymbolicLinkLimitExceeded,

    #[error("inode reference count error")]
    INodeRefCountError,
}

impl VFSError {
    /// Convert this error to the equivalent kernel errno value
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            VFSError::ImageStorageError => libc::EIO,
            VFSError::DirectoryExpected => libc::ENOTDIR,
            VFSError::FileExpected => libc::EISDIR,
            VFSError::UnallocNode => libc::ENOENT,
            VFSError::NotFound => libc::ENOENT,
            VFSError::RootDirectory => libc::EBUSY,
            VFSError::PathSegmentLimitExceeded => libc::ENAMETOOLONG,
            VFSError::SymbolicLinkLimitExceeded => libc::ELOOP,
            VFSError::INodeRefCountError => libc::ENOMEM,
        }
    }
}

/// Errors from the snapshot backend and its mount server
#[derive(Error, Debug)]
pub enum SnapshotError {
    /// virtual filesystem error
    #[error("virtual filesystem error: {0}")]
    VFS(#[from] VFSError),

    /// error reading layer content
    #[error("layer content error: {0}")]
    Image(#[from] ImageError),

    /// mount server has not been started
    #[error("mount server has not been started")]
    NotStarted,

    /// mount server is already running
    #[error("mount server is already running")]
    AlreadyRunning,

    /// mount server stopped while a request was in flight
    #[error("mount server stopped while a request was in flight")]
    ServerStopped,

    /// no such mount
    #[error("no active mount {0}")]
    UnknownMount(MountId),

    /// task join error
    #[error("task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

/// Errors surfaced by a whole pull operation
#[derive(Error, Debug)]
pub enum PullError {
    /// the image reference could not be parsed
    #[error("invalid image reference {input:?}: {source}")]
    InvalidReference { input: String, source: ImageError },

    /// no resolver is registered for this kind of source
    #[error("no resolver registered for source kind {0:?}")]
    UnknownSourceKind(SourceKind),

    /// resolution failed before a chain was complete
    #[error("failed to resolve {reference}: {source}")]
    ResolveFailed {
        reference: ImageName,
        source: ImageError,
    },

    /// fetched content did not match its digest
    #[error("content verification failed for {reference}, expected {expected}, found {found}")]
    ContentVerificationFailed {
        reference: ImageName,
        expected: ContentDigest,
        found: ContentDigest,
    },

    /// the snapshot backend could not materialize a chain
    #[error("failed to snapshot chain {chain}: {source}")]
    SnapshotFailed { chain: ChainId, source: SnapshotError },

    /// the snapshot backend could not be started or stopped
    #[error("snapshot backend lifecycle error: {0}")]
    BackendLifecycle(SnapshotError),

    /// shutdown was requested before the pull finished
    #[error("interrupted")]
    Interrupted,

    /// local state could not be read or written
    #[error("local storage error: {0}")]
    Storage(ImageError),
}

impl PullError {
    /// Attach a reference to an error from resolving it
    ///
    /// Digest mismatches and interruptions keep their own kinds.
    pub fn resolving(reference: &ImageName, err: ImageError) -> Self {
        match err {
            ImageError::ContentDigestMismatch { expected, found } => {
                PullError::ContentVerificationFailed {
                    reference: reference.clone(),
                    expected,
                    found,
                }
            }
            ImageError::Interrupted => PullError::Interrupted,
            source => PullError::ResolveFailed {
                reference: reference.clone(),
                source,
            },
        }
    }

    /// Attach a chain id to an error from materializing it
    pub fn snapshotting(chain: &ChainId, err: SnapshotError) -> Self {
        match err {
            SnapshotError::Image(ImageError::Interrupted) => PullError::Interrupted,
            source => PullError::SnapshotFailed {
                chain: chain.clone(),
                source,
            },
        }
    }
}

//! Manifest, index, and runtime config documents
//!
//! Docker schema 2 and OCI image documents share a shape closely enough to
//! parse with the same structs; the media type tells them apart.
//!
//! Reference: <https://docs.docker.com/registry/spec/manifest-v2-2/> and
//! <https://github.com/opencontainers/image-spec>

use crate::{config::Platform, errors::ImageError, image::ContentDigest};

pub mod media_types {
    pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const DOCKER_MANIFEST_LIST: &str =
        "application/vnd.docker.distribution.manifest.list.v2+json";
    pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

    pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
    pub const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";

    pub const DOCKER_LAYER_TAR_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
    pub const DOCKER_LAYER_TAR: &str = "application/vnd.docker.image.rootfs.diff.tar";
    pub const OCI_LAYER_TAR_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
    pub const OCI_LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";

    /// Value of the `Accept` header on manifest requests
    pub const ACCEPT_MANIFESTS: &str = concat!(
        "application/vnd.docker.distribution.manifest.v2+json, ",
        "application/vnd.docker.distribution.manifest.list.v2+json, ",
        "application/vnd.oci.image.manifest.v1+json, ",
        "application/vnd.oci.image.index.v1+json"
    );
}

/// Refuse to parse manifests larger than this
pub const MAX_MANIFEST_SIZE: u64 = 4 * 1024 * 1024;

pub const FS_TYPE: &str = "layers";

/// Reference to another piece of content, with its expected size
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub size: u64,
    pub digest: ContentDigest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<DescriptorPlatform>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DescriptorPlatform {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// A single-platform image manifest
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Manifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

/// A manifest list or OCI index, one manifest per platform
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ManifestIndex {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub manifests: Vec<Descriptor>,
}

#[derive(Clone, Debug)]
pub enum ManifestDocument {
    Image(Manifest),
    Index(ManifestIndex),
}

#[derive(Deserialize)]
struct DocumentShape {
    #[serde(rename = "schemaVersion", default)]
    schema_version: Option<u32>,
    #[serde(rename = "mediaType", default)]
    media_type: Option<String>,
    #[serde(default)]
    manifests: Option<serde::de::IgnoredAny>,
}

impl ManifestDocument {
    /// Parse a manifest or index, given the `Content-Type` it was served with
    ///
    /// A `mediaType` inside the document wins over the header. Documents
    /// with neither are recognized by whether they list `manifests`.
    pub fn parse(content_type: Option<&str>, bytes: &[u8]) -> Result<Self, ImageError> {
        if bytes.len() as u64 > MAX_MANIFEST_SIZE {
            return Err(ImageError::ManifestTooLarge(bytes.len() as u64));
        }
        log::trace!("raw json manifest, {}", String::from_utf8_lossy(bytes));
        let shape: DocumentShape = serde_json::from_slice(bytes)?;
        match shape.schema_version {
            Some(2) => (),
            Some(other) => return Err(ImageError::UnsupportedSchemaVersion(other)),
            None => return Err(ImageError::UnsupportedSchemaVersion(0)),
        }
        let media_type = shape.media_type.or_else(|| {
            content_type
                .map(|value| value.split(';').next().unwrap_or("").trim().to_owned())
                .filter(|value| is_manifest_type(value))
        });
        let is_index = match media_type.as_deref() {
            Some(media_types::DOCKER_MANIFEST_LIST) | Some(media_types::OCI_INDEX) => true,
            Some(media_types::DOCKER_MANIFEST) | Some(media_types::OCI_MANIFEST) => false,
            Some(other) => return Err(ImageError::UnsupportedManifestType(other.to_owned())),
            None => shape.manifests.is_some(),
        };
        if is_index {
            Ok(ManifestDocument::Index(serde_json::from_slice(bytes)?))
        } else {
            let manifest: Manifest = serde_json::from_slice(bytes)?;
            manifest.validate()?;
            Ok(ManifestDocument::Image(manifest))
        }
    }
}

fn is_manifest_type(media_type: &str) -> bool {
    matches!(
        media_type,
        media_types::DOCKER_MANIFEST
            | media_types::DOCKER_MANIFEST_LIST
            | media_types::OCI_MANIFEST
            | media_types::OCI_INDEX
    )
}

impl Manifest {
    /// Check the parts of the manifest we rely on
    pub fn validate(&self) -> Result<(), ImageError> {
        if self.schema_version != 2 {
            return Err(ImageError::UnsupportedSchemaVersion(self.schema_version));
        }
        match self.config.media_type.as_str() {
            media_types::DOCKER_CONFIG | media_types::OCI_CONFIG => (),
            other => return Err(ImageError::UnsupportedRuntimeConfigType(other.to_owned())),
        }
        if self.config.size == 0 {
            return Err(ImageError::UnsupportedRuntimeConfigType(
                "empty config".to_owned(),
            ));
        }
        if self.layers.is_empty() {
            return Err(ImageError::EmptyImage);
        }
        Ok(())
    }
}

impl ManifestIndex {
    /// Choose the manifest for a platform
    ///
    /// The os and architecture must match. An exact variant match is
    /// preferred; entries without a variant are accepted for any variant,
    /// and with no variant requested the first os/architecture match wins.
    pub fn select(&self, platform: &Platform) -> Result<&Descriptor, ImageError> {
        let candidates: Vec<(&Descriptor, &DescriptorPlatform)> = self
            .manifests
            .iter()
            .filter(|descriptor| is_manifest_type(&descriptor.media_type))
            .filter_map(|descriptor| descriptor.platform.as_ref().map(|p| (descriptor, p)))
            .filter(|(_, p)| p.os == platform.os && p.architecture == platform.architecture)
            .collect();
        let exact = candidates
            .iter()
            .find(|(_, p)| p.variant == platform.variant);
        let fallback = candidates.iter().find(|(_, p)| {
            platform.variant.is_none() || p.variant.is_none()
        });
        match exact.or(fallback) {
            Some(&(descriptor, p)) => {
                log::debug!(
                    "selected {} for {}/{}{}",
                    descriptor.digest,
                    p.os,
                    p.architecture,
                    p.variant
                        .as_ref()
                        .map(|v| format!("/{}", v))
                        .unwrap_or_default()
                );
                Ok(descriptor)
            }
            None => Err(ImageError::NoMatchingPlatform(platform.to_string())),
        }
    }
}

/// The parts of an image config blob that describe its filesystem
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ImageConfig>,
    pub rootfs: RootFilesystem,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ImageConfig {
    #[serde(rename = "User", default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(rename = "Env", default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    #[serde(rename = "Cmd", default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(rename = "WorkingDir", default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(rename = "Entrypoint", default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RootFilesystem {
    #[serde(rename = "type")]
    pub fs_type: String,
    pub diff_ids: Vec<ContentDigest>,
}

impl RuntimeConfig {
    pub fn parse(bytes: &[u8]) -> Result<Self, ImageError> {
        log::trace!("raw json runtime config, {}", String::from_utf8_lossy(bytes));
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Uncompressed layer digests, bottom first
    pub fn diff_ids(&self) -> Result<&[ContentDigest], ImageError> {
        if self.rootfs.fs_type != FS_TYPE {
            return Err(ImageError::UnsupportedRootFilesystemType(
                self.rootfs.fs_type.clone(),
            ));
        }
        Ok(&self.rootfs.diff_ids)
    }
}

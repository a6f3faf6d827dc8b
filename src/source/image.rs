use crate::{
    cache::{BlobDescriptor, CacheHold, CacheManager, CacheRef, LayerDescriptor, Snapshot},
    config::Config,
    errors::{ImageError, PullError},
    image::{ContentDigest, ImageName, ImageVersion, Registry, Repository},
    manifest::{Descriptor, Manifest, ManifestDocument, RuntimeConfig},
    metadata::ImageRecord,
    registry::RegistryClient,
    session::Session,
    source::{Identifier, Source, SourceInstance, SourceKind},
};
use async_trait::async_trait;
use std::sync::Arc;

/// Resolves image references against registries, through the cache
pub struct ImageSource {
    cache: Arc<CacheManager>,
    client: RegistryClient,
    config: Config,
}

/// A resolved image, leasing its top chain
pub struct ImageInstance {
    identifier: Identifier,
    reference: ImageName,
    manifest_digest: ContentDigest,
    cache_ref: CacheRef,
    cache: Arc<CacheManager>,
}

struct ResolvedManifest {
    manifest: Manifest,
    digest: ContentDigest,
    index_digest: Option<ContentDigest>,
}

impl ImageSource {
    pub fn new(config: &Config, cache: Arc<CacheManager>) -> Result<Self, ImageError> {
        Ok(ImageSource {
            client: RegistryClient::new(config)?,
            config: config.clone(),
            cache,
        })
    }

    async fn resolve_image(
        &self,
        session: &Session,
        name: &ImageName,
    ) -> Result<ImageInstance, ImageError> {
        // Everything fetched here stays unreferenced until the image is
        // pinned, so garbage collection waits for the whole resolve.
        let hold = session
            .until_shutdown(self.cache.hold())
            .await
            .ok_or(ImageError::Interrupted)?;
        let (registry, repository) = self.client.locate(name);
        let blobs = self
            .client
            .repository_blobs(registry.clone(), repository.clone());

        let resolved = self
            .resolve_manifest(session, &registry, &repository, &name.version())
            .await?;
        let manifest = &resolved.manifest;
        log::info!("{} resolved to manifest {}", name, resolved.digest);

        let config_blob = descriptor_blob(&manifest.config);
        self.cache.ensure_blob(&config_blob, &blobs, session).await?;
        let config_bytes = self
            .cache
            .storage()
            .read_blob(&config_blob.digest)
            .await?
            .ok_or(ImageError::ContentDigestIOError)?;
        let runtime_config = RuntimeConfig::parse(&config_bytes)?;
        let diff_ids = runtime_config.diff_ids()?;
        if diff_ids.len() != manifest.layers.len() {
            return Err(ImageError::LayerCountMismatch {
                layers: manifest.layers.len(),
                diff_ids: diff_ids.len(),
            });
        }

        let layers: Vec<LayerDescriptor> = manifest
            .layers
            .iter()
            .zip(diff_ids.iter())
            .map(|(descriptor, diff_id)| LayerDescriptor {
                blob: descriptor_blob(descriptor),
                diff_id: diff_id.clone(),
            })
            .collect();
        for layer in &layers {
            layer.compression()?;
        }

        let cache_ref = self
            .cache
            .get_or_create_chain(&hold, &layers, &blobs, session)
            .await?;
        self.pin(&hold, name, &resolved, &config_blob.digest, &cache_ref)?;

        Ok(ImageInstance {
            identifier: Identifier::Image(super::ImageIdentifier {
                reference: name.clone(),
            }),
            reference: name.clone(),
            manifest_digest: resolved.digest,
            cache_ref,
            cache: self.cache.clone(),
        })
    }

    fn pin(
        &self,
        hold: &CacheHold,
        name: &ImageName,
        resolved: &ResolvedManifest,
        config_digest: &ContentDigest,
        cache_ref: &CacheRef,
    ) -> Result<(), ImageError> {
        self.cache.pin_image(
            hold,
            name,
            ImageRecord {
                name: name.to_string(),
                manifest_digest: resolved.digest.clone(),
                index_digest: resolved.index_digest.clone(),
                config_digest: config_digest.clone(),
                chain_id: cache_ref.chain_id().clone(),
                size: cache_ref.size(),
            },
        )
    }

    /// Find the single-platform manifest for an image version
    async fn resolve_manifest(
        &self,
        session: &Session,
        registry: &Registry,
        repository: &Repository,
        version: &ImageVersion,
    ) -> Result<ResolvedManifest, ImageError> {
        let (document, digest) = self
            .fetch_document(session, registry, repository, version)
            .await?;
        match document {
            ManifestDocument::Image(manifest) => Ok(ResolvedManifest {
                manifest,
                digest,
                index_digest: None,
            }),
            ManifestDocument::Index(index) => {
                let selected = index.select(&self.config.platform)?;
                let version = ImageVersion::ContentDigest(selected.digest.clone());
                let (document, manifest_digest) = self
                    .fetch_document(session, registry, repository, &version)
                    .await?;
                match document {
                    ManifestDocument::Image(manifest) => Ok(ResolvedManifest {
                        manifest,
                        digest: manifest_digest,
                        index_digest: Some(digest),
                    }),
                    ManifestDocument::Index(_) => Err(ImageError::UnsupportedManifestType(
                        selected.media_type.clone(),
                    )),
                }
            }
        }
    }

    /// Load a manifest or index, from the content store when it's pinned by digest
    async fn fetch_document(
        &self,
        session: &Session,
        registry: &Registry,
        repository: &Repository,
        version: &ImageVersion,
    ) -> Result<(ManifestDocument, ContentDigest), ImageError> {
        let storage = self.cache.storage();
        if let Some(digest) = version.content_digest() {
            if let Some(bytes) = storage.read_blob(digest).await? {
                log::debug!("manifest {} is already stored", digest);
                return Ok((ManifestDocument::parse(None, &bytes)?, digest.clone()));
            }
        }
        let fetched = session
            .interruptible(self.client.fetch_manifest(registry, repository, version))
            .await?;
        let document = ManifestDocument::parse(fetched.content_type.as_deref(), &fetched.bytes)?;
        storage.insert(&fetched.bytes, Some(&fetched.digest)).await?;
        Ok((document, fetched.digest))
    }
}

fn descriptor_blob(descriptor: &Descriptor) -> BlobDescriptor {
    BlobDescriptor {
        digest: descriptor.digest.clone(),
        size: descriptor.size,
        media_type: descriptor.media_type.clone(),
    }
}

#[async_trait]
impl Source for ImageSource {
    fn kind(&self) -> SourceKind {
        SourceKind::ContainerImage
    }

    async fn resolve(
        &self,
        session: &Session,
        identifier: &Identifier,
    ) -> Result<Box<dyn SourceInstance>, PullError> {
        let Identifier::Image(image) = identifier;
        let name = image
            .reference()
            .normalize(&self.config.default_registry)
            .map_err(|source| PullError::InvalidReference {
                input: image.reference().to_string(),
                source,
            })?;
        match self.resolve_image(session, &name).await {
            Ok(instance) => Ok(Box::new(instance)),
            Err(err) => {
                log::warn!("resolving {} failed, {}", name, err);
                Err(PullError::resolving(&name, err))
            }
        }
    }
}

impl ImageInstance {
    /// The normalized name this instance was resolved from
    pub fn reference(&self) -> &ImageName {
        &self.reference
    }

    /// Digest of the single-platform manifest
    pub fn manifest_digest(&self) -> &ContentDigest {
        &self.manifest_digest
    }
}

#[async_trait]
impl SourceInstance for ImageInstance {
    fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    fn cache_ref(&self) -> &CacheRef {
        &self.cache_ref
    }

    async fn snapshot(&self, session: &Session) -> Result<Snapshot, PullError> {
        let chain = self.cache_ref.chain_id();
        match session
            .until_shutdown(self.cache.materialize(&self.cache_ref))
            .await
        {
            None => Err(PullError::Interrupted),
            Some(result) => result.map_err(|err| PullError::snapshotting(chain, err)),
        }
    }
}

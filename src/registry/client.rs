use crate::{
    cache::{BlobDescriptor, BlobProvider},
    config::Config,
    errors::ImageError,
    image::{ContentDigest, ImageName, ImageVersion, Registry, Repository},
    manifest::{media_types, MAX_MANIFEST_SIZE},
    registry::auth::Auth,
    storage::StorageWriter,
};
use async_trait::async_trait;
use reqwest::{header, StatusCode};
use tokio::io::AsyncWriteExt;

/// A manifest or index exactly as the registry served it
#[derive(Clone, Debug)]
pub struct FetchedManifest {
    pub digest: ContentDigest,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// Talks the distribution protocol to any number of registries
///
/// Clones share the same connection pool and bearer tokens.
#[derive(Clone)]
pub struct RegistryClient {
    req: reqwest::Client,
    auth: Auth,
    config: Config,
}

impl RegistryClient {
    pub fn new(config: &Config) -> Result<Self, ImageError> {
        let mut builder = reqwest::Client::builder().user_agent(config.user_agent.clone());
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(timeout) = config.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        Ok(RegistryClient {
            req: builder.build()?,
            auth: Auth::new(config.credentials.clone()),
            config: config.clone(),
        })
    }

    /// Network server and repository path for an image
    pub fn locate(&self, image: &ImageName) -> (Registry, Repository) {
        self.config.default_registry.resolve_image_name(image)
    }

    /// Blob access scoped to one repository
    pub fn repository_blobs(&self, registry: Registry, repository: Repository) -> RepositoryBlobs {
        RepositoryBlobs {
            client: self.clone(),
            registry,
            repository,
        }
    }

    fn url(registry: &Registry, repository: &Repository, kind: &str, reference: &str) -> String {
        format!(
            "{}://{}/v2/{}/{}/{}",
            registry.protocol_str(),
            registry,
            repository,
            kind,
            reference
        )
    }

    /// Send a GET, authenticating and retrying once if the registry asks
    async fn get(
        &self,
        registry: &Registry,
        url: &str,
        accept: Option<&str>,
    ) -> Result<reqwest::Response, ImageError> {
        if !self.config.is_registry_allowed(registry) {
            log::warn!("registry {} not allowed by configuration", registry);
            return Err(ImageError::RegistryNotAllowed(registry.clone()));
        }
        let mut authenticated = false;
        loop {
            let req = self.req.get(url);
            let req = match accept {
                Some(accept) => req.header(header::ACCEPT, accept),
                None => req,
            };
            let response = self.auth.include_token(registry, req).send().await?;
            let status = response.status();
            log::debug!("GET {} -> {}", url, status);

            if status == StatusCode::UNAUTHORIZED && !authenticated {
                let challenge = response
                    .headers()
                    .get(header::WWW_AUTHENTICATE)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_owned);
                match challenge {
                    Some(challenge) => {
                        self.auth
                            .authenticate_for(registry, &self.req, &challenge)
                            .await?;
                        authenticated = true;
                        continue;
                    }
                    None => return Err(ImageError::AccessDenied(url.to_owned())),
                }
            }
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(ImageError::AccessDenied(url.to_owned()));
            }
            if !status.is_success() {
                return Err(ImageError::RegistryStatus {
                    status: status.as_u16(),
                    url: url.to_owned(),
                });
            }
            return Ok(response);
        }
    }

    /// Download a manifest or index by tag or digest
    ///
    /// When the version is a digest, the received bytes must hash to it.
    pub async fn fetch_manifest(
        &self,
        registry: &Registry,
        repository: &Repository,
        version: &ImageVersion,
    ) -> Result<FetchedManifest, ImageError> {
        let url = RegistryClient::url(registry, repository, "manifests", version.as_str());
        log::info!("<{}> downloading manifest...", url);
        let mut response = self
            .get(registry, &url, Some(media_types::ACCEPT_MANIFESTS))
            .await?;
        if let Some(len) = response.content_length() {
            if len > MAX_MANIFEST_SIZE {
                return Err(ImageError::ManifestTooLarge(len));
            }
        }
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);

        let mut bytes = vec![];
        while let Some(chunk) = response.chunk().await? {
            bytes.extend_from_slice(&chunk);
            if bytes.len() as u64 > MAX_MANIFEST_SIZE {
                return Err(ImageError::ManifestTooLarge(bytes.len() as u64));
            }
        }

        let digest = ContentDigest::from_content(&bytes);
        if let Some(expected) = version.content_digest() {
            if expected != &digest {
                return Err(ImageError::ContentDigestMismatch {
                    expected: expected.clone(),
                    found: digest,
                });
            }
        }
        log::debug!("downloaded manifest {}, {} bytes", digest, bytes.len());
        Ok(FetchedManifest {
            digest,
            content_type,
            bytes,
        })
    }

    /// Stream a blob into a content store writer
    ///
    /// Stops as soon as the body runs past the descriptor's size. The digest
    /// is checked when the writer is committed.
    pub async fn fetch_blob(
        &self,
        registry: &Registry,
        repository: &Repository,
        blob: &BlobDescriptor,
        writer: &mut StorageWriter,
    ) -> Result<(), ImageError> {
        let url = RegistryClient::url(registry, repository, "blobs", blob.digest.as_str());
        log::info!("<{}> downloading {} bytes ...", url, blob.size);
        let mut response = self.get(registry, &url, None).await?;
        let mut received = 0u64;
        while let Some(chunk) = response.chunk().await? {
            received += chunk.len() as u64;
            if received > blob.size {
                break;
            }
            writer.write_all(&chunk).await?;
        }
        if received != blob.size {
            return Err(ImageError::UnexpectedContentSize {
                digest: blob.digest.clone(),
                expected: blob.size,
                found: received,
            });
        }
        log::debug!("{} downloaded, {} bytes", blob.digest, received);
        Ok(())
    }
}

/// Fetches layer blobs for one repository
#[derive(Clone)]
pub struct RepositoryBlobs {
    client: RegistryClient,
    registry: Registry,
    repository: Repository,
}

#[async_trait]
impl BlobProvider for RepositoryBlobs {
    async fn fetch_blob(
        &self,
        blob: &BlobDescriptor,
        writer: &mut StorageWriter,
    ) -> Result<(), ImageError> {
        self.client
            .fetch_blob(&self.registry, &self.repository, blob, writer)
            .await
    }
}

//! A fake registry server, and images small enough to build in memory

#![allow(dead_code)]

use flate2::{write::GzEncoder, Compression};
use rootless_pull::{
    cache::ChainId,
    image::{ContentDigest, DefaultRegistry, Registry},
    manifest::media_types,
    Config, Puller,
};
use serde_json::json;
use std::{io::Write, path::Path};
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate, Times,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// One layer, as a tar file and its compressed blob
#[derive(Clone)]
pub struct Layer {
    pub tar: Vec<u8>,
    pub blob: Vec<u8>,
    pub digest: ContentDigest,
    pub diff_id: ContentDigest,
}

impl Layer {
    pub fn gzip(files: &[(&str, &[u8])]) -> Self {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_entry_type(tar::EntryType::Regular);
            builder.append_data(&mut header, name, *data).unwrap();
        }
        let tar = builder.into_inner().unwrap();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tar).unwrap();
        let blob = encoder.finish().unwrap();
        Layer {
            digest: ContentDigest::from_content(&blob),
            diff_id: ContentDigest::from_content(&tar),
            tar,
            blob,
        }
    }
}

/// Manifest, config, and layers for one platform
pub struct TestImage {
    pub layers: Vec<Layer>,
    pub config: Vec<u8>,
    pub config_digest: ContentDigest,
    pub manifest: Vec<u8>,
    pub manifest_digest: ContentDigest,
}

impl TestImage {
    pub fn new(layers: Vec<Layer>, architecture: &str) -> Self {
        let config = serde_json::to_vec(&json!({
            "architecture": architecture,
            "os": "linux",
            "rootfs": {
                "type": "layers",
                "diff_ids": layers.iter().map(|l| l.diff_id.as_str()).collect::<Vec<_>>(),
            },
        }))
        .unwrap();
        let config_digest = ContentDigest::from_content(&config);
        let manifest = serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "mediaType": media_types::DOCKER_MANIFEST,
            "config": {
                "mediaType": media_types::DOCKER_CONFIG,
                "size": config.len(),
                "digest": config_digest.as_str(),
            },
            "layers": layers.iter().map(|l| json!({
                "mediaType": media_types::DOCKER_LAYER_TAR_GZIP,
                "size": l.blob.len(),
                "digest": l.digest.as_str(),
            })).collect::<Vec<_>>(),
        }))
        .unwrap();
        TestImage {
            manifest_digest: ContentDigest::from_content(&manifest),
            config_digest,
            config,
            manifest,
            layers,
        }
    }

    /// Two small layers, the second one adding to the first
    pub fn small(architecture: &str) -> Self {
        TestImage::new(
            vec![
                Layer::gzip(&[("hello.txt", &b"hello from the bottom layer\n"[..])]),
                Layer::gzip(&[("arch.txt", architecture.as_bytes())]),
            ],
            architecture,
        )
    }

    /// Uncompressed size of every layer together
    pub fn size(&self) -> u64 {
        self.layers.iter().map(|l| l.tar.len() as u64).sum()
    }

    pub fn chain_id(&self) -> ChainId {
        ChainId::for_diff_ids(self.layers.iter().map(|l| &l.diff_id))
            .pop()
            .unwrap()
    }

    /// Descriptor for this image inside an index
    pub fn index_entry(&self, architecture: &str) -> serde_json::Value {
        json!({
            "mediaType": media_types::DOCKER_MANIFEST,
            "size": self.manifest.len(),
            "digest": self.manifest_digest.as_str(),
            "platform": { "os": "linux", "architecture": architecture },
        })
    }
}

pub struct MockRegistry {
    pub server: MockServer,
}

impl MockRegistry {
    pub async fn start() -> Self {
        init_logging();
        MockRegistry {
            server: MockServer::start().await,
        }
    }

    pub fn registry(&self) -> Registry {
        format!("127.0.0.1:{}", self.server.address().port())
            .parse()
            .unwrap()
    }

    /// Settings that make this server the default registry
    pub fn config(&self, state_dir: &Path) -> Config {
        Config::builder()
            .state_dir(state_dir)
            .registry(&DefaultRegistry::from(self.registry()))
            .platform("linux/amd64".parse().unwrap())
            .build()
            .unwrap()
    }

    pub fn puller(&self, state_dir: &Path) -> Puller {
        Puller::new(self.config(state_dir)).unwrap()
    }

    pub async fn serve_manifest<T: Into<Times>>(
        &self,
        repository: &str,
        reference: &str,
        media_type: &str,
        bytes: &[u8],
        times: T,
    ) {
        Mock::given(method("GET"))
            .and(path(format!("/v2/{}/manifests/{}", repository, reference)))
            .respond_with(ResponseTemplate::new(200).set_body_raw(bytes.to_vec(), media_type))
            .expect(times)
            .mount(&self.server)
            .await;
    }

    pub async fn serve_blob<T: Into<Times>>(
        &self,
        repository: &str,
        digest: &ContentDigest,
        bytes: &[u8],
        times: T,
    ) {
        Mock::given(method("GET"))
            .and(path(format!("/v2/{}/blobs/{}", repository, digest)))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(bytes.to_vec(), "application/octet-stream"),
            )
            .expect(times)
            .mount(&self.server)
            .await;
    }

    /// Serve an image under a tag, expecting each blob to be fetched once
    pub async fn serve_image(&self, repository: &str, tag: &str, image: &TestImage) {
        self.serve_manifest(
            repository,
            tag,
            media_types::DOCKER_MANIFEST,
            &image.manifest,
            1u64..,
        )
        .await;
        self.serve_blobs(repository, image).await;
    }

    pub async fn serve_blobs(&self, repository: &str, image: &TestImage) {
        self.serve_blob(repository, &image.config_digest, &image.config, 1u64)
            .await;
        for layer in &image.layers {
            self.serve_blob(repository, &layer.digest, &layer.blob, 1u64)
                .await;
        }
    }
}

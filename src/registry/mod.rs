//! Support for downloading manifests and blobs from a registry server

mod auth;
mod client;

pub use auth::{Credentials, NoCredentials, StaticCredentials};
pub use client::{FetchedManifest, RegistryClient, RepositoryBlobs};

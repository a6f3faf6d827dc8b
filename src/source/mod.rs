//! Pluggable resolvers from identifiers to cached content
//!
//! Each [Source] handles one [SourceKind]. The [SourceManager] is filled in
//! once at startup and only read after that.

mod image;

pub use self::image::{ImageInstance, ImageSource};

use crate::{
    cache::{CacheRef, Snapshot},
    errors::{ImageError, PullError},
    image::{DefaultRegistry, ImageName},
    session::Session,
};
use async_trait::async_trait;
use std::{collections::HashMap, fmt, sync::Arc};

/// The kinds of identifier a resolver can be registered for
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum SourceKind {
    ContainerImage,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::ContainerImage => f.write_str("container-image"),
        }
    }
}

/// Something a resolver knows how to find
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum Identifier {
    Image(ImageIdentifier),
}

impl Identifier {
    pub fn kind(&self) -> SourceKind {
        match self {
            Identifier::Image(_) => SourceKind::ContainerImage,
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Image(image) => fmt::Display::fmt(image.reference(), f),
        }
    }
}

/// A fully normalized image reference
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ImageIdentifier {
    reference: ImageName,
}

impl ImageIdentifier {
    pub fn new(name: &ImageName, defaults: &DefaultRegistry) -> Result<Self, ImageError> {
        Ok(ImageIdentifier {
            reference: name.normalize(defaults)?,
        })
    }

    pub fn reference(&self) -> &ImageName {
        &self.reference
    }
}

/// Resolves one kind of identifier
#[async_trait]
pub trait Source: Send + Sync {
    fn kind(&self) -> SourceKind;

    async fn resolve(
        &self,
        session: &Session,
        identifier: &Identifier,
    ) -> Result<Box<dyn SourceInstance>, PullError>;
}

/// The result of resolving an identifier
///
/// Holds a lease on its chain for as long as it lives.
#[async_trait]
pub trait SourceInstance: Send + Sync {
    fn identifier(&self) -> &Identifier;

    fn cache_ref(&self) -> &CacheRef;

    /// Mount the resolved chain
    async fn snapshot(&self, session: &Session) -> Result<Snapshot, PullError>;
}

/// Dispatch table from [SourceKind] to resolver
#[derive(Default)]
pub struct SourceManager {
    sources: HashMap<SourceKind, Arc<dyn Source>>,
}

impl SourceManager {
    pub fn new() -> Self {
        Default::default()
    }

    /// Register a resolver under the kind it reports
    ///
    /// Returns the resolver it replaced, if any.
    pub fn register(&mut self, source: Arc<dyn Source>) -> Option<Arc<dyn Source>> {
        let kind = source.kind();
        log::debug!("registering source for {}", kind);
        self.sources.insert(kind, source)
    }

    pub fn get(&self, kind: SourceKind) -> Option<Arc<dyn Source>> {
        self.sources.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<SourceKind> {
        self.sources.keys().copied().collect()
    }

    pub async fn resolve(
        &self,
        session: &Session,
        identifier: &Identifier,
    ) -> Result<Box<dyn SourceInstance>, PullError> {
        let kind = identifier.kind();
        match self.sources.get(&kind) {
            Some(source) => {
                log::debug!("resolving {} with the {} source", identifier, kind);
                source.resolve(session, identifier).await
            }
            None => Err(PullError::UnknownSourceKind(kind)),
        }
    }
}

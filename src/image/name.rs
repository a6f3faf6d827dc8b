use crate::{
    errors::ImageError,
    image::{ContentDigest, DefaultRegistry, ImageVersion, Registry, Repository, Tag},
};
use regex::Regex;
use std::ops::Range;

/// Parsed Docker-style image reference
///
/// A complete image name contains a [Registry], [Repository], [Tag], and
/// [ContentDigest] in that order. Only the [Repository] is mandatory.
///
/// The tag begins with `:` and the digest with `@`, but telling the optional
/// registry apart from the first repository component takes a heuristic:
/// if that component has a dot or a port number, or is exactly `localhost`,
/// it names a registry.
///
/// A name with a digest securely identifies its content. A name without one
/// is only as trustworthy as the registry we get it from.
#[derive(Clone)]
pub struct ImageName {
    serialized: String,
    registry_pos: Option<Range<usize>>,
    repository_pos: Range<usize>,
    tag_pos: Option<Range<usize>>,
    digest_pos: Option<Range<usize>>,
}

serialized_identity!(ImageName);

impl ImageName {
    pub fn as_str(&self) -> &str {
        &self.serialized
    }

    /// Parse an [ImageName] from its component pieces
    ///
    /// Fails if a component is malformed, or if the combined string would
    /// parse differently than intended (such as a registry-looking first
    /// repository component).
    pub fn from_parts(
        registry: Option<&str>,
        repository: &str,
        tag: Option<&str>,
        digest: Option<&str>,
    ) -> Result<Self, ImageError> {
        let mut combined = String::new();
        if let Some(registry) = registry {
            combined.push_str(registry);
            combined.push('/');
        }
        combined.push_str(repository);
        if let Some(tag) = tag {
            combined.push(':');
            combined.push_str(tag);
        }
        if let Some(digest) = digest {
            combined.push('@');
            combined.push_str(digest);
        }
        let parsed = ImageName::parse(&combined)?;
        if parsed.as_parts() == (registry, repository, tag, digest) {
            Ok(parsed)
        } else {
            Err(ImageError::InvalidReferenceFormat(combined))
        }
    }

    pub fn as_parts(&self) -> (Option<&str>, &str, Option<&str>, Option<&str>) {
        (
            self.registry_str(),
            self.repository_str(),
            self.tag_str(),
            self.content_digest_str(),
        )
    }

    /// The most specific available version
    ///
    /// The digest if there is one, otherwise the tag, defaulting to `latest`.
    pub fn version(&self) -> ImageVersion {
        if let Some(digest) = self.content_digest() {
            ImageVersion::ContentDigest(digest)
        } else if let Some(tag) = self.tag() {
            ImageVersion::Tag(tag)
        } else {
            ImageVersion::Tag(Tag::latest())
        }
    }

    /// Parse a [prim@str] as an [ImageName]
    pub fn parse(s: &str) -> Result<Self, ImageError> {
        lazy_static! {
            static ref HAS_REGISTRY: Regex = Regex::new(concat!(
                "^(?:",
                /* */ "(?:", // a domain with at least one dot, optional port
                /* -- */ "(?:[a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9])",
                /* -- */ "(?:\\.(?:[a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9]))+",
                /* -- */ "(?::[0-9]+)?",
                /* */ ")|(?:", // no dots, but a port number
                /* -- */ "(?:[a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9])",
                /* -- */ "(?::[0-9]+)",
                /* */ ")|(?:", // localhost
                /* -- */ "localhost(?::[0-9]+)?",
                /* */ ")",
                ")/",
            ))
            .unwrap();
            static ref WITH_REGISTRY: Regex = Regex::new(&format!(
                "^{}/{}(:{})?(@{})?$",
                Registry::regex_str(),
                Repository::regex_str(),
                Tag::regex_str(),
                ContentDigest::regex_str()
            ))
            .unwrap();
            static ref NO_REGISTRY: Regex = Regex::new(&format!(
                "^{}(:{})?(@{})?$",
                Repository::regex_str(),
                Tag::regex_str(),
                ContentDigest::regex_str()
            ))
            .unwrap();
        }
        let re: &Regex = if HAS_REGISTRY.is_match(s) {
            &WITH_REGISTRY
        } else {
            &NO_REGISTRY
        };
        let captures = re
            .captures(s)
            .ok_or_else(|| ImageError::InvalidReferenceFormat(s.to_owned()))?;
        let repository = captures
            .name("repo")
            .ok_or_else(|| ImageError::InvalidReferenceFormat(s.to_owned()))?;
        Ok(ImageName {
            serialized: s.to_owned(),
            registry_pos: captures.name("reg").map(|m| m.range()),
            repository_pos: repository.range(),
            tag_pos: captures.name("tag").map(|m| m.range()),
            digest_pos: captures.name("dig").map(|m| m.range()),
        })
    }

    pub fn registry_str(&self) -> Option<&str> {
        self.registry_pos.clone().map(|pos| &self.serialized[pos])
    }

    pub fn repository_str(&self) -> &str {
        &self.serialized[self.repository_pos.clone()]
    }

    pub fn tag_str(&self) -> Option<&str> {
        self.tag_pos.clone().map(|pos| &self.serialized[pos])
    }

    pub fn content_digest_str(&self) -> Option<&str> {
        self.digest_pos.clone().map(|pos| &self.serialized[pos])
    }

    pub fn registry(&self) -> Option<Registry> {
        self.registry_str().and_then(|s| Registry::parse(s).ok())
    }

    pub fn repository(&self) -> Repository {
        Repository::parse(self.repository_str()).expect("already parsed")
    }

    pub fn tag(&self) -> Option<Tag> {
        self.tag_str().and_then(|s| Tag::parse(s).ok())
    }

    pub fn content_digest(&self) -> Option<ContentDigest> {
        self.content_digest_str()
            .and_then(|s| ContentDigest::parse(s).ok())
    }

    /// Shorthand for [DefaultRegistry::normalize]
    pub fn normalize(&self, defaults: &DefaultRegistry) -> Result<ImageName, ImageError> {
        defaults.normalize(self)
    }

    /// A new [ImageName] which includes the content digest we actually found
    ///
    /// If the name already has a digest it must match.
    pub fn with_found_digest(&self, found_digest: &ContentDigest) -> Result<ImageName, ImageError> {
        match self.content_digest() {
            None => ImageName::from_parts(
                self.registry_str(),
                self.repository_str(),
                self.tag_str(),
                Some(found_digest.as_str()),
            ),
            Some(image_digest) if &image_digest == found_digest => Ok(self.clone()),
            Some(image_digest) => Err(ImageError::ContentDigestMismatch {
                expected: image_digest,
                found: found_digest.clone(),
            }),
        }
    }
}

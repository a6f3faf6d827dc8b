use crate::{
    errors::ImageError,
    image::{ContentDigest, Tag},
};
use std::{fmt, str::FromStr};

/// Either an image tag or a content digest
///
/// This is the part of an [crate::image::ImageName] that actually gets sent
/// to the registry: the digest when one is known, otherwise the tag.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ImageVersion {
    Tag(Tag),
    ContentDigest(ContentDigest),
}

impl ImageVersion {
    pub fn as_str(&self) -> &str {
        match self {
            ImageVersion::Tag(tag) => tag.as_str(),
            ImageVersion::ContentDigest(content_digest) => content_digest.as_str(),
        }
    }

    /// Parse a [prim@str] as an [ImageVersion]
    ///
    /// Tags can't contain colons, so anything with a colon is a digest.
    pub fn parse(s: &str) -> Result<Self, ImageError> {
        if s.contains(':') {
            Ok(ImageVersion::ContentDigest(ContentDigest::parse(s)?))
        } else {
            Ok(ImageVersion::Tag(Tag::parse(s)?))
        }
    }

    pub fn content_digest(&self) -> Option<&ContentDigest> {
        match self {
            ImageVersion::Tag(_) => None,
            ImageVersion::ContentDigest(digest) => Some(digest),
        }
    }
}

impl FromStr for ImageVersion {
    type Err = ImageError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ImageVersion::parse(s)
    }
}

impl fmt::Display for ImageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for ImageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

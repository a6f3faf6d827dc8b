use crate::errors::ImageError;
use regex::Regex;

/// A tag identifying a specific image version by name
///
/// Up to 128 characters: alphanumerics and underscores anywhere, dots and
/// dashes anywhere except the beginning.
#[derive(Clone)]
pub struct Tag {
    serialized: String,
}

serialized_identity!(Tag);

static LATEST_STR: &str = "latest";

impl Tag {
    pub fn as_str(&self) -> &str {
        &self.serialized
    }

    /// Parse a [prim@str] as a [Tag]
    pub fn parse(s: &str) -> Result<Self, ImageError> {
        lazy_static! {
            static ref RE: Regex = Regex::new(&format!("^{}$", Tag::regex_str())).unwrap();
        }
        if RE.is_match(s) {
            Ok(Tag {
                serialized: s.to_owned(),
            })
        } else {
            Err(ImageError::InvalidReferenceFormat(s.to_owned()))
        }
    }

    /// Returns the special tag `latest`
    pub fn latest() -> Self {
        Tag {
            serialized: LATEST_STR.to_owned(),
        }
    }

    pub fn is_latest(&self) -> bool {
        self.serialized == LATEST_STR
    }

    pub(crate) fn regex_str() -> &'static str {
        "(?P<tag>[a-zA-Z0-9_][a-zA-Z0-9_.-]{0,127})"
    }
}

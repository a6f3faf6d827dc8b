use crate::errors::ImageError;
use regex::Regex;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::{fmt, ops::Range};

/// A digest securely identifies the specific contents of a binary object
///
/// Digests include the hash format. Content we hash ourselves is always
/// `sha256`, but other well-formed digests still parse so they can be
/// reported in errors.
#[derive(Clone)]
pub struct ContentDigest {
    serialized: String,
    format_pos: Range<usize>,
    hex_pos: Range<usize>,
}

serialized_identity!(ContentDigest);

pub(crate) const SHA256: &str = "sha256";

impl ContentDigest {
    /// Returns a reference to the existing string representation
    ///
    /// Always a format specifier, one colon, then at least 32 lowercase
    /// hexadecimal digits.
    pub fn as_str(&self) -> &str {
        &self.serialized
    }

    /// Assemble a digest from a format name and a hex-formattable hash value
    pub fn from_parts<T: fmt::LowerHex>(
        format_part: &str,
        hex_part: &T,
    ) -> Result<Self, ImageError> {
        ContentDigest::parse(&format!("{}:{:x}", format_part, hex_part))
    }

    /// Hash some content with `sha256`
    ///
    /// ```
    /// # use rootless_pull::image::ContentDigest;
    /// let digest = ContentDigest::from_content(b"cat");
    /// assert_eq!(digest.as_str(), "sha256:77af778b51abd4a3c51c5ddd97204a9c3ae614ebccb75a606c3b6865aed6744e");
    /// ```
    pub fn from_content(content_bytes: &[u8]) -> Self {
        ContentDigest::from_hasher(Sha256::new().chain_update(content_bytes))
    }

    /// Finish a running `sha256` hash
    pub fn from_hasher(hasher: Sha256) -> Self {
        let hex = format!("{:x}", hasher.finalize());
        let serialized = format!("{}:{}", SHA256, hex);
        ContentDigest {
            format_pos: 0..SHA256.len(),
            hex_pos: (SHA256.len() + 1)..serialized.len(),
            serialized,
        }
    }

    /// Parse a [prim@str] as a [ContentDigest]
    ///
    /// ```
    /// # use rootless_pull::image::ContentDigest;
    /// let digest = ContentDigest::parse("format:00112233445566778899aabbccddeeff").unwrap();
    /// assert_eq!(digest.format_str(), "format");
    /// assert_eq!(digest.hex_str(), "00112233445566778899aabbccddeeff")
    /// ```
    pub fn parse(s: &str) -> Result<Self, ImageError> {
        lazy_static! {
            static ref RE: Regex = Regex::new(&format!("^{}$", ContentDigest::regex_str())).unwrap();
        }
        match RE.captures(s) {
            None => Err(ImageError::InvalidReferenceFormat(s.to_owned())),
            Some(captures) => Ok(ContentDigest {
                serialized: s.to_owned(),
                format_pos: captures.name("dig_f").unwrap().range(),
                hex_pos: captures.name("dig_h").unwrap().range(),
            }),
        }
    }

    /// The hash format, `sha256` for everything we can verify
    pub fn format_str(&self) -> &str {
        &self.serialized[self.format_pos.clone()]
    }

    /// The hexadecimal hash value, at least 32 digits
    pub fn hex_str(&self) -> &str {
        &self.serialized[self.hex_pos.clone()]
    }

    /// Can we check content against this digest?
    pub fn is_verifiable(&self) -> bool {
        self.format_str() == SHA256 && self.hex_str().len() == 64
    }

    pub(crate) fn regex_str() -> &'static str {
        concat!(
            "(?P<dig>",
            /*  */ "(?P<dig_f>", // format: alphanumeric components
            /* -- */ "[a-zA-Z][a-zA-Z0-9]*",
            /* -- */ "(?:[-_+.][a-zA-Z][a-zA-Z0-9]*)*",
            /*  */ ")",
            /*  */ "[:]",
            /*  */ "(?P<dig_h>[a-f0-9]{32,})",
            ")",
        )
    }
}

impl Serialize for ContentDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ContentDigest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ContentDigest::parse(&s).map_err(de::Error::custom)
    }
}

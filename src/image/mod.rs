//! Image references and content identity
//!
//! Everything here is a parsed string: the parsed value keeps its original
//! serialized form, plus the byte ranges of its components. Equality,
//! ordering and hashing all follow the serialized form.

/// Trait impls shared by every string-backed identity type in this module
macro_rules! serialized_identity {
    ($ty:ident) => {
        impl Eq for $ty {}

        impl PartialEq for $ty {
            fn eq(&self, other: &Self) -> bool {
                self.serialized.eq(&other.serialized)
            }
        }

        impl std::str::FromStr for $ty {
            type Err = crate::errors::ImageError;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $ty::parse(s)
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.serialized)
            }
        }

        impl std::fmt::Debug for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.serialized)
            }
        }

        impl std::hash::Hash for $ty {
            fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
                self.serialized.hash(state);
            }
        }

        impl Ord for $ty {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                self.serialized.cmp(&other.serialized)
            }
        }

        impl PartialOrd for $ty {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }
    };
}


#[cfg(test)] mod tests;

mod digest;
mod name;
mod registry;
mod repository;
mod tag;
mod version;

pub use digest::ContentDigest;
pub use name::ImageName;
pub use registry::{DefaultRegistry, Registry};
pub use repository::{Repository, RepositoryIter};
pub use tag::Tag;
pub use version::ImageVersion;

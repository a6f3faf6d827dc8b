use crate::{
    errors::ImageError,
    image::{ImageName, Repository},
};
use regex::Regex;
use std::ops::Range;

/// Name of a Docker-style image registry server
///
/// A domain name with an optional port. The protocol is https, except for
/// the same development-friendly heuristic Docker uses: a domain with no
/// dots in it (like `localhost:5000`) or a loopback address is reached over
/// plain http.
#[derive(Clone)]
pub struct Registry {
    serialized: String,
    domain_pos: Range<usize>,
    port: Option<u16>,
    is_https: bool,
}

serialized_identity!(Registry);

impl Registry {
    pub fn as_str(&self) -> &str {
        &self.serialized
    }

    /// Parse a [prim@str] as a [Registry]
    pub fn parse(s: &str) -> Result<Self, ImageError> {
        lazy_static! {
            static ref RE: Regex = Regex::new(&format!("^{}$", Registry::regex_str())).unwrap();
        }
        let captures = RE
            .captures(s)
            .ok_or_else(|| ImageError::InvalidReferenceFormat(s.to_owned()))?;
        let domain = captures.name("reg_d").unwrap();
        let port = match captures.name("reg_p") {
            None => None,
            Some(m) => Some(
                m.as_str()
                    .parse()
                    .map_err(|_| ImageError::InvalidReferenceFormat(s.to_owned()))?,
            ),
        };
        Ok(Registry {
            serialized: s.to_owned(),
            domain_pos: domain.range(),
            is_https: domain.as_str().contains('.') && !is_loopback(domain.as_str()),
            port,
        })
    }

    pub fn domain_str(&self) -> &str {
        &self.serialized[self.domain_pos.clone()]
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn is_https(&self) -> bool {
        self.is_https
    }

    /// Either "http" or "https"
    pub fn protocol_str(&self) -> &str {
        if self.is_https() {
            "https"
        } else {
            "http"
        }
    }

    pub(crate) fn regex_str() -> &'static str {
        concat!(
            "(?P<reg>",
            /*  */ "(?P<reg_d>",
            /* -- */ "(?:[a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9])",
            /* -- */ "(?:\\.(?:[a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9]))*",
            /*  */ ")",
            /*  */ "(?:[:](?P<reg_p>[0-9]+))?",
            ")",
        )
    }
}

fn is_loopback(domain: &str) -> bool {
    domain
        .parse::<std::net::Ipv4Addr>()
        .map(|addr| addr.is_loopback())
        .unwrap_or(false)
}

/// Settings for the registry used by names that don't include one
///
/// Docker Hub has a few quirks: it is known publicly as `docker.io`, served
/// from another host name, and single-component repositories live under
/// `library/`.
#[derive(Clone, Debug)]
pub struct DefaultRegistry {
    /// The name used in normalized image references
    pub canonical_name: Registry,
    /// Connect to the registry under this name
    pub network_name: Registry,
    /// Additional names that refer to the same registry
    pub also_known_as: Vec<Registry>,
    /// Prefix for repositories with only a single path component
    pub library_prefix: Option<Repository>,
}

impl From<Registry> for DefaultRegistry {
    fn from(name: Registry) -> Self {
        DefaultRegistry {
            canonical_name: name.clone(),
            network_name: name,
            also_known_as: vec![],
            library_prefix: None,
        }
    }
}

impl Default for DefaultRegistry {
    fn default() -> Self {
        DefaultRegistry {
            canonical_name: "docker.io".parse().unwrap(),
            network_name: "registry-1.docker.io".parse().unwrap(),
            also_known_as: vec!["index.docker.io".parse().unwrap()],
            library_prefix: Some("library".parse().unwrap()),
        }
    }
}

impl DefaultRegistry {
    /// Is this registry (or the lack of one) the default registry?
    pub fn is_default(&self, registry: Option<&Registry>) -> bool {
        match registry {
            None => true,
            Some(registry) => {
                registry == &self.canonical_name
                    || registry == &self.network_name
                    || self.also_known_as.contains(registry)
            }
        }
    }

    /// Complete repository path on the default registry
    fn library_repository(&self, repository: Repository) -> Repository {
        match &self.library_prefix {
            Some(prefix) if repository.is_single_component() => prefix.join(&repository),
            _ => repository,
        }
    }

    /// Fill in the registry, library prefix, and `latest` tag
    ///
    /// The result always has a registry and a tag or digest. Normalizing an
    /// already normalized name returns an equal name.
    pub fn normalize(&self, image: &ImageName) -> Result<ImageName, ImageError> {
        let (registry, repository) = match image.registry() {
            Some(registry) if !self.is_default(Some(&registry)) => (registry, image.repository()),
            _ => (
                self.canonical_name.clone(),
                self.library_repository(image.repository()),
            ),
        };
        let tag = match (image.tag_str(), image.content_digest_str()) {
            (None, None) => Some("latest"),
            (tag, _) => tag,
        };
        ImageName::from_parts(
            Some(registry.as_str()),
            repository.as_str(),
            tag,
            image.content_digest_str(),
        )
    }

    /// Determine the actual network server and repository path for an image
    pub fn resolve_image_name(&self, image: &ImageName) -> (Registry, Repository) {
        match image.registry() {
            Some(registry) if !self.is_default(Some(&registry)) => (registry, image.repository()),
            _ => (
                self.network_name.clone(),
                self.library_repository(image.repository()),
            ),
        }
    }
}

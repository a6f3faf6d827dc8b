//! Settings shared by every part of the pull pipeline
//!
//! A [Config] is built once, usually through [ConfigBuilder], and passed
//! by reference from then on.

use crate::{
    errors::ImageError,
    image::{DefaultRegistry, Registry},
    registry::{Credentials, NoCredentials},
    session::DEFAULT_NAMESPACE,
    snapshot::BackendKind,
};
use std::{
    collections::HashSet,
    env, fmt,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

/// Operating system and CPU architecture that images are selected for
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    pub variant: Option<String>,
}

impl Platform {
    /// The platform we are running on, in registry vocabulary
    pub fn host() -> Self {
        let architecture = match env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            "x86" => "386",
            other => other,
        };
        Platform {
            os: env::consts::OS.to_owned(),
            architecture: architecture.to_owned(),
            variant: None,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{}", variant)?;
        }
        Ok(())
    }
}

impl FromStr for Platform {
    type Err = ImageError;

    /// Parse `os/architecture` with an optional `/variant`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(os), Some(arch), variant, None) if !os.is_empty() && !arch.is_empty() => {
                Ok(Platform {
                    os: os.to_owned(),
                    architecture: arch.to_owned(),
                    variant: variant.filter(|v| !v.is_empty()).map(str::to_owned),
                })
            }
            _ => Err(ImageError::NoMatchingPlatform(s.to_owned())),
        }
    }
}

/// Settings for a [crate::Puller] and everything it owns
#[derive(Clone)]
pub struct Config {
    pub state_dir: PathBuf,
    pub default_registry: DefaultRegistry,
    pub allowed_registries: Option<HashSet<Registry>>,
    pub allow_http_registries: bool,
    pub request_timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
    pub user_agent: String,
    pub platform: Platform,
    pub backend: BackendKind,
    pub namespace: String,
    pub credentials: Arc<dyn Credentials>,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Return the default `User-Agent` that we use if no other is set
    pub fn default_user_agent() -> String {
        concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_owned()
    }

    /// Determine a default per-user state directory
    ///
    /// Typically this returns `$HOME/.local/share/rootless-pull`, but it may
    /// return `$XDG_DATA_HOME/rootless-pull` if the per-user data directory
    /// has been set, and the location can be customized directly via the
    /// `$ROOTLESS_PULL_STATE` environment variable.
    pub fn default_state_dir() -> Result<PathBuf, ImageError> {
        if let Ok(s) = env::var("ROOTLESS_PULL_STATE") {
            return Ok(PathBuf::from(s));
        }
        let data_home = match env::var("XDG_DATA_HOME") {
            Ok(s) => PathBuf::from(s),
            Err(_) => match env::var("HOME") {
                Ok(s) => Path::new(&s).join(".local").join("share"),
                Err(_) => return Err(ImageError::NoDefaultStateDir),
            },
        };
        Ok(data_home.join("rootless-pull"))
    }

    /// Is this registry allowed by the allow-list and the http policy?
    pub fn is_registry_allowed(&self, registry: &Registry) -> bool {
        (self.allow_http_registries || registry.is_https())
            && match &self.allowed_registries {
                None => true,
                Some(allow_list) => allow_list.contains(registry),
            }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("state_dir", &self.state_dir)
            .field("default_registry", &self.default_registry)
            .field("allowed_registries", &self.allowed_registries)
            .field("allow_http_registries", &self.allow_http_registries)
            .field("request_timeout", &self.request_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("user_agent", &self.user_agent)
            .field("platform", &self.platform)
            .field("backend", &self.backend)
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

/// Builder for [Config]
pub struct ConfigBuilder {
    state_dir: Option<PathBuf>,
    default_registry: Option<DefaultRegistry>,
    allowed_registries: Option<HashSet<Registry>>,
    allow_http_registries: bool,
    request_timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
    user_agent: Option<String>,
    platform: Option<Platform>,
    backend: BackendKind,
    namespace: String,
    credentials: Arc<dyn Credentials>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        ConfigBuilder {
            state_dir: None,
            default_registry: None,
            allowed_registries: None,
            allow_http_registries: true,
            request_timeout: None,
            connect_timeout: None,
            user_agent: None,
            platform: None,
            backend: BackendKind::Unprivileged,
            namespace: DEFAULT_NAMESPACE.to_owned(),
            credentials: Arc::new(NoCredentials),
        }
    }

    /// Change the state directory
    ///
    /// This holds the content store and metadata records. Files here may be
    /// shared with other trusted processes. The default directory comes from
    /// [Config::default_state_dir()].
    pub fn state_dir(mut self, dir: &Path) -> Self {
        self.state_dir = Some(dir.to_path_buf());
        self
    }

    /// Change the default registry server
    ///
    /// This registry is used for images that do not name a server. A plain
    /// [Registry] converts into a [DefaultRegistry] with `into()`.
    pub fn registry(mut self, default_registry: &DefaultRegistry) -> Self {
        self.default_registry = Some(default_registry.clone());
        self
    }

    /// Set a list of allowed registry servers
    ///
    /// The default registry is not added to the list automatically. An empty
    /// list disallows every connection, but local content is still used.
    pub fn allow_only_connections_to(mut self, allowed: HashSet<Registry>) -> Self {
        self.allowed_registries = Some(allowed);
        self
    }

    /// Disallow connecting to registries via HTTP
    ///
    /// Names like `localhost/blah` or `dev:5000/foo` are reached over
    /// unencrypted HTTP by default, same as Docker.
    pub fn disallow_http(mut self) -> Self {
        self.allow_http_registries = false;
        self
    }

    /// Timeout for each network request, from start to the last byte
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Timeout for only the connect phase of each network request
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn user_agent(mut self, value: &str) -> Self {
        self.user_agent = Some(value.to_owned());
        self
    }

    /// Select images for a platform other than the host
    pub fn platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn backend(mut self, kind: BackendKind) -> Self {
        self.backend = kind;
        self
    }

    pub fn namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_owned();
        self
    }

    /// Source of usernames and passwords for registry logins
    pub fn credentials(mut self, credentials: Arc<dyn Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn build(self) -> Result<Config, ImageError> {
        let state_dir = match self.state_dir {
            Some(dir) => dir,
            None => Config::default_state_dir()?,
        };
        Ok(Config {
            state_dir,
            default_registry: self.default_registry.unwrap_or_default(),
            allowed_registries: self.allowed_registries,
            allow_http_registries: self.allow_http_registries,
            request_timeout: self.request_timeout,
            connect_timeout: self.connect_timeout,
            user_agent: self.user_agent.unwrap_or_else(Config::default_user_agent),
            platform: self.platform.unwrap_or_else(Platform::host),
            backend: self.backend,
            namespace: self.namespace,
            credentials: self.credentials,
        })
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        ConfigBuilder::new()
    }
}

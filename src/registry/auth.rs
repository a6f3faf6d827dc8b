use crate::{errors::ImageError, image::Registry};
use parking_lot::Mutex;
use regex::Regex;
use reqwest::{RequestBuilder, Url};
use std::{collections::HashMap, sync::Arc};

/// Source of basic credentials used when requesting registry tokens
pub trait Credentials: Send + Sync {
    /// Username and optional password for a registry, if we have a login
    fn basic_auth(&self, registry: &Registry) -> Option<(String, Option<String>)>;
}

/// Anonymous access only
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCredentials;

impl Credentials for NoCredentials {
    fn basic_auth(&self, _registry: &Registry) -> Option<(String, Option<String>)> {
        None
    }
}

#[derive(Clone)]
struct Login {
    username: String,
    password: Option<String>,
}

/// A fixed table of logins, one per registry
#[derive(Clone, Default)]
pub struct StaticCredentials {
    logins: HashMap<Registry, Login>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn login(mut self, registry: Registry, username: String, password: Option<String>) -> Self {
        self.logins.insert(registry, Login { username, password });
        self
    }
}

impl Credentials for StaticCredentials {
    fn basic_auth(&self, registry: &Registry) -> Option<(String, Option<String>)> {
        self.logins
            .get(registry)
            .map(|login| (login.username.clone(), login.password.clone()))
    }
}

/// Bearer tokens we've been issued so far, shared by clones of a client
#[derive(Clone)]
pub(crate) struct Auth {
    credentials: Arc<dyn Credentials>,
    tokens: Arc<Mutex<HashMap<Registry, Token>>>,
}

impl Auth {
    pub fn new(credentials: Arc<dyn Credentials>) -> Self {
        Auth {
            credentials,
            tokens: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn include_token(&self, registry: &Registry, req: RequestBuilder) -> RequestBuilder {
        match self.tokens.lock().get(registry) {
            Some(token_struct) => {
                log::debug!("using token for {}", registry);
                req.bearer_auth(&token_struct.token)
            }
            None => req,
        }
    }

    /// Reference: <https://docs.docker.com/registry/spec/auth/token/>
    pub async fn authenticate_for(
        &self,
        registry: &Registry,
        req: &reqwest::Client,
        auth_header: &str,
    ) -> Result<(), ImageError> {
        let challenge = BearerChallenge::parse(auth_header)?;
        log::debug!("login challenge for {}, {:?}", registry, challenge);
        let mut query = vec![];
        if let Some(service) = &challenge.service {
            query.push(("service", service.as_str()));
        }
        if let Some(scope) = &challenge.scope {
            query.push(("scope", scope.as_str()));
        }
        let req = req.get(challenge.realm.clone()).query(&query);
        let req = match self.credentials.basic_auth(registry) {
            Some((username, password)) => req.basic_auth(username, password),
            None => req,
        };
        let response: Token = req.send().await?.error_for_status()?.json().await?;
        log::debug!("received token for {}", registry);
        self.tokens.lock().insert(registry.clone(), response);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
struct BearerChallenge {
    realm: Url,
    service: Option<String>,
    scope: Option<String>,
}

#[derive(Clone, Deserialize)]
struct Token {
    #[serde(alias = "access_token")]
    token: String,
}

impl BearerChallenge {
    fn parse(auth_header: &str) -> Result<Self, ImageError> {
        lazy_static! {
            static ref RE: Regex = Regex::new(concat!(
                "^\\s*",
                "(?i:bearer)",   // Case-insensitive challenge type
                "(?:",           // multiple unordered parameters
                /* */ "\\s*",
                /* */ "(?:",     // alternative group for the parameters
                /* -- */ "(?:",  // parameter: service
                /* -- -- */ "service=",
                /* -- -- */ "\"(?P<service>",
                /* -- -- -- */ r"[\x20-\x21\x23-\x5B\x5D-\x7E]*", // allowed chars from RFC 6750
                /* -- -- */ ")\"",
                /* -- */ ")|",
                /* -- */ "(?:",  // parameter: scope
                /* -- -- */ "scope=",
                /* -- -- */ "\"(?P<scope>",
                /* -- -- -- */ r"[\x20-\x21\x23-\x5B\x5D-\x7E]*", // allowed chars from RFC 6750
                /* -- -- */ ")\"",
                /* -- */ ")|",
                /* -- */ "(?:",  // parameter: realm
                /* -- -- */ "realm=",
                /* -- -- */ "\"(?P<realm>", // capture quoted string
                /* -- -- -- */ "https?://",  // plain http only makes sense for local registries
                /* -- -- -- */ "[-_.+a-zA-Z:0-9/]+",
                /* -- -- */ ")\"",
                /* -- */ ")",
                /* */ ")",
                /* */ ",?",      // to keep the parser regular, commas are all optional *shrug*
                ")*$",
            )).unwrap();
        }
        match RE.captures(auth_header).map(|captures| {
            (
                captures.name("service").map(|m| m.as_str().to_owned()),
                captures.name("scope").map(|m| m.as_str().to_owned()),
                captures.name("realm").map(|m| m.as_str().parse::<Url>()),
            )
        }) {
            Some((service, scope, Some(Ok(realm)))) => Ok(BearerChallenge {
                realm,
                service,
                scope,
            }),
            _ => Err(ImageError::UnsupportedAuthentication(
                auth_header.to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn docker_hub_challenge() {
        let challenge = BearerChallenge::parse(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/alpine:pull""#,
        )
        .unwrap();
        assert_eq!(challenge.realm.as_str(), "https://auth.docker.io/token");
        assert_eq!(challenge.service.as_deref(), Some("registry.docker.io"));
        assert_eq!(
            challenge.scope.as_deref(),
            Some("repository:library/alpine:pull")
        );
    }

    #[test]
    fn parameters_in_any_order() {
        let challenge = BearerChallenge::parse(
            r#"bearer scope="repository:x:pull", realm="http://127.0.0.1:4000/token""#,
        )
        .unwrap();
        assert_eq!(challenge.realm.as_str(), "http://127.0.0.1:4000/token");
        assert_eq!(challenge.service, None);
    }

    #[test]
    fn unsupported_challenges() {
        for header in &[
            r#"Basic realm="registry""#,
            r#"Bearer service="registry.docker.io""#,
            r#"Bearer realm="ftp://example.com/token""#,
        ] {
            assert!(matches!(
                BearerChallenge::parse(header),
                Err(ImageError::UnsupportedAuthentication(_))
            ));
        }
    }

    #[test]
    fn static_credentials() {
        let registry: Registry = "quay.io".parse().unwrap();
        let creds = StaticCredentials::new().login(registry.clone(), "me".into(), None);
        assert_eq!(creds.basic_auth(&registry), Some(("me".to_owned(), None)));
        assert_eq!(creds.basic_auth(&"ghcr.io".parse().unwrap()), None);
        assert_eq!(NoCredentials.basic_auth(&registry), None);
    }
}

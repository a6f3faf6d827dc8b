use super::*;

#[test]
fn image_name_from_parts() {
    assert_eq!(
        ImageName::from_parts(None, "busybox", None, None)
            .unwrap()
            .as_parts(),
        (None, "busybox", None, None)
    );
    assert!(ImageName::from_parts(None, "localhost", None, None).is_ok());
    assert!(ImageName::from_parts(None, "localhost/busybox", None, None).is_err());
    assert!(ImageName::from_parts(None, "library/busybox", None, None).is_ok());
    assert!(ImageName::from_parts(None, "library:42/busybox", None, None).is_err());
    assert!(ImageName::from_parts(Some("library:42"), "busybox", None, None).is_ok());
}

#[test]
fn parse_image_name() {
    assert!(ImageName::parse("alpine").is_ok());
    assert!(ImageName::parse("alpine/").is_err());
    assert!(ImageName::parse("/alpine").is_err());
    assert!(ImageName::parse("").is_err());
    assert!(ImageName::parse(" alpine").is_err());
    assert!(ImageName::parse("-alpine").is_err());
    assert!(ImageName::parse("alpine:").is_err());
    assert!(ImageName::parse("Alpine").is_err());
    assert!(ImageName::parse("quay.io/a/b//c").is_err());
    assert!(ImageName::parse("quay.io:/a").is_err());
    assert!(ImageName::parse("quay.io:443/a").is_ok());
    assert_eq!(
        ImageName::parse("quay.io/coreos/etcd:v3.5.0").unwrap().as_parts(),
        (Some("quay.io"), "coreos/etcd", Some("v3.5.0"), None)
    );

    let p = ImageName::parse("alpine:3.18@sha256:00112233445566778899aabbccddeeff").unwrap();
    assert_eq!(p.registry(), None);
    assert_eq!(p.repository(), "alpine".parse().unwrap());
    assert_eq!(p.tag(), Some("3.18".parse().unwrap()));
    assert_eq!(
        p.content_digest(),
        Some("sha256:00112233445566778899aabbccddeeff".parse().unwrap())
    );

    let p = ImageName::parse("localhost:5000/team/app").unwrap();
    let registry = p.registry().unwrap();
    assert_eq!(registry.domain_str(), "localhost");
    assert_eq!(registry.port(), Some(5000));
    assert_eq!(registry.protocol_str(), "http");
    assert_eq!(p.repository_str(), "team/app");
}

#[test]
fn parse_digest() {
    assert!(ContentDigest::parse("sha256").is_err());
    assert!(ContentDigest::parse("sha256:0123456789abcdef0123456789abcdef").is_ok());
    assert!(ContentDigest::parse("sha256:0123456789abcdef0123456789abcde").is_err());
    assert!(ContentDigest::parse("sha256:0123456789abcdef0123456789abcdeg").is_err());
    assert!(ContentDigest::parse(":0123456789abcdef0123456789abcdef").is_err());
    assert!(ContentDigest::parse("9:0123456789abcdef0123456789abcdef").is_err());
    assert!(ContentDigest::parse("multi+part.fmt:0123456789abcdef0123456789abcdef").is_ok());
    assert!(ContentDigest::parse("bad++fmt:0123456789abcdef0123456789abcdef").is_err());

    let short = ContentDigest::parse("sha256:0123456789abcdef0123456789abcdef").unwrap();
    assert!(!short.is_verifiable());
    assert!(ContentDigest::from_content(b"").is_verifiable());
}

#[test]
fn digest_serde() {
    let digest = ContentDigest::from_content(b"layer");
    let json = serde_json::to_string(&digest).unwrap();
    assert_eq!(json, format!("\"{}\"", digest));
    let back: ContentDigest = serde_json::from_str(&json).unwrap();
    assert_eq!(back, digest);
    assert!(serde_json::from_str::<ContentDigest>("\"nope\"").is_err());
}

#[test]
fn parse_repository() {
    assert!(Repository::parse("").is_err());
    assert!(Repository::parse("/").is_err());
    assert!(Repository::parse("a").is_ok());
    assert!(Repository::parse("blah.ok").is_ok());
    assert!(Repository::parse("blah..ok").is_err());
    assert!(Repository::parse("blah/.ok").is_err());
    assert!(Repository::parse("blah//blah").is_err());
    assert!(Repository::parse("some__thing/x--y").is_ok());
    let repo = Repository::parse("library/alpine").unwrap();
    assert_eq!(repo.iter().collect::<Vec<_>>(), vec!["library", "alpine"]);
    assert!(!repo.is_single_component());
}

#[test]
fn version_prefers_digest() {
    let name = ImageName::parse("alpine").unwrap();
    assert_eq!(name.version().as_str(), "latest");
    let name = ImageName::parse("alpine:edge").unwrap();
    assert_eq!(name.version().as_str(), "edge");
    let name = ImageName::parse("alpine:edge@sha256:00112233445566778899aabbccddeeff").unwrap();
    assert_eq!(
        name.version().as_str(),
        "sha256:00112233445566778899aabbccddeeff"
    );
}

#[test]
fn normalize_fills_defaults() {
    let defaults = DefaultRegistry::default();
    let check = |input: &str, expected: &str| {
        let name = ImageName::parse(input).unwrap().normalize(&defaults).unwrap();
        assert_eq!(name.as_str(), expected, "normalizing {}", input);
    };
    check("alpine", "docker.io/library/alpine:latest");
    check("library/alpine", "docker.io/library/alpine:latest");
    check("docker.io/alpine", "docker.io/library/alpine:latest");
    check("index.docker.io/library/alpine:3", "docker.io/library/alpine:3");
    check("registry-1.docker.io/someone/tool", "docker.io/someone/tool:latest");
    check("quay.io/coreos/etcd", "quay.io/coreos/etcd:latest");
    check("localhost:5000/app:v1", "localhost:5000/app:v1");
    check(
        "alpine@sha256:00112233445566778899aabbccddeeff",
        "docker.io/library/alpine@sha256:00112233445566778899aabbccddeeff",
    );
}

#[test]
fn normalize_is_idempotent() {
    let defaults = DefaultRegistry::default();
    for input in &[
        "alpine",
        "busybox:1.36",
        "ghcr.io/org/tool",
        "localhost/app",
        "alpine:edge@sha256:00112233445566778899aabbccddeeff",
    ] {
        let once = ImageName::parse(input).unwrap().normalize(&defaults).unwrap();
        let twice = once.normalize(&defaults).unwrap();
        assert_eq!(once, twice);
    }
}

#[test]
fn resolve_network_location() {
    let defaults = DefaultRegistry::default();
    let name = ImageName::parse("docker.io/library/alpine:latest").unwrap();
    let (registry, repository) = defaults.resolve_image_name(&name);
    assert_eq!(registry.as_str(), "registry-1.docker.io");
    assert_eq!(repository.as_str(), "library/alpine");

    let name = ImageName::parse("ubuntu").unwrap();
    let (registry, repository) = defaults.resolve_image_name(&name);
    assert_eq!(registry.as_str(), "registry-1.docker.io");
    assert_eq!(repository.as_str(), "library/ubuntu");

    let name = ImageName::parse("localhost:8080/x/y").unwrap();
    let (registry, repository) = defaults.resolve_image_name(&name);
    assert_eq!(registry.as_str(), "localhost:8080");
    assert!(!registry.is_https());
    assert_eq!(repository.as_str(), "x/y");
}

#[test]
fn with_found_digest() {
    let found = ContentDigest::from_content(b"manifest");
    let name = ImageName::parse("alpine:3").unwrap();
    let pinned = name.with_found_digest(&found).unwrap();
    assert_eq!(pinned.content_digest(), Some(found.clone()));
    assert_eq!(pinned.with_found_digest(&found).unwrap(), pinned);
    let other = ContentDigest::from_content(b"other");
    assert!(matches!(
        pinned.with_found_digest(&other),
        Err(crate::errors::ImageError::ContentDigestMismatch { .. })
    ));
}

#[test]
fn registry_protocol() {
    let https = |s: &str| Registry::parse(s).unwrap().is_https();
    assert!(https("quay.io"));
    assert!(https("registry.example.com:5000"));
    assert!(!https("localhost"));
    assert!(!https("dev:5000"));
    assert!(!https("127.0.0.1:41000"));
    assert!(https("10.0.0.1"));
}

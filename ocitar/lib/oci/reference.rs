use std::{fmt, str::FromStr};

use getset::{Getters, Setters};

use crate::{
    utils::{sanitize_repo_name, sanitize_selector},
    OcitarError,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The registry host used when a reference does not name one.
pub const DEFAULT_REGISTRY_HOST: &str = "registry-1.docker.io";

/// The namespace prepended to single-segment repositories on the default
/// registry.
pub const DEFAULT_REPOSITORY_NAMESPACE: &str = "library";

/// The tag used when a reference carries neither a tag nor a digest.
pub const DEFAULT_TAG: &str = "latest";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A parsed image reference.
///
/// A reference names a registry host, a repository and exactly one of a tag
/// or a manifest digest. When a multi-arch index is resolved, the digest of
/// the selected child manifest is attached next to the tag; once the image
/// manifest is fetched, the digest of the image configuration is attached
/// as well.
///
/// Parsing accepts the usual free forms:
///
/// - `alpine` (default registry, `library/` namespace, `latest` tag)
/// - `library/alpine:3.18`
/// - `registry.example.com:5000/team/app:v1`
/// - `alpine@sha256:…` (digest supplants any tag)
#[derive(Debug, Clone, PartialEq, Eq, Getters, Setters)]
#[getset(get = "pub with_prefix", set = "pub with_prefix")]
pub struct Reference {
    /// The registry host (optionally with port).
    registry: String,

    /// The repository path.
    repository: String,

    /// The tag, absent for digest references.
    tag: Option<String>,

    /// The manifest digest, from the reference itself or attached after
    /// platform selection.
    manifest_digest: Option<String>,

    /// The digest of the image configuration, attached once the manifest
    /// has been fetched.
    config_digest: Option<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Reference {
    /// Returns the manifest reference used on the wire: the digest when one
    /// is attached, the tag otherwise.
    pub fn selector(&self) -> &str {
        self.manifest_digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or_default()
    }

    /// Returns the scheme-less URL of the manifest endpoint for this
    /// reference. The registry session prefixes the scheme according to its
    /// TLS flag.
    pub fn manifests_url(&self) -> String {
        format!(
            "{}/v2/{}/manifests/{}",
            self.registry,
            self.repository,
            self.selector()
        )
    }

    /// Returns the scheme-less URL of the blob endpoint for a digest.
    pub fn blobs_url(&self, digest: &str) -> String {
        format!("{}/v2/{}/blobs/{}", self.registry, self.repository, digest)
    }

    /// Returns the scratch-directory name for this reference, optionally
    /// suffixed with a platform.
    pub fn scratch_dir_name(&self, platform: Option<(&str, &str)>) -> String {
        let repository = sanitize_repo_name(&self.repository);
        let selector = match &self.tag {
            Some(tag) => sanitize_selector(tag),
            None => sanitize_selector(self.manifest_digest.as_deref().unwrap_or_default()),
        };

        match platform {
            Some((os, arch)) => format!("{}_{}_{}_{}", repository, selector, os, arch),
            None => format!("{}_{}", repository, selector),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl FromStr for Reference {
    type Err = OcitarError;

    /// Parses a free-form reference string.
    ///
    /// The prefix before the first `/` is taken as the registry host only
    /// when it contains a `.` or a `:`; a digest after `@` supplants any
    /// tag; the tag defaults to `latest`; single-segment repositories on
    /// the default registry get the `library/` namespace.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(OcitarError::BadReference("input string is empty".into()));
        }

        let mut registry = DEFAULT_REGISTRY_HOST;
        let mut rest = s;

        if let Some(idx) = rest.find('/') {
            let prefix = &rest[..idx];
            if prefix.contains('.') || prefix.contains(':') {
                registry = prefix;
                rest = &rest[idx + 1..];
            }
        }

        let mut manifest_digest = None;
        if let Some(idx) = rest.find('@') {
            manifest_digest = Some(rest[idx + 1..].to_string());
            rest = &rest[..idx];
        }

        let mut tag = DEFAULT_TAG;
        if let Some(idx) = rest.find(':') {
            tag = &rest[idx + 1..];
            rest = &rest[..idx];
        }

        let repository = if registry == DEFAULT_REGISTRY_HOST && !rest.contains('/') {
            format!("{}/{}", DEFAULT_REPOSITORY_NAMESPACE, rest)
        } else {
            rest.to_string()
        };

        if rest.is_empty() {
            return Err(OcitarError::BadReference(format!(
                "repository is empty: {}",
                s
            )));
        }

        Ok(Reference {
            registry: registry.to_string(),
            repository,
            tag: if manifest_digest.is_none() {
                Some(tag.to_string())
            } else {
                None
            },
            manifest_digest,
            config_digest: None,
        })
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        match (&self.tag, &self.manifest_digest) {
            (Some(tag), _) => write!(f, ":{}", tag),
            (None, Some(digest)) => write!(f, "@{}", digest),
            (None, None) => Ok(()),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:deadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeef";

    #[test]
    fn test_reference_default_registry_and_namespace() {
        let reference: Reference = "alpine:3.18".parse().unwrap();
        assert_eq!(reference.get_registry(), DEFAULT_REGISTRY_HOST);
        assert_eq!(reference.get_repository(), "library/alpine");
        assert_eq!(reference.get_tag().as_deref(), Some("3.18"));
        assert!(reference.get_manifest_digest().is_none());
    }

    #[test]
    fn test_reference_default_tag() {
        let reference: Reference = "alpine".parse().unwrap();
        assert_eq!(reference.get_tag().as_deref(), Some("latest"));
    }

    #[test]
    fn test_reference_multi_segment_repository_keeps_namespace() {
        let reference: Reference = "myorg/myrepo:stable".parse().unwrap();
        assert_eq!(reference.get_registry(), DEFAULT_REGISTRY_HOST);
        assert_eq!(reference.get_repository(), "myorg/myrepo");
        assert_eq!(reference.get_tag().as_deref(), Some("stable"));
    }

    #[test]
    fn test_reference_explicit_registry() {
        let reference: Reference = "registry.example.com/team/app:v1".parse().unwrap();
        assert_eq!(reference.get_registry(), "registry.example.com");
        assert_eq!(reference.get_repository(), "team/app");
    }

    #[test]
    fn test_reference_registry_with_port() {
        let reference: Reference = "localhost:5000/app".parse().unwrap();
        assert_eq!(reference.get_registry(), "localhost:5000");
        // a non-default registry never gets the library/ namespace
        assert_eq!(reference.get_repository(), "app");
        assert_eq!(reference.get_tag().as_deref(), Some("latest"));
    }

    #[test]
    fn test_reference_plain_prefix_is_part_of_the_repository() {
        let reference: Reference = "myorg/app:v1".parse().unwrap();
        assert_eq!(reference.get_registry(), DEFAULT_REGISTRY_HOST);
        assert_eq!(reference.get_repository(), "myorg/app");
    }

    #[test]
    fn test_reference_digest_supplants_tag() {
        let reference: Reference = format!("alpine:3.18@{}", DIGEST).parse::<Reference>().unwrap();
        assert_eq!(reference.get_repository(), "library/alpine");
        assert!(reference.get_tag().is_none());
        assert_eq!(reference.get_manifest_digest().as_deref(), Some(DIGEST));
    }

    #[test]
    fn test_reference_digest_only() {
        let reference: Reference = format!("alpine@{}", DIGEST).parse::<Reference>().unwrap();
        assert!(reference.get_tag().is_none());
        assert_eq!(reference.get_manifest_digest().as_deref(), Some(DIGEST));
    }

    #[test]
    fn test_reference_urls() {
        let reference: Reference = "alpine:3.18".parse().unwrap();
        assert_eq!(
            reference.manifests_url(),
            "registry-1.docker.io/v2/library/alpine/manifests/3.18"
        );
        assert_eq!(
            reference.blobs_url("sha256:abc"),
            "registry-1.docker.io/v2/library/alpine/blobs/sha256:abc"
        );
    }

    #[test]
    fn test_reference_manifests_url_prefers_digest() {
        let mut reference: Reference = "alpine:3.18".parse().unwrap();
        reference.set_manifest_digest(Some("sha256:abc".to_string()));
        assert!(reference.manifests_url().ends_with("/manifests/sha256:abc"));
        // the tag survives for RepoTags and the repositories file
        assert_eq!(reference.get_tag().as_deref(), Some("3.18"));
    }

    #[test]
    fn test_reference_scratch_dir_name() {
        let reference: Reference = "alpine:3.18".parse().unwrap();
        assert_eq!(reference.scratch_dir_name(None), "library_alpine_3.18");
        assert_eq!(
            reference.scratch_dir_name(Some(("linux", "arm64"))),
            "library_alpine_3.18_linux_arm64"
        );

        let by_digest: Reference = format!("alpine@{}", DIGEST).parse::<Reference>().unwrap();
        assert_eq!(
            by_digest.scratch_dir_name(Some(("linux", "amd64"))),
            format!(
                "library_alpine_{}_linux_amd64",
                DIGEST.replace(':', "_")
            )
        );
    }

    #[test]
    fn test_reference_canonicalization_idempotence() {
        for input in [
            "alpine",
            "alpine:3.18",
            "myorg/myrepo:stable",
            "registry.example.com:5000/team/app:v1",
            &format!("alpine@{}", DIGEST),
            &format!("registry.example.com/team/app@{}", DIGEST),
        ] {
            let first: Reference = input.parse().unwrap();
            let second: Reference = first.to_string().parse().unwrap();
            assert_eq!(first, second, "{input} should canonicalize idempotently");
        }
    }

    #[test]
    fn test_reference_empty_inputs_are_rejected() {
        assert!(matches!(
            "".parse::<Reference>(),
            Err(OcitarError::BadReference(_))
        ));
        assert!(matches!(
            "registry.example.com/:tag".parse::<Reference>(),
            Err(OcitarError::BadReference(_))
        ));
    }
}

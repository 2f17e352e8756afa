//! End-to-end pulls against Docker Hub.
//!
//! These tests hit the real registry and are ignored by default; run them
//! with `cargo test -- --ignored` when network access is available.

use std::sync::Arc;

use ocitar::{
    oci::{PullPlatform, Puller, Reference, RegistrySession},
    progress::EmptyProgressBar,
};
use tempfile::tempdir;
use tokio::fs;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const IMAGE: &str = "alpine:3.18";

const MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn puller(output: &std::path::Path) -> Puller {
    Puller::new(
        output,
        "linux/amd64".parse::<PullPlatform>().unwrap(),
        true,
        Arc::new(EmptyProgressBar),
    )
}

/// Resolves the digest of the platform manifest of [`IMAGE`] from the
/// registry; asking for the single-manifest media type makes Docker Hub
/// answer with the default (amd64) child of the index.
async fn resolve_manifest_digest() -> anyhow::Result<String> {
    let reference: Reference = IMAGE.parse()?;
    let session = RegistrySession::default();
    let response = session
        .get(
            &reference.manifests_url(),
            &[("Accept", MANIFEST_MEDIA_TYPE.to_string())],
        )
        .await?;

    let digest = response
        .headers()
        .get("docker-content-digest")
        .ok_or_else(|| anyhow::anyhow!("registry did not return docker-content-digest"))?
        .to_str()?
        .to_string();

    Ok(digest)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test_log::test(tokio::test)]
#[ignore = "requires network access to Docker Hub"]
async fn test_pull_by_tag_produces_reference_layout() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let mut puller = puller(temp_dir.path());

    puller.pull(IMAGE).await?;

    let scratch = temp_dir.path().join("library_alpine_3.18_linux_amd64");
    let archive = temp_dir.path().join("library_alpine_3.18_linux_amd64.tar");
    assert!(scratch.is_dir(), "scratch directory should be kept");
    assert!(archive.is_file(), "archive should be written");

    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&archive)?.permissions().mode() & 0o7777;
        assert_eq!(mode, 0o600, "archive mode should be 0600");
    }

    let manifest: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(scratch.join("manifest.json")).await?)?;
    assert_eq!(
        manifest[0]["RepoTags"],
        serde_json::json!(["library/alpine:3.18"]),
        "the library/ prefix is retained in the tag string"
    );

    let repositories: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(scratch.join("repositories")).await?)?;
    assert!(repositories["library/alpine"]["3.18"].is_string());

    for layer in manifest[0]["Layers"].as_array().unwrap() {
        let layer_tar = scratch.join(layer.as_str().unwrap());
        assert!(layer_tar.exists(), "{} should exist", layer_tar.display());

        let layer_dir = layer_tar.parent().unwrap();
        assert_eq!(fs::read_to_string(layer_dir.join("VERSION")).await?, "1.0");
        assert!(layer_dir.join("json").is_file());
    }

    Ok(())
}

#[test_log::test(tokio::test)]
#[ignore = "requires network access to Docker Hub"]
async fn test_pull_by_digest_omits_repo_tags() -> anyhow::Result<()> {
    let digest = resolve_manifest_digest().await?;

    let temp_dir = tempdir()?;
    let mut puller = puller(temp_dir.path());

    puller.pull(&format!("alpine@{}", digest)).await?;

    let scratch = temp_dir.path().join(format!(
        "library_alpine_{}_linux_amd64",
        digest.replace(':', "_")
    ));
    assert!(scratch.is_dir(), "scratch directory should be kept");

    let manifest: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(scratch.join("manifest.json")).await?)?;
    assert!(
        manifest[0]["RepoTags"].is_null(),
        "digest pulls serialize RepoTags as null"
    );
    assert!(
        !scratch.join("repositories").exists(),
        "digest pulls omit the repositories file"
    );

    Ok(())
}

#[test_log::test(tokio::test)]
#[ignore = "requires network access to Docker Hub"]
async fn test_pull_same_digest_is_deterministic() -> anyhow::Result<()> {
    let digest = resolve_manifest_digest().await?;
    let image = format!("alpine@{}", digest);
    let archive_name = format!(
        "library_alpine_{}_linux_amd64.tar",
        digest.replace(':', "_")
    );

    let first_dir = tempdir()?;
    let mut first = puller(first_dir.path());
    first.pull(&image).await?;

    let second_dir = tempdir()?;
    let mut second = puller(second_dir.path());
    second.pull(&image).await?;

    let first_bytes = fs::read(first_dir.path().join(&archive_name)).await?;
    let second_bytes = fs::read(second_dir.path().join(&archive_name)).await?;
    assert_eq!(
        first_bytes, second_bytes,
        "two pulls of the same digest should be byte-identical"
    );

    Ok(())
}

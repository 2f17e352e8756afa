use std::{collections::HashMap, fmt, path::PathBuf, str::FromStr, sync::Arc};

use oci_spec::image::{Descriptor, ImageIndex, ImageManifest};
use serde::Serialize;
use serde_json::Value;
use tokio::fs;

use crate::{
    progress::PullProgress,
    utils::{host_architecture, strip_scheme, Workspace},
    OcitarError, OcitarResult,
};

use super::{
    config::ImageConfig, registry::BasicCredentials, registry::RegistrySession, v1, Reference,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The MIME type of Docker Registry v2 manifests.
const MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// The MIME type of Docker Registry v2 manifest lists.
const MANIFEST_LIST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.list.v2+json";

/// The MIME type of OCI image manifests.
const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// The MIME type of OCI image indexes.
const OCI_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";

/// The literal content of every layer `VERSION` file.
const LAYER_VERSION: &str = "1.0";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The platform images are selected for, as an `os/arch` pair where either
/// side may be left unspecified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullPlatform {
    /// The operating system, e.g. `linux`.
    pub os: Option<String>,

    /// The architecture, e.g. `amd64`.
    pub arch: Option<String>,
}

/// Pulls images referenced on the command line into `docker save`
/// compatible archives.
///
/// The puller owns one [`RegistrySession`] per registry host (created on
/// demand for hosts without configured credentials) and a scratch directory
/// per reference below `output_dir`. References are pulled one at a time
/// and layers strictly in manifest order; the duplicate-layer symlink
/// policy depends on that ordering.
pub struct Puller {
    /// Registry sessions keyed by host.
    sessions: HashMap<String, Arc<RegistrySession>>,

    /// Parent directory of scratch directories and final archives.
    output_dir: PathBuf,

    /// The platform used to select child manifests from an index.
    platform: PullPlatform,

    /// Whether to keep the scratch directory after a successful pull.
    save_cache: bool,

    /// Progress callbacks driven during blob downloads.
    progress: Arc<dyn PullProgress>,
}

#[derive(Debug, Serialize)]
struct ArchiveManifestEntry {
    #[serde(rename = "Config")]
    config: String,

    #[serde(rename = "RepoTags")]
    repo_tags: Option<Vec<String>>,

    #[serde(rename = "Layers")]
    layers: Vec<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl PullPlatform {
    /// Returns the operating system, defaulting to `linux`.
    pub fn os_or_default(&self) -> &str {
        self.os.as_deref().unwrap_or("linux")
    }

    /// Returns the architecture, defaulting to the host architecture.
    pub fn arch_or_default(&self) -> &str {
        self.arch.as_deref().unwrap_or_else(|| host_architecture())
    }
}

impl Puller {
    /// Creates a puller writing below `output_dir`.
    pub fn new(
        output_dir: impl Into<PathBuf>,
        platform: PullPlatform,
        save_cache: bool,
        progress: Arc<dyn PullProgress>,
    ) -> Self {
        Self {
            sessions: HashMap::new(),
            output_dir: output_dir.into(),
            platform,
            save_cache,
            progress,
        }
    }

    /// Configures the session used for a registry host.
    ///
    /// Any `https://` or `http://` prefix on the host is stripped. The
    /// session lives for the rest of the process.
    pub fn set_registry(
        &mut self,
        registry: &str,
        credentials: Option<BasicCredentials>,
        tls: bool,
    ) {
        let host = strip_scheme(registry);
        self.sessions.insert(
            host.to_string(),
            Arc::new(RegistrySession::new(credentials, tls)),
        );
    }

    /// Pulls one image reference into an archive below the output
    /// directory.
    ///
    /// Multi-arch indexes may produce several archives (one per selected
    /// child manifest); references with an explicit digest are always
    /// treated as a single manifest.
    pub async fn pull(&mut self, image: &str) -> OcitarResult<()> {
        let mut img: Reference = image.parse()?;
        let session = self.session(img.get_registry().clone());

        match img.get_tag() {
            Some(tag) => tracing::info!("{}: pulling from {}", tag, img.get_repository()),
            None => tracing::info!(
                "pulling from {}@{}",
                img.get_repository(),
                img.get_manifest_digest().as_deref().unwrap_or_default()
            ),
        }

        let response = session
            .get(
                &img.manifests_url(),
                &[("Accept", MANIFEST_LIST_MEDIA_TYPE.to_string())],
            )
            .await?;
        let bytes = response.bytes().await?;

        let probe: Value = serde_json::from_slice(&bytes)?;
        if let Some(version) = schema_version(&probe) {
            if version == 1 {
                return Err(OcitarError::UnsupportedSchema(1));
            }
        }
        let media_type = probe
            .get("mediaType")
            .and_then(Value::as_str)
            .map(str::to_string);

        if img.get_manifest_digest().is_some() {
            // an explicit digest always names a single manifest
            let media_type = media_type.unwrap_or_else(|| OCI_MANIFEST_MEDIA_TYPE.to_string());
            let dir_name = img.scratch_dir_name(Some((
                self.platform.os_or_default(),
                self.platform.arch_or_default(),
            )));
            self.fetch_image(&session, &mut img, &media_type, &dir_name)
                .await?;
        } else {
            let media_type = media_type
                .ok_or_else(|| OcitarError::UnsupportedMediaType("<missing>".to_string()))?;
            match media_type.as_str() {
                MANIFEST_MEDIA_TYPE | OCI_MANIFEST_MEDIA_TYPE => {
                    let dir_name = img.scratch_dir_name(None);
                    self.fetch_image(&session, &mut img, &media_type, &dir_name)
                        .await?;
                }
                MANIFEST_LIST_MEDIA_TYPE | OCI_INDEX_MEDIA_TYPE => {
                    let index: ImageIndex = serde_json::from_slice(&bytes)?;
                    let children: Vec<Descriptor> = select_manifests(&index, &self.platform)
                        .into_iter()
                        .cloned()
                        .collect();

                    for child in children {
                        let (os, arch) = match child.platform() {
                            Some(platform) => (
                                platform.os().to_string(),
                                platform.architecture().to_string(),
                            ),
                            None => {
                                tracing::warn!(
                                    "index entry {} carries no platform metadata, assuming {}/{}",
                                    child.digest(),
                                    self.platform.os_or_default(),
                                    self.platform.arch_or_default()
                                );
                                (
                                    self.platform.os_or_default().to_string(),
                                    self.platform.arch_or_default().to_string(),
                                )
                            }
                        };
                        img.set_manifest_digest(Some(child.digest().to_string()));
                        let dir_name = img.scratch_dir_name(Some((os.as_str(), arch.as_str())));
                        let child_media_type = child.media_type().to_string();
                        self.fetch_image(&session, &mut img, &child_media_type, &dir_name)
                            .await?;
                    }
                }
                other => return Err(OcitarError::UnsupportedMediaType(other.to_string())),
            }
        }

        if let Some(digest) = img.get_config_digest() {
            tracing::info!("digest: {}", digest);
        }

        Ok(())
    }

    /// Pulls one resolved manifest: config, layers, metadata files and the
    /// final archive.
    async fn fetch_image(
        &self,
        session: &Arc<RegistrySession>,
        img: &mut Reference,
        media_type: &str,
        dir_name: &str,
    ) -> OcitarResult<()> {
        let response = session
            .get(&img.manifests_url(), &[("Accept", media_type.to_string())])
            .await?;
        let bytes = response.bytes().await?;

        let probe: Value = serde_json::from_slice(&bytes)?;
        if schema_version(&probe) == Some(1) {
            return Err(OcitarError::UnsupportedSchema(1));
        }
        let manifest: ImageManifest = serde_json::from_slice(&bytes)?;

        let config_digest = manifest.config().digest().clone();
        img.set_config_digest(Some(config_digest.to_string()));

        let response = session
            .get(&img.blobs_url(&config_digest.to_string()), &[])
            .await?;
        let config_bytes = response.bytes().await?.to_vec();
        let config = ImageConfig::parse(config_bytes)?;

        let workspace = Workspace::create(self.output_dir.join(dir_name)).await?;
        let config_hex = config_digest.digest().to_string();
        workspace
            .write(&format!("{}.json", config_hex), config.get_raw())
            .await?;

        if config.get_diff_ids().len() != manifest.layers().len() {
            return Err(OcitarError::custom(anyhow::anyhow!(
                "manifest lists {} layers but the config has {} diff_ids",
                manifest.layers().len(),
                config.get_diff_ids().len()
            )));
        }

        let chain = v1::chain_ids(config.get_diff_ids());
        let layer_ids = v1::synthetic_layer_ids(&chain, config.get_fields())?;

        let mut archive_layers = Vec::with_capacity(layer_ids.len());
        let mut previous_digest: Option<String> = None;
        let mut parent_hex: Option<String> = None;

        for (i, descriptor) in manifest.layers().iter().enumerate() {
            let layer_hex = layer_ids[i]
                .strip_prefix("sha256:")
                .unwrap_or(&layer_ids[i])
                .to_string();
            archive_layers.push(format!("{}/layer.tar", layer_hex));

            let layer_workspace = workspace.subdir(&layer_hex).await?;
            let digest = descriptor.digest().to_string();

            if previous_digest.as_deref() == Some(digest.as_str()) {
                // the registry may list the same blob twice in a row; the
                // reference runtime stores the second copy as a symlink and
                // byte-for-byte compatibility requires doing the same
                let parent = parent_hex.as_deref().unwrap_or_default();
                fs::symlink(
                    format!("../{}/layer.tar", parent),
                    layer_workspace.path("layer.tar")?,
                )
                .await?;
            } else {
                session
                    .fetch_blob(
                        &img.blobs_url(&digest),
                        &layer_workspace.path("layer.tar")?,
                        Some(&descriptor.media_type().to_string()),
                        Arc::clone(&self.progress),
                    )
                    .await?;
            }

            let last = i + 1 == manifest.layers().len();
            let metadata = v1::layer_json(&layer_hex, parent_hex.as_deref(), config.get_fields(), last)?;
            layer_workspace.write("json", metadata).await?;
            layer_workspace.write("VERSION", LAYER_VERSION).await?;

            previous_digest = Some(digest);
            parent_hex = Some(layer_hex);
        }

        if let Some(tag) = img.get_tag() {
            // the reference runtime only writes this file for tag pulls
            let final_hex = parent_hex.clone().unwrap_or_default();
            let mut tags = serde_json::Map::new();
            tags.insert(tag.clone(), Value::String(final_hex));
            let mut repositories = serde_json::Map::new();
            repositories.insert(img.get_repository().clone(), Value::Object(tags));
            workspace
                .write(
                    "repositories",
                    format!("{}\n", serde_json::to_string(&repositories)?),
                )
                .await?;
        }

        let entry = ArchiveManifestEntry {
            config: format!("{}.json", config_hex),
            repo_tags: img
                .get_tag()
                .as_ref()
                .map(|tag| vec![format!("{}:{}", img.get_repository(), tag)]),
            layers: archive_layers,
        };
        workspace
            .write(
                "manifest.json",
                format!("{}\n", serde_json::to_string(&[entry])?),
            )
            .await?;

        let created = config.created_unix()?;
        let archive_path = self.output_dir.join(format!("{}.tar", dir_name));

        let root = workspace.root().to_path_buf();
        let out = archive_path.clone();
        tokio::task::spawn_blocking(move || crate::archive::make_tar(&out, &root, created))
            .await??;

        fs::set_permissions(
            &archive_path,
            std::os::unix::fs::PermissionsExt::from_mode(0o600),
        )
        .await?;

        if !self.save_cache {
            fs::remove_dir_all(workspace.root()).await?;
        }

        tracing::info!("wrote archive {}", archive_path.display());

        Ok(())
    }

    fn session(&mut self, host: String) -> Arc<RegistrySession> {
        self.sessions.entry(host).or_default().clone()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Selects the child manifests of an index matching a platform.
///
/// With both components given, only the first exact match is returned.
/// With one component given, every entry matching that component is
/// returned; this can include unrelated platforms, hence the warning.
/// With neither given, all entries are returned. List order is preserved.
fn select_manifests<'a>(index: &'a ImageIndex, platform: &PullPlatform) -> Vec<&'a Descriptor> {
    tracing::debug!(
        "platform: {}/{}",
        platform.os.as_deref().unwrap_or(""),
        platform.arch.as_deref().unwrap_or("")
    );

    let manifests = index.manifests().iter();

    match (&platform.os, &platform.arch) {
        (None, None) => manifests.collect(),
        (Some(os), Some(arch)) => manifests
            .filter(|entry| {
                entry_platform(entry)
                    .map(|(entry_os, entry_arch)| entry_os == *os && entry_arch == *arch)
                    .unwrap_or(false)
            })
            .take(1)
            .collect(),
        (Some(os), None) => {
            tracing::warn!(
                "platform filter matched on os only; unrelated architectures may be selected"
            );
            manifests
                .filter(|entry| {
                    entry_platform(entry)
                        .map(|(entry_os, _)| entry_os == *os)
                        .unwrap_or(false)
                })
                .collect()
        }
        (None, Some(arch)) => {
            tracing::warn!(
                "platform filter matched on architecture only; unrelated platforms may be selected"
            );
            manifests
                .filter(|entry| {
                    entry_platform(entry)
                        .map(|(_, entry_arch)| entry_arch == *arch)
                        .unwrap_or(false)
                })
                .collect()
        }
    }
}

fn entry_platform(entry: &Descriptor) -> Option<(String, String)> {
    entry
        .platform()
        .as_ref()
        .map(|platform| (platform.os().to_string(), platform.architecture().to_string()))
}

fn schema_version(probe: &Value) -> Option<u64> {
    probe.get("schemaVersion").and_then(Value::as_u64)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl FromStr for PullPlatform {
    type Err = OcitarError;

    /// Parses an `os/arch` pair. Either side may be empty (`linux/`,
    /// `/arm64`) to filter on a single component; the empty string leaves
    /// both unspecified.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Result::Ok(PullPlatform {
                os: None,
                arch: None,
            });
        }

        let mut parts = s.split('/');
        let os = parts.next().unwrap_or_default();
        let arch = parts.next().unwrap_or_default();
        if parts.next().is_some() {
            return Err(OcitarError::InvalidPlatform(s.to_string()));
        }

        let none_if_empty = |part: &str| {
            if part.is_empty() {
                None
            } else {
                Some(part.to_string())
            }
        };

        Result::Ok(PullPlatform {
            os: none_if_empty(os),
            arch: none_if_empty(arch),
        })
    }
}

impl fmt::Display for PullPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}",
            self.os.as_deref().unwrap_or(""),
            self.arch.as_deref().unwrap_or("")
        )
    }
}

impl Default for PullPlatform {
    fn default() -> Self {
        PullPlatform {
            os: Some("linux".to_string()),
            arch: Some(host_architecture().to_string()),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn index(entries: &[(&str, &str)]) -> ImageIndex {
        let manifests: Vec<Value> = entries
            .iter()
            .enumerate()
            .map(|(i, (os, arch))| {
                serde_json::json!({
                    "mediaType": MANIFEST_MEDIA_TYPE,
                    "digest": format!(
                        "sha256:{:064x}",
                        i + 1
                    ),
                    "size": 1,
                    "platform": {"os": os, "architecture": arch}
                })
            })
            .collect();

        serde_json::from_value(serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MANIFEST_LIST_MEDIA_TYPE,
            "manifests": manifests,
        }))
        .unwrap()
    }

    fn platform(s: &str) -> PullPlatform {
        s.parse().unwrap()
    }

    #[test]
    fn test_pull_platform_parse() {
        assert_eq!(
            platform("linux/arm64"),
            PullPlatform {
                os: Some("linux".into()),
                arch: Some("arm64".into())
            }
        );
        assert_eq!(
            platform("linux/"),
            PullPlatform {
                os: Some("linux".into()),
                arch: None
            }
        );
        assert_eq!(
            platform("/arm64"),
            PullPlatform {
                os: None,
                arch: Some("arm64".into())
            }
        );
        assert_eq!(
            platform(""),
            PullPlatform {
                os: None,
                arch: None
            }
        );
        assert!(matches!(
            "a/b/c".parse::<PullPlatform>(),
            Err(OcitarError::InvalidPlatform(_))
        ));
    }

    #[test]
    fn test_select_manifests_exact_match_stops_at_first() {
        let index = index(&[
            ("linux", "amd64"),
            ("linux", "arm64"),
            ("linux", "amd64"),
        ]);

        let selected = select_manifests(&index, &platform("linux/amd64"));
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].digest().to_string(), format!("sha256:{:064x}", 1));
    }

    #[test]
    fn test_select_manifests_single_component_matches_all() {
        let index = index(&[
            ("linux", "amd64"),
            ("windows", "amd64"),
            ("linux", "arm64"),
        ]);

        let selected = select_manifests(&index, &platform("linux/"));
        assert_eq!(selected.len(), 2);

        let selected = select_manifests(&index, &platform("/amd64"));
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn test_select_manifests_unspecified_returns_everything_in_order() {
        let index = index(&[("linux", "amd64"), ("linux", "arm64")]);

        let selected = select_manifests(
            &index,
            &PullPlatform {
                os: None,
                arch: None,
            },
        );
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].digest().to_string(), format!("sha256:{:064x}", 1));
        assert_eq!(selected[1].digest().to_string(), format!("sha256:{:064x}", 2));
    }

    #[test]
    fn test_select_manifests_unspecified_keeps_entries_without_platform() {
        let index: ImageIndex = serde_json::from_value(serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MANIFEST_LIST_MEDIA_TYPE,
            "manifests": [
                {
                    "mediaType": MANIFEST_MEDIA_TYPE,
                    "digest": format!("sha256:{:064x}", 1),
                    "size": 1,
                    "platform": {"os": "linux", "architecture": "amd64"}
                },
                {
                    "mediaType": MANIFEST_MEDIA_TYPE,
                    "digest": format!("sha256:{:064x}", 2),
                    "size": 1
                }
            ],
        }))
        .unwrap();

        let selected = select_manifests(
            &index,
            &PullPlatform {
                os: None,
                arch: None,
            },
        );
        assert_eq!(selected.len(), 2, "platform-less entries are not dropped");
        assert!(selected[1].platform().is_none());
    }

    #[test]
    fn test_select_manifests_no_match_yields_no_work() {
        let index = index(&[("linux", "amd64")]);
        assert!(select_manifests(&index, &platform("linux/s390x")).is_empty());
    }

    #[test]
    fn test_schema_version_probe() {
        assert_eq!(
            schema_version(&serde_json::json!({"schemaVersion": 1})),
            Some(1)
        );
        assert_eq!(
            schema_version(&serde_json::json!({"schemaVersion": 2})),
            Some(2)
        );
        assert_eq!(schema_version(&serde_json::json!({})), None);
    }

    #[test]
    fn test_archive_manifest_entry_serialization() {
        let entry = ArchiveManifestEntry {
            config: "abc.json".into(),
            repo_tags: Some(vec!["library/alpine:3.18".into()]),
            layers: vec!["aaa/layer.tar".into()],
        };
        assert_eq!(
            serde_json::to_string(&[&entry]).unwrap(),
            r#"[{"Config":"abc.json","RepoTags":["library/alpine:3.18"],"Layers":["aaa/layer.tar"]}]"#
        );

        let entry = ArchiveManifestEntry {
            config: "abc.json".into(),
            repo_tags: None,
            layers: vec![],
        };
        assert_eq!(
            serde_json::to_string(&[&entry]).unwrap(),
            r#"[{"Config":"abc.json","RepoTags":null,"Layers":[]}]"#
        );
    }
}

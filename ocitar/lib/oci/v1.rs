//! The legacy identity scheme of the `docker save` archive format.
//!
//! The archive format does not use the layer digests the registry reports.
//! Each layer directory is named after a synthetic identifier derived from
//! the image configuration: the rootfs diff-ids are first folded into
//! chain-ids, then every chain-id is wrapped into a small metadata document
//! whose SHA-256 becomes the layer's on-disk name. The last layer's document
//! additionally embeds the image configuration (minus its `id` field), so
//! the final identifier pins the whole image.
//!
//! All document fields are held as raw JSON fragments so that `\uXXXX`
//! escapes from the image configuration are re-emitted byte-for-byte; see
//! [`crate::utils`] for the supporting helpers.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use sha2::{Digest, Sha256};

use crate::{
    utils::{raw_is_empty, raw_literal, raw_string},
    OcitarResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The creation timestamp emitted when a document does not inherit one from
/// the image configuration.
const EPOCH_CREATED: &str = "\"1970-01-01T00:00:00Z\"";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The container configuration schema shared by the v1 documents.
///
/// Values are raw fragments of the image configuration; missing fields take
/// the schema defaults. Serialization follows the fixed schema order and
/// omits the trailing optional fields when they are empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(rename = "Hostname", default = "raw_empty_string")]
    pub(crate) hostname: Box<RawValue>,

    #[serde(rename = "Domainname", default = "raw_empty_string")]
    pub(crate) domainname: Box<RawValue>,

    #[serde(rename = "User", default = "raw_empty_string")]
    pub(crate) user: Box<RawValue>,

    #[serde(rename = "AttachStdin", default = "raw_false")]
    pub(crate) attach_stdin: Box<RawValue>,

    #[serde(rename = "AttachStdout", default = "raw_false")]
    pub(crate) attach_stdout: Box<RawValue>,

    #[serde(rename = "AttachStderr", default = "raw_false")]
    pub(crate) attach_stderr: Box<RawValue>,

    #[serde(rename = "ExposedPorts", default, skip_serializing_if = "omitted")]
    pub(crate) exposed_ports: Option<Box<RawValue>>,

    #[serde(rename = "Tty", default = "raw_false")]
    pub(crate) tty: Box<RawValue>,

    #[serde(rename = "OpenStdin", default = "raw_false")]
    pub(crate) open_stdin: Box<RawValue>,

    #[serde(rename = "StdinOnce", default = "raw_false")]
    pub(crate) stdin_once: Box<RawValue>,

    #[serde(rename = "Env", default = "raw_null")]
    pub(crate) env: Box<RawValue>,

    #[serde(rename = "Cmd", default = "raw_null")]
    pub(crate) cmd: Box<RawValue>,

    #[serde(rename = "Healthcheck", default, skip_serializing_if = "omitted")]
    pub(crate) healthcheck: Option<Box<RawValue>>,

    #[serde(rename = "ArgsEscaped", default, skip_serializing_if = "omitted")]
    pub(crate) args_escaped: Option<Box<RawValue>>,

    #[serde(rename = "Image", default = "raw_empty_string")]
    pub(crate) image: Box<RawValue>,

    #[serde(rename = "Volumes", default = "raw_null")]
    pub(crate) volumes: Box<RawValue>,

    #[serde(rename = "WorkingDir", default = "raw_empty_string")]
    pub(crate) working_dir: Box<RawValue>,

    #[serde(rename = "Entrypoint", default = "raw_null")]
    pub(crate) entrypoint: Box<RawValue>,

    #[serde(rename = "NetworkDisabled", default, skip_serializing_if = "omitted")]
    pub(crate) network_disabled: Option<Box<RawValue>>,

    #[serde(rename = "MacAddress", default, skip_serializing_if = "omitted")]
    pub(crate) mac_address: Option<Box<RawValue>>,

    #[serde(rename = "OnBuild", default = "raw_null")]
    pub(crate) on_build: Box<RawValue>,

    #[serde(rename = "Labels", default = "raw_null")]
    pub(crate) labels: Box<RawValue>,

    #[serde(rename = "StopSignal", default, skip_serializing_if = "omitted")]
    pub(crate) stop_signal: Option<Box<RawValue>>,

    #[serde(rename = "StopTimeout", default, skip_serializing_if = "omitted")]
    pub(crate) stop_timeout: Option<Box<RawValue>>,

    #[serde(rename = "Shell", default, skip_serializing_if = "omitted")]
    pub(crate) shell: Option<Box<RawValue>>,
}

/// The top-level image configuration fields the v1 documents inherit.
///
/// Parsed from the whitespace-compacted configuration blob so every
/// fragment re-serializes to its original bytes. The `id` field of the
/// configuration is deliberately not represented: the documents always set
/// their own identifiers.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFields {
    #[serde(default)]
    pub(crate) architecture: Option<Box<RawValue>>,

    #[serde(default)]
    pub(crate) author: Option<Box<RawValue>>,

    #[serde(default)]
    pub(crate) comment: Option<Box<RawValue>>,

    #[serde(default)]
    pub(crate) config: Option<ContainerConfig>,

    #[serde(default)]
    pub(crate) container: Option<Box<RawValue>>,

    #[serde(default)]
    pub(crate) container_config: Option<ContainerConfig>,

    #[serde(default)]
    pub(crate) created: Option<Box<RawValue>>,

    #[serde(default)]
    pub(crate) docker_version: Option<Box<RawValue>>,

    #[serde(default)]
    pub(crate) os: Option<Box<RawValue>>,

    #[serde(default)]
    pub(crate) size: Option<Box<RawValue>>,

    #[serde(default)]
    pub(crate) variant: Option<Box<RawValue>>,
}

/// The document hashed into a synthetic layer identifier.
#[derive(Debug, Serialize)]
struct LayerConfig {
    #[serde(skip_serializing_if = "omitted")]
    architecture: Option<Box<RawValue>>,

    #[serde(skip_serializing_if = "omitted")]
    comment: Option<Box<RawValue>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    config: Option<ContainerConfig>,

    #[serde(skip_serializing_if = "omitted")]
    container: Option<Box<RawValue>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    container_config: Option<ContainerConfig>,

    created: Box<RawValue>,

    #[serde(skip_serializing_if = "omitted")]
    docker_version: Option<Box<RawValue>>,

    layer_id: Box<RawValue>,

    #[serde(skip_serializing_if = "omitted")]
    os: Option<Box<RawValue>>,

    #[serde(skip_serializing_if = "omitted")]
    parent: Option<Box<RawValue>>,

    #[serde(skip_serializing_if = "omitted")]
    variant: Option<Box<RawValue>>,
}

/// The per-layer metadata document written to the `json` file of every
/// layer directory.
#[derive(Debug, Serialize)]
struct V1Image {
    #[serde(skip_serializing_if = "omitted")]
    id: Option<Box<RawValue>>,

    #[serde(skip_serializing_if = "omitted")]
    parent: Option<Box<RawValue>>,

    #[serde(skip_serializing_if = "omitted")]
    comment: Option<Box<RawValue>>,

    created: Box<RawValue>,

    #[serde(skip_serializing_if = "omitted")]
    container: Option<Box<RawValue>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    container_config: Option<ContainerConfig>,

    #[serde(skip_serializing_if = "omitted")]
    docker_version: Option<Box<RawValue>>,

    #[serde(skip_serializing_if = "omitted")]
    author: Option<Box<RawValue>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    config: Option<ContainerConfig>,

    #[serde(skip_serializing_if = "omitted")]
    architecture: Option<Box<RawValue>>,

    #[serde(skip_serializing_if = "omitted")]
    variant: Option<Box<RawValue>>,

    #[serde(skip_serializing_if = "omitted")]
    os: Option<Box<RawValue>>,

    #[serde(skip_serializing_if = "omitted")]
    size: Option<Box<RawValue>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl LayerConfig {
    /// Builds the document for one chain-id. The last layer passes the
    /// configuration fields to merge over the defaults.
    fn new(chain_id: &str, parent: Option<&str>, config: Option<&ConfigFields>) -> Self {
        match config {
            None => Self {
                architecture: None,
                comment: None,
                config: None,
                container: None,
                container_config: Some(ContainerConfig::default()),
                created: raw_literal(EPOCH_CREATED),
                docker_version: None,
                layer_id: raw_string(chain_id),
                os: None,
                parent: parent.map(raw_string),
                variant: None,
            },
            Some(fields) => Self {
                architecture: fields.architecture.clone(),
                comment: fields.comment.clone(),
                config: Some(fields.config.clone().unwrap_or_default()),
                container: fields.container.clone(),
                container_config: Some(fields.container_config.clone().unwrap_or_default()),
                created: fields
                    .created
                    .clone()
                    .unwrap_or_else(|| raw_literal(EPOCH_CREATED)),
                docker_version: fields.docker_version.clone(),
                layer_id: raw_string(chain_id),
                os: fields.os.clone(),
                parent: parent.map(raw_string),
                variant: fields.variant.clone(),
            },
        }
    }
}

impl V1Image {
    /// Builds the document for one layer. The last layer passes the
    /// configuration fields to merge over the defaults.
    fn new(id: &str, parent: Option<&str>, fields: &ConfigFields, last: bool) -> Self {
        let base = Self {
            id: Some(raw_string(id)),
            parent: parent.map(raw_string),
            comment: None,
            created: raw_literal(EPOCH_CREATED),
            container: None,
            container_config: Some(ContainerConfig::default()),
            docker_version: None,
            author: None,
            config: None,
            architecture: None,
            variant: None,
            os: fields
                .os
                .clone()
                .or_else(|| Some(raw_literal("\"linux\""))),
            size: None,
        };

        if !last {
            return base;
        }

        Self {
            comment: fields.comment.clone(),
            created: fields
                .created
                .clone()
                .unwrap_or_else(|| raw_literal(EPOCH_CREATED)),
            container: fields.container.clone(),
            container_config: Some(fields.container_config.clone().unwrap_or_default()),
            docker_version: fields.docker_version.clone(),
            author: fields.author.clone(),
            config: Some(fields.config.clone().unwrap_or_default()),
            architecture: fields.architecture.clone(),
            variant: fields.variant.clone(),
            size: fields.size.clone(),
            ..base
        }
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            hostname: raw_empty_string(),
            domainname: raw_empty_string(),
            user: raw_empty_string(),
            attach_stdin: raw_false(),
            attach_stdout: raw_false(),
            attach_stderr: raw_false(),
            exposed_ports: None,
            tty: raw_false(),
            open_stdin: raw_false(),
            stdin_once: raw_false(),
            env: raw_null(),
            cmd: raw_null(),
            healthcheck: None,
            args_escaped: None,
            image: raw_empty_string(),
            volumes: raw_null(),
            working_dir: raw_empty_string(),
            entrypoint: raw_null(),
            network_disabled: None,
            mac_address: None,
            on_build: raw_null(),
            labels: raw_null(),
            stop_signal: None,
            stop_timeout: None,
            shell: None,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Folds an ordered diff-id sequence into its chain-id sequence.
///
/// The first chain-id is the first diff-id itself; every further one hashes
/// the literal text of the previous chain-id, a single space and the next
/// diff-id.
pub fn chain_ids(diff_ids: &[String]) -> Vec<String> {
    let mut chain: Vec<String> = Vec::with_capacity(diff_ids.len());

    for (i, diff_id) in diff_ids.iter().enumerate() {
        if i == 0 {
            chain.push(diff_id.clone());
        } else {
            let text = format!("{} {}", chain[i - 1], diff_id);
            chain.push(format!(
                "sha256:{}",
                hex::encode(Sha256::digest(text.as_bytes()))
            ));
        }
    }

    chain
}

/// Derives the synthetic layer identifiers from a chain-id sequence.
///
/// Each identifier is the SHA-256 of the serialized [`LayerConfig`]
/// document; the parent of a document is the identifier of the previous
/// one, and the last document embeds the image configuration.
pub fn synthetic_layer_ids(
    chain_ids: &[String],
    fields: &ConfigFields,
) -> OcitarResult<Vec<String>> {
    let mut ids = Vec::with_capacity(chain_ids.len());
    let mut parent: Option<String> = None;

    for (i, chain_id) in chain_ids.iter().enumerate() {
        let last = i + 1 == chain_ids.len();
        let document = LayerConfig::new(chain_id, parent.as_deref(), last.then_some(fields));
        let serialized = serde_json::to_string(&document)?;
        let id = format!(
            "sha256:{}",
            hex::encode(Sha256::digest(serialized.as_bytes()))
        );
        parent = Some(id.clone());
        ids.push(id);
    }

    Ok(ids)
}

/// Serializes the `json` metadata document of one layer directory.
pub fn layer_json(
    id: &str,
    parent: Option<&str>,
    fields: &ConfigFields,
    last: bool,
) -> OcitarResult<String> {
    let document = V1Image::new(id, parent, fields, last);
    Ok(serde_json::to_string(&document)?)
}

fn omitted(value: &Option<Box<RawValue>>) -> bool {
    match value {
        None => true,
        Some(raw) => raw_is_empty(raw.get()),
    }
}

fn raw_empty_string() -> Box<RawValue> {
    raw_literal("\"\"")
}

fn raw_false() -> Box<RawValue> {
    raw_literal("false")
}

fn raw_null() -> Box<RawValue> {
    raw_literal("null")
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

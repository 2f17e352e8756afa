use chrono::DateTime;
use getset::Getters;
use serde::Deserialize;

use crate::{utils::compact_json, OcitarError, OcitarResult};

use super::ConfigFields;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The image configuration blob of one manifest.
///
/// The original bytes are kept untouched — they are written verbatim into
/// the archive as `<config-digest-hex>.json` — and the pieces needed
/// downstream are extracted twice from the same bytes: once as plain values
/// for control flow (`created`, `rootfs.diff_ids`) and once as raw JSON
/// fragments ([`ConfigFields`]) so the per-layer metadata re-emits string
/// escapes byte-for-byte.
#[derive(Debug, Clone, Getters)]
#[getset(get = "pub with_prefix")]
pub struct ImageConfig {
    /// The configuration bytes exactly as received from the registry.
    raw: Vec<u8>,

    /// The image creation timestamp (RFC 3339).
    created: String,

    /// The ordered diff-ids of the uncompressed layers.
    diff_ids: Vec<String>,

    /// The schema-relevant fields as raw fragments.
    fields: ConfigFields,
}

#[derive(Debug, Deserialize)]
struct TypedConfig {
    created: String,
    rootfs: TypedRootFs,
}

#[derive(Debug, Deserialize)]
struct TypedRootFs {
    diff_ids: Vec<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ImageConfig {
    /// Parses a configuration blob, keeping the raw bytes.
    pub fn parse(raw: Vec<u8>) -> OcitarResult<Self> {
        let text = std::str::from_utf8(&raw).map_err(OcitarError::custom)?;
        let typed: TypedConfig = serde_json::from_str(text)?;
        let fields: ConfigFields = serde_json::from_str(&compact_json(text))?;

        Ok(Self {
            created: typed.created,
            diff_ids: typed.rootfs.diff_ids,
            fields,
            raw,
        })
    }

    /// Returns the creation timestamp as Unix seconds.
    pub fn created_unix(&self) -> OcitarResult<i64> {
        let created = DateTime::parse_from_rfc3339(&self.created).map_err(|e| {
            OcitarError::custom(anyhow::anyhow!(
                "invalid created timestamp {:?}: {}",
                self.created,
                e
            ))
        })?;

        Ok(created.timestamp())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

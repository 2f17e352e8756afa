//! `ocitar` pulls container images from Distribution Registries ("v2" HTTP
//! API) and assembles them into a single local archive whose byte layout is
//! compatible with the output of `docker save`, so the result can be loaded
//! into a local container runtime without network access.
//!
//! # Overview
//!
//! A pull walks the registry protocol end to end:
//!
//! - resolves the image reference (registry host, repository, tag or digest),
//! - negotiates challenge-response bearer-token authentication,
//! - selects the per-platform manifest from a multi-arch index,
//! - downloads, verifies and decompresses every layer blob (resumable),
//! - recomputes the legacy layer-chain identifiers of the `docker save`
//!   archive format,
//! - emits a deterministic USTAR archive that round-trips through
//!   `docker load`.
//!
//! # Modules
//!
//! - [`oci`] - Reference parsing, registry client, pull orchestration and
//!   the legacy v1 identity scheme
//! - [`archive`] - Deterministic USTAR archive assembly
//! - [`progress`] - Progress reporting interface consumed by the core
//! - [`cli`] - Command-line interface and argument parsing
//! - [`utils`] - Common utilities and helpers

#![warn(missing_docs)]

mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod archive;
pub mod cli;
pub mod oci;
pub mod progress;
pub mod utils;

pub use error::*;

use std::{
    error::Error,
    fmt::{self, Display},
};

use reqwest::StatusCode;
use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of an ocitar-related operation.
pub type OcitarResult<T> = Result<T, OcitarError>;

/// An error that occurred while pulling or assembling an image.
#[derive(pretty_error_debug::Debug, Error)]
pub enum OcitarError {
    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error that can represent any error.
    #[error(transparent)]
    Custom(#[from] AnyError),

    /// An error that occurred during an HTTP request.
    #[error("http request error: {0}")]
    HttpRequest(#[from] reqwest::Error),

    /// An error that occurred when a Serde JSON error occurred.
    #[error("serde json error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    /// An error that occurred when a join handle returned an error.
    #[error("join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    /// An error that occurred when parsing an image reference.
    #[error("invalid image reference: {0}")]
    BadReference(String),

    /// An error that occurred when registry authentication could not be
    /// completed, including missing or unsupported challenges.
    #[error("registry authentication failed: {0}")]
    AuthFailed(String),

    /// An error that occurred when the registry returned a non-success
    /// status that is not an authentication challenge.
    #[error("registry error: status {status}, body: {body}")]
    RegistryError {
        /// The HTTP status returned by the registry.
        status: StatusCode,

        /// A trimmed snippet of the response body.
        body: String,
    },

    /// An error that occurred when a manifest used an unsupported schema
    /// version.
    #[error("schema version {0} image manifest not supported")]
    UnsupportedSchema(u64),

    /// An error that occurred when a manifest carried a media type the
    /// puller cannot dispatch on.
    #[error("unsupported manifest media type: {0}")]
    UnsupportedMediaType(String),

    /// An error that occurred when a fetched blob did not hash to its
    /// expected digest.
    #[error("blob digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// The digest encoded in the blob URL.
        expected: String,

        /// The digest computed over the downloaded bytes.
        actual: String,
    },

    /// An error that occurred while assembling the final archive.
    #[error("archive error: {0}")]
    ArchiveError(String),

    /// An error that occurred when validating paths inside the scratch
    /// directory.
    #[error("path validation error: {0}")]
    PathValidation(String),

    /// An error that occurred when parsing a platform string.
    #[error("invalid platform: {0}")]
    InvalidPlatform(String),
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl OcitarError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> OcitarError {
        OcitarError::Custom(AnyError {
            error: error.into(),
        })
    }
}

impl AnyError {
    /// Downcasts the error to a `T`.
    pub fn downcast<T>(&self) -> Option<&T>
    where
        T: Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an `Ok` `OcitarResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> OcitarResult<T> {
    Result::Ok(value)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}

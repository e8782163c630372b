use octofhir_storage::StorageError;
use thiserror::Error;

/// Errors surfaced by `$validate-code`.
///
/// A code that is simply not in the referenced definition is not an error;
/// it is a `ValidationResult` with `valid = false`. These variants cover the
/// cases where no answer could be given.
#[derive(Debug, Error)]
pub enum TerminologyError {
    #[error("Invalid $validate-code request: {0}")]
    InvalidRequest(String),

    #[error("{kind} not found: {url}")]
    NotFound { kind: &'static str, url: String },

    /// The remote authority could not be reached, timed out or failed with 5xx.
    #[error("Terminology server {url} unavailable: {message}")]
    UpstreamUnavailable { url: String, message: String },

    /// The remote authority answered, but not with a usable result.
    #[error("Terminology server {url} rejected the request ({status}): {message}")]
    Remote {
        url: String,
        status: u16,
        message: String,
    },

    #[error("Invalid terminology configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl TerminologyError {
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn code_system_not_found(url: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "CodeSystem",
            url: url.into(),
        }
    }

    pub fn value_set_not_found(url: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "ValueSet",
            url: url.into(),
        }
    }
}

pub type TerminologyResult<T> = Result<T, TerminologyError>;

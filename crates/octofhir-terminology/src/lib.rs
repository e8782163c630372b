//! Terminology Validation Gateway.
//!
//! `$validate-code` in two shapes ([`ValidateCodeRequest`]): is a code
//! defined by a CodeSystem, and is a code a member of a ValueSet. Each
//! request is answered by a remote authority when one is registered for the
//! referenced url ([`RemoteRegistry`]), otherwise from CodeSystem/ValueSet
//! resources in local storage.
//!
//! ```ignore
//! let gateway = TerminologyGateway::from_settings(storage, &settings.terminology)?;
//! let result = gateway
//!     .validate_code(&ValidateCodeRequest::code_system("http://foo/cs", "yes"))
//!     .await?;
//! assert!(result.valid);
//! ```

pub mod config;
pub mod error;
pub mod gateway;
pub mod local;
pub mod remote;
pub mod types;

pub use config::{RemoteServiceSettings, TerminologySettings};
pub use error::{TerminologyError, TerminologyResult};
pub use gateway::TerminologyGateway;
pub use remote::{HttpTerminologyClient, RemoteAuthority, RemoteRegistry, canonical_url};
pub use types::{
    OperationTarget, ResolutionSource, ValidateCodeParams, ValidateCodeRequest, ValidationResult,
};

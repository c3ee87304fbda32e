//! Error taxonomy:
//! - Validation errors name the offending specification field and fail at build time.
//! - Subprocess errors are swallowed by connect/leave and re-raised by start.
//! - Unsupported result formats and unimplemented surfaces fail loudly, never silently.
use std::fmt;
use std::io;

/// Reason strings reused across validation errors, matching the constraints
/// the external tool enforces on specification fields.
pub(crate) mod reasons {
    pub const ALPHANUMERIC_WITH_HYPHENS: &str =
        "value must consist of only lowercase letters, numbers and hyphens";
    pub const ALPHANUMERIC_WITH_HYPHENS_UNDERSCORES: &str =
        "value must consist of only letters, numbers, hyphens and underscores";
    pub const ALPHANUMERIC_WITH_UNDERSCORES: &str =
        "value must consist of only letters, numbers and underscores";
    pub const CANT_EXCEED_64_CHARACTERS: &str = "cannot exceed 64 characters";
    pub const CANT_DETERMINE_NAME: &str = "cannot determine name from input or convention";
    pub const INVALID_WORKLOAD_COUNT: &str = "only 1 - 32 workloads can be defined at once";
    pub const INVALID_INTERCEPT_COUNT: &str = "only 1 - 16 intercepts can be defined at once";
    pub const INVALID_HANDLER_COUNT: &str = "only 1 - 64 handlers can be defined at once";
    pub const NOT_A_VALID_PORT: &str = "port numbers can only be between 1 - 65535";
    pub const NOT_AN_IP_ADDRESS: &str = "not a valid IPv4 address";
    pub const GLOBAL_MUTUALLY_EXCLUSIVE: &str =
        "cannot set global while paths or headers are also set";
    pub const MUTUALLY_EXCLUSIVE_HANDLERS: &str =
        "handlers are mutually exclusive, exactly one of [container, script, external] must be set";
}

#[derive(Debug)]
pub enum Error {
    /// A specification field failed validation. Carries the offending field
    /// path and the constraint it violated.
    Validation {
        field: &'static str,
        reason: &'static str,
    },
    /// A result payload format that is declared but intentionally unimplemented.
    UnsupportedFormat(String),
    /// A surface whose semantics are intentionally unimplemented in the wrapped tool flow.
    NotImplemented(&'static str),
    /// The external tool did not produce the expected output within the wait window.
    UnableToStartIntercept,
    /// The external tool failed in a way the caller must see.
    Subprocess(String),
    /// A bounded wait was aborted by timeout or caller cancellation.
    Cancelled,
    Io(io::Error),
    Json(serde_json::Error),
    Yaml(serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn validation(field: &'static str, reason: &'static str) -> Self {
        Error::Validation { field, reason }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Validation { field, reason } => write!(f, "invalid field '{field}': {reason}"),
            Error::UnsupportedFormat(ext) => {
                write!(f, "unsupported output format '{ext}': not implemented")
            }
            Error::NotImplemented(what) => write!(f, "not implemented: {what}"),
            Error::UnableToStartIntercept => write!(f, "unable to start the intercept"),
            Error::Subprocess(msg) => write!(f, "telepresence invocation failed: {msg}"),
            Error::Cancelled => write!(f, "operation cancelled or timed out"),
            Error::Io(e) => write!(f, "{e}"),
            Error::Json(e) => write!(f, "invalid result payload: {e}"),
            Error::Yaml(e) => write!(f, "specification serialization failed: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Json(e) => Some(e),
            Error::Yaml(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e)
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Yaml(e)
    }
}

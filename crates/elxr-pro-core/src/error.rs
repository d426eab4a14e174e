//! Error types for the eLxr Pro client.
//!
//! Every variant carries a stable, machine-readable code (see [`Error::code`])
//! next to its human-readable message so the CLI can render either form.

use std::path::PathBuf;

use serde_json::{Value, json};
use thiserror::Error;

/// Result type alias using the client [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Client error taxonomy.
#[derive(Debug, Error)]
pub enum Error {
    // ---------------------------------------------------------------------
    // Preconditions
    // ---------------------------------------------------------------------
    /// `join` on a machine that already holds a machine token.
    #[error(
        "This machine is already attached to '{account_name}'\n\
         To use a different subscription first run: sudo elxr-pro leave."
    )]
    AlreadyAttached { account_name: String },

    /// An operation that needs an attachment ran on an unattached machine.
    #[error("This machine is not attached to an eLxr Pro subscription.")]
    Unattached,

    #[error("This command must be run as root (try using sudo).")]
    NonRootUser,

    /// Another lifecycle operation holds the lock.
    #[error("Unable to perform: {lock_request}.\nOperation in progress: {lock_holder} (pid:{pid})")]
    LockHeld {
        lock_request: String,
        lock_holder: String,
        pid: i32,
    },

    #[error(
        "There is a corrupted lock file in the system. To continue, please remove it\n\
         from the system by running:\n\n    $ sudo rm {}",
        path.display()
    )]
    InvalidLockFile { path: PathBuf },

    // ---------------------------------------------------------------------
    // Remote service
    // ---------------------------------------------------------------------
    /// The contract service could not be reached.
    #[error("Failed to connect to {url}\n{cause}")]
    Connectivity { url: String, cause: String },

    /// Non-200 answer from the contract service.
    #[error("Error connecting to {url}: {code} {body}")]
    ContractApi { url: String, code: u16, body: String },

    /// A 200 answer whose body does not match the expected schema.
    #[error("Invalid response from {url}: {reason}")]
    InvalidResponse { url: String, reason: String },

    #[error("MachineId Unmatch: {request_machine_id} and {response_machine_id}")]
    MachineIdUnmatch {
        request_machine_id: String,
        response_machine_id: String,
    },

    #[error("Invalid Https URL: {url}")]
    InvalidHttpsUrl { url: String },

    /// Entitlement `type` unusable as a repository file name.
    #[error("Invalid entitlement name: '{name}'")]
    InvalidEntitlementName { name: String },

    // ---------------------------------------------------------------------
    // Local state
    // ---------------------------------------------------------------------
    #[error("{} is not valid {format}", path.display())]
    InvalidFileFormat { path: PathBuf, format: &'static str },

    #[error("Configuration error: {0}")]
    Config(String),

    // ---------------------------------------------------------------------
    // Command arguments
    // ---------------------------------------------------------------------
    #[error(
        "Do not pass the TOKEN arg if you are using --attach-config.\n\
         Include the token in the attach-config file instead."
    )]
    AttachTokenXorConfig,

    #[error("Pass the TOKEN arg or use --attach-config.")]
    AttachTokenRequired,

    #[error("Error while reading {config_name}:\n{error}")]
    AttachInvalidConfigFile { config_name: String, error: String },

    #[error("json formatted response requires --assume-yes flag.")]
    JsonFormatRequiresAssumeYes,

    #[error("{arg} must be one of: {choices}")]
    InvalidArgChoice { arg: String, choices: String },

    #[error("Empty value provided for {key}.")]
    EmptyConfigValue { key: String },

    #[error("Expected {expected} but found: {actual}")]
    InvalidFormat { expected: String, actual: String },

    #[error("\"{url}\" is not a valid url. Not setting as proxy.")]
    InvalidProxyUrl { url: String },

    // ---------------------------------------------------------------------
    // Wrapped
    // ---------------------------------------------------------------------
    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable machine-readable code for this error.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::AlreadyAttached { .. } => "already-attached",
            Self::Unattached => "unattached",
            Self::NonRootUser => "nonroot-user",
            Self::LockHeld { .. } => "lock-held-error",
            Self::InvalidLockFile { .. } => "invalid-lock-file",
            Self::Connectivity { .. } => "connectivity-error",
            Self::ContractApi { .. } => "contract-api-error",
            Self::InvalidResponse { .. } => "invalid-response",
            Self::MachineIdUnmatch { .. } => "machineid-unmatch",
            Self::InvalidHttpsUrl { .. } => "invalid-https-url",
            Self::InvalidEntitlementName { .. } => "invalid-entitlement-name",
            Self::InvalidFileFormat { .. } => "invalid-file-format",
            Self::Config(_) => "invalid-config",
            Self::AttachTokenXorConfig => "attach-token-xor-config",
            Self::AttachTokenRequired => "attach-token-or-config-required",
            Self::AttachInvalidConfigFile { .. } => "attach-config-read-error",
            Self::JsonFormatRequiresAssumeYes => "json-format-require-assume-yes",
            Self::InvalidArgChoice { .. } => "invalid-arg-choice",
            Self::EmptyConfigValue { .. } => "empty-value",
            Self::InvalidFormat { .. } => "generic-invalid-format",
            Self::InvalidProxyUrl { .. } => "invalid-proxy-url",
            Self::Json(_) => "json-error",
            Self::Io(_) => "io-error",
        }
    }

    /// Process exit status for this error.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::AlreadyAttached { .. } => 2,
            _ => 1,
        }
    }

    /// Structured context attached to the error in JSON output.
    pub fn additional_info(&self) -> Value {
        match self {
            Self::AlreadyAttached { account_name } => json!({ "account_name": account_name }),
            Self::LockHeld {
                lock_request,
                lock_holder,
                pid,
            } => json!({
                "lock_request": lock_request,
                "lock_holder": lock_holder,
                "pid": pid,
            }),
            Self::Connectivity { url, cause } => json!({ "url": url, "cause_error": cause }),
            Self::ContractApi { url, code, body } => {
                json!({ "url": url, "code": code, "body": body })
            }
            Self::MachineIdUnmatch {
                request_machine_id,
                response_machine_id,
            } => json!({
                "request_machineid": request_machine_id,
                "response_machineid": response_machine_id,
            }),
            Self::InvalidHttpsUrl { url } => json!({ "url": url }),
            Self::InvalidEntitlementName { name } => json!({ "name": name }),
            Self::InvalidFileFormat { path, format } => {
                json!({ "file_name": path.display().to_string(), "file_format": format })
            }
            _ => json!({}),
        }
    }
}

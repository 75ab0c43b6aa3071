//! Error types for directory operations.
//!
//! The taxonomy keeps transport failures apart from credential failures so callers can decide
//! whether to surface an authentication error or silently deny.

use thiserror::Error;

/// Failure to establish a session with the directory server.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// The host could not be reached (DNS, refused connection, reset).
    #[error("directory host {endpoint} is unreachable: {message}")]
    Unreachable {
        /// Endpoint signature (`host:port`).
        endpoint: String,
        /// Transport error message.
        message: String,
    },

    /// TCP succeeded but the TLS negotiation did not.
    #[error("TLS handshake with {endpoint} failed: {message}")]
    TlsHandshake {
        /// Endpoint signature (`host:port`).
        endpoint: String,
        /// TLS error message.
        message: String,
    },

    /// The connection attempt exceeded the connect timeout.
    #[error("connection to {endpoint} timed out")]
    Timeout {
        /// Endpoint signature (`host:port`).
        endpoint: String,
    },

    /// The endpoint could not be turned into a directory URL.
    #[error("invalid directory endpoint: {0}")]
    InvalidEndpoint(String),
}

/// Failure to authenticate a connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BindError {
    /// The server rejected the credentials (result code 49).
    #[error("invalid credentials for `{dn}`")]
    InvalidCredentials {
        /// DN used for the bind.
        dn: String,
    },

    /// The server answered with a non-success result other than bad credentials.
    #[error("bind rejected with result code {code}: {message}")]
    Protocol {
        /// LDAP result code.
        code: u32,
        /// Diagnostic text returned by the server.
        message: String,
    },

    /// The request could not be delivered or its answer could not be read.
    #[error("bind transport failure: {0}")]
    Transport(String),

    /// No answer within the operation timeout.
    #[error("bind timed out")]
    Timeout,
}

impl BindError {
    /// Returns true when the failure is attributable to the supplied credentials.
    #[must_use]
    pub const fn is_credentials(&self) -> bool {
        matches!(self, Self::InvalidCredentials { .. })
    }
}

/// Reasons a local account could not be provisioned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProvisionFailure {
    /// No attribute mapping is configured.
    #[error("no attribute mapping configured")]
    NoMapping,

    /// Neither an explicit nor a derived account identifier is available.
    #[error("no account identifier could be derived for `{uid}`")]
    NoAccountId {
        /// Directory uid being provisioned.
        uid: String,
    },
}

/// Main error type for directory operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Connection could not be established
    #[error("Connect failed: {0}")]
    Connect(#[from] ConnectError),

    /// Bind was rejected or failed
    #[error("Bind failed: {0}")]
    Bind(#[from] BindError),

    /// Search exceeded its time limit
    #[error("Search under `{0}` exceeded its time limit")]
    SearchTimeout(String),

    /// Unexpected protocol-level failure
    #[error("Directory protocol error: {0}")]
    Protocol(String),

    /// Configuration could not be used
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Operation attempted in the wrong connection state
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        /// Operation that was attempted
        operation: &'static str,
        /// Connection state at the time
        state: String,
    },

    /// Directory entry not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Authenticated user is not allowed in
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Account provisioning failed
    #[error("Provisioning failed: {0}")]
    Provision(#[from] ProvisionFailure),
}

/// Specialized result type for directory operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns the error code for this error type.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Connect(ConnectError::TlsHandshake { .. }) => "TLS_HANDSHAKE_FAILED",
            Self::Connect(_) => "CONNECT_FAILED",
            Self::Bind(BindError::InvalidCredentials { .. }) => "INVALID_CREDENTIALS",
            Self::Bind(_) => "BIND_FAILED",
            Self::SearchTimeout(_) => "SEARCH_TIMEOUT",
            Self::Protocol(_) => "PROTOCOL_ERROR",
            Self::Configuration(_) => "CONFIG_ERROR",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::NotFound(_) => "NOT_FOUND",
            Self::AccessDenied(_) => "ACCESS_DENIED",
            Self::Provision(_) => "PROVISION_FAILED",
        }
    }

    /// Returns true if this error should be logged as a serious error.
    ///
    /// Credential rejections and negative lookups are expected during normal operation.
    #[must_use]
    pub const fn should_log(&self) -> bool {
        matches!(
            self,
            Self::Connect(_)
                | Self::Protocol(_)
                | Self::Configuration(_)
                | Self::InvalidState { .. }
                | Self::Bind(BindError::Protocol { .. } | BindError::Transport(_))
        )
    }

    /// Returns true when the directory itself could not be used (as opposed to a negative answer).
    #[must_use]
    pub const fn is_directory_unavailable(&self) -> bool {
        matches!(
            self,
            Self::Connect(_)
                | Self::SearchTimeout(_)
                | Self::Bind(BindError::Transport(_) | BindError::Timeout)
        )
    }
}

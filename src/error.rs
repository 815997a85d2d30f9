//! Error handling for the polling gateway
//!
//! Two levels of errors exist. `TransactionError` describes the outcome of a
//! single bus transaction and is what the scheduler and the device state
//! machine pattern-match on. `GatewayError` is the service-level error used
//! at configuration load and at the port-runtime boundary.

use thiserror::Error;

/// Outcome classification of one request/response exchange on the bus.
///
/// The split between transient and permanent kinds drives scheduling: a
/// transient failure is retried on the register's next natural turn, while a
/// permanent one removes the register from polling until restart.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    /// No response byte arrived within the response timeout.
    #[error("response timeout: {0}")]
    Timeout(String),

    /// A response arrived but was malformed (bad checksum, short frame,
    /// unexpected unit id, unexpected function code).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The device explicitly reported the operation is unsupported for this
    /// register. The register is excluded from future scheduling.
    #[error("register unsupported: {0}")]
    PermanentRegister(String),

    /// The underlying channel itself failed. Propagates up to force a
    /// port-level reopen, not just a device-level retry.
    #[error("io error: {0}")]
    Io(String),
}

impl TransactionError {
    pub fn timeout(msg: impl Into<String>) -> Self {
        TransactionError::Timeout(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        TransactionError::Protocol(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        TransactionError::PermanentRegister(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        TransactionError::Io(msg.into())
    }

    /// Whether the failure must be escalated to a port reopen.
    pub fn is_io(&self) -> bool {
        matches!(self, TransactionError::Io(_))
    }
}

impl From<std::io::Error> for TransactionError {
    fn from(err: std::io::Error) -> Self {
        TransactionError::Io(err.to_string())
    }
}

/// Service-level error type.
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    /// Malformed or internally inconsistent configuration. Fails fast at
    /// load time, never at poll time.
    #[error("configuration error: {0}")]
    Config(String),

    /// The physical channel failed; the owning port task reopens the port
    /// with backoff before resuming.
    #[error("io error: {0}")]
    Io(String),

    /// Invariant violation inside the gateway.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn config(msg: impl Into<String>) -> Self {
        GatewayError::Config(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        GatewayError::Io(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        GatewayError::Internal(msg.into())
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Io(err.to_string())
    }
}

/// Result type alias for the gateway.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Extension trait for adding context when mapping foreign errors.
pub trait ErrorExt<T> {
    fn config_error(self, msg: &str) -> Result<T>;
}

impl<T, E> ErrorExt<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn config_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| GatewayError::Config(format!("{msg}: {e}")))
    }
}

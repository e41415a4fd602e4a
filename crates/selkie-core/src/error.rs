//! Error types for selkie.
//!
//! TigerStyle: Explicit error variants with context, using thiserror.

use thiserror::Error;

/// Result type alias for selkie operations
pub type Result<T> = std::result::Result<T, Error>;

/// Selkie error types
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Protocol Errors
    // =========================================================================
    #[error("Unknown protocol type: {ptype}")]
    UnknownProtocol { ptype: u8 },

    #[error("No dispatch registered for protocol type: {ptype}")]
    MissingDispatch { ptype: u8 },

    #[error("Session not found: {session}")]
    SessionNotFound { session: i32 },

    // =========================================================================
    // Resource Errors
    // =========================================================================
    #[error("Memory limit exceeded: service {service:08X}, used {used} bytes, limit {limit} bytes")]
    MemoryLimitExceeded { service: u32, used: u64, limit: u64 },

    #[error("Fd table exhausted on worker {worker}")]
    FdExhausted { worker: u8 },

    #[error("Send queue overflow: fd {fd:08X}, depth {depth}, limit {limit}")]
    SendQueueOverflow { fd: u32, depth: usize, limit: usize },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    #[error("Socket error on fd {fd:08X}: {reason}")]
    Socket { fd: u32, reason: String },

    #[error("Connection timed out: fd {fd:08X}")]
    ConnectionTimeout { fd: u32 },

    #[error("Handshake failed: {reason}")]
    Handshake { reason: String },

    #[error("Frame too large: {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Usage Errors
    // =========================================================================
    #[error("Unique service name already registered: {name}")]
    DuplicateUniqueName { name: String },

    #[error("Read already pending on fd {fd:08X}")]
    DoubleRead { fd: u32 },

    #[error("Service not found: {id:08X}")]
    ServiceNotFound { id: u32 },

    #[error("Unique service not found: {name}")]
    UniqueServiceNotFound { name: String },

    #[error("Worker not found: {worker}")]
    WorkerNotFound { worker: u8 },

    #[error("Invalid configuration: {field}, reason: {reason}")]
    InvalidConfiguration { field: String, reason: String },

    // =========================================================================
    // Fatal Errors
    // =========================================================================
    #[error("Service init failed: {name}, reason: {reason}")]
    ServiceInitFailed { name: String, reason: String },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {reason}")]
    Internal { reason: String },

    #[error("Serialization failed: {reason}")]
    Serialization { reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create an internal error
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Create a service init failure
    pub fn init_failed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ServiceInitFailed {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a socket error
    pub fn socket(fd: u32, reason: impl Into<String>) -> Self {
        Self::Socket {
            fd,
            reason: reason.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(reason: impl Into<String>) -> Self {
        Self::Serialization {
            reason: reason.into(),
        }
    }

    /// Protocol-kind errors: malformed or unroutable message traffic
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::UnknownProtocol { .. }
                | Self::MissingDispatch { .. }
                | Self::SessionNotFound { .. }
        )
    }

    /// Resource-kind errors: a configured limit was hit
    pub fn is_resource(&self) -> bool {
        matches!(
            self,
            Self::MemoryLimitExceeded { .. }
                | Self::FdExhausted { .. }
                | Self::SendQueueOverflow { .. }
        )
    }

    /// Fatal errors abort the server when the failing service is unique
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ServiceInitFailed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_carries_context() {
        let err = Error::SendQueueOverflow {
            fd: 0x0001_0002,
            depth: 5,
            limit: 4,
        };
        let text = err.to_string();
        assert!(text.contains("00010002"));
        assert!(text.contains('5'));
        assert!(text.contains('4'));
    }

    #[test]
    fn test_error_kinds() {
        assert!(Error::SessionNotFound { session: 7 }.is_protocol());
        assert!(Error::FdExhausted { worker: 1 }.is_resource());
        assert!(Error::init_failed("gate", "boom").is_fatal());
        assert!(!Error::internal("x").is_fatal());
    }
}

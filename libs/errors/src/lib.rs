//! Unified error handling for the hub service
//!
//! Bus-level results (NAK, timeouts, CRC mismatches) are not errors in this
//! sense: they travel through command continuations as typed outcomes. The
//! types here cover submission failures, bad input and bootstrap faults.

use thiserror::Error;

// ============================================================================
// HubError - Main error type
// ============================================================================

/// Main error type for all hub crates
#[derive(Debug, Error)]
pub enum HubError {
    // ======================================
    // Capacity Errors
    // ======================================
    #[error("Too many tasks: scheduler table holds {capacity} frames")]
    TaskTableFull { capacity: usize },

    #[error("{bus} command queue full ({depth} entries)")]
    QueueFull { bus: &'static str, depth: usize },

    // ======================================
    // Validation Errors
    // ======================================
    #[error("Invalid {bus} address: {address}")]
    InvalidAddress { bus: &'static str, address: u32 },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    // ======================================
    // Protocol & Communication Errors
    // ======================================
    #[error("Protocol error: {protocol}: {message}")]
    Protocol { protocol: String, message: String },

    #[error("Timeout waiting for {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ======================================
    // Configuration Errors
    // ======================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    // ======================================
    // Service & Runtime
    // ======================================
    #[error("Engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using HubError
pub type HubResult<T> = Result<T, HubError>;

// ============================================================================
// Helper constructors
// ============================================================================

impl HubError {
    pub fn task_table_full(capacity: usize) -> Self {
        Self::TaskTableFull { capacity }
    }

    pub fn queue_full(bus: &'static str, depth: usize) -> Self {
        Self::QueueFull { bus, depth }
    }

    pub fn invalid_address(bus: &'static str, address: impl Into<u32>) -> Self {
        Self::InvalidAddress {
            bus,
            address: address.into(),
        }
    }

    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn protocol(protocol: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            protocol: protocol.into(),
            message: message.into(),
        }
    }

    pub fn timeout(what: impl Into<String>) -> Self {
        Self::Timeout(what.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::EngineUnavailable(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// The requested work never started because a fixed table was full.
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::TaskTableFull { .. } | Self::QueueFull { .. })
    }

    /// Check if the same request may succeed if submitted again later
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TaskTableFull { .. } | Self::QueueFull { .. } => true,
            Self::Timeout(_) | Self::EngineUnavailable(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// Short stable identifier, used in structured log fields
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::TaskTableFull { .. } => "TASK_TABLE_FULL",
            Self::QueueFull { .. } => "QUEUE_FULL",
            Self::InvalidAddress { .. } => "INVALID_ADDRESS",
            Self::InvalidValue { .. } => "INVALID_VALUE",
            Self::Protocol { .. } => "PROTOCOL_ERROR",
            Self::Timeout(_) => "TIMEOUT",
            Self::Io(_) => "IO_ERROR",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::EngineUnavailable(_) => "ENGINE_UNAVAILABLE",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

// ============================================================================
// Conversions
// ============================================================================

impl From<figment::Error> for HubError {
    fn from(err: figment::Error) -> Self {
        Self::Configuration(err.to_string())
    }
}

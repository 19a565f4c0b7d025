//! Unified error types for the ModESP core runtime.
//!
//! Every subsystem funnels into a single [`Error`] carrying one of the
//! eight [`ErrorKind`]s, keeping error handling uniform across the
//! scheduler, managers, and stores. Driver and manager operations return
//! these as status values; callers decide whether to surface, retry, or
//! ignore (sensor read failures, for example, are counted and reported
//! through health rather than propagated).

use core::fmt;

// ---------------------------------------------------------------------------
// Error kinds
// ---------------------------------------------------------------------------

/// Classification of every fallible operation in the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A parameter violated a documented bound (key too long, bad range).
    InvalidArgument,
    /// A named entity (key, section, driver type, module) does not exist.
    NotFound,
    /// The operation is not legal in the current lifecycle state.
    InvalidState,
    /// A bounded resource (queue, map, slot table) is full.
    ResourceExhausted,
    /// A bounded wait expired.
    Timeout,
    /// A config mutation failed schema validation.
    ValidationError,
    /// The HAL or a device behind it reported a failure.
    HardwareError,
    /// Unrecoverable; the application transitions to ERROR.
    Fatal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InvalidArgument => "invalid argument",
            Self::NotFound => "not found",
            Self::InvalidState => "invalid state",
            Self::ResourceExhausted => "resource exhausted",
            Self::Timeout => "timeout",
            Self::ValidationError => "validation error",
            Self::HardwareError => "hardware error",
            Self::Fatal => "fatal",
        };
        write!(f, "{name}")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// A classified error with a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidState, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceExhausted, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationError, message)
    }

    pub fn hardware(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::HardwareError, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::validation(format!("JSON: {e}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::hardware(format!("I/O: {e}"))
    }
}

/// Core-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;

//! Common error types for CAN links

use thiserror::Error;

/// Result type for link operations
pub type LinkResult<T> = Result<T, LinkError>;

/// Errors raised while constructing frames or filter rules
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Identifier does not fit the 11-bit or 29-bit range
    #[error("CAN id 0x{id:X} out of range for {} frame", frame_kind(.extended))]
    IdOutOfRange { id: u32, extended: bool },

    /// Payload longer than a classic CAN frame allows
    #[error("payload of {0} bytes exceeds 8")]
    PayloadTooLong(usize),

    /// Filter mask wider than the identifier space
    #[error("filter mask 0x{mask:X} out of range for {} filter", frame_kind(.extended))]
    MaskOutOfRange { mask: u32, extended: bool },

    /// Unparseable identifier text
    #[error("invalid CAN id '{0}'")]
    InvalidId(String),
}

fn frame_kind(extended: &bool) -> &'static str {
    if *extended {
        "extended"
    } else {
        "standard"
    }
}

/// Broad grouping used when tagging log records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Configuration,
    State,
    Transport,
    Backend,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::State => "state",
            ErrorCategory::Transport => "transport",
            ErrorCategory::Backend => "backend",
        };
        f.write_str(s)
    }
}

/// Errors that can occur on a CAN link
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkError {
    /// Bad channel, bitrate, filter set or failed bring-up
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Operation invoked in a lifecycle state that does not allow it
    #[error("State error: {0}")]
    State(String),

    /// Transient send/receive failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// The requested backend cannot be built
    #[error("Unsupported backend: {0}")]
    UnsupportedBackend(String),
}

impl LinkError {
    /// Whether the error leaves the link unusable
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LinkError::Configuration(_) | LinkError::UnsupportedBackend(_)
        )
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            LinkError::Configuration(_) => ErrorCategory::Configuration,
            LinkError::State(_) => ErrorCategory::State,
            LinkError::Transport(_) => ErrorCategory::Transport,
            LinkError::UnsupportedBackend(_) => ErrorCategory::Backend,
        }
    }
}

impl From<FrameError> for LinkError {
    fn from(err: FrameError) -> Self {
        LinkError::Configuration(err.to_string())
    }
}

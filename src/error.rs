//! Error types for VenomSync

use std::io;
use thiserror::Error;

use crate::unique_id::UniqueId;

/// Result type for VenomSync operations
pub type Result<T> = std::result::Result<T, VenomError>;

/// How bad an error is for the component that hit it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    /// Reported to the caller, the component stays usable
    Recoverable,
    /// A programming error; the operation cannot produce a usable value
    Fatal,
}

/// Broad class of an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// A fixed-size resource is exhausted
    Capacity,
    /// The caller used an API in a way it does not allow
    Usage,
    /// A value was built with parameters that can never work
    Construction,
    /// The operating system refused a request
    Platform,
}

/// Errors that can occur in VenomSync operations
#[derive(Debug, Error)]
pub enum VenomError {
    /// Bounded queue rejected a push
    #[error("Queue is full")]
    QueueFull,

    /// Wait set already holds as many conditions as it can
    #[error("Wait set capacity of {capacity} conditions exceeded")]
    CapacityExceeded { capacity: usize },

    /// Every condition variable slot of the process pool is leased
    #[error("No free condition variable slot (pool size {slots})")]
    ConditionVariablesExhausted { slots: usize },

    /// A shared condition variable is already claimed by another wait set
    #[error("Shared condition variable is already in use by a wait set")]
    ConditionVariableInUse,

    /// Trigger placed in shared memory outside the wait set's segment
    #[error("Trigger {id} lives in shared memory the wait set cannot reach from other processes")]
    ForeignTrigger { id: UniqueId },

    /// Condition is already attached to a wait set
    #[error("Condition {id} is already attached")]
    AlreadyAttached { id: UniqueId },

    /// Notification index outside the flag space of a condition variable
    #[error("Notification index {index} out of range: max {max}")]
    NotificationIndexOutOfRange { index: usize, max: usize },

    /// Slot index outside an indexed storage
    #[error("Index {index} out of bounds for capacity {capacity}")]
    IndexOutOfBounds { index: usize, capacity: usize },

    /// Capacity is zero, not a power of two, or above a hard limit
    #[error("Invalid capacity {capacity}: {reason}")]
    InvalidCapacity {
        capacity: usize,
        reason: &'static str,
    },

    /// The unique id counter wrapped around
    #[error("Unique id space exhausted")]
    UniqueIdsExhausted,

    /// Failed to create shared memory
    #[error("Failed to create shared memory '{name}': {source}")]
    ShmCreate {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to open shared memory
    #[error("Failed to open shared memory '{name}': {source}")]
    ShmOpen {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to map memory
    #[error("Failed to map memory: {0}")]
    Mmap(#[source] io::Error),

    /// Failed to truncate shared memory
    #[error("Failed to set shared memory size: {0}")]
    Truncate(#[source] io::Error),

    /// Shared memory name is not usable
    #[error("Invalid shared memory name '{0}'")]
    InvalidName(String),

    /// Namespace too long
    #[error("Namespace too long: max {max} chars, got {got}")]
    NamespaceTooLong { max: usize, got: usize },

    /// Invalid segment magic number
    #[error("Invalid segment magic number: expected 0x{expected:08X}, got 0x{got:08X}")]
    InvalidMagic { expected: u32, got: u32 },

    /// Segment written by an incompatible layout version
    #[error("Unsupported segment version: expected {expected}, got {got}")]
    VersionMismatch { expected: u32, got: u32 },

    /// Object would not fit in, or is misaligned within, a shared memory region
    #[error("Placement at offset {offset} with size {size} does not fit region of {region} bytes or is misaligned")]
    InvalidPlacement {
        offset: u64,
        size: usize,
        region: usize,
    },
}

impl VenomError {
    /// Category of this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            VenomError::QueueFull
            | VenomError::CapacityExceeded { .. }
            | VenomError::ConditionVariablesExhausted { .. }
            | VenomError::UniqueIdsExhausted => ErrorCategory::Capacity,
            VenomError::AlreadyAttached { .. }
            | VenomError::ConditionVariableInUse
            | VenomError::ForeignTrigger { .. }
            | VenomError::NotificationIndexOutOfRange { .. }
            | VenomError::IndexOutOfBounds { .. }
            | VenomError::InvalidName(_)
            | VenomError::NamespaceTooLong { .. }
            | VenomError::InvalidPlacement { .. } => ErrorCategory::Usage,
            VenomError::InvalidCapacity { .. } => ErrorCategory::Construction,
            VenomError::ShmCreate { .. }
            | VenomError::ShmOpen { .. }
            | VenomError::Mmap(_)
            | VenomError::Truncate(_)
            | VenomError::InvalidMagic { .. }
            | VenomError::VersionMismatch { .. } => ErrorCategory::Platform,
        }
    }

    /// Severity of this error
    pub fn severity(&self) -> Severity {
        match self.category() {
            ErrorCategory::Construction => Severity::Fatal,
            ErrorCategory::Capacity | ErrorCategory::Usage | ErrorCategory::Platform => {
                Severity::Recoverable
            }
        }
    }
}

#![forbid(unsafe_code)]

//! Identifiers and the crate-wide error type.

use std::fmt;
use std::io;

/// Identifier assigned to an object when it is created.
///
/// Ids increase monotonically within an instance and are never reused.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct ObjectId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ObjectId {
    fn from(value: u64) -> Self {
        ObjectId(value)
    }
}

/// Failure reported by a population callback.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("populate failed: {0}")]
pub struct PopulateError(pub String);

impl PopulateError {
    /// Creates a populate error carrying `message`.
    pub fn new(message: impl Into<String>) -> Self {
        PopulateError(message.into())
    }
}

/// Errors produced by the engine.
#[derive(thiserror::Error, Debug)]
pub enum UfoError {
    /// An operating-system call failed.
    #[error("IO: {0}")]
    Io(#[from] io::Error),
    /// Geometry or limits were rejected.
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
    /// [`crate::Instance::set_memory_limits`] was called twice.
    #[error("memory limits can only be set once")]
    LimitsAlreadySet,
    /// The instance stopped, or is stopping, before the request completed.
    #[error("instance shutting down")]
    ShuttingDown,
    /// One load exceeds the whole memory budget.
    #[error("chunk of {chunk} bytes exceeds high water mark of {high_water} bytes")]
    ChunkTooLarge { chunk: usize, high_water: usize },
    /// A fault or release hit an address no object owns.
    #[error("no object registered at address {0:#x}")]
    UnknownAddress(usize),
    /// A new reservation intersects an existing one.
    #[error("interval {start:#x}+{len} overlaps a registered object")]
    Overlap { start: usize, len: usize },
    /// The eviction ring is full and growth is disabled.
    #[error("eviction ring is full and cannot grow")]
    RingExhausted,
    /// Eviction found nothing left to pop.
    #[error("eviction ring is empty")]
    RingEmpty,
    /// A populate callback failed.
    #[error(transparent)]
    Populate(#[from] PopulateError),
    /// Too many interrupted waits in a row.
    #[error("event wait interrupted {0} times in a row")]
    InterruptStorm(u32),
    /// The host cannot provide userfaultfd service.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    /// The worker thread panicked.
    #[error("worker thread panicked")]
    WorkerPanicked,
    /// [`crate::Instance::start`] was called on a running instance.
    #[error("instance already started")]
    AlreadyStarted,
    /// Objects were requested before [`crate::Instance::start`].
    #[error("instance not started")]
    NotStarted,
    /// An accessor range falls outside the header or body.
    #[error("access of {len} bytes at offset {offset} is out of bounds")]
    OutOfBounds { offset: usize, len: usize },
    /// The handle's object was released.
    #[error("object {0} has been destroyed")]
    Destroyed(ObjectId),
    /// A body write to a read-only object.
    #[error("object {0} is read-only")]
    ReadOnly(ObjectId),
    /// Options could not be parsed or are inconsistent.
    #[error("invalid options: {0}")]
    InvalidOptions(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, UfoError>;

impl UfoError {
    /// Returns true for errors that terminate the owning instance.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            UfoError::Io(_)
                | UfoError::UnknownAddress(_)
                | UfoError::RingExhausted
                | UfoError::RingEmpty
                | UfoError::Populate(_)
                | UfoError::InterruptStorm(_)
                | UfoError::WorkerPanicked
        )
    }
}

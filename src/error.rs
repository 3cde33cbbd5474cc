//! Error types for the scheduler core
//!
//! Mirrors the shape of a typical kernel error module: one broad enum with
//! sub-domain variants, a hand-written [`std::fmt::Display`] impl, and `From`
//! glue so callers can propagate with `?` instead of matching on raw codes.
//! [`ErrorCode`] is the C-style numeric projection used at the public API
//! boundary; internal code should never construct it directly.

use std::fmt;

/// Top-level runtime error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "runtime errors must be handled, not silently discarded"]
pub enum RuntimeError {
    /// A task-type callback was missing when required (e.g. `run_callback`
    /// is null without the `EXTERNAL` flag).
    InvalidCallback,
    /// Requested metadata size exceeds the 4096-byte inline limit.
    InvalidMetadataSize { requested: usize, max: usize },
    /// Flags named in the call are mutually exclusive or otherwise illegal.
    InvalidOperation { reason: &'static str },
    /// A parameter was out of its valid range.
    InvalidParameter { name: &'static str },
    /// The runtime has not been initialized.
    NotInitialized,
    /// Allocation failed; no partial state was created.
    OutOfMemory,
    /// A caller-only operation (`pause`, `yield`, ...) was invoked outside a
    /// task body.
    OutsideTask,
    /// Error originating from the submit path.
    Submit(SubmitError),
    /// Error originating from affinity handling.
    Affinity(AffinityError),
    /// Error originating from the delegation lock.
    DtLock(DtLockError),
    /// Catch-all for states that should be unreachable in a correct caller.
    Unknown,
}

/// Errors from `submit`. Ingress capacity is not among these: `submit`
/// spins with a rescue drain until the push succeeds rather than
/// surfacing a capacity error (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// Task is parallel and therefore cannot be submitted `INLINE`.
    ParallelInline,
    /// Task is parallel and therefore cannot be submitted with `BLOCKING`
    /// wakeup semantics.
    ParallelBlocking,
    /// Task is parallel and therefore cannot be waited on via
    /// `DEADLINE_WAKE`.
    ParallelDeadlineWake,
}

/// Errors from affinity get/set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AffinityError {
    CpuOutOfRange { cpu: u32, ncpu: u32 },
    NumaOutOfRange { numa: u32, nnuma: u32 },
}

/// Errors surfaced by the delegation lock (capacity-only, per §4.3/§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtLockError {
    /// Waitqueue capacity (`2*NCPU`) exceeded; should be unreachable given
    /// one slot per worker.
    WaitqueueFull,
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// C-style numeric error codes, as enumerated in the spec's external
/// interface section. Produced only at the public API boundary via
/// [`RuntimeError::as_code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    Success = 0,
    InvalidCallback = -1,
    InvalidMetadataSize = -2,
    InvalidOperation = -3,
    InvalidParameter = -4,
    NotInitialized = -5,
    OutOfMemory = -6,
    OutsideTask = -7,
    Unknown = -8,
}

impl RuntimeError {
    /// Project this error onto the numeric error codes of the public API.
    pub fn as_code(&self) -> ErrorCode {
        match self {
            Self::InvalidCallback => ErrorCode::InvalidCallback,
            Self::InvalidMetadataSize { .. } => ErrorCode::InvalidMetadataSize,
            Self::InvalidOperation { .. } => ErrorCode::InvalidOperation,
            Self::InvalidParameter { .. } => ErrorCode::InvalidParameter,
            Self::NotInitialized => ErrorCode::NotInitialized,
            Self::OutOfMemory => ErrorCode::OutOfMemory,
            Self::OutsideTask => ErrorCode::OutsideTask,
            Self::Submit(_) | Self::Affinity(_) | Self::DtLock(_) => ErrorCode::InvalidOperation,
            Self::Unknown => ErrorCode::Unknown,
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidCallback => write!(f, "task type is missing a required callback"),
            Self::InvalidMetadataSize { requested, max } => {
                write!(f, "metadata size {requested} exceeds maximum {max}")
            }
            Self::InvalidOperation { reason } => write!(f, "invalid operation: {reason}"),
            Self::InvalidParameter { name } => write!(f, "invalid parameter: {name}"),
            Self::NotInitialized => write!(f, "runtime not initialized"),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::OutsideTask => write!(f, "operation called outside a task body"),
            Self::Submit(e) => write!(f, "submit error: {e:?}"),
            Self::Affinity(e) => write!(f, "affinity error: {e:?}"),
            Self::DtLock(e) => write!(f, "delegation lock error: {e:?}"),
            Self::Unknown => write!(f, "unknown error"),
        }
    }
}

impl std::error::Error for RuntimeError {}

impl From<SubmitError> for RuntimeError {
    fn from(e: SubmitError) -> Self {
        Self::Submit(e)
    }
}

impl From<AffinityError> for RuntimeError {
    fn from(e: AffinityError) -> Self {
        Self::Affinity(e)
    }
}

impl From<DtLockError> for RuntimeError {
    fn from(e: DtLockError) -> Self {
        Self::DtLock(e)
    }
}

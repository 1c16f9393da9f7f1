//! Error taxonomy for model loading, arena construction, and execution.
//!
//! Load-time failures (format, cycles, sizing) abort engine construction.
//! Execute-time failures leave the engine in a valid, reusable state.
//! Internal invariant violations (out-of-bounds slot access, bad alignment
//! arguments) are programmer errors and panic instead of propagating.

use thiserror::Error;

/// All fallible operations in the crate return this error.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The model binary is malformed or truncated.
    #[error("invalid model format: {0}")]
    InvalidFormat(String),

    /// The optimized-variant header carries a version outside the accepted set.
    #[error("unsupported model version {0}")]
    UnsupportedVersion(u32),

    /// The topology edges contain a dependency cycle.
    #[error("dependency cycle detected at node {0}")]
    GraphCyclic(u16),

    /// Duplicate id, dangling topology reference, or out-of-bounds offset.
    #[error("inconsistent graph: {0}")]
    GraphInconsistent(String),

    /// Caller-requested arena total is below the computed minimum.
    #[error("arena too small: {requested} bytes requested, {needed} bytes needed")]
    ArenaTooSmall { requested: usize, needed: usize },

    /// The NodePayloads bump allocator ran out of region.
    #[error("node payload region exhausted: {requested} bytes requested, {remaining} remaining")]
    NodePayloadsExhausted { requested: usize, remaining: usize },

    /// The Scratch bump allocator ran out of region.
    #[error("scratch region exhausted: {requested} bytes requested, {remaining} remaining")]
    ScratchExhausted { requested: usize, remaining: usize },

    /// A streaming operation was invoked on an engine built without streaming.
    #[error("streaming is not configured on this engine")]
    StreamingNotConfigured,

    /// A streaming input exceeds the StreamingInput window.
    #[error("streaming input of {len} bytes exceeds window of {window} bytes")]
    StreamingOverflow { len: usize, window: usize },

    /// A parallel execute was requested but no scheduler was built.
    #[error("scheduler not initialized")]
    SchedulerNotInitialized,

    /// Underlying I/O failure while reading a model file.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, EngineError>;

//! Error types - provider failures, heap failures, configuration failures
//!
//! Backout never fails and has no error type. Programming errors (zero-size
//! requests, bad alignment, mismatched backout bounds) panic instead of
//! surfacing here.

use std::io;
use thiserror::Error;

/// Failure reported by a [`PageProvider`](crate::vm::PageProvider).
#[derive(Debug, Error)]
pub enum VmError {
    #[error("failed to reserve {size} bytes of address space")]
    Reserve {
        size: usize,
        #[source]
        source: io::Error,
    },

    #[error("failed to commit {size} bytes at {addr:#x}")]
    Commit {
        addr: usize,
        size: usize,
        #[source]
        source: io::Error,
    },

    #[error("failed to change protection of {size} bytes at {addr:#x}")]
    Protect {
        addr: usize,
        size: usize,
        #[source]
        source: io::Error,
    },

    #[error("page budget exhausted: {requested} bytes requested, {remaining} remaining")]
    Exhausted { requested: usize, remaining: usize },
}

/// Failure of a heap operation.
#[derive(Debug, Error)]
pub enum HeapError {
    /// Reservation or commit failed; the heap is unchanged and still usable.
    #[error("out of memory: could not satisfy a {requested}-byte request")]
    OutOfMemory { requested: usize },

    /// Rejected construction parameters.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The allocation tracker could not grow its own bookkeeping. The
    /// allocation being tracked has already been backed out.
    #[error("allocation tracker could not grow its bookkeeping")]
    OutOfTrackerSpace,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Failure loading or validating [`Settings`](crate::config::Settings).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type Result<T, E = HeapError> = std::result::Result<T, E>;

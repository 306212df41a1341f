//! Error types shared across the crate.
//!
//! Lookup misses are reported as `Option`/`bool`, never as errors. Errors
//! are reserved for I/O failures while mapping a pool and for invariant
//! violations discovered on recovery, which are fatal: the tree refuses to
//! operate on corrupt state.

use std::fmt;
use std::io;

/// Fatal conditions raised while opening or validating a tree.
#[derive(Debug)]
pub enum TreeError {
    /// The pool file could not be created, mapped, or grown.
    Io(io::Error),

    /// A persisted invariant does not hold (bad magic, out-of-range
    /// cursor, duplicate slot in a state word, unordered keys, ...).
    /// The payload names the violated invariant.
    CorruptState(&'static str),
}

impl fmt::Display for TreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "pool i/o error: {e}"),

            Self::CorruptState(what) => write!(f, "corrupt persistent state: {what}"),
        }
    }
}

impl std::error::Error for TreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),

            Self::CorruptState(_) => None,
        }
    }
}

impl From<io::Error> for TreeError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

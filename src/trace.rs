//! Event logging, compiled in only with the `tracing` cargo feature.
//!
//! Instead of one macro per level, events are grouped by domain, each
//! pinned to its own `RUST_LOG` target so a run can select exactly the
//! noise it wants:
//!
//! - `structure_event!` — shape changes (splits, merges, root moves, bulk
//!   builds) under the `pmtree::structure` target, debug level.
//! - `pm_event!` — per-allocation and per-redirect noise under the
//!   `pmtree::pm` target, trace level.
//!
//! ```bash
//! # only structural events
//! RUST_LOG=pmtree::structure=debug cargo test --features tracing
//! # everything
//! RUST_LOG=pmtree=trace cargo test --features tracing
//! ```
//!
//! Without the feature both macros expand to nothing.

#[cfg(feature = "tracing")]
macro_rules! structure_event {
    ($($arg:tt)*) => {
        tracing::debug!(target: "pmtree::structure", $($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! structure_event {
    ($($arg:tt)*) => {};
}

#[cfg(feature = "tracing")]
macro_rules! pm_event {
    ($($arg:tt)*) => {
        tracing::trace!(target: "pmtree::pm", $($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! pm_event {
    ($($arg:tt)*) => {};
}

pub(crate) use {pm_event, structure_event};

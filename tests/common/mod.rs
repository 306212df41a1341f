//! Shared test setup: a once-guarded tracing subscriber.
//!
//! ```bash
//! RUST_LOG=pmtree=trace cargo test --features tracing -- --nocapture
//! ```

#![allow(dead_code)]

use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Install a console subscriber honoring `RUST_LOG`. Safe to call from
/// every test; only the first call takes effect.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

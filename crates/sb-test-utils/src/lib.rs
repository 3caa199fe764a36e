//! Shared test utilities for the split-HTTP workspace
//!
//! - Skip helpers for environments without loopback networking or UDP
//! - Self-signed certificate generation for TLS / QUIC carriers
//! - One-shot `tracing` subscriber installation driven by `RUST_LOG`
//!
//! ## Usage
//!
//! ```toml
//! [dev-dependencies]
//! sb-test-utils = { path = "../sb-test-utils" }
//! ```
//!
//! ```rust,no_run
//! let (chain, key) = sb_test_utils::tls::self_signed("localhost");
//! sb_test_utils::init_tracing();
//! ```

mod skip;
pub mod tls;

pub use skip::{skip_if_io_permission_denied, skip_if_udp_unavailable, skip_with_reason};

/// Install a fmt subscriber once per test binary; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

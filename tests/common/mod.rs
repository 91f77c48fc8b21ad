//! Shared test setup. Not a test binary itself (`tests/common/mod.rs`
//! is the conventional way to share code across integration test
//! binaries without cargo treating it as its own suite).

/// Initializes a `tracing` subscriber for the current test binary the way
/// the teacher's CLI does (`EnvFilter` driven by `RUST_LOG`), so `tracing`
/// output from hydration/commit/snapshot/passivation is visible with
/// `--nocapture` instead of silently going nowhere. Safe to call from every
/// test; only the first call in a given test binary wins.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

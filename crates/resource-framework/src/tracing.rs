//! # Observability & Tracing
//!
//! Every layer logs through the `tracing` macros with structured fields
//! (`resource_type`, `index`, `op`, `key`) instead of formatted strings.
//!
//! ## What Gets Traced
//!
//! - **Store Lifecycle**: startup, every request kind, commits, rollbacks, shutdown
//! - **Query Reading**: parameters read, unknown parameters, rejected values
//! - **Atomic Batches**: a `process` span per batch, each applied operation,
//!   the failing index on abort, post-commit hook failures
//! - **Reads**: a `get_all` / `get_by_id` span with include and count steps
//! - **Resource Hooks**: one line per cascade layer, one per completed cascade
//!
//! ## Usage
//!
//! ```bash
//! RUST_LOG=info cargo run -p resource-sample
//! RUST_LOG=debug cargo run -p resource-sample
//! RUST_LOG=resource_framework::operations=debug cargo test
//! ```
//!
//! At `info` a batch reads roughly like:
//! - `INFO process: Created resource_type="articles" id=Some("1")`
//! - `INFO process: Batch committed operations=2`
//!
//! Use `debug` to see every store request and hook layer.

/// Installs a compact `fmt` subscriber filtered by `RUST_LOG`.
///
/// Call once at startup. Panics if a global subscriber is already set.
pub fn setup_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();
}

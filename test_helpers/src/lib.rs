//! Utilities shared by the workspace's tests.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(clippy::explicit_iter_loop, clippy::use_self, clippy::clone_on_ref_ptr)]

use std::sync::Once;
use tracing_subscriber::EnvFilter;

static LOG_SETUP: Once = Once::new();

/// Enables debug logging if the `RUST_LOG` environment variable is set.
/// Set it in a `.env` file or the shell before running a test to see output.
pub fn maybe_start_logging() {
    dotenvy::dotenv().ok();
    if std::env::var("RUST_LOG").is_ok() {
        start_logging()
    }
}

/// Install a global tracing subscriber honoring `RUST_LOG`. Idempotent.
pub fn start_logging() {
    LOG_SETUP.call_once(|| {
        // route `log` records from dependencies through tracing as well
        tracing_log::LogTracer::init().ok();

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .finish();
        observability_deps::tracing::subscriber::set_global_default(subscriber)
            .expect("global subscriber not yet installed");
    })
}

/// A fresh temporary directory, cleaned up on drop.
pub fn tmp_dir() -> std::io::Result<tempfile::TempDir> {
    tempfile::Builder::new().prefix("dupmill").tempdir()
}

/// A fresh temporary file, cleaned up on drop.
pub fn tmp_file() -> std::io::Result<tempfile::NamedTempFile> {
    tempfile::Builder::new().prefix("dupmill").tempfile()
}

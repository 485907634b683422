//! Tracing helpers for tests.
//!
//! [`init_test_tracing`] installs a process-wide subscriber writing to the
//! test harness. [`capture_run_log`] installs a thread-scoped [`RunLog`] so a
//! test can assert on what a run logged.

use repodoc_core::{RunLog, RunLogHandle};
use tracing::Level;
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Filter used when `RUST_LOG` is not set.
const DEFAULT_FILTER: &str = "warn,repodoc_core=info";

/// Install the test-writer subscriber once per process. Later calls are
/// ignored.
///
/// ```ignore
/// #[tokio::test]
/// async fn my_test() {
///     repodoc_test_utils::tracing_setup::init_test_tracing();
/// }
/// ```
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
        )
        .with_test_writer()
        .try_init();
}

/// Capture INFO and above on the current thread until the guard drops.
///
/// Use with a current-thread runtime (plain `#[tokio::test]`) so every event
/// of the run lands on this thread.
pub fn capture_run_log() -> (RunLogHandle, DefaultGuard) {
    let log = RunLog::new(1_000, Level::INFO);
    let handle = log.handle();
    let guard = tracing_subscriber::registry().with(log).set_default();
    (handle, guard)
}

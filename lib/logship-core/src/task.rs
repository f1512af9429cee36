//! Helpers for spawning background tasks.

use std::future::Future;

use tokio::task::JoinHandle;
use tracing::Instrument as _;

/// Spawns a named background task attached to the current `tracing` span.
pub fn spawn_traced_named<S, F, T>(name: S, f: F) -> JoinHandle<T>
where
    S: Into<String>,
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    // The span's parent is whatever span is current at the call site.
    let name: String = name.into();
    let span = tracing::debug_span!("task", name = %name);
    tokio::task::spawn(f.instrument(span))
}

//! Offloading of blocking PC/SC calls.
//!
//! The host side of this crate is asynchronous; every binding call that may
//! block runs on the tokio blocking pool, one call per task. Ordering across
//! calls on the same handle is the caller's responsibility.

// ───── Local Modules ─────
use crate::error::{code, Error};

/// Runs one blocking binding call off the host thread and resolves with its
/// result. A worker that dies without reporting (panic, runtime teardown)
/// surfaces as an internal platform error rather than a hang.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, Error>
where
    F: FnOnce() -> Result<T, Error> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(e) => {
            log::error!("blocking PC/SC task failed to join: {}", e);
            Err(Error::Other(code::INTERNAL_ERROR))
        }
    }
}

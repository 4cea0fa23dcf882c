//! The retry governor for source reads, and the shared destination
//! exception policy.

use crate::error::{Result, SyncError};
use std::fmt::Debug;
use std::thread;
use std::time::Duration;
use tracing::{error, warn};

/// attempts the governor gives a transient source failure before the error
/// surfaces.
pub(crate) const MAX_SOURCE_ATTEMPTS: u32 = 10;

const BACKOFF_BASE_SECS: f64 = 0.5;
const BACKOFF_GROWTH: f64 = 1.5;

/// backoff slept after failed attempt number `attempt` (zero-based).
fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs_f64(BACKOFF_BASE_SECS * BACKOFF_GROWTH.powi(attempt as i32))
}

/// Run `operation` up to `max_attempts` times, sleeping with exponential
/// backoff between attempts on transient source errors.
///
/// Non-retryable errors (duplicate key, cursor-not-found, anything not a
/// source read failure) surface immediately.
pub fn with_retries<T, F>(max_attempts: u32, mut operation: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    for attempt in 0..max_attempts {
        match operation() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable_source() && attempt + 1 < max_attempts => {
                let delay = backoff_delay(attempt);
                warn!(error=%e, ?delay, "transient source error, backing off");
                thread::sleep(delay);
            }
            Err(e) => return Err(e),
        }
    }
    unreachable!("with_retries needs max_attempts >= 1")
}

/// Run a destination write under the unsafe policy.
///
/// When the destination itself rejected the record and `unsafe_mode` is on,
/// the record is logged and skipped; every other failure is logged with its
/// namespace and record, then surfaced.
pub(crate) fn unsafe_handle_exceptions<R, F>(
    unsafe_mode: bool,
    ns: &str,
    record: &R,
    operation: F,
) -> Result<()>
where
    R: Debug,
    F: FnOnce() -> Result<()>,
{
    match operation() {
        Ok(()) => Ok(()),
        Err(e) if e.is_rejected_record() && unsafe_mode => {
            warn!(%ns, ?record, error=%e, "ignoring record the destination rejected");
            Ok(())
        }
        Err(e) => {
            error!(%ns, ?record, "error processing record");
            Err(e)
        }
    }
}

//! Bounded retry of a fallible asynchronous operation.
//!
//! Retries are local to the LLM-class strategies: output validation
//! failures re-run the whole model stream, everything else fails fast.
//! There is no backoff - the model's own sampling is the randomness
//! source, so an immediate re-issue is as good as a delayed one.

use std::future::Future;

use crate::engine::error::EngineError;

/// Default attempt budget for the LLM-class strategies.
pub const DEFAULT_RETRY_BUDGET: u32 = 5;

/// Run `op` up to `budget` times, re-attempting while `should_retry`
/// accepts the error. The attempt index (0-based) is passed to `op` so
/// callers can make the first attempt special (e.g. only the first
/// attempt streams deltas to the caller).
pub async fn retry<T, F, Fut, P>(budget: u32, mut should_retry: P, mut op: F) -> Result<T, EngineError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
    P: FnMut(&EngineError) -> bool,
{
    let budget = budget.max(1);
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt + 1 < budget && should_retry(&err) => {
                tracing::debug!(attempt, error = %err, "retrying recoverable failure");
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

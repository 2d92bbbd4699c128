//! Bounded retry combinator.
//!
//! Each attempt classifies its own outcome instead of mutating a shared
//! counter; [`retry_bounded`] owns the loop.

use crate::error::Result;
use log::debug;

/// Outcome of a single attempt.
#[derive(Debug)]
pub enum Attempt<T> {
    /// Finished; stop retrying and return the value.
    Done(T),
    /// Worth another try. Returned as-is once the budget is spent.
    Retry(T),
    /// Give up immediately.
    Fatal(crate::Error),
}

/// Run `attempt` up to `max_attempts` times.
///
/// The closure receives the 1-based attempt number. When every attempt asks
/// for a retry, the value of the last one is returned.
pub fn retry_bounded<T, F>(max_attempts: u32, mut attempt: F) -> Result<T>
where
    F: FnMut(u32) -> Attempt<T>,
{
    let max_attempts = max_attempts.max(1);
    let mut n = 1;
    loop {
        match attempt(n) {
            Attempt::Done(value) => return Ok(value),
            Attempt::Fatal(err) => return Err(err),
            Attempt::Retry(value) if n >= max_attempts => {
                debug!("Retry budget of {max_attempts} attempts exhausted");
                return Ok(value);
            },
            Attempt::Retry(_) => {
                debug!("Attempt {n}/{max_attempts} asked for a retry");
                n += 1;
            },
        }
    }
}

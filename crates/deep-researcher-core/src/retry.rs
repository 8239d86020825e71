//! Bounded retry with input shrinking.
//!
//! Serves both findings compression and report synthesis: a token-limit
//! failure shrinks the input before the next attempt, a transient failure
//! retries unchanged, anything else stops immediately.

use std::future::Future;

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Shrink the input, then try again.
    Shrink,
    /// Try again with the same input.
    Repeat,
    /// Stop and surface the error.
    GiveUp,
}

#[derive(Debug)]
pub enum RetryFailure<E> {
    /// Every attempt failed with a recoverable error.
    Exhausted { attempts: usize, last: E },
    /// The classifier gave up on this error.
    Aborted(E),
    /// A shrink was requested but the input cannot be reduced further.
    CannotShrink(E),
}

impl<E> RetryFailure<E> {
    pub fn into_error(self) -> E {
        match self {
            RetryFailure::Exhausted { last, .. } => last,
            RetryFailure::Aborted(err) | RetryFailure::CannotShrink(err) => err,
        }
    }
}

/// Run `attempt` up to `max_attempts` times.
///
/// `shrink` receives the current input and the 1-based count of shrinks so
/// far; returning `None` stops with [`RetryFailure::CannotShrink`]. The input
/// is never shrunk after the final attempt.
pub async fn retry_with_shrink<I, T, E, A, Fut, S, C>(
    max_attempts: usize,
    input: I,
    mut attempt: A,
    mut shrink: S,
    classify: C,
) -> Result<T, RetryFailure<E>>
where
    I: Clone,
    A: FnMut(I) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    S: FnMut(I, usize) -> Option<I>,
    C: Fn(&E) -> Recovery,
{
    let max_attempts = max_attempts.max(1);
    let mut input = input;
    let mut shrinks = 0usize;
    let mut attempt_no = 0usize;

    loop {
        attempt_no += 1;
        let err = match attempt(input.clone()).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let recovery = classify(&err);
        if recovery == Recovery::GiveUp {
            return Err(RetryFailure::Aborted(err));
        }
        if attempt_no >= max_attempts {
            return Err(RetryFailure::Exhausted {
                attempts: attempt_no,
                last: err,
            });
        }
        if recovery == Recovery::Shrink {
            shrinks += 1;
            input = match shrink(input, shrinks) {
                Some(next) => next,
                None => return Err(RetryFailure::CannotShrink(err)),
            };
        }
    }
}

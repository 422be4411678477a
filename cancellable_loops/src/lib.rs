//! # cancellable_loops
//!
//! A small utility crate for running fallible, cancellable loops in both sequential and
//! parallel contexts.
//!
//! Every loop body returns a `Result`. The first error stops the loop (fail-fast) and is
//! handed back to the caller, and an abort flag that is raised from another thread stops
//! the loop before the next item is started. Items that are already running are never
//! interrupted, so the granularity of cancellation is one loop item.
//!
//! ## Example
//!
//! ```
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use cancellable_loops::{try_for_each_cancellable, LoopError};
//!
//! let abort_flag = AtomicBool::new(false);
//! let mut seen = Vec::new();
//!
//! let result: Result<(), LoopError<String>> = try_for_each_cancellable(0..10, &abort_flag, |i| {
//!     seen.push(i);
//!     if i == 3 {
//!         abort_flag.store(true, Ordering::Relaxed);
//!     }
//!     Ok(())
//! });
//!
//! assert_eq!(result, Err(LoopError::Cancelled));
//! assert_eq!(seen, vec![0, 1, 2, 3]);
//! ```

use rayon::prelude::*;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// Reason a cancellable loop stopped before visiting every item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopError<E> {
    /// The abort flag was raised between two items.
    Cancelled,
    /// The loop body returned an error.
    Failed(E),
}

impl<E: fmt::Display> fmt::Display for LoopError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopError::Cancelled => write!(f, "loop cancelled"),
            LoopError::Failed(err) => write!(f, "{err}"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for LoopError<E> {}

/// Executes a sequential loop that stops on the first error or when the abort flag is set.
///
/// The flag is checked before every item. A raised flag is left raised, so that other loops
/// observing the same flag stop as well.
///
/// # Arguments
///
/// * `iter` - Any iterator to process
/// * `abort_flag` - An atomic boolean that can be set to `true` to cancel the loop
/// * `func` - A fallible function to apply to each element in the iterator
///
/// # Examples
///
/// ```
/// use std::sync::atomic::AtomicBool;
/// use cancellable_loops::{try_for_each_cancellable, LoopError};
///
/// let abort_flag = AtomicBool::new(false);
/// let mut sum = 0;
///
/// let result = try_for_each_cancellable(1..=10, &abort_flag, |i| {
///     if i > 5 {
///         return Err("too large");
///     }
///     sum += i;
///     Ok(())
/// });
///
/// assert_eq!(result, Err(LoopError::Failed("too large")));
/// assert_eq!(sum, 15);
/// ```
pub fn try_for_each_cancellable<I, F, T, E>(
    iter: I,
    abort_flag: &AtomicBool,
    mut func: F,
) -> Result<(), LoopError<E>>
where
    I: IntoIterator<Item = T>,
    F: FnMut(T) -> Result<(), E>,
{
    for item in iter {
        if abort_flag.load(Ordering::Relaxed) {
            return Err(LoopError::Cancelled);
        }
        func(item).map_err(LoopError::Failed)?;
    }
    Ok(())
}

/// Executes a parallel loop that stops on the first error or when the abort flag is set.
///
/// Work is distributed with Rayon. Once an item fails or the flag is observed, items that
/// have not started yet are skipped. When several items fail concurrently, or an item fails
/// while the flag is raised, any one of those outcomes is returned.
///
/// # Arguments
///
/// * `iter` - Any parallel iterator to process
/// * `abort_flag` - An atomic boolean that can be set to `true` to cancel the loop
/// * `func` - A fallible function to apply to each element in the iterator
///
/// # Examples
///
/// ```
/// use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
/// use cancellable_loops::par_try_for_each_cancellable;
///
/// let abort_flag = AtomicBool::new(false);
/// let counter = AtomicUsize::new(0);
///
/// let result: Result<(), cancellable_loops::LoopError<()>> =
///     par_try_for_each_cancellable(0..100, &abort_flag, |_| {
///         counter.fetch_add(1, Ordering::Relaxed);
///         Ok(())
///     });
///
/// assert!(result.is_ok());
/// assert_eq!(counter.load(Ordering::Relaxed), 100);
/// ```
pub fn par_try_for_each_cancellable<I, F, E>(
    iter: I,
    abort_flag: &AtomicBool,
    func: F,
) -> Result<(), LoopError<E>>
where
    I: IntoParallelIterator,
    F: Fn(I::Item) -> Result<(), E> + Sync + Send,
    I::Item: Send,
    E: Send,
{
    iter.into_par_iter().try_for_each(|item| {
        if abort_flag.load(Ordering::Relaxed) {
            Err(LoopError::Cancelled)
        } else {
            func(item).map_err(LoopError::Failed)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn sequential_loop_visits_everything_without_abort() {
        let abort = AtomicBool::new(false);
        let mut visited = 0;
        let result: Result<(), LoopError<()>> = try_for_each_cancellable(0..8, &abort, |_| {
            visited += 1;
            Ok(())
        });
        assert!(result.is_ok());
        assert_eq!(visited, 8);
    }

    #[test]
    fn sequential_loop_respects_preset_abort() {
        let abort = AtomicBool::new(true);
        let mut visited = 0;
        let result: Result<(), LoopError<()>> = try_for_each_cancellable(0..8, &abort, |_| {
            visited += 1;
            Ok(())
        });
        assert_eq!(result, Err(LoopError::Cancelled));
        assert_eq!(visited, 0);
        // the flag stays raised for other observers
        assert!(abort.load(Ordering::Relaxed));
    }

    #[test]
    fn parallel_loop_stops_on_error() {
        let abort = AtomicBool::new(false);
        let result = par_try_for_each_cancellable(0..1000usize, &abort, |i| {
            if i == 500 {
                Err(i)
            } else {
                Ok(())
            }
        });
        assert_eq!(result, Err(LoopError::Failed(500)));
    }

    #[test]
    fn parallel_loop_skips_work_after_abort() {
        let abort = AtomicBool::new(true);
        let counter = AtomicUsize::new(0);
        let result: Result<(), LoopError<()>> = par_try_for_each_cancellable(0..64, &abort, |_| {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });
        assert_eq!(result, Err(LoopError::Cancelled));
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }
}

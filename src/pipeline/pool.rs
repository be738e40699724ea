//! Bounded pool of OS worker threads
//!
//! Workers pull `(index, item)` pairs from a bounded channel, run the work
//! function synchronously to completion, and push the result back tagged with
//! its index so the caller gets results in input order. The pool holds no
//! per-item state beyond the active count used to observe the bound.

use crossbeam_channel::bounded;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use tracing::{debug, error};

/// Failure of one item in the pool
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// The work function panicked
    #[error("worker panicked on item {index}: {message}")]
    Panicked {
        /// Input position
        index: usize,
        /// Panic payload, when it was a string
        message: String,
    },

    /// No worker picked the item up (all workers failed to start)
    #[error("item {index} was never executed")]
    NotExecuted {
        /// Input position
        index: usize,
    },
}

/// Fixed-size pool of worker threads
#[derive(Debug)]
pub struct WorkerPool {
    size: usize,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl WorkerPool {
    /// Pool with `size` worker slots (at least one)
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Worker slots
    pub fn size(&self) -> usize {
        self.size
    }

    /// Items currently executing
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of items observed executing at once
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Run `work` over every item on at most `size` threads
    ///
    /// Blocks until every item has finished. Results come back in input order;
    /// a panic in one item becomes that item's error and does not affect the others.
    pub fn execute<T, R, F>(&self, items: Vec<T>, work: F) -> Vec<Result<R, PoolError>>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> R + Sync,
    {
        let total = items.len();
        if total == 0 {
            return Vec::new();
        }
        let workers = self.size.min(total);
        let (job_tx, job_rx) = bounded::<(usize, T)>(workers);
        let (result_tx, result_rx) = bounded::<(usize, Result<R, PoolError>)>(total);

        thread::scope(|scope| {
            let mut started = 0;
            for worker in 0..workers {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                let work = &work;
                let spawned = thread::Builder::new()
                    .name(format!("vdisk-worker-{worker}"))
                    .spawn_scoped(scope, move || {
                        for (index, item) in job_rx.iter() {
                            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                            self.peak.fetch_max(now, Ordering::SeqCst);

                            let outcome = panic::catch_unwind(AssertUnwindSafe(|| work(item)))
                                .map_err(|payload| {
                                    let message = panic_message(payload.as_ref());
                                    error!(worker, index, message = %message, "Worker panicked");
                                    PoolError::Panicked { index, message }
                                });

                            self.active.fetch_sub(1, Ordering::SeqCst);
                            if result_tx.send((index, outcome)).is_err() {
                                break;
                            }
                        }
                    });
                match spawned {
                    Ok(_) => started += 1,
                    Err(e) => error!(worker, error = %e, "Failed to start worker thread"),
                }
            }
            debug!(workers = started, items = total, "Worker pool started");

            // Only worker clones keep the channels open from here on
            drop(job_rx);
            drop(result_tx);

            for (index, item) in items.into_iter().enumerate() {
                if job_tx.send((index, item)).is_err() {
                    break;
                }
            }
            drop(job_tx);
        });

        let mut slots: Vec<Option<Result<R, PoolError>>> = (0..total).map(|_| None).collect();
        for (index, outcome) in result_rx.try_iter() {
            slots[index] = Some(outcome);
        }
        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| slot.unwrap_or(Err(PoolError::NotExecuted { index })))
            .collect()
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

//! Bounded worker pool over a pre-populated shared queue.
//!
//! Items are queued with `submit`, then `join` starts the workers, which pull
//! one item at a time until the queue is empty. A panicking task is caught and
//! reported as a per-item failure; the worker moves on to the next item.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Mutex, PoisonError};
use std::thread;
use thiserror::Error;

const DEFAULT_IO_WORKERS: usize = 8;

/// What a pool's workers spend their time on. Both kinds run on OS threads;
/// the kind picks the default size and the worker thread names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// CPU-bound work, sized to the machine's parallelism.
    Compute,
    /// Blocking network or disk I/O.
    Io,
}

impl PoolKind {
    fn thread_prefix(self) -> &'static str {
        match self {
            PoolKind::Compute => "compute",
            PoolKind::Io => "io",
        }
    }

    /// Worker count used when a pool is created with capacity 0.
    pub fn default_capacity(self) -> usize {
        match self {
            PoolKind::Compute => thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            PoolKind::Io => DEFAULT_IO_WORKERS,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("task {index} panicked: {message}")]
pub struct TaskPanic {
    /// Submission index of the item whose task panicked.
    pub index: usize,
    pub message: String,
}

pub type TaskResult<R> = Result<R, TaskPanic>;

pub struct WorkerPool<I, F> {
    kind: PoolKind,
    capacity: usize,
    task: F,
    queue: VecDeque<(usize, I)>,
}

impl<I, F> WorkerPool<I, F> {
    /// Create a pool of `capacity` workers running `task`. A capacity of 0
    /// selects the kind's default.
    pub fn new(kind: PoolKind, capacity: usize, task: F) -> Self {
        let capacity = if capacity == 0 { kind.default_capacity() } else { capacity };
        Self {
            kind,
            capacity,
            task,
            queue: VecDeque::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queue items. Submission order determines the order of `join`'s results.
    pub fn submit(&mut self, items: impl IntoIterator<Item = I>) {
        let start = self.queue.len();
        self.queue
            .extend(items.into_iter().enumerate().map(|(i, item)| (start + i, item)));
    }

    /// Run every queued item to completion and return one result per item,
    /// in submission order.
    pub fn join<R>(self) -> Vec<TaskResult<R>>
    where
        I: Send,
        R: Send,
        F: Fn(I) -> R + Sync,
    {
        let Self { kind, capacity, task, queue } = self;
        let total = queue.len();
        let workers = capacity.min(total);
        let queue = Mutex::new(queue);
        let results: Mutex<Vec<Option<TaskResult<R>>>> =
            Mutex::new((0..total).map(|_| None).collect());

        tracing::debug!(kind = ?kind, workers, items = total, "pool starting");

        thread::scope(|s| {
            for n in 0..workers {
                let name = format!("{}-{}", kind.thread_prefix(), n + 1);
                let (queue, results, task) = (&queue, &results, &task);
                let spawned = thread::Builder::new()
                    .name(name.clone())
                    .spawn_scoped(s, move || run_worker(&name, queue, results, task));
                if let Err(e) = spawned {
                    tracing::warn!(error = %e, kind = ?kind, "failed to spawn pool worker");
                }
            }
        });

        // Anything left means workers could not be spawned; drain it here.
        run_worker("caller", &queue, &results, &task);

        results
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    Err(TaskPanic {
                        index,
                        message: "task never ran".into(),
                    })
                })
            })
            .collect()
    }
}

fn run_worker<I, R, F>(
    name: &str,
    queue: &Mutex<VecDeque<(usize, I)>>,
    results: &Mutex<Vec<Option<TaskResult<R>>>>,
    task: &F,
) where
    F: Fn(I) -> R,
{
    let mut processed = 0usize;
    loop {
        let next = queue.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
        let Some((index, item)) = next else {
            break;
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| task(item))).map_err(|payload| TaskPanic {
            index,
            message: panic_message(payload.as_ref()),
        });
        if let Err(p) = &outcome {
            tracing::warn!(worker = name, index, message = %p.message, "task panicked");
        }

        results.lock().unwrap_or_else(PoisonError::into_inner)[index] = Some(outcome);
        processed += 1;
    }
    if processed > 0 {
        tracing::debug!(worker = name, processed, "worker drained queue");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

//! Thin per-event-type-family adapter around a [`BatchingQueue`]: per-kind
//! in-flight bookkeeping, single-worker ordering enforcement, and a
//! connection-established gate deferring queue startup.

use crate::deadline::Deadline;
use crate::error::QueueError;
use crate::queue::{AddAllOutcome, BatchingQueue, BatchingQueueBuilder, QueueStats, WorkerId};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// The three monotonic/derived counters tracked per event kind.
///
/// Split out of [`TypedEventService`] so the post-handler "guaranteed
/// execution" decrement (run via a drop guard around the caller's handler)
/// can hold a reference to just the counters, without needing the handler
/// closure to close over the `TypedEventService` it will eventually be
/// installed into.
#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    completed: AtomicU64,
    in_flight: AtomicI64,
}

impl Counters {
    fn stats(&self) -> QueueStats {
        QueueStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }

    fn record_batch_completed(&self, count: usize) {
        self.completed.fetch_add(count as u64, Ordering::Relaxed);
        self.in_flight.fetch_sub(count as i64, Ordering::AcqRel);
    }
}

/// Wrap `inner` so that, regardless of whether it panics, `counters`'
/// in-flight is decremented and completed incremented by the batch's
/// cardinality once `inner` returns or unwinds.
///
/// This gives the post-handler decrement a guaranteed-execution scope: a
/// drop guard, not a `try`/`catch`, since the decrement must run even if
/// `inner`'s future panics while it is polled inside [`BatchingQueue`]'s
/// own `catch_unwind` wrapper.
fn guarded_handler<T: Send + 'static, F>(
    counters: Arc<Counters>,
    inner: F,
) -> impl Fn(WorkerId, Vec<T>) -> BoxFuture<'static, ()> + Send + Sync + 'static
where
    F: Fn(WorkerId, Vec<T>) -> BoxFuture<'static, ()> + Send + Sync + 'static,
{
    let inner = Arc::new(inner);
    move |id, batch| {
        let counters = counters.clone();
        let inner = inner.clone();
        Box::pin(async move {
            struct Guard {
                counters: Arc<Counters>,
                count: usize,
            }
            impl Drop for Guard {
                fn drop(&mut self) {
                    self.counters.record_batch_completed(self.count);
                }
            }

            let _guard = Guard {
                counters,
                count: batch.len(),
            };
            inner(id, batch).await;
        })
    }
}

/// Builder for a [`TypedEventService`].
#[must_use = "builders do nothing unless you call .build()"]
pub struct TypedEventServiceBuilder<T> {
    name: String,
    max_queue_size: usize,
    max_workers: usize,
    max_batch_size: usize,
    add_timeout: Duration,
    max_send_delay: Duration,
    ordered: bool,
    process_batch: Option<Box<dyn Fn(WorkerId, Vec<T>) -> BoxFuture<'static, ()> + Send + Sync>>,
}

impl<T: Send + 'static> TypedEventServiceBuilder<T> {
    /// Start building a service named `name` (used for diagnostics and as
    /// the underlying queue's name).
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_queue_size: 1,
            max_workers: 1,
            max_batch_size: 1,
            add_timeout: Duration::from_secs(1),
            max_send_delay: Duration::from_millis(500),
            ordered: false,
            process_batch: None,
        }
    }

    pub fn max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    /// Number of concurrent workers. Forced to 1 once [`Self::ordered`] is
    /// set, since an order-sensitive receiver cannot tolerate out-of-order
    /// delivery across workers.
    pub fn max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers;
        self
    }

    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    pub fn add_timeout(mut self, timeout: Duration) -> Self {
        self.add_timeout = timeout;
        self
    }

    pub fn max_send_delay(mut self, delay: Duration) -> Self {
        self.max_send_delay = delay;
        self
    }

    /// Require in-order delivery: forces exactly one worker, regardless of
    /// any `max_workers` call.
    pub fn ordered(mut self, ordered: bool) -> Self {
        self.ordered = ordered;
        self
    }

    pub fn process_batch<F>(mut self, handler: F) -> Self
    where
        F: Fn(WorkerId, Vec<T>) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        self.process_batch = Some(Box::new(handler));
        self
    }

    pub fn build(self) -> TypedEventService<T> {
        let handler = self
            .process_batch
            .expect("TypedEventServiceBuilder requires a process_batch handler");
        let counters = Arc::new(Counters::default());
        let wrapped = guarded_handler::<T, _>(counters.clone(), move |id, batch| handler(id, batch));

        let max_workers = if self.ordered { 1 } else { self.max_workers };

        let queue = BatchingQueueBuilder::new(self.name)
            .max_queue_size(self.max_queue_size)
            .max_workers(max_workers)
            .max_batch_size(self.max_batch_size)
            .add_timeout(self.add_timeout)
            .max_send_delay(self.max_send_delay)
            .process_batch(wrapped)
            .build();

        TypedEventService {
            queue: Arc::new(queue),
            connected: AtomicBool::new(false),
            start_requested: AtomicBool::new(false),
            started: AtomicBool::new(false),
            counters,
        }
    }
}

/// A single-instance-per-event-kind adapter wrapping one [`BatchingQueue`].
pub struct TypedEventService<T> {
    queue: Arc<BatchingQueue<T>>,
    connected: AtomicBool,
    start_requested: AtomicBool,
    started: AtomicBool,
    counters: Arc<Counters>,
}

impl<T: Send + 'static> TypedEventService<T> {
    /// Request that the service start. The underlying queue's workers are
    /// not actually spawned until [`Self::connection_established`] has
    /// also been called. `add` is accepted in the meantime and simply
    /// buffers.
    pub fn start(&self) -> Result<(), QueueError> {
        self.start_requested.store(true, Ordering::Release);
        self.maybe_start()
    }

    /// Signal that the downstream connection is ready. Combined with a
    /// prior (or later) [`Self::start`] call, this spawns the underlying
    /// queue's workers exactly once.
    pub fn connection_established(&self) -> Result<(), QueueError> {
        self.connected.store(true, Ordering::Release);
        self.maybe_start()
    }

    fn maybe_start(&self) -> Result<(), QueueError> {
        if !self.start_requested.load(Ordering::Acquire) || !self.connected.load(Ordering::Acquire)
        {
            return Ok(());
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.queue.start()
    }

    /// Enqueue `item`, tracking per-kind in-flight bookkeeping: the
    /// counter is incremented optimistically before admission and rolled
    /// back immediately on rejection.
    pub async fn add(&self, item: T) -> bool {
        self.counters.in_flight.fetch_add(1, Ordering::AcqRel);
        if self.queue.add(item).await {
            self.counters.accepted.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            self.counters.in_flight.fetch_sub(1, Ordering::AcqRel);
            false
        }
    }

    /// Enqueue every item in `items`, stopping at the first rejection.
    pub async fn add_all(&self, items: impl IntoIterator<Item = T>) -> AddAllOutcome {
        let mut accepted = 0;
        for (index, item) in items.into_iter().enumerate() {
            if !self.add(item).await {
                return AddAllOutcome {
                    accepted,
                    rejected_at: Some(index),
                };
            }
            accepted += 1;
        }
        AddAllOutcome {
            accepted,
            rejected_at: None,
        }
    }

    /// Force a flush of everything currently buffered, without waiting.
    pub fn sync(&self) {
        self.queue.sync();
    }

    /// Delegate to the underlying queue's `stop`.
    pub async fn stop(&self, deadline: Deadline) {
        self.queue.stop(deadline).await;
    }

    /// Delegate to the underlying queue's `cancel`.
    pub async fn cancel(&self) {
        self.queue.cancel().await;
    }

    /// A snapshot of this event kind's accept/completion/in-flight counters.
    pub fn stats(&self) -> QueueStats {
        self.counters.stats()
    }
}

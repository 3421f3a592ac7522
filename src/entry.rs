//! The tagged variant shared by the queue's FIFO: user items and the
//! control records (`Marker`) used to force a synchronous flush.

use std::sync::Arc;
use tokio::sync::Barrier;

/// One slot in a [`crate::BatchingQueue`]'s FIFO.
pub(crate) enum QueueEntry<T> {
    /// A user-supplied item awaiting batching.
    Item(T),
    /// A control record forcing workers to flush their partial batch.
    Control(Marker),
}

/// A control record placed into the FIFO by [`crate::BatchingQueue::sync`].
///
/// Exactly one `Marker` is posted per worker per `sync` call. Every worker
/// consumes exactly one marker: on consuming it, a worker flushes its
/// partial batch and then either exits (if `stop` is set) or rendezvouses
/// on `barrier` with every other worker before resuming its poll loop, so a
/// fast worker can never race ahead and consume a marker meant for a
/// slower one.
#[derive(Clone)]
pub(crate) struct Marker {
    pub(crate) stop: bool,
    pub(crate) barrier: Arc<Barrier>,
}

impl Marker {
    /// Build `worker_count` markers sharing one fresh barrier, for a single
    /// `sync` invocation.
    pub(crate) fn for_sync(worker_count: usize, stop: bool) -> Vec<Marker> {
        let barrier = Arc::new(Barrier::new(worker_count.max(1)));
        (0..worker_count)
            .map(|_| Marker {
                stop,
                barrier: barrier.clone(),
            })
            .collect()
    }
}

//! Batching queue and cooperative shutdown primitives for an in-process
//! telemetry client.
//!
//! This crate provides the core plumbing an in-process telemetry agent
//! needs to accept events from arbitrary producer threads, coalesce them
//! into size- and time-bounded batches, and hand those batches to a
//! caller-supplied handler on a fixed-size worker pool, without itself
//! knowing anything about serialization, transport, or retry. Those are
//! the handler's job.
//!
//! Three pieces:
//!
//! - [`Deadline`]: a monotonic countdown with a one-shot sticky expiry
//!   latch, used throughout to bound how long a call may block.
//! - [`BatchingQueue`]: the bounded FIFO and worker pool.
//! - [`TypedEventService`]: a thin per-event-kind adapter around one
//!   `BatchingQueue`, adding in-flight bookkeeping and a
//!   connection-established start gate.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use telemetry_batch_queue::{BatchingQueueBuilder, Deadline};
//!
//! #[tokio::main]
//! async fn main() {
//!     let queue = std::sync::Arc::new(
//!         BatchingQueueBuilder::new("spans")
//!             .max_queue_size(1000)
//!             .max_workers(2)
//!             .max_batch_size(50)
//!             .max_send_delay(Duration::from_millis(500))
//!             .process_batch(|worker, batch: Vec<String>| {
//!                 Box::pin(async move {
//!                     println!("{worker} flushing {} items", batch.len());
//!                 })
//!             })
//!             .build(),
//!     );
//!
//!     queue.start().unwrap();
//!     queue.add("span-1".to_string()).await;
//!     queue.stop(Deadline::in_(Duration::from_secs(5)).unwrap()).await;
//! }
//! ```

mod deadline;
mod entry;
mod error;
mod event_service;
mod queue;

pub use deadline::{Deadline, TimeUnit};
pub use error::{DeadlineError, QueueError};
pub use event_service::{TypedEventService, TypedEventServiceBuilder};
pub use queue::{AddAllOutcome, BatchHandler, BatchingQueue, BatchingQueueBuilder, QueueStats, WorkerId};

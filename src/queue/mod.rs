//! Durable job queues with retries and backoff.
//!
//! Every pipeline stage runs behind its own [`Queue`]:
//! - **Enqueue**: producers add a JSON payload and get a [`JobHandle`] back
//! - **Process**: workers claim jobs under a concurrency limit and run a [`JobProcessor`]
//! - **Retry**: retryable failures are delayed with exponential backoff until attempts run out
//! - **Maintenance**: retention cleanup, stalled-job recovery, promotion of overdue delays
//!
//! # Job lifecycle
//!
//! ```text
//! waiting -> active -> completed
//!              |
//!              +-> delayed -> waiting   (retryable error, attempts left)
//!              +-> failed               (permanent error or attempts exhausted)
//! ```
//!
//! Observers see every transition on the shared [`EventBus`].

pub mod context;
pub mod events;
pub mod handle;
pub mod heartbeat;
pub mod job;
pub mod maintenance;
#[cfg(feature = "redis-store")]
pub mod redis_store;
pub mod registry;
pub mod store;
pub mod worker;

pub use context::JobContext;
pub use events::{EventBus, QueueEvent, QueueEventKind};
pub use handle::{JobHandle, JobOutcome};
pub use job::{JobOptions, JobStatus, QueueJob, QueueName};
pub use maintenance::{spawn_maintenance, MaintenanceReport};
#[cfg(feature = "redis-store")]
pub use redis_store::RedisJobStore;
pub use registry::QueueRegistry;
pub use store::{InMemoryJobStore, JobStore};
pub use worker::{JobProcessor, Queue, QueueCounts, QueueSettings};

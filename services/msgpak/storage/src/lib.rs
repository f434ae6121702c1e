//! Outbound task storage for msgpak: bounded per-peer queues and the dedup
//! cache consulted by the broadcast step.
//!
//! Tasks are never persisted. A peer's queue lives as long as the process
//! (client side) or the peer's connection (server side).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use msgpak_wire::{CommandError, DEFAULT_MAX_MESSAGE_SIZE};
use thiserror::Error;

/// Default number of queued tasks per peer
pub const DEFAULT_QUEUE_DEPTH: usize = 100;

/// Task popped from a queue
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueuedTask {
    /// Application command
    pub cmd: String,
    /// Payload
    pub data: String,
    /// Unix seconds at enqueue time
    pub enqueued_at: u64,
    /// Hash of the stored entry, used as the dedup key. Unique per enqueue.
    pub hash: String,
}

/// Queue errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Peer queue is at its bound
    #[error("queue full for {peer} ({depth} tasks)")]
    QueueFull {
        /// Peer address
        peer: String,
        /// Configured bound
        depth: usize,
    },

    /// Command failed validation
    #[error("invalid task: {0}")]
    InvalidTask(#[from] CommandError),

    /// Task could not be sent within the envelope cap
    #[error("task too large: envelope may reach {size} bytes, cap is {limit}")]
    DataTooLarge {
        /// Worst-case envelope size
        size: usize,
        /// Configured cap
        limit: usize,
    },

    /// Stored entry could not be decoded
    #[error("corrupted queue entry: {0}")]
    Corruption(String),
}

/// Queue configuration
#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// Maximum tasks per peer
    pub max_depth: usize,
    /// Envelope size cap tasks must fit in once composed
    pub max_message_size: usize,
    /// Commands accepted for scheduling, empty accepts any valid command
    pub allowed_commands: Vec<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_QUEUE_DEPTH,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            allowed_commands: Vec::new(),
        }
    }
}

/// Bounded FIFO of outbound tasks per peer.
///
/// Each operation is atomic on its own; no atomicity is promised across
/// separate calls.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Validate and append a task for a peer
    async fn enqueue(&self, peer: &str, cmd: &str, data: &str) -> Result<(), QueueError>;

    /// Pop the oldest task for a peer
    async fn dequeue_one(&self, peer: &str) -> Result<Option<QueuedTask>, QueueError>;

    /// Number of queued tasks for a peer
    async fn len(&self, peer: &str) -> usize;

    /// Drop every task queued for a peer, returning how many were dropped
    async fn purge(&self, peer: &str) -> usize;

    /// Validate a task without queueing it
    fn validate(&self, cmd: &str, data: &str) -> Result<(), QueueError>;
}

/// Expiring "seen" set used to suppress re-delivery
#[async_trait]
pub trait SeenCache: Send + Sync {
    /// Return `true` if `(peer, hash)` was marked within its window, otherwise
    /// mark it for `ttl` and return `false`. Check and mark are one operation.
    async fn check_and_mark(&self, peer: &str, hash: &str, ttl: Duration) -> bool;

    /// Drop expired entries, returning how many were removed
    async fn purge_expired(&self) -> usize;
}

/// Combined storage interface
#[derive(Clone)]
pub struct Storage {
    /// Outbound task queues
    pub queue: Arc<dyn TaskQueue>,
    /// Dedup cache
    pub seen: Arc<dyn SeenCache>,
}

impl Storage {
    /// In-memory storage
    pub fn in_memory(config: QueueConfig) -> Self {
        Storage {
            queue: Arc::new(MemoryTaskQueue::new(config)),
            seen: Arc::new(MemorySeenCache::new()),
        }
    }
}

// Re-export backend implementations
pub use backend::mem::{MemorySeenCache, MemoryTaskQueue};

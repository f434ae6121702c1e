//! In-memory storage backend

use crate::{QueueConfig, QueueError, QueuedTask, SeenCache, TaskQueue};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use msgpak_wire::crypto::sha256_hex;
use msgpak_wire::{envelope_size_bound, validate_task_command};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tracing::{debug, trace};

/// Stored form: base64 command, base64 data, base64 unix seconds, hash
#[derive(Clone, Debug)]
struct TaskEntry {
    cmd_b64: String,
    data_b64: String,
    time_b64: String,
    hash: String,
}

impl TaskEntry {
    /// `seq` is unique per queue, so two submissions of the same task never
    /// share a hash even within one second.
    fn new(cmd: &str, data: &str, seq: u64) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let cmd_b64 = STANDARD.encode(cmd);
        let data_b64 = STANDARD.encode(data);
        let time_b64 = STANDARD.encode(now.to_string());
        let hash = sha256_hex(
            format!("{}\n{}\n{}\n{}", cmd_b64, data_b64, time_b64, seq).as_bytes(),
        );
        Self {
            cmd_b64,
            data_b64,
            time_b64,
            hash,
        }
    }

    fn decode(self) -> Result<QueuedTask, QueueError> {
        let text = |field: &str, value: &str| -> Result<String, QueueError> {
            STANDARD
                .decode(value)
                .ok()
                .and_then(|raw| String::from_utf8(raw).ok())
                .ok_or_else(|| QueueError::Corruption(field.to_string()))
        };

        let enqueued_at = text("time", &self.time_b64)?
            .parse::<u64>()
            .map_err(|_| QueueError::Corruption("time".to_string()))?;

        Ok(QueuedTask {
            cmd: text("cmd", &self.cmd_b64)?,
            data: text("data", &self.data_b64)?,
            enqueued_at,
            hash: self.hash,
        })
    }
}

/// In-memory task queue
pub struct MemoryTaskQueue {
    /// Per-peer FIFO, removed once drained
    queues: Arc<DashMap<String, VecDeque<TaskEntry>>>,
    next_seq: AtomicU64,
    config: QueueConfig,
}

impl MemoryTaskQueue {
    /// Create a new in-memory queue
    pub fn new(config: QueueConfig) -> Self {
        Self {
            queues: Arc::new(DashMap::new()),
            next_seq: AtomicU64::new(0),
            config,
        }
    }

    /// Number of peers with a non-empty queue
    pub fn peer_count(&self) -> usize {
        self.queues.len()
    }
}

impl Default for MemoryTaskQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn enqueue(&self, peer: &str, cmd: &str, data: &str) -> Result<(), QueueError> {
        self.validate(cmd, data)?;
        let cmd = cmd.trim();

        let mut queue = self.queues.entry(peer.to_string()).or_default();
        if queue.len() >= self.config.max_depth {
            return Err(QueueError::QueueFull {
                peer: peer.to_string(),
                depth: self.config.max_depth,
            });
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        queue.push_back(TaskEntry::new(cmd, data, seq));

        debug!(
            "Queue enqueue peer={} cmd={} len={}",
            peer,
            cmd,
            queue.len()
        );
        Ok(())
    }

    async fn dequeue_one(&self, peer: &str) -> Result<Option<QueuedTask>, QueueError> {
        let entry = match self.queues.get_mut(peer) {
            Some(mut queue) => queue.pop_front(),
            None => return Ok(None),
        };
        self.queues.remove_if(peer, |_, queue| queue.is_empty());

        match entry {
            Some(entry) => {
                let task = entry.decode()?;
                trace!("Queue dequeue peer={} cmd={}", peer, task.cmd);
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    async fn len(&self, peer: &str) -> usize {
        self.queues.get(peer).map(|q| q.len()).unwrap_or(0)
    }

    async fn purge(&self, peer: &str) -> usize {
        let dropped = self
            .queues
            .remove(peer)
            .map(|(_, queue)| queue.len())
            .unwrap_or(0);
        if dropped > 0 {
            debug!("Queue purge peer={} dropped={}", peer, dropped);
        }
        dropped
    }

    fn validate(&self, cmd: &str, data: &str) -> Result<(), QueueError> {
        let cmd = validate_task_command(cmd, &self.config.allowed_commands)?;
        let size = envelope_size_bound(cmd, data.len());
        if size > self.config.max_message_size {
            return Err(QueueError::DataTooLarge {
                size,
                limit: self.config.max_message_size,
            });
        }
        Ok(())
    }
}

const GC_EVERY: u64 = 256;

/// In-memory dedup cache keyed by `(peer, hash)`
pub struct MemorySeenCache {
    /// Expiry instant per key
    entries: Arc<DashMap<(String, String), Instant>>,
    marks: AtomicU64,
}

impl MemorySeenCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            marks: AtomicU64::new(0),
        }
    }

    /// Number of tracked keys, expired ones included until purged
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no keys are tracked
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, expires| *expires > now);
        before.saturating_sub(self.entries.len())
    }
}

impl Default for MemorySeenCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SeenCache for MemorySeenCache {
    async fn check_and_mark(&self, peer: &str, hash: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let seen = match self.entries.entry((peer.to_string(), hash.to_string())) {
            Entry::Occupied(mut e) => {
                if *e.get() > now {
                    true
                } else {
                    e.insert(now + ttl);
                    false
                }
            }
            Entry::Vacant(e) => {
                e.insert(now + ttl);
                false
            }
        };

        if self.marks.fetch_add(1, Ordering::Relaxed) % GC_EVERY == GC_EVERY - 1 {
            self.sweep();
        }
        seen
    }

    async fn purge_expired(&self) -> usize {
        let removed = self.sweep();
        if removed > 0 {
            debug!("Seen cache purged {} expired entries", removed);
        }
        removed
    }
}

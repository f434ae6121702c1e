//! The broker owns all shared state of one msgpak server or client: the peer
//! registry, the task queues, the dedup cache, the dispatcher and the
//! shutdown token. Session loops receive it by `Arc`.

use std::sync::Arc;
use std::time::Duration;

use msgpak_storage::{QueueConfig, QueueError, Storage};
use msgpak_wire::{ProtocolCommand, DEFAULT_MAX_MESSAGE_SIZE};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::dispatch::{CommandContext, CommandHandler, Dispatcher};
use crate::handshake::HandshakeKeys;
use crate::registry::{PeerInfo, PeerRegistry};
use crate::transport::Credentials;

/// Side of the connection a broker plays
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Accepts connections
    Server,
    /// Dials the server pool
    Client,
}

/// Broker configuration
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Local identifier
    pub id: String,
    /// Role
    pub role: Role,
    /// Long-lived shared key
    pub shared_key: String,
    /// Transport credentials
    pub credentials: Credentials,
    /// Broadcast interval
    pub message_interval: Duration,
    /// Watchdog interval
    pub reconnect_interval: Duration,
    /// Maximum wait for the key exchange
    pub handshake_timeout: Duration,
    /// Envelope size cap
    pub max_message_size: usize,
    /// Queue bounds and allow-list
    pub queue: QueueConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            id: "msgpak".to_string(),
            role: Role::Server,
            shared_key: String::new(),
            credentials: Credentials {
                user: String::new(),
                password: String::new(),
            },
            message_interval: Duration::from_secs(60),
            reconnect_interval: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(60),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            queue: QueueConfig::default(),
        }
    }
}

/// Result of a fan-out enqueue
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct EnqueueSummary {
    /// Peers the task was queued for
    pub accepted: usize,
    /// Peers whose queue was full
    pub full: Vec<String>,
}

impl EnqueueSummary {
    /// Whether no peer took the task
    pub fn all_full(&self) -> bool {
        self.accepted == 0 && !self.full.is_empty()
    }
}

/// Shared state of one server or client
pub struct Broker {
    config: BrokerConfig,
    registry: PeerRegistry,
    storage: Storage,
    dispatcher: Dispatcher,
    shutdown: CancellationToken,
}

impl Broker {
    /// Create a broker with in-memory storage. Queued tasks are held to the
    /// broker's envelope cap.
    pub fn new(config: BrokerConfig, handler: Arc<dyn CommandHandler>) -> Arc<Self> {
        let mut queue = config.queue.clone();
        queue.max_message_size = queue.max_message_size.min(config.max_message_size);
        let storage = Storage::in_memory(queue);
        Self::with_storage(config, handler, storage)
    }

    /// Create a broker over the given storage
    pub fn with_storage(
        config: BrokerConfig,
        handler: Arc<dyn CommandHandler>,
        storage: Storage,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: PeerRegistry::new(),
            storage,
            dispatcher: Dispatcher::new(handler),
            shutdown: CancellationToken::new(),
        })
    }

    /// Configuration
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Whether this broker is the server side
    pub fn is_server(&self) -> bool {
        self.config.role == Role::Server
    }

    /// Peer registry
    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Task and dedup storage
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Dispatcher
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Process-wide shutdown token
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Whether shutdown has started
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Start shutdown; sessions send a close frame and exit
    pub fn shutdown(&self) {
        info!("Broker {} shutting down", self.config.id);
        self.shutdown.cancel();
    }

    /// Keys for the key exchange
    pub fn handshake_keys(&self) -> HandshakeKeys {
        HandshakeKeys {
            long_lived: self.config.shared_key.clone(),
            max_message_size: self.config.max_message_size,
        }
    }

    /// Dedup window, ten broadcast intervals
    pub fn dedup_ttl(&self) -> Duration {
        self.config.message_interval * 10
    }

    /// Receive deadline, one broadcast interval plus grace
    pub fn read_deadline(&self) -> Duration {
        self.config.message_interval + Duration::from_secs(10)
    }

    /// Keep-alive sent when a peer has nothing queued
    pub fn keepalive(&self) -> (ProtocolCommand, String) {
        match self.config.role {
            Role::Server => (
                ProtocolCommand::Ping,
                format!("PING, from the Server: `{}`", self.config.id),
            ),
            Role::Client => (
                ProtocolCommand::Pong,
                format!("PONG, from Client: `{}`", self.config.id),
            ),
        }
    }

    /// Handler context for a peer
    pub fn command_context(&self, remote_id: &str) -> CommandContext {
        CommandContext {
            is_server: self.is_server(),
            local_id: self.config.id.clone(),
            remote_id: remote_id.to_string(),
            auth_user: self.config.credentials.user.clone(),
            auth_pass: self.config.credentials.password.clone(),
        }
    }

    /// Queue a task for one peer
    pub async fn enqueue(&self, peer: &str, cmd: &str, data: &str) -> Result<(), QueueError> {
        self.storage.queue.enqueue(peer, cmd, data).await
    }

    /// Queue a task for every connected peer. Validation failures reject the
    /// task before anything is queued; full queues are reported per peer.
    pub async fn enqueue_all(&self, cmd: &str, data: &str) -> Result<EnqueueSummary, QueueError> {
        self.storage.queue.validate(cmd, data)?;

        let mut summary = EnqueueSummary::default();
        for peer in self.registry.addresses() {
            match self.storage.queue.enqueue(&peer, cmd, data).await {
                Ok(()) => summary.accepted += 1,
                Err(QueueError::QueueFull { .. }) => {
                    warn!("Queue full for {}, dropped {}", peer, cmd.trim());
                    summary.full.push(peer);
                }
                Err(e) => return Err(e),
            }
        }
        summary.full.sort();

        info!(
            "Task {} queued for {} peer(s), {} full",
            cmd.trim(),
            summary.accepted,
            summary.full.len()
        );
        Ok(summary)
    }

    /// Connected peers
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.registry.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::RejectUnhandled;
    use crate::registry::PeerEntry;
    use chrono::Utc;
    use msgpak_wire::CommandError;
    use zeroize::Zeroizing;

    fn broker(depth: usize) -> Arc<Broker> {
        Broker::new(
            BrokerConfig {
                queue: QueueConfig {
                    max_depth: depth,
                    ..QueueConfig::default()
                },
                ..BrokerConfig::default()
            },
            Arc::new(RejectUnhandled),
        )
    }

    fn register(broker: &Broker, address: &str) {
        broker.registry().register(PeerEntry {
            address: address.to_string(),
            conn_id: broker.registry().next_conn_id(),
            shared_secret: Zeroizing::new(String::new()),
            connected_at: Utc::now(),
            cancel: CancellationToken::new(),
        });
    }

    #[tokio::test]
    async fn test_queue_held_to_envelope_cap() {
        let b = Broker::new(
            BrokerConfig {
                max_message_size: 4096,
                ..BrokerConfig::default()
            },
            Arc::new(RejectUnhandled),
        );
        register(&b, "a:1");

        let err = b.enqueue_all("REPORT", &"z".repeat(4000)).await.unwrap_err();
        assert!(matches!(err, QueueError::DataTooLarge { limit: 4096, .. }));
        assert_eq!(b.enqueue_all("REPORT", "small").await.unwrap().accepted, 1);
    }

    #[tokio::test]
    async fn test_enqueue_all() {
        let b = broker(1);
        register(&b, "a:1");
        register(&b, "b:1");

        let summary = b.enqueue_all("REPORT", "x").await.unwrap();
        assert_eq!(summary.accepted, 2);
        assert!(summary.full.is_empty());

        let summary = b.enqueue_all("REPORT", "y").await.unwrap();
        assert_eq!(summary.accepted, 0);
        assert_eq!(summary.full, vec!["a:1".to_string(), "b:1".to_string()]);
        assert!(summary.all_full());
    }

    #[tokio::test]
    async fn test_enqueue_all_rejects_invalid_before_queueing() {
        let b = broker(10);
        register(&b, "a:1");
        assert_eq!(
            b.enqueue_all("DO:THIS", "x").await,
            Err(QueueError::InvalidTask(CommandError::ColonNotAllowed))
        );
        assert_eq!(b.storage().queue.len("a:1").await, 0);
    }

    #[test]
    fn test_derived_timings() {
        let b = Broker::new(
            BrokerConfig {
                message_interval: Duration::from_secs(30),
                ..BrokerConfig::default()
            },
            Arc::new(RejectUnhandled),
        );
        assert_eq!(b.dedup_ttl(), Duration::from_secs(300));
        assert_eq!(b.read_deadline(), Duration::from_secs(40));
        assert_eq!(b.keepalive().0, ProtocolCommand::Ping);
    }
}

//! Core session management for msgpak.
//!
//! Once the key exchange is done both sides run the same steady state: a
//! broadcast task draining the peer's queue (or sending the keep-alive) every
//! interval, and a receive task parsing envelopes and answering through the
//! dispatcher. The two tasks form the connection's task group; either one
//! ending cancels the other.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use msgpak_wire::{compose, parse, EnvelopeKeys, FrameKind, INFLATE_HEADROOM};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::broker::Broker;
use crate::dispatch::CommandContext;
use crate::error::{HandshakeError, SessionError, TransportError};
use crate::guard::{ConnReader, ConnWriter};
use crate::handshake::{Handshake, HandshakeStep, SharedSecret};
use crate::registry::{fingerprint, PeerEntry};

/// How long a closing session waits for the peer to hang up
pub const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Frame cap for a broker's connections
pub fn max_frame_size(broker: &Broker) -> usize {
    broker.config().max_message_size + INFLATE_HEADROOM
}

/// Run the key exchange on an authenticated connection. The caller bounds the
/// total time; individual reads only guard against a stuck socket.
pub async fn negotiate(
    broker: &Broker,
    reader: &mut ConnReader,
    writer: &ConnWriter,
) -> Result<SharedSecret, SessionError> {
    let read_deadline = broker.config().handshake_timeout * 2;

    let mut handshake = if broker.is_server() {
        let (handshake, offer) = Handshake::begin_as_server(broker.handshake_keys())?;
        writer
            .write_text(offer, broker.config().handshake_timeout)
            .await?;
        handshake
    } else {
        Handshake::begin_as_client(broker.handshake_keys())
    };

    loop {
        let frame = reader.read_message(read_deadline).await?;
        match frame.kind {
            FrameKind::Text => {
                let blob = frame.payload_text().map_err(TransportError::from)?;
                match handshake.supply_peer_message(blob)? {
                    HandshakeStep::Reply { blob, secret } => {
                        writer
                            .write_text(blob, broker.config().handshake_timeout)
                            .await?;
                        return Ok(secret);
                    }
                    HandshakeStep::Complete { secret } => return Ok(secret),
                }
            }
            FrameKind::Close => {
                let reason = frame.payload_text().unwrap_or_default().to_string();
                return Err(TransportError::Closed(reason).into());
            }
            other => {
                return Err(HandshakeError::Rejected(format!("unexpected {:?} frame", other)).into())
            }
        }
    }
}

/// Bound a handshake phase by the configured timeout
pub async fn with_handshake_timeout<T, F>(broker: &Broker, phase: F) -> Result<T, SessionError>
where
    F: std::future::Future<Output = Result<T, SessionError>>,
{
    timeout(broker.config().handshake_timeout, phase)
        .await
        .map_err(|_| SessionError::Handshake(HandshakeError::Timeout))?
}

/// State shared by the two tasks of an established connection
struct SessionLink {
    broker: Arc<Broker>,
    peer: String,
    writer: ConnWriter,
    secret: SharedSecret,
    cancel: CancellationToken,
    invalid_envelopes: AtomicU64,
}

/// Register the peer and run the steady state until the connection ends or
/// the broker shuts down. Always deregisters before returning.
pub async fn run_established(
    broker: Arc<Broker>,
    peer: String,
    reader: ConnReader,
    writer: ConnWriter,
    secret: SharedSecret,
) -> Result<(), SessionError> {
    let conn_id = broker.registry().next_conn_id();
    let cancel = CancellationToken::new();

    broker.registry().register(PeerEntry {
        address: peer.clone(),
        conn_id,
        shared_secret: secret.clone(),
        connected_at: Utc::now(),
        cancel: cancel.clone(),
    });
    info!(
        "Session established with {} (conn {}, secret {})",
        peer,
        conn_id,
        fingerprint(&secret)
    );

    let link = Arc::new(SessionLink {
        broker: broker.clone(),
        peer: peer.clone(),
        writer: writer.clone(),
        secret,
        cancel: cancel.clone(),
        invalid_envelopes: AtomicU64::new(0),
    });

    let broadcast = tokio::spawn(link.clone().broadcast_loop());
    let mut receive = tokio::spawn(link.clone().receive_loop(reader));

    let shutdown = broker.shutdown_token();
    let shutting_down = tokio::select! {
        _ = cancel.cancelled() => false,
        _ = shutdown.cancelled() => true,
    };

    let mut receive_done = false;
    if shutting_down {
        let _ = writer.write_close("shutdown").await;
        match timeout(CLOSE_GRACE, &mut receive).await {
            Ok(_) => receive_done = true,
            Err(_) => debug!("{} did not hang up within {:?}", peer, CLOSE_GRACE),
        }
    }

    cancel.cancel();
    if !receive_done {
        let _ = receive.await;
    }
    let _ = broadcast.await;

    broker.registry().deregister(&peer, conn_id);
    if broker.is_server() {
        let dropped = broker.storage().queue.purge(&peer).await;
        if dropped > 0 {
            info!("Dropped {} undelivered task(s) for {}", dropped, peer);
        }
    }
    writer.shutdown().await;

    info!(
        "Session with {} ended (conn {}, {} invalid envelope(s))",
        peer,
        conn_id,
        link.invalid_envelopes.load(Ordering::Relaxed)
    );
    Ok(())
}

impl SessionLink {
    fn keys(&self) -> EnvelopeKeys<'_> {
        EnvelopeKeys::session(&self.broker.config().shared_key, &self.secret)
    }

    async fn broadcast_loop(self: Arc<Self>) {
        let shutdown = self.broker.shutdown_token();
        let interval = self.broker.config().message_interval;

        loop {
            if let Err(e) = self.broadcast_once().await {
                warn!("Broadcast to {} failed: {}", self.peer, e);
                self.cancel.cancel();
                break;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    async fn broadcast_once(&self) -> Result<(), TransportError> {
        let (cmd, data) = self.next_outbound().await;
        let config = self.broker.config();

        match compose(&cmd, &data, &self.keys(), config.max_message_size) {
            Ok(blob) => {
                self.writer.write_text(blob, config.message_interval).await?;
                trace!("Sent {} to {}", cmd, self.peer);
            }
            Err(e) => error!("Not sending {} to {}: {}", cmd, self.peer, e),
        }
        Ok(())
    }

    async fn next_outbound(&self) -> (String, String) {
        let storage = self.broker.storage();
        let task = match storage.queue.dequeue_one(&self.peer).await {
            Ok(task) => task,
            Err(e) => {
                warn!("Dropping unreadable task for {}: {}", self.peer, e);
                None
            }
        };

        if let Some(task) = task {
            let seen = storage
                .seen
                .check_and_mark(&self.peer, &task.hash, self.broker.dedup_ttl())
                .await;
            if !seen {
                return (task.cmd, task.data);
            }
            debug!(
                "Skipping duplicate {} for {} within the dedup window",
                task.cmd, self.peer
            );
        }

        let (cmd, data) = self.broker.keepalive();
        (cmd.as_str().to_string(), data)
    }

    async fn receive_loop(self: Arc<Self>, mut reader: ConnReader) {
        let ctx = self.broker.command_context(&self.peer);
        let deadline = self.broker.read_deadline();

        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => break,
                res = reader.read_message(deadline) => res,
            };

            match frame {
                Ok(frame) => match frame.kind {
                    FrameKind::Text => {
                        let text = match frame.payload_text() {
                            Ok(text) => text,
                            Err(_) => {
                                self.count_invalid("payload is not UTF-8");
                                continue;
                            }
                        };
                        if let Err(e) = self.handle_text(&ctx, text).await {
                            warn!("Reply to {} failed: {}", self.peer, e);
                            break;
                        }
                    }
                    FrameKind::Close => {
                        info!(
                            "{} closed the connection: {}",
                            self.peer,
                            frame.payload_text().unwrap_or_default()
                        );
                        break;
                    }
                    other => warn!("Ignoring {:?} frame from {}", other, self.peer),
                },
                Err(TransportError::Closed(reason)) => {
                    info!("Connection to {} closed: {}", self.peer, reason);
                    break;
                }
                Err(e) => {
                    warn!("Read from {} failed: {}", self.peer, e);
                    break;
                }
            }
        }

        self.cancel.cancel();
    }

    async fn handle_text(&self, ctx: &CommandContext, text: &str) -> Result<(), TransportError> {
        let config = self.broker.config();
        let envelope = match parse(text, &self.keys(), config.max_message_size) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.count_invalid(&e.to_string());
                return Ok(());
            }
        };

        let reply = self
            .broker
            .dispatcher()
            .dispatch(ctx, &envelope.cmd, &envelope.data)
            .await;

        if let Some(out) = reply {
            match compose(&out.cmd, &out.data, &self.keys(), config.max_message_size) {
                Ok(blob) => self.writer.write_text(blob, config.message_interval).await?,
                Err(e) => error!("Not replying {} to {}: {}", out.cmd, self.peer, e),
            }
        }
        Ok(())
    }

    fn count_invalid(&self, reason: &str) {
        let n = self.invalid_envelopes.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            "Dropped invalid envelope from {}: {} ({} so far)",
            self.peer, reason, n
        );
    }
}

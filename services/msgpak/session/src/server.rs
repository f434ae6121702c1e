//! Server side: accept loop and per-connection session.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::broker::Broker;
use crate::error::{SessionError, TransportError};
use crate::guard::Connection;
use crate::session::{max_frame_size, negotiate, run_established, with_handshake_timeout};
use crate::transport::{authenticate_inbound, IpAllowList};

/// Accept loop options
#[derive(Clone, Default)]
pub struct ServerOptions {
    /// Remote IP allow-list, empty admits all
    pub allow_list: IpAllowList,
    /// TLS acceptor
    #[cfg(feature = "tls")]
    pub tls: Option<crate::transport::tls::TlsServer>,
}

/// Accept connections until the broker shuts down, then wait for every
/// session to close.
pub async fn serve(
    broker: Arc<Broker>,
    listener: TcpListener,
    options: ServerOptions,
) -> anyhow::Result<()> {
    let local = listener.local_addr()?;
    info!("MsgPak server {} listening on {}", broker.config().id, local);

    let shutdown = broker.shutdown_token();
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,

            accepted = listener.accept() => {
                let (tcp, remote) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("Accept failed on {}: {}", local, e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };

                if !options.allow_list.permits(remote.ip()) {
                    warn!("Refusing connection from {}: {}", remote, TransportError::IpRefused(remote.ip()));
                    continue;
                }
                let _ = tcp.set_nodelay(true);

                let broker = broker.clone();
                let options = options.clone();
                sessions.spawn(async move {
                    if let Err(e) = accept_session(broker, tcp, remote, &options).await {
                        warn!("Session with {} failed: {}", remote, e);
                    }
                });
            }

            Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                if let Err(e) = joined {
                    error!("Session task panicked: {}", e);
                }
            }
        }
    }

    info!("Waiting for {} session(s) to close", sessions.len());
    while sessions.join_next().await.is_some() {}
    info!("MsgPak server {} stopped", broker.config().id);
    Ok(())
}

#[cfg_attr(not(feature = "tls"), allow(unused_variables))]
async fn accept_session(
    broker: Arc<Broker>,
    tcp: tokio::net::TcpStream,
    remote: SocketAddr,
    options: &ServerOptions,
) -> Result<(), SessionError> {
    debug!("Accepted connection from {}", remote);

    #[cfg(feature = "tls")]
    {
        if let Some(acceptor) = &options.tls {
            let stream = with_handshake_timeout(&broker, async {
                crate::transport::tls::accept_tls(acceptor, tcp)
                    .await
                    .map_err(|e| SessionError::from(TransportError::Tls(format!("{:#}", e))))
            })
            .await?;
            return run_server_session(broker, stream, remote).await;
        }
    }

    run_server_session(broker, tcp, remote).await
}

/// Serve one accepted connection: credential preamble, key exchange, then
/// the steady state. The peer is keyed by its socket address.
pub async fn run_server_session<S>(
    broker: Arc<Broker>,
    stream: S,
    remote: SocketAddr,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer) = Connection::split_with_limit(stream, max_frame_size(&broker));

    let established = with_handshake_timeout(&broker, async {
        authenticate_inbound(
            &mut reader,
            &writer,
            &broker.config().credentials,
            broker.config().handshake_timeout,
        )
        .await?;
        negotiate(&broker, &mut reader, &writer).await
    })
    .await;

    let secret = match established {
        Ok(secret) => secret,
        Err(e) => {
            warn!("Handshake with {} failed: {}", remote, e);
            let _ = writer.write_close("handshake failed").await;
            writer.shutdown().await;
            return Err(e);
        }
    };

    run_established(broker, remote.to_string(), reader, writer, secret).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerConfig;
    use crate::dispatch::RejectUnhandled;
    use crate::error::HandshakeError;
    use crate::transport::Credentials;
    use msgpak_wire::{Frame, FrameKind};

    fn broker() -> Arc<Broker> {
        Broker::new(
            BrokerConfig {
                id: "srv".into(),
                shared_key: "long-lived-key-0123456789".into(),
                credentials: Credentials {
                    user: "operator".into(),
                    password: "s3cret-pass".into(),
                },
                handshake_timeout: Duration::from_secs(60),
                ..BrokerConfig::default()
            },
            Arc::new(RejectUnhandled),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout_closes_connection() {
        let broker = broker();
        let (server_side, client_side) = tokio::io::duplex(64 * 1024);
        let remote: SocketAddr = "127.0.0.1:5555".parse().unwrap();

        let (mut client_r, client_w) = Connection::split(client_side);
        // Authenticate, then stay silent through the key exchange.
        client_w
            .write_frame(Frame::auth("operator", "s3cret-pass"), Duration::from_secs(1))
            .await
            .unwrap();

        let result = run_server_session(broker.clone(), server_side, remote).await;
        assert!(matches!(
            result,
            Err(SessionError::Handshake(HandshakeError::Timeout))
        ));
        assert!(broker.registry().is_empty());

        // AuthOk, the offer, then the close frame
        let kinds: Vec<FrameKind> = {
            let mut kinds = Vec::new();
            while let Ok(frame) = client_r.read_message(Duration::from_secs(1)).await {
                kinds.push(frame.kind);
            }
            kinds
        };
        assert_eq!(
            kinds,
            vec![FrameKind::AuthOk, FrameKind::Text, FrameKind::Close]
        );
    }

    #[tokio::test]
    async fn test_bad_credentials_rejected() {
        let broker = broker();
        let (server_side, client_side) = tokio::io::duplex(64 * 1024);
        let remote: SocketAddr = "127.0.0.1:5556".parse().unwrap();

        let (_client_r, client_w) = Connection::split(client_side);
        client_w
            .write_frame(Frame::auth("operator", "wrong-pass"), Duration::from_secs(1))
            .await
            .unwrap();

        let result = run_server_session(broker.clone(), server_side, remote).await;
        assert!(matches!(
            result,
            Err(SessionError::Transport(TransportError::AuthRejected))
        ));
        assert!(broker.registry().is_empty());
    }
}

//! Client side: one session per server pool entry.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::error::{SessionError, TransportError};
use crate::guard::Connection;
use crate::session::{max_frame_size, negotiate, run_established, with_handshake_timeout};
use crate::transport::{authenticate_outbound, connect_tcp};

/// Dial options
#[derive(Clone, Default)]
pub struct ClientOptions {
    /// TLS connector
    #[cfg(feature = "tls")]
    pub tls: Option<crate::transport::tls::TlsClient>,
}

/// Host part of a `host:port` pool address
pub fn host_of(address: &str) -> &str {
    let host = address.rsplit_once(':').map(|(h, _)| h).unwrap_or(address);
    host.trim_start_matches('[').trim_end_matches(']')
}

/// Dial a pool address and run the session until it ends
#[cfg_attr(not(feature = "tls"), allow(unused_variables))]
pub async fn connect_and_run(
    broker: Arc<Broker>,
    address: String,
    options: &ClientOptions,
) -> Result<(), SessionError> {
    info!("Connecting to {}", address);

    let tcp = timeout(broker.config().handshake_timeout, connect_tcp(&address))
        .await
        .map_err(|_| TransportError::Timeout("connect"))?
        .map_err(TransportError::from)?;
    debug!("TCP connection established to {}", address);

    #[cfg(feature = "tls")]
    {
        if let Some(connector) = &options.tls {
            let stream = with_handshake_timeout(&broker, async {
                crate::transport::tls::connect_tls(connector, tcp, host_of(&address))
                    .await
                    .map_err(|e| SessionError::from(TransportError::Tls(format!("{:#}", e))))
            })
            .await?;
            return run_client_session(broker, stream, address).await;
        }
    }

    run_client_session(broker, tcp, address).await
}

/// Run a client session on an established stream. The peer is keyed by the
/// pool address it was dialed through.
pub async fn run_client_session<S>(
    broker: Arc<Broker>,
    stream: S,
    address: String,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer) = Connection::split_with_limit(stream, max_frame_size(&broker));

    let established = with_handshake_timeout(&broker, async {
        authenticate_outbound(
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
            warn!("Handshake with {} failed: {}", address, e);
            writer.shutdown().await;
            return Err(e);
        }
    };

    run_established(broker, address, reader, writer, secret).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("example.org:7000"), "example.org");
        assert_eq!(host_of("10.0.0.1:7000"), "10.0.0.1");
        assert_eq!(host_of("[::1]:7000"), "::1");
        assert_eq!(host_of("nohost"), "nohost");
    }
}

//! Admin HTTP/1.1 accept loop

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use msgpak_session::{Broker, IpAllowList};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::routes::{handle_request, AdminState};

/// Admin endpoint configuration
#[derive(Clone, Debug)]
pub struct AdminConfig {
    /// Listen address
    pub bind_addr: SocketAddr,
    /// Allowed remote addresses; empty means loopback only
    pub allow_list: IpAllowList,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 7001)),
            allow_list: IpAllowList::default(),
        }
    }
}

/// Serve the admin endpoint until the broker shuts down. Open connections get
/// a graceful shutdown: in-flight requests finish, keep-alive ends.
pub async fn serve(
    broker: Arc<Broker>,
    listener: TcpListener,
    config: AdminConfig,
) -> anyhow::Result<()> {
    let local = listener.local_addr()?;
    let shutdown = broker.shutdown_token();
    let state = Arc::new(AdminState::new(broker, config.allow_list));
    let mut connections = JoinSet::new();

    info!("Admin endpoint listening on http://{}", local);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,

            accepted = listener.accept() => {
                let (tcp, remote) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("Admin accept failed on {}: {}", local, e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };

                let state = state.clone();
                let shutdown = shutdown.clone();
                connections.spawn(async move {
                    let io = TokioIo::new(tcp);
                    let service = service_fn(move |req| handle_request(state.clone(), remote, req));
                    let conn = hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, service);
                    tokio::pin!(conn);

                    let result = tokio::select! {
                        res = conn.as_mut() => res,
                        _ = shutdown.cancelled() => {
                            conn.as_mut().graceful_shutdown();
                            conn.await
                        }
                    };
                    if let Err(e) = result {
                        debug!("Admin connection from {} ended: {}", remote, e);
                    }
                });
            }

            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    error!("Admin connection task panicked: {}", e);
                }
            }
        }
    }

    while connections.join_next().await.is_some() {}
    info!("Admin endpoint on {} stopped", local);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use bytes::Bytes;
    use http_body_util::{BodyExt, Full};
    use hyper::{Request, StatusCode};
    use msgpak_session::{BrokerConfig, Credentials, RejectUnhandled};

    #[tokio::test]
    async fn test_serves_over_tcp_and_stops_on_shutdown() {
        let broker = Broker::new(
            BrokerConfig {
                credentials: Credentials {
                    user: "operator".into(),
                    password: "s3cret-pass".into(),
                },
                ..BrokerConfig::default()
            },
            Arc::new(RejectUnhandled),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve(broker.clone(), listener, AdminConfig::default()));

        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .unwrap();
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let credentials = base64::engine::general_purpose::STANDARD.encode("operator:s3cret-pass");
        let req = Request::builder()
            .uri("/peers")
            .header("host", addr.to_string())
            .header("authorization", format!("Basic {}", credentials))
            .body(Full::new(Bytes::new()))
            .unwrap();
        let res = sender.send_request(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = res.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["count"], 0);

        broker.shutdown();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}

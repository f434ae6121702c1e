//! TCP and TLS transport for msgpak sessions.
//!
//! Sessions are generic over the byte stream, so plain TCP and both TLS
//! stream types go straight into `Connection::split`. This module also owns
//! the two checks every inbound connection passes before the key exchange:
//! the remote IP allow-list and the credential preamble.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use msgpak_wire::{crypto::ct_eq, Frame, FrameKind};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::guard::{ConnReader, ConnWriter};

/// Create a TCP listener bound to the given address
pub async fn listen_tcp(addr: SocketAddr) -> tokio::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

/// Connect to a `host:port` address
pub async fn connect_tcp(addr: &str) -> tokio::io::Result<TcpStream> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Remote IP allow-list. An empty list admits every address.
#[derive(Clone, Debug, Default)]
pub struct IpAllowList {
    allowed: Vec<IpAddr>,
}

impl IpAllowList {
    /// Build from parsed addresses
    pub fn new(allowed: Vec<IpAddr>) -> Self {
        Self { allowed }
    }

    /// Parse a list of textual IP addresses
    pub fn parse<S: AsRef<str>>(items: &[S]) -> Result<Self, String> {
        let allowed = items
            .iter()
            .map(|s| {
                let s = s.as_ref().trim();
                s.parse::<IpAddr>()
                    .map_err(|_| format!("invalid IP address: {}", s))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { allowed })
    }

    /// Whether the list is empty
    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }

    /// Check an address; IPv4-mapped IPv6 addresses match their IPv4 form
    pub fn permits(&self, ip: IpAddr) -> bool {
        if self.allowed.is_empty() {
            return true;
        }
        let ip = canonical(ip);
        self.allowed.iter().any(|a| canonical(*a) == ip)
    }
}

fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

/// Transport credential pair
#[derive(Clone)]
pub struct Credentials {
    /// User name
    pub user: String,
    /// Password
    pub password: String,
}

impl Credentials {
    /// Constant-time comparison of both fields
    pub fn matches(&self, user: &str, password: &str) -> bool {
        // Evaluate both so timing does not reveal which field differed.
        let user_ok = ct_eq(&self.user, user);
        let pass_ok = ct_eq(&self.password, password);
        user_ok & pass_ok
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

/// Server side of the credential preamble
pub async fn authenticate_inbound(
    reader: &mut ConnReader,
    writer: &ConnWriter,
    expected: &Credentials,
    deadline: Duration,
) -> Result<(), TransportError> {
    let frame = reader.read_message(deadline).await?;
    if frame.kind != FrameKind::Auth {
        warn!("Expected credential preamble, got {:?} frame", frame.kind);
        let _ = writer.write_close("unauthorized").await;
        return Err(TransportError::AuthRejected);
    }

    let (user, password) = frame.auth_credentials()?;
    if !expected.matches(&user, &password) {
        let _ = writer.write_close("unauthorized").await;
        return Err(TransportError::AuthRejected);
    }

    writer.write_frame(Frame::auth_ok(), deadline).await?;
    debug!("Transport credentials accepted for user {}", user);
    Ok(())
}

/// Client side of the credential preamble
pub async fn authenticate_outbound(
    reader: &mut ConnReader,
    writer: &ConnWriter,
    credentials: &Credentials,
    deadline: Duration,
) -> Result<(), TransportError> {
    writer
        .write_frame(
            Frame::auth(&credentials.user, &credentials.password),
            deadline,
        )
        .await?;

    let frame = reader.read_message(deadline).await?;
    match frame.kind {
        FrameKind::AuthOk => Ok(()),
        FrameKind::Close => Err(TransportError::AuthRejected),
        other => {
            warn!("Expected credential acknowledgement, got {:?} frame", other);
            Err(TransportError::AuthRejected)
        }
    }
}

// TLS-specific functionality
#[cfg(feature = "tls")]
/// TLS transport layer
pub mod tls {
    use super::*;
    use anyhow::{Context as AnyhowContext, Result};
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
    use rustls::{ClientConfig, RootCertStore, ServerConfig};
    use std::sync::Arc;
    use tokio_rustls::{TlsAcceptor, TlsConnector};
    use tracing::info;

    const ALPN: &[u8] = b"msgpak/1";

    /// TLS server acceptor wrapper
    #[derive(Clone)]
    pub struct TlsServer {
        acceptor: TlsAcceptor,
    }

    /// TLS client connector wrapper
    #[derive(Clone)]
    pub struct TlsClient {
        connector: TlsConnector,
    }

    fn load_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
        let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut pem.as_bytes()).collect();
        let certs = certs.context("Failed to parse certificate chain")?;
        if certs.is_empty() {
            anyhow::bail!("No certificates found in certificate chain");
        }
        Ok(certs)
    }

    /// Create a TLS server configuration. Clients authenticate with the
    /// credential preamble, not with certificates.
    pub fn make_server_config(cert_chain_pem: &str, private_key_pem: &str) -> Result<ServerConfig> {
        info!("Creating TLS server configuration");

        // Install default crypto provider if not already set
        let _ = rustls::crypto::ring::default_provider().install_default();

        let certs = load_certs(cert_chain_pem)?;
        let key = rustls_pemfile::private_key(&mut private_key_pem.as_bytes())
            .context("Failed to parse private key")?
            .ok_or_else(|| anyhow::anyhow!("No private key found"))?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, PrivateKeyDer::from(key))
            .context("Failed to configure server certificate")?;
        config.alpn_protocols = vec![ALPN.to_vec()];

        Ok(config)
    }

    /// Create a TLS client configuration trusting the given CA bundle
    pub fn make_client_config(ca_pem: &str) -> Result<ClientConfig> {
        info!("Creating TLS client configuration");

        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut roots = RootCertStore::empty();
        for ca_cert in load_certs(ca_pem)? {
            roots
                .add(ca_cert)
                .context("Failed to add CA certificate to root store")?;
        }

        let mut config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = vec![ALPN.to_vec()];

        Ok(config)
    }

    /// Create TLS acceptor from server configuration
    pub fn tls_acceptor(config: ServerConfig) -> TlsServer {
        TlsServer {
            acceptor: TlsAcceptor::from(Arc::new(config)),
        }
    }

    /// Create TLS connector from client configuration
    pub fn tls_connector(config: ClientConfig) -> TlsClient {
        TlsClient {
            connector: TlsConnector::from(Arc::new(config)),
        }
    }

    /// Server side TLS stream
    pub type ServerStream = tokio_rustls::server::TlsStream<TcpStream>;
    /// Client side TLS stream
    pub type ClientStream = tokio_rustls::client::TlsStream<TcpStream>;

    /// Accept a TLS connection
    pub async fn accept_tls(acceptor: &TlsServer, tcp_stream: TcpStream) -> Result<ServerStream> {
        let peer_addr = tcp_stream.peer_addr()?;
        debug!("Accepting TLS connection from {}", peer_addr);

        let tls_stream = acceptor
            .acceptor
            .accept(tcp_stream)
            .await
            .with_context(|| format!("TLS handshake failed with {}", peer_addr))?;
        Ok(tls_stream)
    }

    /// Connect via TLS
    pub async fn connect_tls(
        client: &TlsClient,
        tcp_stream: TcpStream,
        sni: &str,
    ) -> Result<ClientStream> {
        let peer_addr = tcp_stream.peer_addr()?;
        debug!("Connecting via TLS to {} (SNI: {})", peer_addr, sni);

        let server_name = ServerName::try_from(sni.to_owned())
            .map_err(|_| anyhow::anyhow!("Invalid server name: {}", sni))?;

        let tls_stream = client
            .connector
            .connect(server_name, tcp_stream)
            .await
            .with_context(|| format!("TLS handshake failed with {} (SNI: {})", peer_addr, sni))?;
        Ok(tls_stream)
    }
}

//! TCP/TLS transport, key exchange, session loops, command dispatch and the
//! reconnect watchdog for msgpak.
//!
//! ## Connection lifecycle
//!
//! ```text
//! accept / dial ──> credential preamble ──> key exchange ──> steady state ──> closed
//!                   (Auth / AuthOk)         (<KX:OFFER> /    broadcast task
//!                                            <KX:REPLY>)     + receive task
//! ```
//!
//! All shared state lives in a [`Broker`]; session loops, the watchdog and
//! the admin endpoint receive it by `Arc`.
//!
//! ## Example
//!
//! ```rust,no_run
//! use msgpak_session::{serve, Broker, BrokerConfig, RejectUnhandled, ServerOptions};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let broker = Broker::new(BrokerConfig::default(), Arc::new(RejectUnhandled));
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:7000").await?;
//!
//! let server = tokio::spawn(serve(broker.clone(), listener, ServerOptions::default()));
//! broker.enqueue_all("REPORT", "hello").await?;
//!
//! broker.shutdown();
//! server.await??;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod broker;
pub mod client;
pub mod dispatch;
pub mod error;
pub mod guard;
pub mod handshake;
pub mod registry;
pub mod server;
pub mod session;
pub mod transport;
pub mod watchdog;

// Re-export main types
pub use broker::{Broker, BrokerConfig, EnqueueSummary, Role};
pub use client::{connect_and_run, run_client_session, ClientOptions};
pub use dispatch::{
    CommandContext, CommandHandler, Dispatcher, HandlerReply, Outbound, RejectUnhandled,
};
pub use error::{HandshakeError, SessionError, TransportError};
pub use guard::{ConnReader, ConnWriter, Connection};
pub use handshake::{Handshake, HandshakeKeys, HandshakeStep, KxGroup, SharedSecret};
pub use registry::{PeerInfo, PeerRegistry};
pub use server::{run_server_session, serve, ServerOptions};
pub use transport::{connect_tcp, listen_tcp, Credentials, IpAllowList};
pub use watchdog::Watchdog;

// Re-export TLS functionality when available
#[cfg(feature = "tls")]
pub use transport::tls::{
    accept_tls, connect_tls, make_client_config, make_server_config, tls_acceptor,
    tls_connector, ClientStream, ServerStream, TlsClient, TlsServer,
};

//! msgpak node binary.
//!
//! Runs either a server (accepts clients, queues tasks for them) or a client
//! (keeps a session to every server in its pool), with an optional HTTP admin
//! endpoint for queueing tasks.

use clap::Parser;
use msgpak_admin::AdminConfig;
use msgpak_session::{
    listen_tcp, serve, Broker, ClientOptions, IpAllowList, ServerOptions, Watchdog,
};
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod config;
mod handler;
mod logging;

use config::{Mode, MsgPakConfig};
use handler::AckHandler;
use logging::MsgPakLogFormatter;

/// Encrypted command and task exchange between a server and its clients
#[derive(Parser, Debug)]
#[command(name = "msgpak", version, about = "Encrypted message exchange between servers and clients")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "msgpak.yaml")]
    config: PathBuf,

    /// Run as server or client
    #[arg(long)]
    mode: Option<Mode>,

    /// Local identifier
    #[arg(long)]
    id: Option<String>,

    /// Server listen address, e.g. 0.0.0.0:7000
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Server to connect to in client mode, e.g. 10.0.0.1:7000 (repeatable)
    #[arg(long = "server")]
    servers: Vec<String>,

    /// Broadcast interval, e.g. 60s
    #[arg(long)]
    message_interval: Option<humantime::Duration>,

    /// Reconnect interval, e.g. 2m
    #[arg(long)]
    reconnect_interval: Option<humantime::Duration>,

    /// Key exchange timeout, e.g. 60s
    #[arg(long)]
    handshake_timeout: Option<humantime::Duration>,

    /// Enable the admin endpoint on this address
    #[arg(long)]
    admin_bind: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable TLS
    #[arg(long)]
    tls: bool,

    /// Path to TLS certificate file (PEM format)
    #[arg(long, requires = "tls")]
    tls_cert: Option<PathBuf>,

    /// Path to TLS private key file (PEM format)
    #[arg(long, requires = "tls")]
    tls_key: Option<PathBuf>,

    /// Path to CA certificate file (PEM format)
    #[arg(long, requires = "tls")]
    tls_ca: Option<PathBuf>,
}

impl Args {
    /// Flags win over file and environment
    fn apply(&self, config: &mut MsgPakConfig) {
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(id) = &self.id {
            config.id = id.clone();
        }
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if !self.servers.is_empty() {
            config.servers = self.servers.clone();
        }
        if let Some(d) = self.message_interval {
            config.message_interval = d.into();
        }
        if let Some(d) = self.reconnect_interval {
            config.reconnect_interval = d.into();
        }
        if let Some(d) = self.handshake_timeout {
            config.handshake_timeout = d.into();
        }
        if let Some(bind) = self.admin_bind {
            config.admin.enabled = true;
            config.admin.bind = bind;
        }
        if self.tls {
            config.tls.enabled = true;
        }
        if let Some(p) = &self.tls_cert {
            config.tls.cert_file = p.display().to_string();
        }
        if let Some(p) = &self.tls_key {
            config.tls.key_file = p.display().to_string();
        }
        if let Some(p) = &self.tls_ca {
            config.tls.ca_file = p.display().to_string();
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut env_filter = EnvFilter::new("info");
    for target in ["msgpak", "msgpak_session", "msgpak_wire", "msgpak_storage", "msgpak_admin"] {
        env_filter = env_filter.add_directive(format!("{}={}", target, args.log_level).parse()?);
    }

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .event_format(MsgPakLogFormatter::new("msgpak"))
        .init();

    info!("Starting msgpak v{}", env!("CARGO_PKG_VERSION"));

    let mut config = MsgPakConfig::load_from_file(&args.config)?;
    args.apply(&mut config);
    component_debug!("config", "Effective configuration: {:?}", redacted(&config));
    if let Err(e) = config.validate() {
        error!("{}", e);
        return Err(e.into());
    }
    if cfg!(not(feature = "tls")) && config.tls.enabled {
        anyhow::bail!("TLS requested but not compiled with TLS support. Build with --features tls");
    }

    info!(
        "Config: id={}, mode={:?}, message_interval={}, reconnect_interval={}, queue_depth={}, tls={}",
        config.id,
        config.mode,
        humantime::format_duration(config.message_interval),
        humantime::format_duration(config.reconnect_interval),
        config.queue.depth,
        config.tls.enabled
    );

    let broker = Broker::new(config.broker_config(), Arc::new(AckHandler));
    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

    match config.mode {
        Mode::Server => {
            let options = ServerOptions {
                allow_list: IpAllowList::parse(&config.allow_ips).map_err(anyhow::Error::msg)?,
                #[cfg(feature = "tls")]
                tls: server_tls(&config).await?,
            };
            let listener = listen_tcp(config.listen).await?;
            tasks.spawn(serve(broker.clone(), listener, options));
        }
        Mode::Client => {
            let options = ClientOptions {
                #[cfg(feature = "tls")]
                tls: client_tls(&config).await?,
            };
            let watchdog = Watchdog::new(broker.clone(), config.servers.clone(), options);
            tasks.spawn(async move {
                watchdog.run().await;
                Ok(())
            });
        }
    }

    if config.admin.enabled {
        let admin = AdminConfig {
            bind_addr: config.admin.bind,
            allow_list: IpAllowList::parse(&config.admin.allow_ips).map_err(anyhow::Error::msg)?,
        };
        let listener = tokio::net::TcpListener::bind(admin.bind_addr).await?;
        component_info!("admin", "Admin endpoint enabled on {}", admin.bind_addr);
        tasks.spawn(msgpak_admin::serve(broker.clone(), listener, admin));
    }

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGINT handler: {}", e))?;

    let mut failure = None;
    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
        _ = sigint.recv() => info!("Received SIGINT, shutting down"),
        Some(joined) = tasks.join_next() => {
            let err = match joined {
                Ok(Ok(())) => anyhow::anyhow!("service task exited"),
                Ok(Err(e)) => e,
                Err(e) => e.into(),
            };
            component_error!("main", "Stopping after task failure: {:#}", err);
            failure = Some(err);
        }
    }

    broker.shutdown();
    let drain = async {
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Err(e)) => component_warn!("main", "Task ended with error: {:#}", e),
                Err(e) => component_warn!("main", "Task panicked: {}", e),
                Ok(Ok(())) => {}
            }
        }
    };
    // Sessions wait at most one second each for their peer; allow some slack.
    if tokio::time::timeout(Duration::from_secs(10), drain).await.is_err() {
        component_warn!("main", "Tasks still running after 10s, exiting anyway");
    }

    info!("msgpak stopped");
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Configuration with secrets blanked, for logging
fn redacted(config: &MsgPakConfig) -> MsgPakConfig {
    let mut shown = config.clone();
    shown.auth.password = "***".into();
    shown.shared_key = "***".into();
    shown
}

#[cfg(feature = "tls")]
async fn server_tls(config: &MsgPakConfig) -> anyhow::Result<Option<msgpak_session::TlsServer>> {
    if !config.tls.enabled {
        return Ok(None);
    }
    info!(
        "Loading TLS configuration from cert={}, key={}",
        config.tls.cert_file, config.tls.key_file
    );
    let cert_pem = tokio::fs::read_to_string(&config.tls.cert_file)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read certificate file {}: {}", config.tls.cert_file, e))?;
    let key_pem = tokio::fs::read_to_string(&config.tls.key_file)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read private key file {}: {}", config.tls.key_file, e))?;

    let server_config = msgpak_session::make_server_config(&cert_pem, &key_pem)?;
    Ok(Some(msgpak_session::tls_acceptor(server_config)))
}

#[cfg(feature = "tls")]
async fn client_tls(config: &MsgPakConfig) -> anyhow::Result<Option<msgpak_session::TlsClient>> {
    if !config.tls.enabled {
        return Ok(None);
    }
    info!("Loading TLS CA from {}", config.tls.ca_file);
    let ca_pem = tokio::fs::read_to_string(&config.tls.ca_file)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read CA file {}: {}", config.tls.ca_file, e))?;

    let client_config = msgpak_session::make_client_config(&ca_pem)?;
    Ok(Some(msgpak_session::tls_connector(client_config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let args = Args::parse_from([
            "msgpak",
            "--mode",
            "client",
            "--server",
            "a.example:7000",
            "--server",
            "b.example:7000",
            "--message-interval",
            "30s",
            "--admin-bind",
            "127.0.0.1:9100",
        ]);

        let mut config = MsgPakConfig::default();
        args.apply(&mut config);

        assert_eq!(config.mode, Mode::Client);
        assert_eq!(config.servers, vec!["a.example:7000", "b.example:7000"]);
        assert_eq!(config.message_interval, Duration::from_secs(30));
        assert!(config.admin.enabled);
        assert_eq!(config.admin.bind.port(), 9100);
    }

    #[test]
    fn test_redacted_hides_secrets() {
        let mut config = MsgPakConfig::default();
        config.auth.password = "s3cret-pass".into();
        config.shared_key = "long-lived-key-0123456789".into();
        let shown = format!("{:?}", redacted(&config));
        assert!(!shown.contains("s3cret-pass"));
        assert!(!shown.contains("long-lived-key"));
    }

    #[test]
    fn test_tls_paths_require_flag() {
        assert!(Args::try_parse_from(["msgpak", "--tls-ca", "ca.pem"]).is_err());
        let args = Args::try_parse_from(["msgpak", "--tls", "--tls-ca", "ca.pem"]).unwrap();
        let mut config = MsgPakConfig::default();
        args.apply(&mut config);
        assert!(config.tls.enabled);
        assert_eq!(config.tls.ca_file, "ca.pem");
    }
}

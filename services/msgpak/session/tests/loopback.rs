//! End-to-end sessions over loopback TCP.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use msgpak_session::{
    serve, Broker, BrokerConfig, ClientOptions, CommandContext, CommandHandler, Credentials,
    HandlerReply, RejectUnhandled, Role, ServerOptions, Watchdog,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};

const KEY: &str = "loopback-shared-key-0123456789";

struct Recorder {
    tx: mpsc::UnboundedSender<(String, String)>,
}

#[async_trait]
impl CommandHandler for Recorder {
    async fn handle(&self, _ctx: &CommandContext, cmd: &str, data: &str) -> HandlerReply {
        let _ = self.tx.send((cmd.to_string(), data.to_string()));
        HandlerReply::reply("OK", "received")
    }
}

fn config(role: Role, id: &str) -> BrokerConfig {
    BrokerConfig {
        id: id.to_string(),
        role,
        shared_key: KEY.to_string(),
        credentials: Credentials {
            user: "operator".into(),
            password: "s3cret-pass".into(),
        },
        message_interval: Duration::from_millis(200),
        reconnect_interval: Duration::from_millis(200),
        handshake_timeout: Duration::from_secs(5),
        ..BrokerConfig::default()
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, f: F) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !f() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        sleep(Duration::from_millis(20)).await;
    }
}

struct Pair {
    server: Arc<Broker>,
    client: Arc<Broker>,
    pool_addr: String,
    inbox: mpsc::UnboundedReceiver<(String, String)>,
    server_task: tokio::task::JoinHandle<anyhow::Result<()>>,
    watchdog_task: tokio::task::JoinHandle<()>,
}

async fn start_pair() -> Pair {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let pool_addr = listener.local_addr().unwrap().to_string();

    let server = Broker::new(config(Role::Server, "srv"), Arc::new(RejectUnhandled));
    let server_task = tokio::spawn(serve(server.clone(), listener, ServerOptions::default()));

    let (tx, inbox) = mpsc::unbounded_channel();
    let client = Broker::new(config(Role::Client, "cli"), Arc::new(Recorder { tx }));
    let watchdog = Watchdog::new(
        client.clone(),
        vec![pool_addr.clone()],
        ClientOptions::default(),
    );
    let watchdog_task = tokio::spawn(watchdog.run());

    {
        let server = server.clone();
        let client = client.clone();
        let addr = pool_addr.clone();
        wait_for("session", move || {
            server.registry().len() == 1 && client.registry().contains(&addr)
        })
        .await;
    }

    Pair {
        server,
        client,
        pool_addr,
        inbox,
        server_task,
        watchdog_task,
    }
}

async fn stop_pair(pair: Pair) {
    pair.client.shutdown();
    timeout(Duration::from_secs(5), pair.watchdog_task)
        .await
        .expect("watchdog stops")
        .unwrap();
    pair.server.shutdown();
    timeout(Duration::from_secs(5), pair.server_task)
        .await
        .expect("server stops")
        .unwrap()
        .unwrap();
    assert!(pair.client.registry().is_empty());
    assert!(pair.server.registry().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_happy_path_delivery() {
    let mut pair = start_pair().await;

    let summary = pair.server.enqueue_all("REPORT", "hello").await.unwrap();
    assert_eq!(summary.accepted, 1);

    let got = timeout(Duration::from_secs(5), pair.inbox.recv())
        .await
        .expect("task delivered")
        .unwrap();
    assert_eq!(got, ("REPORT".to_string(), "hello".to_string()));

    // The <OK> reply is terminal; the session stays up.
    sleep(Duration::from_millis(500)).await;
    assert_eq!(pair.server.registry().len(), 1);

    stop_pair(pair).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_identical_tasks_each_delivered() {
    let mut pair = start_pair().await;
    let peer = pair.server.peers()[0].address.clone();

    pair.server.enqueue(&peer, "REPORT", "same").await.unwrap();
    pair.server.enqueue(&peer, "REPORT", "same").await.unwrap();

    for _ in 0..2 {
        let got = timeout(Duration::from_secs(5), pair.inbox.recv())
            .await
            .expect("each submission delivered")
            .unwrap();
        assert_eq!(got, ("REPORT".to_string(), "same".to_string()));
    }

    // A later resubmission inside the dedup window is a new task too.
    sleep(Duration::from_millis(1100)).await;
    let summary = pair.server.enqueue_all("REPORT", "same").await.unwrap();
    assert_eq!(summary.accepted, 1);
    let got = timeout(Duration::from_secs(5), pair.inbox.recv())
        .await
        .expect("resubmission delivered")
        .unwrap();
    assert_eq!(got.1, "same");
    assert_eq!(pair.server.storage().queue.len(&peer).await, 0);

    stop_pair(pair).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reconnect_after_drop() {
    let pair = start_pair().await;

    let before = pair
        .client
        .registry()
        .secret_fingerprint(&pair.pool_addr)
        .unwrap();
    let server_peer = pair.server.peers()[0].address.clone();
    assert!(pair.server.registry().disconnect(&server_peer));

    {
        let client = pair.client.clone();
        let addr = pair.pool_addr.clone();
        let before = before.clone();
        wait_for("reconnect", move || {
            client
                .registry()
                .secret_fingerprint(&addr)
                .map(|fp| fp != before)
                .unwrap_or(false)
        })
        .await;
    }
    {
        let server = pair.server.clone();
        wait_for("server session", move || server.registry().len() == 1).await;
    }

    stop_pair(pair).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wrong_shared_key_never_registers() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let server = Broker::new(config(Role::Server, "srv"), Arc::new(RejectUnhandled));
    let server_task = tokio::spawn(serve(server.clone(), listener, ServerOptions::default()));

    let mut bad = config(Role::Client, "cli");
    bad.shared_key = "a-different-shared-key-987654".into();
    let client = Broker::new(bad, Arc::new(RejectUnhandled));
    let result =
        msgpak_session::connect_and_run(client.clone(), addr, &ClientOptions::default()).await;
    assert!(result.is_err());
    assert!(client.registry().is_empty());
    assert!(server.registry().is_empty());

    server.shutdown();
    timeout(Duration::from_secs(5), server_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

//! Reconnect watchdog.
//!
//! Every reconnect interval the watchdog walks the server pool and spawns a
//! connection attempt for each address that has neither a live session nor an
//! attempt in flight. An attempt owns its whole lifetime: dial, handshake,
//! steady state, deregistration.

use std::sync::Arc;

use dashmap::DashSet;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::broker::Broker;
use crate::client::{connect_and_run, ClientOptions};

/// Client pool maintenance loop
pub struct Watchdog {
    broker: Arc<Broker>,
    pool: Vec<String>,
    options: ClientOptions,
    in_flight: Arc<DashSet<String>>,
}

impl Watchdog {
    /// Create a watchdog over a server pool
    pub fn new(broker: Arc<Broker>, pool: Vec<String>, options: ClientOptions) -> Self {
        Self {
            broker,
            pool,
            options,
            in_flight: Arc::new(DashSet::new()),
        }
    }

    /// Run until the broker shuts down, then wait for every attempt to finish
    pub async fn run(self) {
        let shutdown = self.broker.shutdown_token();
        let mut ticker = tokio::time::interval(self.broker.config().reconnect_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut attempts = JoinSet::new();

        info!(
            "Watchdog started for {} server(s), checking every {:?}",
            self.pool.len(),
            self.broker.config().reconnect_interval
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                _ = ticker.tick() => self.check_pool(&mut attempts),

                Some(joined) = attempts.join_next(), if !attempts.is_empty() => {
                    if let Err(e) = joined {
                        error!("Connection attempt panicked: {}", e);
                    }
                }
            }
        }

        debug!("Watchdog waiting for {} attempt(s)", attempts.len());
        while attempts.join_next().await.is_some() {}
        info!("Watchdog stopped");
    }

    fn check_pool(&self, attempts: &mut JoinSet<()>) {
        for address in &self.pool {
            if self.broker.registry().contains(address) {
                continue;
            }
            if !self.in_flight.insert(address.clone()) {
                debug!("Attempt to {} still in flight", address);
                continue;
            }

            let broker = self.broker.clone();
            let options = self.options.clone();
            let in_flight = self.in_flight.clone();
            let address = address.clone();
            attempts.spawn(async move {
                if let Err(e) = connect_and_run(broker, address.clone(), &options).await {
                    warn!("Session with {} failed: {}", address, e);
                }
                in_flight.remove(&address);
            });
        }
    }
}

//! Liveness watchdogs.
//!
//! The connection watchdog keeps a dispatcher's view of the subnet fresh:
//! each period it clears the registry and re-probes, so stale peers drop
//! off until they reassert themselves. The disconnection watchdog turns a
//! single peer's silence into a one-shot disconnect signal for whoever is
//! blocked on that peer.

use std::net::IpAddr;

use tokio::sync::oneshot;

use beekeeper_protocol::{Operation, DEFAULT_MAX_DISCONNECTIONS};

use crate::server::Server;

/// Handle to a running connection watchdog. Dropping it stops the loop.
pub(crate) struct WatchdogGuard {
    stop: Option<oneshot::Sender<()>>,
}

impl Drop for WatchdogGuard {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

impl Server {
    /// Periodically clear the node registry and broadcast a status probe
    /// until the guard is dropped.
    pub(crate) fn spawn_connection_watchdog(&self) -> WatchdogGuard {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let server = self.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => return,
                    _ = tokio::time::sleep(server.config().watchdog_sleep()) => {
                        server.nodes().clear().await;
                        if let Err(e) = server.broadcast_operation(Operation::Status, false).await {
                            tracing::warn!("unable to broadcast as watchdog: {e}");
                        }
                    }
                }
            }
        });

        WatchdogGuard {
            stop: Some(stop_tx),
        }
    }

    /// Watch one peer's registry presence. Each period its absence bumps a
    /// counter and its presence resets it; at the limit the returned slot
    /// fires once and the watchdog exits. The watchdog also exits when the
    /// receiver is dropped.
    pub(crate) fn spawn_disconnection_watchdog(&self, ip: IpAddr) -> oneshot::Receiver<()> {
        let (fire, slot) = oneshot::channel();
        let server = self.clone();

        tokio::spawn(async move {
            let mut fire = Some(fire);
            let mut missed = 0u32;
            loop {
                tokio::time::sleep(server.config().watchdog_sleep()).await;

                match fire.as_ref() {
                    Some(tx) if !tx.is_closed() => {}
                    _ => return, // waiter gave up
                }

                if server.nodes().contains(ip).await {
                    missed = 0;
                } else {
                    missed += 1;
                    if missed >= DEFAULT_MAX_DISCONNECTIONS {
                        if let Some(tx) = fire.take() {
                            let _ = tx.send(());
                        }
                        return;
                    }
                }
            }
        });

        slot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::callbacks::StaticProbe;
    use crate::config::Config;
    use crate::registry::Node;
    use crate::transport::MemoryNetwork;

    fn fast_server(watchdog_ms: u64) -> Server {
        let net = MemoryNetwork::new();
        let config = Config {
            name: "primary".into(),
            watchdog_sleep_ms: watchdog_ms,
            ..Config::default()
        };
        Server::with_transport(
            config,
            Arc::new(net.transport("192.168.1.1".parse().unwrap())),
            Arc::new(StaticProbe::new("linux")),
        )
    }

    #[tokio::test]
    async fn test_disconnection_fires_after_consecutive_misses() {
        let server = fast_server(30);
        let slot = server.spawn_disconnection_watchdog("192.168.1.10".parse().unwrap());

        let fired = tokio::time::timeout(Duration::from_millis(500), slot).await;
        assert!(fired.expect("watchdog should fire after two misses").is_ok());
    }

    #[tokio::test]
    async fn test_presence_resets_the_counter() {
        let server = fast_server(40);
        let ip: IpAddr = "192.168.1.10".parse().unwrap();
        server.nodes().merge(Node::new(ip)).await;

        let slot = server.spawn_disconnection_watchdog(ip);

        // Two polling periods pass with the node present: no signal yet
        let early = tokio::time::timeout(Duration::from_millis(100), slot).await;
        assert!(early.is_err(), "watchdog must not fire while the peer is present");
    }

    #[tokio::test]
    async fn test_connection_watchdog_clears_registry() {
        let server = fast_server(30);
        server
            .nodes()
            .merge(Node::new("192.168.1.10".parse().unwrap()))
            .await;

        let guard = server.spawn_connection_watchdog();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(server.nodes().is_empty().await);
        drop(guard);
    }
}

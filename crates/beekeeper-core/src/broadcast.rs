//! Subnet broadcast and scan.
//!
//! Broadcast sweeps the host's /24: every address except our own octet is
//! dialled with a short deadline and sent one frame. Hosts that refuse are
//! simply not peers; failures stay silent. Scan is a Status broadcast plus
//! a collection window, with replies merging into the registry through the
//! normal dispatch path.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use tokio::task::JoinSet;

use beekeeper_protocol::{Message, Operation};

use crate::registry::Node;
use crate::server::Server;
use crate::{Error, Result};

/// Connect deadline for each broadcast dial.
const BROADCAST_DIAL_TIMEOUT: Duration = Duration::from_secs(1);

impl Server {
    /// Send a message carrying only an operation tag to the whole subnet.
    pub async fn broadcast_operation(
        &self,
        operation: Operation,
        await_completion: bool,
    ) -> Result<()> {
        self.broadcast_message(Message::with_operation(operation), await_completion)
            .await
    }

    /// Send a message to every host on the local /24 except ourselves.
    /// With `await_completion` the call returns only after every dial and
    /// send has finished.
    pub async fn broadcast_message(
        &self,
        message: Message,
        await_completion: bool,
    ) -> Result<()> {
        let local = self.inner.transport.local_ip()?;
        let IpAddr::V4(local_v4) = local else {
            return Err(Error::Transport("broadcast requires an IPv4 address".into()));
        };
        let octets = local_v4.octets();

        let mut tasks = JoinSet::new();
        for x in 1..=255u8 {
            if x == octets[3] {
                continue;
            }

            let ip = IpAddr::V4(Ipv4Addr::new(octets[0], octets[1], octets[2], x));
            let server = self.clone();
            let message = message.clone();
            let probe = async move {
                // No peer at this address is not an error
                let Ok(conn) = server.dial(ip, Some(BROADCAST_DIAL_TIMEOUT)).await else {
                    return;
                };
                let _ = server.send_to_conn(&conn, message).await;
            };

            if await_completion {
                tasks.spawn(probe);
            } else {
                tokio::spawn(probe);
            }
        }

        while tasks.join_next().await.is_some() {}

        Ok(())
    }

    /// Probe the subnet and return the registry after `window` of replies.
    pub async fn scan(&self, window: Duration) -> Result<Vec<Node>> {
        self.broadcast_operation(Operation::Status, false).await?;
        tokio::time::sleep(window).await;
        Ok(self.nodes().snapshot().await)
    }
}

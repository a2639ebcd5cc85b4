//! Request correlation: pairing inbound messages with blocked callers.
//!
//! A caller that expects a reply registers an awaitable -- a one-shot slot
//! plus a predicate over messages -- then blocks on the slot. After every
//! dispatched message the server walks the list once, in insertion order:
//! each matching entry receives the message and is removed, the rest stay.
//! The list is deliberately flat: transfers correlate on a sender address
//! while task results correlate on a UUID inside an opaque payload, which
//! no single keyed map covers.

use std::net::IpAddr;
use std::time::Duration;

use tokio::sync::oneshot;

use beekeeper_protocol::{Message, Operation, TaskResult};

use crate::error::NO_EXPLANATION;
use crate::registry::Node;
use crate::server::Server;
use crate::{Error, Result};

pub(crate) struct Awaitable {
    notify: oneshot::Sender<Message>,
    check: Box<dyn Fn(&Message) -> bool + Send + Sync>,
}

impl Server {
    pub(crate) async fn register_awaitable<F>(&self, check: F) -> oneshot::Receiver<Message>
    where
        F: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        let (notify, slot) = oneshot::channel();
        let mut awaited = self.inner.awaited.lock().await;
        awaited.push(Awaitable {
            notify,
            check: Box::new(check),
        });
        slot
    }

    /// Walk the awaited list with a dispatched message. Matching entries
    /// are resolved and removed; entries whose waiter already gave up are
    /// dropped along the way.
    pub(crate) async fn check_awaited(&self, message: &Message) {
        let mut awaited = self.inner.awaited.lock().await;
        let entries = std::mem::take(&mut *awaited);
        for entry in entries {
            if entry.notify.is_closed() {
                continue;
            }
            if (entry.check)(message) {
                let _ = entry.notify.send(message.clone());
            } else {
                awaited.push(entry);
            }
        }
    }

    /// Block until a worker sends a result with the given task UUID.
    pub async fn await_task(&self, uuid: &str, timeout: Option<Duration>) -> Result<TaskResult> {
        let uuid = uuid.to_string();
        let slot = self
            .register_awaitable(move |msg| {
                if msg.operation != Operation::JobResult {
                    return false;
                }
                match TaskResult::decode(&msg.data) {
                    Ok(result) => result.uuid == uuid,
                    Err(e) => {
                        tracing::warn!("unable to decode task result: {e}");
                        false
                    }
                }
            })
            .await;

        let message = self.wait(slot, timeout).await?;
        Ok(TaskResult::decode(&message.data)?)
    }

    /// Block until the node acknowledges a transfer or reports a typed
    /// failure. Races a per-peer disconnection watchdog: a peer that stays
    /// out of the registry long enough fails the wait.
    pub async fn await_transfer(&self, node: &Node, timeout: Option<Duration>) -> Result<()> {
        let ip = node.addr;
        let slot = self
            .register_awaitable(move |msg| {
                matches!(
                    msg.operation,
                    Operation::TransferFailed | Operation::TransferAcknowledge
                ) && msg.addr == Some(ip)
            })
            .await;

        let mut disconnected = self.spawn_disconnection_watchdog(ip);

        let wait = async {
            tokio::select! {
                outcome = slot => match outcome {
                    Ok(msg) if msg.operation == Operation::TransferAcknowledge => Ok(()),
                    Ok(msg) => {
                        let text = String::from_utf8_lossy(&msg.data).trim().to_string();
                        let text = if text.is_empty() {
                            NO_EXPLANATION.to_string()
                        } else {
                            text
                        };
                        Err(Error::TransferFailed(text))
                    }
                    Err(_) => Err(Error::Terminated),
                },
                _ = &mut disconnected => Err(Error::NodeDisconnected),
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| Error::Timeout)?,
            None => wait.await,
        }
    }

    /// Block until the host at `ip` sends any frame, then return its
    /// registry entry.
    pub async fn await_any(&self, ip: IpAddr, timeout: Option<Duration>) -> Result<Node> {
        let slot = self
            .register_awaitable(move |msg| msg.addr == Some(ip))
            .await;

        let message = self.wait(slot, timeout).await?;

        match self.nodes().find(ip).await {
            Some(node) => Ok(node),
            // Merge raced the walk; fall back to the message itself
            None => Node::from_message(&message)
                .ok_or_else(|| Error::Transport("sender address missing".into())),
        }
    }

    async fn wait(
        &self,
        slot: oneshot::Receiver<Message>,
        timeout: Option<Duration>,
    ) -> Result<Message> {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, slot).await {
                Ok(Ok(message)) => Ok(message),
                Ok(Err(_)) => Err(Error::Terminated),
                Err(_) => Err(Error::Timeout),
            },
            None => slot.await.map_err(|_| Error::Terminated),
        }
    }
}

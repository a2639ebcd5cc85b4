//! Server -- process-wide runtime for one node, primary or worker.
//!
//! One consumer task drains the shared request queue; connection readers
//! feed it from every live socket. Handlers run as their own tasks, so
//! frames from unrelated peers interleave freely while frames on a single
//! connection stay in arrival order.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Mutex, RwLock};

use beekeeper_protocol::{tls, Message, Operation, Status};

use crate::awaitable::Awaitable;
use crate::callbacks::{self, SysinfoProbe, SystemProbe};
use crate::config::Config;
use crate::registry::{Node, NodeRegistry};
use crate::transport::{Connection, Request, TlsTransport, Transport};
use crate::{Error, Result};

/// Capacity of the shared inbound request queue.
const REQUEST_QUEUE_DEPTH: usize = 1024;

/// A node server. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct Server {
    pub(crate) inner: Arc<ServerInner>,
}

pub(crate) struct ServerInner {
    pub(crate) config: Config,
    pub(crate) status: RwLock<Status>,
    pub(crate) nodes: NodeRegistry,
    pub(crate) awaited: Mutex<Vec<Awaitable>>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) probe: Arc<dyn SystemProbe>,
    pub(crate) queue_tx: mpsc::Sender<Request>,
    pub(crate) queue_rx: Mutex<Option<mpsc::Receiver<Request>>>,
    pub(crate) shutdown: broadcast::Sender<()>,
}

impl Server {
    /// Create a server over the default TLS transport, generating and
    /// caching the certificate pair under `$HOME/.beekeeper/` if the config
    /// carries none.
    pub fn new(mut config: Config) -> Result<Self> {
        if config.tls_certificate.is_empty() || config.tls_private_key.is_empty() {
            let dir = dirs::home_dir()
                .ok_or_else(|| Error::Transport("unable to locate home directory".into()))?
                .join(crate::config::DEFAULT_SCRATCH_DIR);
            let (cert, key) = tls::load_or_create(&dir)
                .map_err(|e| Error::Transport(format!("TLS material: {e}")))?;
            config.tls_certificate = cert;
            config.tls_private_key = key;
        }

        Ok(Self::with_transport(
            config,
            Arc::new(TlsTransport::new()),
            Arc::new(SysinfoProbe),
        ))
    }

    /// Create a server over injected I/O and probe strategies. Used by
    /// tests and embedders with their own transports.
    pub fn with_transport(
        config: Config,
        transport: Arc<dyn Transport>,
        probe: Arc<dyn SystemProbe>,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        let (shutdown, _) = broadcast::channel(1);

        Server {
            inner: Arc::new(ServerInner {
                config,
                status: RwLock::new(Status::Idle),
                nodes: NodeRegistry::new(),
                awaited: Mutex::new(Vec::new()),
                transport,
                probe,
                queue_tx,
                queue_rx: Mutex::new(Some(queue_rx)),
                shutdown,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn nodes(&self) -> &NodeRegistry {
        &self.inner.nodes
    }

    pub async fn status(&self) -> Status {
        *self.inner.status.read().await
    }

    pub(crate) async fn set_status(&self, status: Status) {
        *self.inner.status.write().await = status;
    }

    pub(crate) fn probe(&self) -> Arc<dyn SystemProbe> {
        self.inner.probe.clone()
    }

    /// Serve this node and block until `stop` is called.
    pub async fn start(&self) -> Result<()> {
        let mut queue_rx = self
            .inner
            .queue_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Transport("server already started".into()))?;

        tracing::info!("starting server");
        self.inner
            .transport
            .listen(
                &self.inner.config,
                self.inner.queue_tx.clone(),
                self.inner.shutdown.clone(),
            )
            .await?;
        tracing::info!(port = self.inner.config.inbound_port, "listening");

        let mut shutdown_rx = self.inner.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    return Err(Error::Terminated);
                }
                request = queue_rx.recv() => {
                    let Some(request) = request else {
                        return Err(Error::Terminated);
                    };
                    self.accept_request(request).await;
                }
            }
        }
    }

    /// Token gate, registry merge, one walk of the awaited list, then
    /// concurrent dispatch.
    pub(crate) async fn accept_request(&self, request: Request) {
        if request.message.token != self.inner.config.token {
            if self.inner.config.debug {
                tracing::debug!("received no-auth: {}", request.message.summary());
            }
            return;
        }

        if self.inner.config.debug {
            tracing::debug!("received: {}", request.message.summary());
        }

        if let Some(node) = Node::from_message(&request.message) {
            self.inner.nodes.merge(node).await;
        }

        // Every accepted message walks the awaited list, whatever its
        // operation -- await_any correlates on the sender address alone,
        // and the reply it waits for can be a bare status carrier.
        self.check_awaited(&request.message).await;

        let server = self.clone();
        tokio::spawn(async move {
            // A second spawn isolates handler panics from the caller.
            let handler = tokio::spawn(callbacks::dispatch(server, request));
            if let Err(e) = handler.await {
                if e.is_panic() {
                    tracing::error!("operation handler panicked: {e}");
                }
            }
        });
    }

    /// Signal termination: the consumer loop returns and connection
    /// readers close their sockets.
    pub fn stop(&self) {
        let _ = self.inner.shutdown.send(());
    }

    /// Dial a peer, spawning a background reader for the new connection.
    pub async fn dial(&self, ip: IpAddr, timeout: Option<Duration>) -> Result<Connection> {
        self.inner
            .transport
            .dial(
                &self.inner.config,
                ip,
                timeout,
                self.inner.queue_tx.clone(),
                self.inner.shutdown.clone(),
            )
            .await
    }

    /// Dial a host, probe it, and wait until it identifies itself.
    pub async fn connect(&self, ip: IpAddr, timeout: Option<Duration>) -> Result<Node> {
        let conn = self.dial(ip, timeout).await?;
        self.send_to_conn(&conn, Message::with_operation(Operation::Status))
            .await?;
        self.await_any(ip, timeout).await
    }

    /// Stamp the sender metadata every outbound frame carries.
    async fn stamp(&self, message: &mut Message) {
        message.sent_now();
        message.name = self.inner.config.name.clone();
        message.token = self.inner.config.token.clone();
        message.status = self.status().await;
        if message.respond_on_port == 0 {
            message.respond_on_port = self.inner.config.inbound_port;
        }
        if message.node_info.os.is_empty() {
            message.node_info.os = std::env::consts::OS.into();
        }
    }

    /// Stamp and write one frame to an open connection.
    pub async fn send_to_conn(&self, conn: &Connection, mut message: Message) -> Result<()> {
        self.stamp(&mut message).await;
        if self.inner.config.debug {
            tracing::debug!("sent: {}", message.summary());
        }
        self.inner
            .transport
            .send(&self.inner.config, conn, message)
            .await
    }

    /// Send to a node, dialling first when its cached connection is gone.
    /// The fresh connection is cached on this handle only.
    pub async fn send_to_node(&self, node: &mut Node, message: Message) -> Result<()> {
        if node.conn.is_none() {
            node.conn = Some(self.dial(node.addr, None).await?);
        }
        let conn = node.conn.clone().expect("connection cached above");
        self.send_to_conn(&conn, message).await
    }
}

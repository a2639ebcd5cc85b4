//! Transport strategies: how a server listens, dials and sends.
//!
//! The default transport speaks TLS over TCP. Connections are duplex: the
//! dialler spawns a background reader on every new socket so frames coming
//! back on it land in the same inbound queue as accepted connections. The
//! in-memory transport routes frames through channels for tests.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tokio_util::codec::{Encoder, FramedRead};

use beekeeper_protocol::{tls, FrameCodec, Message};
use futures::StreamExt;

use crate::config::{is_private_addr, Config};
use crate::{Error, Result};

/// An inbound frame paired with the connection it arrived on.
pub struct Request {
    pub message: Message,
    pub conn: Connection,
}

/// Reusable handle to a live duplex connection.
#[derive(Clone)]
pub struct Connection {
    peer: IpAddr,
    writer: ConnWriter,
}

#[derive(Clone)]
enum ConnWriter {
    Tls(Arc<Mutex<WriteHalf<TlsStream<TcpStream>>>>),
    Memory {
        remote: mpsc::Sender<Request>,
        local_ip: IpAddr,
        local_queue: mpsc::Sender<Request>,
    },
}

impl Connection {
    /// Address of the remote end.
    pub fn peer(&self) -> IpAddr {
        self.peer
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").field("peer", &self.peer).finish()
    }
}

/// I/O strategy for a server. The default is TLS over TCP; tests swap in
/// `MemoryTransport` to run whole clusters in-process.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Bind the inbound listener and start feeding `queue`.
    /// Returns once the listener is active.
    async fn listen(
        &self,
        config: &Config,
        queue: mpsc::Sender<Request>,
        shutdown: broadcast::Sender<()>,
    ) -> Result<()>;

    /// Dial a peer and spawn the background reader for the new connection.
    async fn dial(
        &self,
        config: &Config,
        ip: IpAddr,
        timeout: Option<Duration>,
        queue: mpsc::Sender<Request>,
        shutdown: broadcast::Sender<()>,
    ) -> Result<Connection>;

    /// Write one frame to a connection. The caller has already stamped the
    /// sender metadata.
    async fn send(&self, config: &Config, conn: &Connection, message: Message) -> Result<()>;

    /// Primary IPv4 of this host; anchors the broadcast subnet.
    fn local_ip(&self) -> Result<IpAddr>;
}

/// TLS-over-TCP transport with source filtering on accept.
pub struct TlsTransport {
    client_config: OnceLock<Arc<rustls::ClientConfig>>,
}

impl TlsTransport {
    pub fn new() -> Self {
        TlsTransport {
            client_config: OnceLock::new(),
        }
    }

    fn connector(&self) -> TlsConnector {
        let config = self
            .client_config
            .get_or_init(|| Arc::new(tls::client_config()));
        TlsConnector::from(config.clone())
    }
}

impl Default for TlsTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for TlsTransport {
    async fn listen(
        &self,
        config: &Config,
        queue: mpsc::Sender<Request>,
        shutdown: broadcast::Sender<()>,
    ) -> Result<()> {
        let tls_config = tls::server_config(&config.tls_certificate, &config.tls_private_key)
            .map_err(|e| Error::Transport(format!("TLS setup: {e}")))?;
        let acceptor = TlsAcceptor::from(Arc::new(tls_config));

        let listener = TcpListener::bind(("0.0.0.0", config.inbound_port)).await?;

        let config = config.clone();
        let max_frame_size = config.max_frame_size;
        let mut shutdown_rx = shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let (stream, peer) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                tracing::warn!("received invalid connection: {e}");
                                continue;
                            }
                        };

                        if !config.allow_external && !is_private_addr(peer.ip()) {
                            tracing::debug!(peer = %peer.ip(), "refused external connection");
                            continue;
                        }
                        if !config.whitelist_allows(peer.ip()) {
                            tracing::debug!(peer = %peer.ip(), "refused non-whitelisted connection");
                            continue;
                        }

                        let acceptor = acceptor.clone();
                        let queue = queue.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            match acceptor.accept(stream).await {
                                Ok(tls_stream) => {
                                    spawn_reader(
                                        TlsStream::from(tls_stream),
                                        peer.ip(),
                                        max_frame_size,
                                        queue,
                                        shutdown.subscribe(),
                                    );
                                }
                                Err(e) => {
                                    tracing::debug!(peer = %peer.ip(), "TLS accept failed: {e}");
                                }
                            }
                        });
                    }
                    _ = shutdown_rx.recv() => {
                        return;
                    }
                }
            }
        });

        Ok(())
    }

    async fn dial(
        &self,
        config: &Config,
        ip: IpAddr,
        timeout: Option<Duration>,
        queue: mpsc::Sender<Request>,
        shutdown: broadcast::Sender<()>,
    ) -> Result<Connection> {
        let addr = SocketAddr::new(ip, config.outbound_port);

        let tcp = match timeout {
            Some(limit) => tokio::time::timeout(limit, TcpStream::connect(addr))
                .await
                .map_err(|_| Error::Timeout)??,
            None => TcpStream::connect(addr).await?,
        };

        let server_name = rustls::pki_types::ServerName::IpAddress(ip.into());
        let tls_stream = self.connector().connect(server_name, tcp).await?;

        Ok(spawn_reader(
            TlsStream::from(tls_stream),
            ip,
            config.max_frame_size,
            queue,
            shutdown.subscribe(),
        ))
    }

    async fn send(&self, config: &Config, conn: &Connection, message: Message) -> Result<()> {
        match &conn.writer {
            ConnWriter::Tls(writer) => {
                let mut buf = BytesMut::new();
                FrameCodec::new(config.max_frame_size).encode(message, &mut buf)?;

                let mut writer = writer.lock().await;
                writer.write_all(&buf).await?;
                writer.flush().await?;
                Ok(())
            }
            ConnWriter::Memory { .. } => {
                Err(Error::Transport("memory connection on TLS transport".into()))
            }
        }
    }

    fn local_ip(&self) -> Result<IpAddr> {
        // Routing-table lookup via a connected UDP socket; nothing is sent.
        let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("1.2.3.4:80")?;
        Ok(socket.local_addr()?.ip())
    }
}

/// Split a TLS stream, spawn the frame reader feeding `queue`, and return
/// the connection handle wrapping the write half.
fn spawn_reader(
    stream: TlsStream<TcpStream>,
    peer: IpAddr,
    max_frame_size: usize,
    queue: mpsc::Sender<Request>,
    mut shutdown: broadcast::Receiver<()>,
) -> Connection {
    let (read_half, write_half) = tokio::io::split(stream);
    let conn = Connection {
        peer,
        writer: ConnWriter::Tls(Arc::new(Mutex::new(write_half))),
    };

    let reader_conn = conn.clone();
    tokio::spawn(async move {
        let mut framed = FramedRead::new(read_half, FrameCodec::new(max_frame_size));
        loop {
            tokio::select! {
                frame = framed.next() => {
                    match frame {
                        Some(Ok(mut message)) => {
                            // Address comes from the transport, never the body
                            message.addr = Some(peer);
                            let request = Request {
                                message,
                                conn: reader_conn.clone(),
                            };
                            if queue.send(request).await.is_err() {
                                return;
                            }
                        }
                        Some(Err(e)) => {
                            tracing::debug!(peer = %peer, "dropping connection: {e}");
                            return;
                        }
                        None => return,
                    }
                }
                _ = shutdown.recv() => {
                    return;
                }
            }
        }
    });

    conn
}

/// Shared in-memory fabric: maps listening node addresses to their queues.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    peers: Arc<StdMutex<HashMap<IpAddr, mpsc::Sender<Request>>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        MemoryNetwork::default()
    }

    /// A transport bound to `ip` on this fabric.
    pub fn transport(&self, ip: IpAddr) -> MemoryTransport {
        MemoryTransport {
            net: self.clone(),
            ip,
            queue: Arc::new(StdMutex::new(None)),
        }
    }

    /// Drop a node from the fabric, refusing future dials to it.
    pub fn unplug(&self, ip: IpAddr) {
        self.peers.lock().unwrap().remove(&ip);
    }
}

/// Channel-backed transport double. Frames skip the wire codec and travel
/// as values; address stamping and routing behave like the TLS transport.
pub struct MemoryTransport {
    net: MemoryNetwork,
    ip: IpAddr,
    queue: Arc<StdMutex<Option<mpsc::Sender<Request>>>>,
}

impl MemoryTransport {
    fn local_queue(&self) -> mpsc::Sender<Request> {
        self.queue
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| mpsc::channel(1).0)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn listen(
        &self,
        _config: &Config,
        queue: mpsc::Sender<Request>,
        _shutdown: broadcast::Sender<()>,
    ) -> Result<()> {
        *self.queue.lock().unwrap() = Some(queue.clone());
        self.net.peers.lock().unwrap().insert(self.ip, queue);
        Ok(())
    }

    async fn dial(
        &self,
        _config: &Config,
        ip: IpAddr,
        _timeout: Option<Duration>,
        _queue: mpsc::Sender<Request>,
        _shutdown: broadcast::Sender<()>,
    ) -> Result<Connection> {
        let remote = self
            .net
            .peers
            .lock()
            .unwrap()
            .get(&ip)
            .cloned()
            .ok_or_else(|| Error::Transport(format!("connection refused: {ip}")))?;

        Ok(Connection {
            peer: ip,
            writer: ConnWriter::Memory {
                remote,
                local_ip: self.ip,
                local_queue: self.local_queue(),
            },
        })
    }

    async fn send(&self, _config: &Config, conn: &Connection, mut message: Message) -> Result<()> {
        let ConnWriter::Memory {
            remote,
            local_ip,
            local_queue,
        } = &conn.writer
        else {
            return Err(Error::Transport("TLS connection on memory transport".into()));
        };

        message.addr = Some(*local_ip);

        // The receiver sees a connection that routes straight back to us.
        let reply_conn = Connection {
            peer: *local_ip,
            writer: ConnWriter::Memory {
                remote: local_queue.clone(),
                local_ip: conn.peer,
                local_queue: remote.clone(),
            },
        };

        remote
            .send(Request {
                message,
                conn: reply_conn,
            })
            .await
            .map_err(|_| Error::Transport("connection closed".into()))
    }

    fn local_ip(&self) -> Result<IpAddr> {
        Ok(self.ip)
    }
}

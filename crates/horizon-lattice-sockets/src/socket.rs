//! Connection endpoint: one connected socket and its receive loop.

use std::fmt;
use std::io::{self, Read};
use std::net::{Ipv4Addr, Shutdown, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use socket2::{Socket, TcpKeepalive};
use tokio::net::TcpStream;

use crate::bridge::{Bridge, EventStream, Observable, Producer};
use crate::cancel::CancellationToken;
use crate::config::SocketConfig;
use crate::dispose::Disposer;
use crate::error::{Result, SocketError};
use crate::logging::{Logger, targets};

/// Unique identifier for a connection endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// State shared between the endpoint handles and the receive thread.
struct Lifecycle {
    disposer: Disposer<Arc<Socket>>,
    connected: AtomicBool,
}

impl Lifecycle {
    /// Mark the endpoint disconnected and release the socket if nobody has.
    fn teardown(&self) -> bool {
        self.connected.store(false, Ordering::Release);
        self.disposer.request_disposal(|socket| {
            // Unblocks a pending recv; the descriptor closes when the last
            // Arc (possibly the receive thread's) drops.
            if let Err(err) = socket.shutdown(Shutdown::Both) {
                tracing::trace!(target: targets::DISPOSE, error = %err, "shutdown on release failed");
            }
        })
    }
}

struct SocketInner {
    id: ConnectionId,
    lifecycle: Arc<Lifecycle>,
    bridge: Arc<Bridge<Bytes>>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    logger: Logger,
}

impl Drop for SocketInner {
    fn drop(&mut self) {
        // Last handle gone: release without waiting on the receive thread.
        self.logger.in_scope(|| {
            if self.lifecycle.teardown() {
                tracing::debug!(target: targets::SOCKET, id = %self.id, "released on drop");
            }
        });
        self.bridge.retire();
    }
}

/// A connected socket exposed as a lazy stream of received chunks.
///
/// `RxSocket` is a cheap, cloneable handle. It is created either by
/// [`connect`](Self::connect) or by a [`Listener`](crate::Listener)'s accept
/// loop. The first consumer attached through
/// [`receive_observable`](Self::receive_observable) or
/// [`receive_stream`](Self::receive_stream) starts one dedicated thread that
/// blocks in `recv` and publishes every non-empty read as a [`Bytes`] chunk.
///
/// The receive stream ends with
///
/// - completion when the peer shuts down its side (zero-length read), or
///   when a read fails after [`dispose`](Self::dispose) was requested,
/// - a fault when a read fails for any other reason; the endpoint is then
///   torn down and [`is_connected`](Self::is_connected) turns false.
///
/// # Example
///
/// ```ignore
/// use futures_util::StreamExt;
/// use horizon_lattice_sockets::{RxSocket, SocketConfig};
///
/// let socket = RxSocket::connect(addr, &SocketConfig::new().no_delay(true)).await?;
/// socket.send(b"Hello!")?;
///
/// let mut chunks = socket.receive_stream();
/// while let Some(chunk) = chunks.next().await {
///     println!("received {} bytes", chunk?.len());
/// }
///
/// socket.dispose();
/// ```
#[derive(Clone)]
pub struct RxSocket {
    inner: Arc<SocketInner>,
}

impl RxSocket {
    /// Connect to `addr`, honoring `config.connect_timeout`.
    ///
    /// Fails with [`SocketError::Connect`] when the peer refuses or is
    /// unreachable and [`SocketError::Timeout`] when the timeout elapses.
    pub async fn connect(addr: SocketAddr, config: &SocketConfig) -> Result<Self> {
        Self::connect_with_cancel(addr, config, &CancellationToken::new()).await
    }

    /// Like [`connect`](Self::connect), but aborts with
    /// [`SocketError::Cancelled`] once `cancel` fires.
    ///
    /// Cancellation and timeout drop the pending attempt, which closes the
    /// half-open socket.
    pub async fn connect_with_cancel(
        addr: SocketAddr,
        config: &SocketConfig,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        if cancel.is_cancelled() {
            return Err(SocketError::Cancelled(addr));
        }

        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                config.logger.in_scope(|| {
                    tracing::debug!(target: targets::SOCKET, %addr, "connect cancelled");
                });
                return Err(SocketError::Cancelled(addr));
            }
            result = dial(addr, config) => result,
        };

        let stream = match stream {
            Ok(stream) => stream.into_std().map_err(|err| SocketError::connect(addr, err))?,
            Err(err) => {
                config.logger.in_scope(|| {
                    tracing::debug!(target: targets::SOCKET, %addr, error = %err, "connect failed");
                });
                return Err(err);
            }
        };
        Ok(Self::from_connected(stream, config))
    }

    /// Wrap an already-connected socket, e.g. one returned by `accept`.
    ///
    /// The socket is switched to blocking mode and configured from `config`;
    /// option failures are logged, never returned.
    pub fn from_connected(socket: impl Into<Socket>, config: &SocketConfig) -> Self {
        let socket: Socket = socket.into();
        let id = ConnectionId::new();
        let logger = config.logger.clone();

        logger.in_scope(|| apply_options(&socket, config, id));

        let unspecified = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
        let local_addr = socket
            .local_addr()
            .ok()
            .and_then(|addr| addr.as_socket())
            .unwrap_or(unspecified);
        let peer_addr = socket
            .peer_addr()
            .ok()
            .and_then(|addr| addr.as_socket())
            .unwrap_or(unspecified);

        let socket = Arc::new(socket);
        let lifecycle = Arc::new(Lifecycle {
            disposer: Disposer::new(Arc::clone(&socket)),
            connected: AtomicBool::new(true),
        });

        let loop_lifecycle = Arc::clone(&lifecycle);
        let buffer_size = config.receive_buffer_size.max(1);
        let bridge = Bridge::new(
            format!("{}-{}", config.thread_name, id.as_u64()),
            logger.clone(),
            Box::new(move |producer: Producer<Bytes>| {
                receive_loop(socket, loop_lifecycle, id, buffer_size, producer);
            }),
        );

        logger.in_scope(|| {
            tracing::debug!(target: targets::SOCKET, %id, local = %local_addr, peer = %peer_addr, "connection opened");
        });

        Self {
            inner: Arc::new(SocketInner {
                id,
                lifecycle,
                bridge,
                local_addr,
                peer_addr,
                logger,
            }),
        }
    }

    /// Get the unique connection ID.
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Get the local socket address.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Get the peer socket address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    /// Whether the connection is still usable. Never turns true again once
    /// it is false.
    pub fn is_connected(&self) -> bool {
        self.inner.lifecycle.connected.load(Ordering::Acquire)
    }

    /// Whether disposal has been requested, explicitly or by a receive fault.
    pub fn is_disposed(&self) -> bool {
        self.inner.lifecycle.disposer.was_disposal_requested()
    }

    /// Write `data` to the peer, returning how many bytes were sent.
    ///
    /// A single call may send fewer bytes than given. Calls may run
    /// concurrently with receiving, but concurrent sends must be serialized
    /// by the caller.
    ///
    /// Fails with [`SocketError::NotConnected`] after disposal and with
    /// [`SocketError::Io`] on a transport fault.
    pub fn send(&self, data: &[u8]) -> Result<usize> {
        let lifecycle = &self.inner.lifecycle;
        if !self.is_connected() {
            return Err(SocketError::NotConnected);
        }
        let socket = lifecycle
            .disposer
            .with_resource(Arc::clone)
            .ok_or(SocketError::NotConnected)?;

        match socket.send(data) {
            Ok(sent) => {
                self.inner.logger.in_scope(|| {
                    tracing::trace!(target: targets::SOCKET, id = %self.inner.id, bytes = sent, "sent");
                });
                Ok(sent)
            }
            Err(_) if lifecycle.disposer.was_disposal_requested() => Err(SocketError::NotConnected),
            Err(err) => {
                self.inner.logger.in_scope(|| {
                    tracing::warn!(target: targets::SOCKET, id = %self.inner.id, error = %err, "send failed");
                });
                Err(err.into())
            }
        }
    }

    /// Write all of `data`, looping over partial sends.
    pub fn send_all(&self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            match self.send(data)? {
                0 => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                sent => data = &data[sent..],
            }
        }
        Ok(())
    }

    /// Push-based view of the received chunks.
    ///
    /// Attaching the first consumer starts the receive thread. After
    /// disposal, new consumers receive completion immediately.
    pub fn receive_observable(&self) -> Observable<Bytes> {
        Observable::new(Arc::clone(&self.inner.bridge))
    }

    /// Pull-based view of the received chunks.
    pub fn receive_stream(&self) -> EventStream<Bytes> {
        self.receive_observable().stream()
    }

    /// Close the connection.
    ///
    /// Shuts the socket down in both directions, marks the endpoint
    /// disconnected, and waits for the receive thread (if any) to deliver
    /// its terminal event and exit. Safe to call any number of times from
    /// any thread, including from a receive callback.
    pub fn dispose(&self) {
        let inner = &self.inner;
        let first = inner.logger.in_scope(|| inner.lifecycle.teardown());
        inner.bridge.retire();
        inner.bridge.wait_for_loop();
        if first {
            inner.logger.in_scope(|| {
                tracing::debug!(target: targets::SOCKET, id = %inner.id, "disposed");
            });
        }
    }

    /// [`dispose`](Self::dispose) on tokio's blocking pool.
    pub async fn dispose_async(&self) {
        let this = self.clone();
        if tokio::task::spawn_blocking(move || this.dispose()).await.is_err() {
            self.dispose();
        }
    }
}

impl fmt::Debug for RxSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RxSocket")
            .field("id", &self.inner.id)
            .field("local_addr", &self.inner.local_addr)
            .field("peer_addr", &self.inner.peer_addr)
            .field("is_connected", &self.is_connected())
            .finish()
    }
}

async fn dial(addr: SocketAddr, config: &SocketConfig) -> Result<TcpStream> {
    let pending = TcpStream::connect(addr);
    let result = match config.connect_timeout {
        Some(limit) => match tokio::time::timeout(limit, pending).await {
            Ok(result) => result,
            Err(_) => return Err(SocketError::Timeout(addr)),
        },
        None => pending.await,
    };
    result.map_err(|err| SocketError::connect(addr, err))
}

fn apply_options(socket: &Socket, config: &SocketConfig, id: ConnectionId) {
    if let Err(err) = socket.set_nonblocking(false) {
        tracing::warn!(target: targets::SOCKET, %id, error = %err, "failed to switch to blocking mode");
    }
    if let Err(err) = socket.set_nodelay(config.no_delay) {
        tracing::warn!(target: targets::SOCKET, %id, error = %err, "failed to set TCP_NODELAY");
    }
    if let Some(idle) = config.keep_alive {
        let keepalive = TcpKeepalive::new().with_time(idle);
        if let Err(err) = socket.set_tcp_keepalive(&keepalive) {
            tracing::warn!(target: targets::SOCKET, %id, error = %err, "failed to set keep-alive");
        }
    }
}

fn receive_loop(
    socket: Arc<Socket>,
    lifecycle: Arc<Lifecycle>,
    id: ConnectionId,
    buffer_size: usize,
    producer: Producer<Bytes>,
) {
    tracing::debug!(target: targets::SOCKET, %id, "receive loop started");
    let mut buffer = vec![0u8; buffer_size];

    loop {
        match (&*socket).read(&mut buffer) {
            Ok(0) => {
                tracing::debug!(target: targets::SOCKET, %id, "peer closed the connection");
                producer.complete();
                return;
            }
            Ok(n) => {
                tracing::trace!(target: targets::SOCKET, %id, bytes = n, "received");
                producer.publish(Bytes::copy_from_slice(&buffer[..n]));
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                if lifecycle.disposer.was_disposal_requested() {
                    tracing::debug!(target: targets::SOCKET, %id, error = %err, "receive ended by disposal");
                    producer.complete();
                } else {
                    tracing::warn!(target: targets::SOCKET, %id, error = %err, "receive failed");
                    lifecycle.teardown();
                    producer.fault(err.into());
                }
                return;
            }
        }
    }
}

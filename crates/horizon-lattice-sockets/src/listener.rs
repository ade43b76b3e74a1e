//! Listener: one listening socket and its accept loop.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use crate::bridge::{Bridge, EventStream, Observable, Producer};
use crate::config::{ListenerConfig, SocketConfig};
use crate::dispose::Disposer;
use crate::error::{Result, SocketError};
use crate::logging::{Logger, targets};
use crate::socket::RxSocket;

/// How long dispose waits when it has to wake a blocked `accept` by
/// connecting to the listener.
const WAKE_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

struct ListenerInner {
    disposer: Arc<Disposer<Arc<Socket>>>,
    bridge: Arc<Bridge<RxSocket>>,
    local_addr: SocketAddr,
    backlog: i32,
    logger: Logger,
}

impl ListenerInner {
    fn release(&self) -> bool {
        let wake_addr = wake_address(self.local_addr);
        self.disposer.request_disposal(|socket| {
            if let Err(err) = socket.shutdown(Shutdown::Both) {
                tracing::trace!(target: targets::DISPOSE, error = %err, "listener shutdown failed");
                // Platforms that do not wake accept on shutdown get a
                // connection instead; the loop discards it.
                if self.bridge.is_started() {
                    let _ = TcpStream::connect_timeout(&wake_addr, WAKE_CONNECT_TIMEOUT);
                }
            }
        })
    }
}

impl Drop for ListenerInner {
    fn drop(&mut self) {
        self.logger.in_scope(|| {
            if self.release() {
                tracing::debug!(target: targets::LISTENER, addr = %self.local_addr, "released on drop");
            }
        });
        self.bridge.retire();
    }
}

/// A listening socket exposed as a lazy stream of accepted connections.
///
/// The first consumer attached through
/// [`accept_observable`](Self::accept_observable) or
/// [`accept_stream`](Self::accept_stream) starts one dedicated thread that
/// blocks in `accept` and publishes an [`RxSocket`] per connection, in
/// acceptance order. The stream never restarts: it ends with
///
/// - completion once [`dispose`](Self::dispose) has been requested,
/// - a fault if `accept` fails for any other reason.
///
/// Accepted endpoints belong to whoever receives them; disposing the
/// listener leaves them open.
///
/// # Example
///
/// ```ignore
/// use horizon_lattice_sockets::{Event, Listener};
///
/// let listener = Listener::bind("127.0.0.1:0", 10)?;
///
/// listener.accept_observable().subscribe(|event| {
///     if let Event::Next(conn) = event {
///         let echo = conn.clone();
///         conn.receive_observable().subscribe(move |event| {
///             if let Event::Next(chunk) = event {
///                 let _ = echo.send_all(&chunk);
///             }
///         });
///     }
/// });
///
/// println!("listening on {}", listener.local_addr());
/// ```
#[derive(Clone)]
pub struct Listener {
    inner: Arc<ListenerInner>,
}

impl Listener {
    /// Bind to the first address `addr` resolves to and start listening
    /// with the given backlog.
    ///
    /// Fails with [`SocketError::InvalidArgument`] for a negative backlog or
    /// an unresolvable address, and with [`SocketError::Bind`] when the
    /// address is in use or unavailable.
    pub fn bind(addr: impl ToSocketAddrs, backlog: i32) -> Result<Self> {
        let addr = resolve(addr)?;
        Self::with_config(ListenerConfig::new(addr).backlog(backlog))
    }

    /// Listen on `127.0.0.1` on an ephemeral port.
    pub fn loopback(backlog: i32) -> Result<Self> {
        Self::with_config(ListenerConfig::loopback().backlog(backlog))
    }

    /// Bind and listen according to `config`.
    pub fn with_config(config: ListenerConfig) -> Result<Self> {
        if config.backlog < 0 {
            return Err(SocketError::InvalidArgument(format!(
                "backlog must not be negative, got {}",
                config.backlog
            )));
        }

        let addr = config.bind_addr;
        let logger = config.logger.clone();
        let socket = open(&config).map_err(|err| {
            logger.in_scope(|| {
                tracing::warn!(target: targets::LISTENER, %addr, error = %err, "bind failed");
            });
            SocketError::bind(addr, err)
        })?;
        let local_addr = socket
            .local_addr()
            .ok()
            .and_then(|addr| addr.as_socket())
            .unwrap_or(addr);

        let socket = Arc::new(socket);
        let disposer = Arc::new(Disposer::new(Arc::clone(&socket)));

        let loop_disposer = Arc::clone(&disposer);
        let socket_config = config.socket.clone();
        let bridge = Bridge::new(
            config.thread_name.clone(),
            logger.clone(),
            Box::new(move |producer: Producer<RxSocket>| {
                accept_loop(socket, loop_disposer, socket_config, producer);
            }),
        );

        logger.in_scope(|| {
            tracing::debug!(target: targets::LISTENER, addr = %local_addr, backlog = config.backlog, "listening");
        });

        Ok(Self {
            inner: Arc::new(ListenerInner {
                disposer,
                bridge,
                local_addr,
                backlog: config.backlog,
                logger,
            }),
        })
    }

    /// The bound address; useful after binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// The backlog the listener was created with.
    pub fn backlog(&self) -> i32 {
        self.inner.backlog
    }

    /// Whether disposal has been requested.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposer.was_disposal_requested()
    }

    /// Push-based view of accepted connections.
    ///
    /// Attaching the first consumer starts the accept thread. After
    /// disposal, new consumers receive completion immediately.
    pub fn accept_observable(&self) -> Observable<RxSocket> {
        Observable::new(Arc::clone(&self.inner.bridge))
    }

    /// Pull-based view of accepted connections.
    pub fn accept_stream(&self) -> EventStream<RxSocket> {
        self.accept_observable().stream()
    }

    /// Stop accepting and close the listening socket.
    ///
    /// Unblocks a pending `accept`, then waits for the accept thread to
    /// deliver completion and exit. Idempotent and safe from any thread.
    pub fn dispose(&self) {
        let inner = &self.inner;
        let first = inner.logger.in_scope(|| inner.release());
        inner.bridge.retire();
        inner.bridge.wait_for_loop();
        if first {
            inner.logger.in_scope(|| {
                tracing::debug!(target: targets::LISTENER, addr = %inner.local_addr, "disposed");
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

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.inner.local_addr)
            .field("backlog", &self.inner.backlog)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

fn resolve(addr: impl ToSocketAddrs) -> Result<SocketAddr> {
    addr.to_socket_addrs()
        .map_err(|err| SocketError::InvalidArgument(format!("cannot resolve address: {err}")))?
        .next()
        .ok_or_else(|| SocketError::InvalidArgument("address resolved to nothing".into()))
}

fn open(config: &ListenerConfig) -> io::Result<Socket> {
    let addr = config.bind_addr;
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if config.reuse_address {
        socket.set_reuse_address(true)?;
    }
    socket.bind(&addr.into())?;
    socket.listen(config.backlog)?;
    Ok(socket)
}

/// The address a local client would dial to reach a listener bound to `addr`.
fn wake_address(addr: SocketAddr) -> SocketAddr {
    let mut wake = addr;
    if addr.ip().is_unspecified() {
        match addr {
            SocketAddr::V4(_) => wake.set_ip(Ipv4Addr::LOCALHOST.into()),
            SocketAddr::V6(_) => wake.set_ip(Ipv6Addr::LOCALHOST.into()),
        }
    }
    wake
}

fn accept_loop(
    socket: Arc<Socket>,
    disposer: Arc<Disposer<Arc<Socket>>>,
    socket_config: SocketConfig,
    producer: Producer<RxSocket>,
) {
    tracing::debug!(target: targets::LISTENER, "accept loop started");

    loop {
        // A loop started after disposal was requested may have missed the wake.
        if disposer.was_disposal_requested() {
            tracing::debug!(target: targets::LISTENER, "accept ended by disposal");
            producer.complete();
            return;
        }
        match socket.accept() {
            Ok((conn, peer)) => {
                if disposer.was_disposal_requested() {
                    drop(conn);
                    tracing::debug!(target: targets::LISTENER, "accept ended by disposal");
                    producer.complete();
                    return;
                }
                let endpoint = RxSocket::from_connected(conn, &socket_config);
                tracing::debug!(
                    target: targets::LISTENER,
                    id = %endpoint.id(),
                    peer = ?peer.as_socket(),
                    "accepted"
                );
                producer.publish(endpoint);
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                if disposer.was_disposal_requested() {
                    tracing::debug!(target: targets::LISTENER, error = %err, "accept ended by disposal");
                    producer.complete();
                } else {
                    tracing::warn!(target: targets::LISTENER, error = %err, "accept failed");
                    producer.fault(err.into());
                }
                return;
            }
        }
    }
}

//! Blocking sockets bridged to streams for Horizon Lattice.
//!
//! This crate wraps plain TCP sockets in objects whose inbound activity is
//! exposed as lazily started event streams:
//!
//! - **Listener**: accepted connections as a stream of [`RxSocket`]s
//! - **RxSocket**: received bytes as a stream of chunks, plus a synchronous send
//! - **Disposer**: exactly-once release shared by both
//!
//! Each stream is driven by one dedicated thread that blocks in `accept` or
//! `recv`. The thread starts when the first consumer attaches and delivers
//! exactly one terminal event: completion when the object was disposed or
//! the peer closed, a fault otherwise.
//!
//! # Server
//!
//! ```ignore
//! use horizon_lattice_sockets::{Event, Listener};
//!
//! let listener = Listener::bind("127.0.0.1:0", 10)?;
//!
//! listener.accept_observable().subscribe(|event| match event {
//!     Event::Next(conn) => {
//!         let _ = conn.send(b"Welcome!");
//!     }
//!     Event::Completed => println!("listener closed"),
//!     Event::Faulted(err) => eprintln!("accept failed: {err}"),
//! });
//!
//! // Later, from any thread
//! listener.dispose();
//! ```
//!
//! # Client
//!
//! Streams are also available pull-based through `futures_util::Stream`:
//!
//! ```ignore
//! use futures_util::StreamExt;
//! use horizon_lattice_sockets::{RxSocket, SocketConfig};
//!
//! let socket = RxSocket::connect(addr, &SocketConfig::default()).await?;
//! let mut chunks = socket.receive_stream();
//!
//! socket.send(b"ping")?;
//! while let Some(chunk) = chunks.next().await {
//!     println!("received {} bytes", chunk?.len());
//! }
//!
//! socket.dispose_async().await;
//! ```
//!
//! # Disposal
//!
//! `dispose` is idempotent and may be called from any thread, including a
//! stream callback. It returns once the resource is released and the loop
//! thread has delivered its terminal event (unless called from that loop
//! thread itself). Dropping the last handle releases the socket without
//! waiting.
//!
//! # Logging
//!
//! Nothing is logged unless a [`Logger`] is injected through
//! [`SocketConfig::logger`] or [`ListenerConfig::logger`]. Event targets are
//! listed in [`targets`].

mod bridge;
mod cancel;
mod config;
mod dispose;
mod error;
mod listener;
mod logging;
mod socket;
mod tracker;

pub use bridge::{Event, EventStream, Observable, SubscriptionId};
pub use cancel::CancellationToken;
pub use config::{DEFAULT_BACKLOG, DEFAULT_RECEIVE_BUFFER_SIZE, ListenerConfig, SocketConfig};
pub use dispose::Disposer;
pub use error::{Result, SocketError};
pub use listener::Listener;
pub use logging::{Logger, targets};
pub use socket::{ConnectionId, RxSocket};
pub use tracker::ConnectionTracker;

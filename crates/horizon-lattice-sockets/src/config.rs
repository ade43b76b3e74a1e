//! Configuration types for listeners and connections.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::logging::Logger;

/// Default size of a single receive buffer, and so the largest chunk.
pub const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 8192;

/// Default pending-connection backlog for listeners.
pub const DEFAULT_BACKLOG: i32 = 128;

/// Options applied to every connection, outbound or accepted.
#[derive(Clone, Debug)]
pub struct SocketConfig {
    /// Enable TCP_NODELAY (disable Nagle's algorithm).
    pub no_delay: bool,
    /// Keep-alive idle time. `None` leaves the OS default.
    pub keep_alive: Option<Duration>,
    /// Size of the buffer each blocking receive reads into.
    pub receive_buffer_size: usize,
    /// Outbound connect timeout. `None` waits for the OS.
    pub connect_timeout: Option<Duration>,
    /// Name given to the receive thread.
    pub thread_name: String,
    /// Where diagnostics go.
    pub logger: Logger,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            no_delay: false,
            keep_alive: None,
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
            connect_timeout: Some(Duration::from_secs(30)),
            thread_name: "horizon-socket-recv".to_string(),
            logger: Logger::disabled(),
        }
    }
}

impl SocketConfig {
    /// Create a new socket configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable TCP_NODELAY.
    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = enabled;
        self
    }

    /// Set the keep-alive idle time.
    pub fn keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive = Some(interval);
        self
    }

    /// Set the receive buffer size. Zero is raised to one byte.
    pub fn receive_buffer_size(mut self, size: usize) -> Self {
        self.receive_buffer_size = size.max(1);
        self
    }

    /// Set the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Disable the connect timeout.
    pub fn no_connect_timeout(mut self) -> Self {
        self.connect_timeout = None;
        self
    }

    /// Set the receive thread name.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Inject a logger.
    pub fn logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }
}

/// Configuration for a [`Listener`](crate::Listener).
#[derive(Clone, Debug)]
pub struct ListenerConfig {
    /// The address to bind to. Port 0 picks an ephemeral port.
    pub bind_addr: SocketAddr,
    /// Pending-connection backlog. Must not be negative.
    pub backlog: i32,
    /// Set SO_REUSEADDR before binding.
    pub reuse_address: bool,
    /// Options for accepted connections.
    pub socket: SocketConfig,
    /// Name given to the accept thread.
    pub thread_name: String,
    /// Where the listener's own diagnostics go.
    pub logger: Logger,
}

impl ListenerConfig {
    /// Create a listener configuration for `bind_addr`.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            backlog: DEFAULT_BACKLOG,
            reuse_address: false,
            socket: SocketConfig::default(),
            thread_name: "horizon-socket-accept".to_string(),
            logger: Logger::disabled(),
        }
    }

    /// Bind to `127.0.0.1` on an ephemeral port.
    pub fn loopback() -> Self {
        Self::new(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
    }

    /// Set the backlog size.
    pub fn backlog(mut self, size: i32) -> Self {
        self.backlog = size;
        self
    }

    /// Enable or disable SO_REUSEADDR.
    pub fn reuse_address(mut self, enabled: bool) -> Self {
        self.reuse_address = enabled;
        self
    }

    /// Set options for accepted connections.
    pub fn socket_config(mut self, config: SocketConfig) -> Self {
        self.socket = config;
        self
    }

    /// Enable TCP_NODELAY on accepted connections.
    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.socket.no_delay = enabled;
        self
    }

    /// Set the accept thread name.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Inject a logger for the listener and, unless already set, its
    /// accepted connections.
    pub fn logger(mut self, logger: Logger) -> Self {
        if !self.socket.logger.is_enabled() {
            self.socket.logger = logger.clone();
        }
        self.logger = logger;
        self
    }
}

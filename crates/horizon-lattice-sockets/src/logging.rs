//! Injected logging for listeners and connections.
//!
//! Every Horizon Lattice crate instruments through `tracing`. Socket
//! objects do not log to whatever dispatcher happens to be global: each
//! one is handed a [`Logger`] at construction and routes its events there.
//! A disabled logger is a valid configuration and only suppresses output.
//!
//! ```ignore
//! use horizon_lattice_sockets::{Listener, ListenerConfig, Logger};
//!
//! tracing_subscriber::fmt::init();
//!
//! let listener = Listener::with_config(
//!     ListenerConfig::loopback().logger(Logger::current()),
//! )?;
//! ```

use std::fmt;

use tracing::Dispatch;
use tracing::dispatcher::{self, DefaultGuard};

/// Target names for log filtering.
pub mod targets {
    /// Listener accept loop and disposal.
    pub const LISTENER: &str = "horizon_lattice_sockets::listener";
    /// Connection receive loop, send and disposal.
    pub const SOCKET: &str = "horizon_lattice_sockets::socket";
    /// Stream bridge subscriptions and terminal events.
    pub const BRIDGE: &str = "horizon_lattice_sockets::bridge";
    /// Exactly-once resource release.
    pub const DISPOSE: &str = "horizon_lattice_sockets::dispose";
}

/// A logger reference handed to a listener or connection.
///
/// Wraps a `tracing` [`Dispatch`]. Cloning is cheap.
#[derive(Clone)]
pub struct Logger {
    dispatch: Dispatch,
    enabled: bool,
}

impl Logger {
    /// A logger that discards everything.
    pub fn disabled() -> Self {
        Self {
            dispatch: Dispatch::none(),
            enabled: false,
        }
    }

    /// Capture the dispatcher that is current on the calling thread.
    ///
    /// With a global subscriber installed (e.g. `tracing_subscriber::fmt::init()`)
    /// this is that subscriber.
    pub fn current() -> Self {
        Self {
            dispatch: dispatcher::get_default(Dispatch::clone),
            enabled: true,
        }
    }

    /// Whether events reach a subscriber at all.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Run `f` with this logger as the thread's default dispatcher.
    pub fn in_scope<R>(&self, f: impl FnOnce() -> R) -> R {
        dispatcher::with_default(&self.dispatch, f)
    }

    /// Install this logger on the current thread until the guard is dropped.
    ///
    /// Loop threads hold the guard for their whole lifetime.
    pub(crate) fn enter(&self) -> DefaultGuard {
        dispatcher::set_default(&self.dispatch)
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::disabled()
    }
}

impl From<Dispatch> for Logger {
    fn from(dispatch: Dispatch) -> Self {
        Self {
            dispatch,
            enabled: true,
        }
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("enabled", &self.enabled)
            .finish()
    }
}

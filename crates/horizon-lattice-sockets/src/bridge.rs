//! Bridging a blocking producer thread into push and pull streams.
//!
//! A [`Bridge`] pairs one lazily started, dedicated producer thread with any
//! number of consumers. The producer keeps calling its blocking primitive
//! (`accept`, `recv`) and hands each result to [`Producer::publish`]; that
//! call never waits on a consumer. Callback subscribers run on the producer
//! thread, channel consumers buffer in an unbounded queue.
//!
//! Consumers attach through an [`Observable`]:
//!
//! - [`Observable::subscribe`] registers a callback receiving [`Event`]s.
//! - [`Observable::stream`] returns an [`EventStream`], a
//!   `futures_util::Stream` of `Result<T, SocketError>` that ends after the
//!   terminal event.
//!
//! Guarantees:
//!
//! - events arrive in the order they were published,
//! - exactly one terminal event (completion or fault) is ever delivered,
//!   after which nothing else is,
//! - delivery is live: a consumer sees events from its attach point on,
//!   and a consumer arriving after the end receives just the terminal event,
//! - the producer thread starts on the first attach and at most once.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::cell::Cell;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};

use futures_util::Stream;
use parking_lot::{Condvar, Mutex};
use slotmap::{SlotMap, new_key_type};
use tokio::sync::mpsc;

use crate::error::SocketError;
use crate::logging::{Logger, targets};

new_key_type! {
    /// Identifies a callback registered with [`Observable::subscribe`].
    pub struct SubscriptionId;
}

/// One notification delivered to a consumer.
#[derive(Debug, Clone)]
pub enum Event<T> {
    /// A produced item.
    Next(T),
    /// The producer finished normally. Terminal.
    Completed,
    /// The producer failed. Terminal.
    Faulted(SocketError),
}

impl<T> Event<T> {
    /// Whether this is a completion or fault.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Next(_))
    }
}

#[derive(Debug, Clone)]
enum Terminal {
    Completed,
    Faulted(SocketError),
}

impl Terminal {
    fn to_event<T>(&self) -> Event<T> {
        match self {
            Self::Completed => Event::Completed,
            Self::Faulted(err) => Event::Faulted(err.clone()),
        }
    }
}

type Callback<T> = Arc<dyn Fn(Event<T>) + Send + Sync>;

enum Sink<T> {
    Callback(Callback<T>),
    Channel(mpsc::UnboundedSender<Event<T>>),
}

impl<T> Clone for Sink<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Callback(cb) => Self::Callback(cb.clone()),
            Self::Channel(tx) => Self::Channel(tx.clone()),
        }
    }
}

impl<T> Sink<T> {
    /// Deliver an event; returns `false` if the consumer has gone away.
    fn deliver(&self, event: Event<T>) -> bool {
        match self {
            Self::Callback(cb) => {
                cb(event);
                true
            }
            Self::Channel(tx) => tx.send(event).is_ok(),
        }
    }
}

thread_local! {
    /// Set on every producer thread for its whole lifetime.
    static IN_PRODUCER: Cell<bool> = const { Cell::new(false) };
}

/// The body of a producer thread.
pub(crate) type LoopBody<T> = Box<dyn FnOnce(Producer<T>) + Send>;

struct BridgeState<T: Clone + Send + 'static> {
    sinks: SlotMap<SubscriptionId, Sink<T>>,
    terminal: Option<Terminal>,
    body: Option<LoopBody<T>>,
}

/// Shared state between the producer thread and its consumers.
pub(crate) struct Bridge<T: Clone + Send + 'static> {
    state: Mutex<BridgeState<T>>,
    thread_name: String,
    logger: Logger,
    started: AtomicBool,
    loop_thread: Mutex<Option<JoinHandle<()>>>,
    finished: Mutex<bool>,
    finished_condvar: Condvar,
}

impl<T: Clone + Send + 'static> Bridge<T> {
    /// Create a bridge whose producer `body` runs on a thread named
    /// `thread_name` once the first consumer attaches.
    pub(crate) fn new(
        thread_name: impl Into<String>,
        logger: Logger,
        body: LoopBody<T>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BridgeState {
                sinks: SlotMap::with_key(),
                terminal: None,
                body: Some(body),
            }),
            thread_name: thread_name.into(),
            logger,
            started: AtomicBool::new(false),
            loop_thread: Mutex::new(None),
            finished: Mutex::new(false),
            finished_condvar: Condvar::new(),
        })
    }

    fn attach(self: &Arc<Self>, sink: Sink<T>) -> SubscriptionId {
        let mut state = self.state.lock();
        if let Some(terminal) = state.terminal.clone() {
            drop(state);
            sink.deliver(terminal.to_event());
            return SubscriptionId::default();
        }
        let id = state.sinks.insert(sink);
        let body = state.body.take();
        drop(state);

        self.logger.in_scope(|| {
            tracing::trace!(target: targets::BRIDGE, thread = %self.thread_name, "consumer attached");
        });

        if let Some(body) = body {
            self.spawn_loop(body);
        }
        id
    }

    fn detach(&self, id: SubscriptionId) -> bool {
        self.state.lock().sinks.remove(id).is_some()
    }

    fn spawn_loop(self: &Arc<Self>, body: LoopBody<T>) {
        self.started.store(true, Ordering::Release);

        let bridge = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || {
                let _finished = FinishedGuard(&bridge);
                IN_PRODUCER.with(|flag| flag.set(true));
                let _log = bridge.logger.enter();
                body(Producer {
                    bridge: Arc::clone(&bridge),
                });
            });

        match spawned {
            Ok(handle) => *self.loop_thread.lock() = Some(handle),
            Err(err) => {
                self.logger.in_scope(|| {
                    tracing::warn!(target: targets::BRIDGE, error = %err, "failed to spawn producer thread");
                    self.terminate(Terminal::Faulted(err.into()));
                });
                self.mark_finished();
            }
        }
    }

    fn publish(&self, item: T) {
        let sinks: Vec<(SubscriptionId, Sink<T>)> = {
            let state = self.state.lock();
            if state.terminal.is_some() {
                return;
            }
            state.sinks.iter().map(|(id, s)| (id, s.clone())).collect()
        };

        let mut gone = Vec::new();
        for (id, sink) in sinks {
            if !sink.deliver(Event::Next(item.clone())) {
                gone.push(id);
            }
        }
        if !gone.is_empty() {
            let mut state = self.state.lock();
            for id in gone {
                state.sinks.remove(id);
            }
        }
    }

    /// Record and deliver the terminal event. Returns `false` if one was
    /// already delivered.
    fn terminate(&self, terminal: Terminal) -> bool {
        let sinks: Vec<Sink<T>> = {
            let mut state = self.state.lock();
            if state.terminal.is_some() {
                return false;
            }
            state.terminal = Some(terminal.clone());
            state.sinks.drain().map(|(_, s)| s).collect()
        };

        tracing::debug!(
            target: targets::BRIDGE,
            thread = %self.thread_name,
            consumers = sinks.len(),
            faulted = matches!(terminal, Terminal::Faulted(_)),
            "stream terminated"
        );
        for sink in sinks {
            sink.deliver(terminal.to_event());
        }
        true
    }

    /// End a bridge whose producer never started, dropping the unused body
    /// (and whatever it captured). No-op once the producer is running.
    pub(crate) fn retire(&self) -> bool {
        let body = {
            let mut state = self.state.lock();
            match state.body.take() {
                Some(body) => {
                    state.terminal = Some(Terminal::Completed);
                    body
                }
                None => return false,
            }
        };
        drop(body);
        self.mark_finished();
        true
    }

    /// Block until the producer thread has exited.
    ///
    /// Returns immediately if the producer never started or if called from
    /// any producer thread. Two loops waiting on each other from their
    /// callbacks would never finish.
    pub(crate) fn wait_for_loop(&self) {
        if !self.started.load(Ordering::Acquire) {
            return;
        }
        if IN_PRODUCER.with(Cell::get) {
            return;
        }
        {
            let mut finished = self.finished.lock();
            while !*finished {
                self.finished_condvar.wait(&mut finished);
            }
        }
        if let Some(handle) = self.loop_thread.lock().take() {
            let _ = handle.join();
        }
    }

    fn mark_finished(&self) {
        let mut finished = self.finished.lock();
        *finished = true;
        self.finished_condvar.notify_all();
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.state.lock().terminal.is_some()
    }

    fn subscriber_count(&self) -> usize {
        self.state.lock().sinks.len()
    }
}

struct FinishedGuard<'a, T: Clone + Send + 'static>(&'a Bridge<T>);

impl<T: Clone + Send + 'static> Drop for FinishedGuard<'_, T> {
    fn drop(&mut self) {
        self.0.mark_finished();
    }
}

/// The producer thread's handle to its bridge.
///
/// Dropping a producer without calling [`complete`](Self::complete) or
/// [`fault`](Self::fault), e.g. when the loop panics, delivers a fault so
/// consumers are never left waiting.
pub(crate) struct Producer<T: Clone + Send + 'static> {
    bridge: Arc<Bridge<T>>,
}

impl<T: Clone + Send + 'static> Producer<T> {
    pub(crate) fn publish(&self, item: T) {
        self.bridge.publish(item);
    }

    pub(crate) fn complete(self) {
        self.bridge.terminate(Terminal::Completed);
    }

    pub(crate) fn fault(self, err: SocketError) {
        self.bridge.terminate(Terminal::Faulted(err));
    }
}

impl<T: Clone + Send + 'static> Drop for Producer<T> {
    fn drop(&mut self) {
        let err = io::Error::other("producer exited without a terminal event");
        self.bridge.terminate(Terminal::Faulted(err.into()));
    }
}

/// Consumer-side handle to a bridged stream.
///
/// Cloning is cheap; all clones refer to the same producer.
pub struct Observable<T: Clone + Send + 'static> {
    bridge: Arc<Bridge<T>>,
}

impl<T: Clone + Send + 'static> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            bridge: Arc::clone(&self.bridge),
        }
    }
}

impl<T: Clone + Send + 'static> Observable<T> {
    pub(crate) fn new(bridge: Arc<Bridge<T>>) -> Self {
        Self { bridge }
    }

    /// Register a callback for every event from now on.
    ///
    /// Items and the terminal event are delivered on the producer thread.
    /// If the stream has already ended, the terminal event is delivered
    /// immediately on the calling thread and the returned id is inert.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(Event<T>) + Send + Sync + 'static,
    {
        self.bridge.attach(Sink::Callback(Arc::new(callback)))
    }

    /// Remove a callback. Returns `true` if it was still registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.bridge.detach(id)
    }

    /// Attach a pull-based consumer.
    pub fn stream(&self) -> EventStream<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.bridge.attach(Sink::Channel(tx));
        EventStream { rx, done: false }
    }

    /// Number of attached consumers.
    pub fn subscriber_count(&self) -> usize {
        self.bridge.subscriber_count()
    }

    /// Whether the terminal event has been delivered.
    pub fn is_terminated(&self) -> bool {
        self.bridge.is_terminated()
    }
}

impl<T: Clone + Send + 'static> fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observable")
            .field("thread", &self.bridge.thread_name)
            .field("started", &self.bridge.is_started())
            .field("terminated", &self.bridge.is_terminated())
            .finish()
    }
}

/// Pull-based view of a bridged stream.
///
/// Yields `Ok(item)` for each item, then either ends (completion) or yields
/// a single `Err` and ends (fault).
#[derive(Debug)]
pub struct EventStream<T> {
    rx: mpsc::UnboundedReceiver<Event<T>>,
    done: bool,
}

impl<T> Stream for EventStream<T> {
    type Item = Result<T, SocketError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(Event::Next(item))) => Poll::Ready(Some(Ok(item))),
            Poll::Ready(Some(Event::Faulted(err))) => {
                this.done = true;
                this.rx.close();
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(Some(Event::Completed)) | Poll::Ready(None) => {
                this.done = true;
                this.rx.close();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

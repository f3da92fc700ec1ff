use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, oneshot};
use tokio::task;

use super::event::Event;
use super::sink::{EventSink, StdOutSink};
use super::stream::EventStream;

/// Default broadcast buffer capacity for subscribers.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Receives events from the runtime and fans them out.
///
/// Producers (the runner, scheduler, and node contexts) push events through
/// the flume sender obtained from [`get_sender`]. A background listener task
/// forwards each event to every registered [`EventSink`] and to every
/// [`EventStream`] subscriber.
///
/// [`get_sender`]: Self::get_sender
pub struct EventBus {
    sinks: Arc<Mutex<Vec<Box<dyn EventSink>>>>,
    event_channel: (flume::Sender<Event>, flume::Receiver<Event>),
    broadcast: broadcast::Sender<Event>,
    listener: Arc<Mutex<Option<ListenerState>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_sink(StdOutSink::default())
    }
}

impl EventBus {
    /// Create an EventBus with the given subscriber buffer and no sinks.
    pub fn with_capacity(capacity: usize) -> Self {
        let (broadcast, _) = broadcast::channel(capacity.max(1));
        Self {
            sinks: Arc::new(Mutex::new(Vec::new())),
            event_channel: flume::unbounded(),
            broadcast,
            listener: Arc::new(Mutex::new(None)),
        }
    }

    /// Create an EventBus with a single sink.
    pub fn with_sink<T>(sink: T) -> Self
    where
        T: EventSink + 'static,
    {
        let bus = Self::with_capacity(DEFAULT_CAPACITY);
        bus.add_sink(sink);
        bus
    }

    /// Create an EventBus with multiple sinks.
    pub fn with_sinks(sinks: Vec<Box<dyn EventSink>>) -> Self {
        let bus = Self::with_capacity(DEFAULT_CAPACITY);
        for sink in sinks {
            bus.add_boxed_sink(sink);
        }
        bus
    }

    /// Dynamically add a sink (useful for per-request streaming).
    pub fn add_sink<T: EventSink + 'static>(&self, sink: T) {
        self.add_boxed_sink(Box::new(sink));
    }

    /// Add an already-boxed sink.
    pub fn add_boxed_sink(&self, sink: Box<dyn EventSink>) {
        self.sinks.lock().expect("sinks poisoned").push(sink);
    }

    /// Get a clone of the sender side so producers can emit events.
    pub fn get_sender(&self) -> flume::Sender<Event> {
        self.event_channel.0.clone()
    }

    /// Subscribe to the broadcast feed.
    ///
    /// Subscribers receive every event the listener forwards after the
    /// subscription was created.
    pub fn subscribe(&self) -> EventStream {
        EventStream::new(self.broadcast.subscribe())
    }

    /// Spawn a background task that listens for events and forwards them to
    /// all sinks and subscribers. Idempotent: calling multiple times has no
    /// effect.
    pub fn listen_for_events(&self) {
        let mut guard = self.listener.lock().expect("listener poisoned");
        if guard.is_some() {
            return;
        }

        let receiver = self.event_channel.1.clone();
        let sinks = self.sinks.clone();
        let broadcast = self.broadcast.clone();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let handle = task::spawn(async move {
            let forward = |event: Event| {
                // No subscribers is fine; sinks may still care.
                let _ = broadcast.send(event.clone());
                let mut sinks_guard = sinks.lock().expect("sinks poisoned");
                for sink in sinks_guard.iter_mut() {
                    if let Err(error) = sink.handle(&event) {
                        tracing::warn!(%error, "event sink error");
                    }
                }
            };
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        // Producers enqueued everything they had before the
                        // shutdown was requested; flush it before exiting.
                        while let Ok(event) = receiver.try_recv() {
                            forward(event);
                        }
                        break;
                    }
                    recv = receiver.recv_async() => match recv {
                        Err(_) => break,
                        Ok(event) => forward(event),
                    }
                }
            }
        });

        *guard = Some(ListenerState {
            shutdown_tx,
            handle,
        });
    }

    /// Stop the background listener task after flushing already queued events.
    pub async fn stop_listener(&self) {
        let state = {
            let mut guard = self.listener.lock().expect("listener poisoned");
            guard.take()
        };
        if let Some(state) = state {
            let _ = state.shutdown_tx.send(());
            let _ = state.handle.await;
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.listener.lock() {
            if let Some(state) = guard.take() {
                let _ = state.shutdown_tx.send(());
                state.handle.abort();
            }
        }
    }
}

struct ListenerState {
    shutdown_tx: oneshot::Sender<()>,
    handle: task::JoinHandle<()>,
}

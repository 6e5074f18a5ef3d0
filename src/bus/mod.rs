//! Event bus — persistent, scope-addressed pub/sub over the store.
//!
//! Every pushed event is durably stored first and then fanned out to live
//! subscriptions. Fan-out is best-effort and non-blocking: a slow or gone
//! subscriber loses the in-flight copy, never the event — `list` and `read`
//! recover anything a channel dropped. Read-receipts make consumption
//! idempotent per reader.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::store::{EventFilter, Store};
use crate::types::{ordered_id, scope_query_matches, Event, EventInput, ListOrder};

/// Default bound for subscription channels.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Options for [`EventBus::list`].
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Scope type to match; see the matching rules on
    /// [`scope_query_matches`].
    pub scope_type: String,

    /// Scope id to match; `"*"` means any.
    pub scope_id: String,

    /// When set, returned events carry the reader's receipt state in
    /// `.read`. Listing never creates receipts.
    pub reader: Option<String>,

    /// Maximum events returned.
    pub limit: Option<usize>,

    /// Ordering; newest-first by default.
    pub order: ListOrder,
}

struct Subscriber {
    id: u64,
    streams: HashSet<String>,
    /// Optional scope filter applied on top of the stream filter.
    scope: Option<(String, String)>,
    tx: mpsc::Sender<Event>,
}

#[derive(Default)]
struct Registry {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
}

/// A live event feed. Receives every event pushed after subscription whose
/// stream (and optional scope) matches. No history replay — pair with
/// [`EventBus::list`] to catch up. Dropping the subscription deregisters it.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Event>,
    registry: Arc<Registry>,
}

impl Subscription {
    /// Receive the next live event; `None` after the bus is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut subscribers = self
            .registry
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.retain(|s| s.id != self.id);
    }
}

/// In-process pub/sub layer over the persistent store.
pub struct EventBus {
    store: Arc<dyn Store>,
    registry: Arc<Registry>,
    channel_capacity: usize,
}

impl EventBus {
    /// Create a bus over the given store with the default channel capacity.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_capacity(store, DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a bus with an explicit per-subscription channel bound.
    pub fn with_capacity(store: Arc<dyn Store>, channel_capacity: usize) -> Self {
        assert!(channel_capacity > 0, "capacity must be greater than 0");
        Self {
            store,
            registry: Arc::new(Registry::default()),
            channel_capacity,
        }
    }

    /// Persist an event and fan it out to matching live subscriptions.
    ///
    /// The durable row is written first (with the store's write retry);
    /// channel delivery is best-effort and never blocks the pusher.
    pub async fn push(&self, input: EventInput) -> Result<Event> {
        if input.stream.is_empty() {
            return Err(Error::validation("event stream is required"));
        }

        let event = Event {
            id: ordered_id(),
            stream: input.stream,
            scope_type: input.scope_type,
            scope_id: input.scope_id,
            subject: input.subject,
            body: input.body,
            metadata: input.metadata,
            payload: input.payload,
            source_id: input.source_id,
            created_at: Utc::now(),
            read: false,
        };
        self.store.insert_event(&event).await?;

        debug!(
            event_id = %event.id,
            stream = %event.stream,
            scope_type = %event.scope_type,
            scope_id = %event.scope_id,
            "event pushed"
        );

        let subscribers = self
            .registry
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for subscriber in subscribers.iter() {
            if !subscriber.streams.contains(&event.stream) {
                continue;
            }
            if let Some((scope_type, scope_id)) = &subscriber.scope {
                if !scope_query_matches(scope_type, scope_id, &event) {
                    continue;
                }
            }
            if let Err(err) = subscriber.tx.try_send(event.clone()) {
                // Dropped copies are recoverable via list/read.
                warn!(
                    subscriber = subscriber.id,
                    event_id = %event.id,
                    error = %err,
                    "subscription channel full or closed, dropping live copy"
                );
            }
        }
        drop(subscribers);

        Ok(event)
    }

    /// Subscribe to live events on the given streams.
    pub fn subscribe(&self, streams: &[&str]) -> Subscription {
        self.register(streams, None)
    }

    /// Subscribe to live events on the given streams, additionally filtered
    /// by a scope query.
    pub fn subscribe_scoped(
        &self,
        streams: &[&str],
        scope_type: impl Into<String>,
        scope_id: impl Into<String>,
    ) -> Subscription {
        self.register(streams, Some((scope_type.into(), scope_id.into())))
    }

    fn register(&self, streams: &[&str], scope: Option<(String, String)>) -> Subscription {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        let subscriber = Subscriber {
            id,
            streams: streams.iter().map(|s| s.to_string()).collect(),
            scope,
            tx,
        };
        self.registry
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(subscriber);
        debug!(subscriber = id, streams = ?streams, "subscription registered");
        Subscription {
            id,
            rx,
            registry: Arc::clone(&self.registry),
        }
    }

    /// List stored events on a stream, scope-filtered and ordered.
    ///
    /// With a `reader`, each returned event's `.read` flag reports whether
    /// that reader already holds a receipt; no receipts are created.
    pub async fn list(&self, stream: &str, options: &ListOptions) -> Result<Vec<Event>> {
        let scope = if options.scope_type.is_empty() && options.scope_id.is_empty() {
            None
        } else {
            Some((options.scope_type.clone(), options.scope_id.clone()))
        };
        let mut events = self
            .store
            .list_events(&EventFilter {
                stream: stream.to_string(),
                scope,
                limit: options.limit,
                order: options.order,
            })
            .await?;

        if let Some(reader) = options.reader.as_deref() {
            if !reader.is_empty() {
                let ids: Vec<String> = events.iter().map(|e| e.id.clone()).collect();
                let seen = self.store.read_receipts(&ids, reader).await?;
                for event in &mut events {
                    event.read = seen.contains(&event.id);
                }
            }
        }
        Ok(events)
    }

    /// Load full events and atomically create read-receipts for the reader.
    ///
    /// The returned `.read` flags carry the *pre-existing* receipt state, so
    /// a consumer can tell first delivery from redelivery. An empty reader
    /// reads without receipting.
    pub async fn read(&self, stream: &str, ids: &[String], reader: &str) -> Result<Vec<Event>> {
        let mut events = self.store.get_events(stream, ids).await?;
        if reader.is_empty() {
            return Ok(events);
        }
        let found: Vec<String> = events.iter().map(|e| e.id.clone()).collect();
        let seen = self
            .store
            .claim_receipts(&found, reader, Utc::now())
            .await?;
        for event in &mut events {
            event.read = seen.contains(&event.id);
        }
        Ok(events)
    }

    /// Mark events read for the reader without loading them. Idempotent.
    pub async fn ack(&self, stream: &str, ids: &[String], reader: &str) -> Result<()> {
        if reader.is_empty() || ids.is_empty() {
            return Ok(());
        }
        // Receipt only ids that exist on the stream; unknown ids are ignored.
        let events = self.store.get_events(stream, ids).await?;
        let found: Vec<String> = events.iter().map(|e| e.id.clone()).collect();
        self.store.claim_receipts(&found, reader, Utc::now()).await?;
        debug!(stream, reader, count = found.len(), "events acked");
        Ok(())
    }

    /// Number of live subscriptions. Test observability.
    pub fn subscriber_count(&self) -> usize {
        self.registry
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

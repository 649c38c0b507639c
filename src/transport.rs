//! Live transport abstraction.
//!
//! The dispatcher only talks to a source through [`LiveTransport`]: open the
//! connection, subscribe to named topics, make request/reply calls and close.
//! [`crate::nats::NatsTransport`] is the production implementation;
//! [`MemoryTransport`] feeds events in-process.

use crate::config::SourceConfig;
use crate::error::TransportError;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// Events delivered for one subscribed topic. The stream ends when the
/// subscription or the connection ends.
pub type EventStream = BoxStream<'static, Result<JsonValue, TransportError>>;

/// A publish/subscribe connection to one source.
#[async_trait]
pub trait LiveTransport: Send + Sync {
    async fn open(&self) -> Result<(), TransportError>;

    /// Subscribe to a topic. Requires an open transport.
    async fn on(&self, topic: &str) -> Result<EventStream, TransportError>;

    /// Request/reply call, e.g. a login handshake.
    async fn call(&self, method: &str, args: JsonValue) -> Result<JsonValue, TransportError>;

    /// Close the connection; open event streams end.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Builds a fresh transport for every connection attempt.
pub trait TransportFactory: Send + Sync {
    fn create(&self, source: &SourceConfig) -> Arc<dyn LiveTransport>;
}

impl<F> TransportFactory for F
where
    F: Fn(&SourceConfig) -> Arc<dyn LiveTransport> + Send + Sync,
{
    fn create(&self, source: &SourceConfig) -> Arc<dyn LiveTransport> {
        self(source)
    }
}

type Subscriber = mpsc::UnboundedSender<Result<JsonValue, TransportError>>;

#[derive(Default)]
struct MemoryState {
    open: bool,
    opens: usize,
    closes: usize,
    subscribers: HashMap<String, Vec<Subscriber>>,
    replies: HashMap<String, JsonValue>,
    failing: HashSet<String>,
    calls: Vec<(String, JsonValue)>,
}

/// In-process transport: events are pushed with [`MemoryTransport::emit`].
#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver an event to every live subscriber of `topic`.
    ///
    /// # Returns
    /// Number of subscribers that received it
    pub fn emit(&self, topic: &str, event: JsonValue) -> usize {
        let mut state = self.lock();
        let Some(subscribers) = state.subscribers.get_mut(topic) else {
            return 0;
        };
        subscribers.retain(|tx| tx.send(Ok(event.clone())).is_ok());
        subscribers.len()
    }

    /// Deliver a transport-level error on `topic`.
    pub fn emit_error(&self, topic: &str, error: TransportError) {
        if let Some(subscribers) = self.lock().subscribers.get(topic) {
            for tx in subscribers {
                let _ = tx.send(Err(error.clone()));
            }
        }
    }

    /// Set the reply returned by `call(method, ..)`.
    pub fn reply_to(&self, method: &str, reply: JsonValue) {
        self.lock().replies.insert(method.to_string(), reply);
    }

    /// Make every `call(method, ..)` fail.
    pub fn fail_method(&self, method: &str) {
        self.lock().failing.insert(method.to_string());
    }

    /// End every event stream without closing the transport.
    pub fn end_streams(&self) {
        self.lock().subscribers.clear();
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    pub fn open_count(&self) -> usize {
        self.lock().opens
    }

    pub fn close_count(&self) -> usize {
        self.lock().closes
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.lock().subscribers.get(topic).map_or(0, Vec::len)
    }

    /// Calls made so far, in order.
    pub fn calls(&self) -> Vec<(String, JsonValue)> {
        self.lock().calls.clone()
    }
}

#[async_trait]
impl LiveTransport for MemoryTransport {
    async fn open(&self) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.open = true;
        state.opens += 1;
        Ok(())
    }

    async fn on(&self, topic: &str) -> Result<EventStream, TransportError> {
        let mut state = self.lock();
        if !state.open {
            return Err(TransportError::NotOpen);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.subscribers.entry(topic.to_string()).or_default().push(tx);

        let events = stream::unfold(rx, |mut rx| async move {
            let event = rx.recv().await?;
            Some((event, rx))
        });
        Ok(events.boxed())
    }

    async fn call(&self, method: &str, args: JsonValue) -> Result<JsonValue, TransportError> {
        let mut state = self.lock();
        if !state.open {
            return Err(TransportError::NotOpen);
        }
        state.calls.push((method.to_string(), args));

        if state.failing.contains(method) {
            return Err(TransportError::Call {
                method: method.to_string(),
                reason: "rejected".to_string(),
            });
        }
        Ok(state.replies.get(method).cloned().unwrap_or(JsonValue::Null))
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.open = false;
        state.closes += 1;
        state.subscribers.clear();
        Ok(())
    }
}

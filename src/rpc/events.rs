//! Session event queue.
//!
//! Platform callbacks (sensor updates, timers, broadcasts) never touch
//! receiver state directly. They post an [`Event`] here, and RPC-facing
//! methods read from the queue. The buffer is bounded; the oldest events are
//! discarded once it is full.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

pub const DEFAULT_CAPACITY: usize = 1024;

/// A named event with arbitrary data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    pub data: Value,
    /// Microseconds since the Unix epoch.
    pub time: i64,
}

impl Event {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
            time: Utc::now().timestamp_micros(),
        }
    }
}

struct Inner {
    buffer: Mutex<VecDeque<Event>>,
    capacity: usize,
    posted: broadcast::Sender<Event>,
}

/// Bounded FIFO of events, shared by every receiver of a session.
#[derive(Clone)]
pub struct EventQueue {
    inner: Arc<Inner>,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        let (posted, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                buffer: Mutex::new(VecDeque::new()),
                capacity: capacity.max(1),
                posted,
            }),
        }
    }

    /// Post an event. Never blocks; safe to call from any thread.
    pub fn post(&self, name: impl Into<String>, data: Value) {
        self.push(Event::new(name, data));
    }

    pub fn push(&self, event: Event) {
        {
            let mut buffer = self.lock();
            while buffer.len() >= self.inner.capacity {
                buffer.pop_front();
            }
            buffer.push_back(event.clone());
        }
        self.dispatch(event);
    }

    /// Notify live subscribers and waiters without queueing the event.
    pub fn dispatch(&self, event: Event) {
        // No subscribers is fine.
        let _ = self.inner.posted.send(event);
    }

    /// Remove and return up to `n` of the oldest events.
    pub fn poll(&self, n: usize) -> Vec<Event> {
        let mut buffer = self.lock();
        let n = n.min(buffer.len());
        buffer.drain(..n).collect()
    }

    /// Remove and return the oldest queued event, or wait for the next posted
    /// one, queued or dispatched. Returns `None` on timeout.
    pub async fn wait_any(&self, timeout: Option<Duration>) -> Option<Event> {
        let wait = async {
            let mut posted = self.inner.posted.subscribe();
            let queued = self.lock().pop_front();
            if queued.is_some() {
                return queued;
            }
            loop {
                match posted.recv().await {
                    Ok(event) => {
                        self.remove(&event);
                        return Some(event);
                    }
                    Err(RecvError::Lagged(_)) => {
                        let queued = self.lock().pop_front();
                        if queued.is_some() {
                            return queued;
                        }
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        };
        with_timeout(timeout, wait).await
    }

    /// Wait for an event named `name`. The event stays in the queue.
    /// Returns `None` on timeout.
    pub async fn wait_for(&self, name: &str, timeout: Option<Duration>) -> Option<Event> {
        let wait = async {
            let mut posted = self.inner.posted.subscribe();
            let queued = self.find(name);
            if queued.is_some() {
                return queued;
            }
            loop {
                match posted.recv().await {
                    Ok(event) if event.name == name => return Some(event),
                    Ok(_) => continue,
                    Err(RecvError::Lagged(_)) => {
                        let queued = self.find(name);
                        if queued.is_some() {
                            return queued;
                        }
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        };
        with_timeout(timeout, wait).await
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Live stream of posted events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.posted.subscribe()
    }

    fn remove(&self, event: &Event) {
        let mut buffer = self.lock();
        if let Some(index) = buffer.iter().position(|queued| queued == event) {
            buffer.remove(index);
        }
    }

    fn find(&self, name: &str) -> Option<Event> {
        self.lock().iter().find(|event| event.name == name).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Event>> {
        self.inner
            .buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

async fn with_timeout<F>(timeout: Option<Duration>, wait: F) -> Option<Event>
where
    F: Future<Output = Option<Event>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, wait).await.ok().flatten(),
        None => wait.await,
    }
}

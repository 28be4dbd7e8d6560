//! Keyed multi-waiter notification primitive.
//!
//! Every background supervisor publishes through one shared list; request
//! handlers park here instead of polling. `resolve` hands its value to every
//! waiter currently registered under the topic and to nobody registered
//! afterwards.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WaitError {
    #[error("wait timed out")]
    Timeout,
    #[error("wait cancelled")]
    Cancelled,
    #[error("wait list closed: {0}")]
    Closed(String),
}

struct Slot<T> {
    id: Uuid,
    tx: oneshot::Sender<Result<T, WaitError>>,
}

struct Inner<T> {
    closed: Option<String>,
    topics: HashMap<String, Vec<Slot<T>>>,
}

pub struct WaitList<T> {
    inner: Mutex<Inner<T>>,
}

/// One registered wait. Consumed by `wait()`; cancellation from elsewhere
/// goes through the cloneable [`WaiterHandle`].
pub struct Waiter<T> {
    topic: String,
    id: Uuid,
    timeout: Option<Duration>,
    rx: oneshot::Receiver<Result<T, WaitError>>,
    list: Arc<WaitList<T>>,
}

pub struct WaiterHandle<T> {
    topic: String,
    id: Uuid,
    list: Arc<WaitList<T>>,
}

impl<T> Clone for WaiterHandle<T> {
    fn clone(&self) -> Self {
        Self {
            topic: self.topic.clone(),
            id: self.id,
            list: Arc::clone(&self.list),
        }
    }
}

impl<T: Clone + Send + 'static> WaitList<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                closed: None,
                topics: HashMap::new(),
            }),
        })
    }

    /// Register a waiter under `topic`. Fails immediately once the list is
    /// closed.
    pub async fn wait_for(
        self: &Arc<Self>,
        topic: &str,
        timeout: Option<Duration>,
    ) -> Result<Waiter<T>, WaitError> {
        let (tx, rx) = oneshot::channel();
        let id = Uuid::new_v4();
        {
            let mut inner = self.inner.lock().await;
            if let Some(reason) = &inner.closed {
                return Err(WaitError::Closed(reason.clone()));
            }
            inner
                .topics
                .entry(topic.to_string())
                .or_default()
                .push(Slot { id, tx });
        }
        Ok(Waiter {
            topic: topic.to_string(),
            id,
            timeout,
            rx,
            list: Arc::clone(self),
        })
    }

    /// Hand `value` to every waiter currently registered under `topic` and
    /// remove them all. Waiters registered after this call never observe the
    /// value. Returns the number of waiters woken.
    pub async fn resolve(&self, topic: &str, value: T) -> usize {
        let slots = {
            let mut inner = self.inner.lock().await;
            inner.topics.remove(topic).unwrap_or_default()
        };
        let woken = slots.len();
        for slot in slots {
            let _ = slot.tx.send(Ok(value.clone()));
        }
        woken
    }

    /// Fail every outstanding waiter on every topic with `reason` and reject
    /// all future registrations.
    pub async fn close(&self, reason: &str) {
        let drained = {
            let mut inner = self.inner.lock().await;
            inner.closed = Some(reason.to_string());
            std::mem::take(&mut inner.topics)
        };
        for (_, slots) in drained {
            for slot in slots {
                let _ = slot.tx.send(Err(WaitError::Closed(reason.to_string())));
            }
        }
    }

    /// Remove one waiter and fail it with `Cancelled`. Safe to call after the
    /// waiter already settled (no-op then). Returns whether a waiter was
    /// removed.
    async fn cancel_slot(&self, topic: &str, id: Uuid) -> bool {
        let slot = self.take_slot(topic, id).await;
        match slot {
            Some(slot) => {
                let _ = slot.tx.send(Err(WaitError::Cancelled));
                true
            }
            None => false,
        }
    }

    async fn take_slot(&self, topic: &str, id: Uuid) -> Option<Slot<T>> {
        let mut inner = self.inner.lock().await;
        let slots = inner.topics.get_mut(topic)?;
        let position = slots.iter().position(|slot| slot.id == id)?;
        let slot = slots.remove(position);
        if slots.is_empty() {
            inner.topics.remove(topic);
        }
        Some(slot)
    }

    #[cfg(test)]
    async fn waiter_count(&self, topic: &str) -> usize {
        let inner = self.inner.lock().await;
        inner.topics.get(topic).map(Vec::len).unwrap_or(0)
    }
}

impl<T: Clone + Send + 'static> Waiter<T> {
    pub fn handle(&self) -> WaiterHandle<T> {
        WaiterHandle {
            topic: self.topic.clone(),
            id: self.id,
            list: Arc::clone(&self.list),
        }
    }

    /// Suspend until the topic resolves, the deadline elapses, the waiter is
    /// cancelled, or the list closes.
    pub async fn wait(mut self) -> Result<T, WaitError> {
        match self.timeout {
            Some(deadline) => {
                let outcome = tokio::time::timeout(deadline, &mut self.rx).await;
                match outcome {
                    Ok(settled) => settled.unwrap_or(Err(WaitError::Cancelled)),
                    Err(_) => {
                        self.list.take_slot(&self.topic, self.id).await;
                        // A resolve racing the deadline may have settled the
                        // slot already; prefer its value over the timeout.
                        match self.rx.try_recv() {
                            Ok(settled) => settled,
                            Err(_) => Err(WaitError::Timeout),
                        }
                    }
                }
            }
            None => self.rx.await.unwrap_or(Err(WaitError::Cancelled)),
        }
    }
}

impl<T: Clone + Send + 'static> WaiterHandle<T> {
    /// Cancel the waiter. No-op when it already settled.
    pub async fn cancel(&self) -> bool {
        self.list.cancel_slot(&self.topic, self.id).await
    }
}

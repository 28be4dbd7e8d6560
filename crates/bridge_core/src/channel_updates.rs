//! Per-channel update loops.
//!
//! One loop per channel turns the engine's blocking wait into a dirty flag
//! plus a broadcast on the channel's topic. The registry guarantees at most
//! one loop per channel; a loop that hits a hard engine error removes itself
//! and stays down until the channel is watched again.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use shared::domain::ChannelId;

use crate::badge::BadgeAggregator;
use crate::engine::ChannelHandle;
use crate::wait_list::{WaitError, WaitList};

pub fn update_topic(channel_id: &ChannelId) -> String {
    format!("update:{channel_id}")
}

struct WatchState {
    loops: HashMap<ChannelId, JoinHandle<()>>,
    dirty: HashSet<ChannelId>,
}

pub struct ChannelUpdateSupervisor {
    wait_list: Arc<WaitList<bool>>,
    badge: Arc<BadgeAggregator>,
    poll_timeout: Duration,
    inner: Mutex<WatchState>,
}

impl ChannelUpdateSupervisor {
    pub fn new(
        wait_list: Arc<WaitList<bool>>,
        badge: Arc<BadgeAggregator>,
        poll_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            wait_list,
            badge,
            poll_timeout,
            inner: Mutex::new(WatchState {
                loops: HashMap::new(),
                dirty: HashSet::new(),
            }),
        })
    }

    /// Start the update loop for `channel`. Idempotent: a second call while a
    /// loop is registered returns immediately.
    pub async fn watch(self: &Arc<Self>, channel: Arc<dyn ChannelHandle>) {
        let channel_id = channel.id();
        let mut state = self.inner.lock().await;
        if state.loops.contains_key(&channel_id) {
            return;
        }
        debug!(channel_id = %channel_id, "updates: starting channel loop");
        let supervisor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            supervisor.run(channel).await;
        });
        state.loops.insert(channel_id, handle);
    }

    async fn run(self: Arc<Self>, channel: Arc<dyn ChannelHandle>) {
        let channel_id = channel.id();
        let topic = update_topic(&channel_id);
        loop {
            match channel.wait_for_incoming(self.poll_timeout).await {
                Ok(true) => {
                    {
                        let mut state = self.inner.lock().await;
                        state.dirty.insert(channel_id.clone());
                    }
                    self.badge.recompute().await;
                    let woken = self.wait_list.resolve(&topic, true).await;
                    debug!(channel_id = %channel_id, woken, "updates: delivery");
                }
                Ok(false) => {
                    // Idle poll window; re-issue the wait.
                }
                Err(err) => {
                    warn!(
                        channel_id = %channel_id,
                        error = %err,
                        "updates: channel wait failed; stopping loop"
                    );
                    {
                        let mut state = self.inner.lock().await;
                        state.loops.remove(&channel_id);
                    }
                    self.wait_list.resolve(&topic, false).await;
                    return;
                }
            }
        }
    }

    /// Consumer path. A set dirty flag is consumed without suspension;
    /// otherwise the caller parks on the channel topic with its own timeout.
    /// Yields `true` on delivery and `false` when the loop terminated.
    pub async fn wait_for_incoming_message(
        self: &Arc<Self>,
        channel_id: &ChannelId,
        timeout: Option<Duration>,
    ) -> Result<bool, WaitError> {
        {
            let mut state = self.inner.lock().await;
            if state.dirty.remove(channel_id) {
                return Ok(true);
            }
        }
        let waiter = self
            .wait_list
            .wait_for(&update_topic(channel_id), timeout)
            .await?;
        waiter.wait().await
    }

    /// Tear down the loop for a removed channel: abort it, drop its dirty
    /// state, and release current waiters with `false`.
    pub async fn unwatch(&self, channel_id: &ChannelId) {
        let handle = {
            let mut state = self.inner.lock().await;
            state.dirty.remove(channel_id);
            state.loops.remove(channel_id)
        };
        if let Some(handle) = handle {
            handle.abort();
            debug!(channel_id = %channel_id, "updates: channel loop stopped");
        }
        self.wait_list.resolve(&update_topic(channel_id), false).await;
    }

    pub async fn is_watching(&self, channel_id: &ChannelId) -> bool {
        self.inner.lock().await.loops.contains_key(channel_id)
    }

    #[cfg(test)]
    pub(crate) async fn loop_count(&self) -> usize {
        self.inner.lock().await.loops.len()
    }

    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut state = self.inner.lock().await;
            state.dirty.clear();
            state.loops.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/channel_updates_tests.rs"]
mod tests;

//! Global chain-map update loop.
//!
//! Same shape as the per-channel loops but singular: one dirty flag, one
//! topic. A hard engine error here means the protocol object itself is
//! defunct, so the loop stops for the lifetime of the process instead of
//! restarting.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::engine::ProtocolEngine;
use crate::wait_list::{WaitError, WaitList};

pub const CHAIN_TOPIC: &str = "chain-map-update";

struct ChainState {
    task: Option<JoinHandle<()>>,
    dirty: bool,
}

pub struct ChainUpdateSupervisor {
    engine: Arc<dyn ProtocolEngine>,
    wait_list: Arc<WaitList<bool>>,
    poll_timeout: Duration,
    inner: Mutex<ChainState>,
}

impl ChainUpdateSupervisor {
    pub fn new(
        engine: Arc<dyn ProtocolEngine>,
        wait_list: Arc<WaitList<bool>>,
        poll_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine,
            wait_list,
            poll_timeout,
            inner: Mutex::new(ChainState {
                task: None,
                dirty: false,
            }),
        })
    }

    /// Start the global loop. Idempotent; the task slot is never cleared on
    /// failure, so a dead loop stays dead until the process restarts.
    pub async fn start(self: &Arc<Self>) {
        let mut state = self.inner.lock().await;
        if state.task.is_some() {
            return;
        }
        debug!("chain: starting update loop");
        let supervisor = Arc::clone(self);
        state.task = Some(tokio::spawn(async move {
            supervisor.run().await;
        }));
    }

    async fn run(self: Arc<Self>) {
        loop {
            match self.engine.wait_for_chain_update(self.poll_timeout).await {
                Ok(true) => {
                    {
                        let mut state = self.inner.lock().await;
                        state.dirty = true;
                    }
                    let woken = self.wait_list.resolve(CHAIN_TOPIC, true).await;
                    debug!(woken, "chain: map updated");
                }
                Ok(false) => {}
                Err(err) => {
                    error!(error = %err, "chain: update wait failed; loop stopped permanently");
                    self.wait_list.resolve(CHAIN_TOPIC, false).await;
                    return;
                }
            }
        }
    }

    /// Consumer path, same contract as the per-channel variant.
    pub async fn wait_for_update(
        self: &Arc<Self>,
        timeout: Option<Duration>,
    ) -> Result<bool, WaitError> {
        {
            let mut state = self.inner.lock().await;
            if state.dirty {
                state.dirty = false;
                return Ok(true);
            }
        }
        let waiter = self.wait_list.wait_for(CHAIN_TOPIC, timeout).await?;
        waiter.wait().await
    }

    pub async fn shutdown(&self) {
        let task = {
            let mut state = self.inner.lock().await;
            state.dirty = false;
            state.task.take()
        };
        if let Some(task) = task {
            task.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/chain_updates_tests.rs"]
mod tests;

//! Coordination layer between a front-end process and the long-running
//! domain objects of a channel messenger: the identity/channel protocol
//! engine, the peer swarm, and persistent storage.
//!
//! The front end issues named, sequenced requests over a channel pair and
//! gets exactly one correlated response per request; background update loops
//! publish through a shared [`wait_list::WaitList`] so "wait for the next
//! event" requests park instead of polling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

use shared::error::{ErrorCode, ResponseError};

pub mod badge;
pub mod chain_updates;
pub mod channel_updates;
pub mod config;
pub mod engine;
pub mod invites;
mod router;
pub mod serialize;
pub mod wait_list;

use badge::BadgeAggregator;
use chain_updates::ChainUpdateSupervisor;
use channel_updates::ChannelUpdateSupervisor;
use config::BridgeSettings;
use engine::{BadgeSink, MetadataStore, ProtocolEngine, Swarm};
use invites::InviteCoordinator;
use wait_list::{WaitError, WaitList};

pub use config::load_settings;

#[cfg(test)]
#[path = "tests/harness.rs"]
pub(crate) mod test_harness;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("engine is not ready; call init first")]
    NotReady,
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),
    #[error("wait timed out")]
    Timeout,
    #[error("wait cancelled")]
    Cancelled,
    #[error("{0}")]
    Fatal(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl BridgeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            BridgeError::NotReady => ErrorCode::NotReady,
            BridgeError::NotFound(_) => ErrorCode::NotFound,
            BridgeError::InvalidEncoding(_) => ErrorCode::InvalidEncoding,
            BridgeError::Timeout => ErrorCode::Timeout,
            BridgeError::Cancelled => ErrorCode::Cancelled,
            BridgeError::Fatal(_) => ErrorCode::Fatal,
            BridgeError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Wire projection. The full error chain rides along in debug builds
    /// only.
    pub fn to_response(&self) -> ResponseError {
        let response = ResponseError::new(self.code(), self.to_string());
        if cfg!(debug_assertions) {
            if let BridgeError::Internal(inner) = self {
                return response.with_detail(format!("{inner:?}"));
            }
        }
        response
    }
}

impl From<WaitError> for BridgeError {
    fn from(err: WaitError) -> Self {
        match err {
            WaitError::Timeout => BridgeError::Timeout,
            // A closed list means teardown; the wait was aborted from the
            // caller's point of view.
            WaitError::Cancelled | WaitError::Closed(_) => BridgeError::Cancelled,
        }
    }
}

pub struct Bridge {
    pub(crate) engine: Arc<dyn ProtocolEngine>,
    pub(crate) swarm: Arc<dyn Swarm>,
    pub(crate) storage: Arc<dyn MetadataStore>,
    pub(crate) badge: Arc<BadgeAggregator>,
    pub(crate) wait_list: Arc<WaitList<bool>>,
    pub(crate) channel_updates: Arc<ChannelUpdateSupervisor>,
    pub(crate) chain_updates: Arc<ChainUpdateSupervisor>,
    pub(crate) invites: Arc<InviteCoordinator>,
    pub(crate) settings: BridgeSettings,
    ready: AtomicBool,
}

impl Bridge {
    pub fn new(
        engine: Arc<dyn ProtocolEngine>,
        swarm: Arc<dyn Swarm>,
        storage: Arc<dyn MetadataStore>,
        badge_sink: Arc<dyn BadgeSink>,
    ) -> Arc<Self> {
        Self::new_with_settings(engine, swarm, storage, badge_sink, BridgeSettings::default())
    }

    pub fn new_with_settings(
        engine: Arc<dyn ProtocolEngine>,
        swarm: Arc<dyn Swarm>,
        storage: Arc<dyn MetadataStore>,
        badge_sink: Arc<dyn BadgeSink>,
        settings: BridgeSettings,
    ) -> Arc<Self> {
        let wait_list: Arc<WaitList<bool>> = WaitList::new();
        let badge = BadgeAggregator::new(Arc::clone(&engine), badge_sink);
        let channel_updates = ChannelUpdateSupervisor::new(
            Arc::clone(&wait_list),
            Arc::clone(&badge),
            settings.channel_poll_timeout,
        );
        let chain_updates = ChainUpdateSupervisor::new(
            Arc::clone(&engine),
            Arc::clone(&wait_list),
            settings.chain_poll_timeout,
        );
        let invites = InviteCoordinator::new(
            Arc::clone(&engine),
            Arc::clone(&swarm),
            Arc::clone(&badge),
            Arc::clone(&channel_updates),
        );
        Arc::new(Self {
            engine,
            swarm,
            storage,
            badge,
            wait_list,
            channel_updates,
            chain_updates,
            invites,
            settings,
            ready: AtomicBool::new(false),
        })
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub(crate) fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    /// Abort every background loop and outstanding wait, then close storage.
    /// No caller may stay parked past this point.
    pub async fn shutdown(&self) {
        tracing::info!("bridge: shutting down");
        self.ready.store(false, Ordering::SeqCst);
        self.channel_updates.shutdown().await;
        self.chain_updates.shutdown().await;
        self.invites.clear().await;
        self.wait_list.close("bridge shutting down").await;
        if let Err(err) = self.storage.close().await {
            tracing::warn!(error = %err, "bridge: storage close failed");
        }
    }
}

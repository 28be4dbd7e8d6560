//! Invite issuance and acceptance tracking, one pending entry per identity.
//!
//! A joining identity requests an invite once, hands the encoded request to a
//! channel member out of band, then waits for the swarm to deliver the
//! accepted invite back. Only the most recent wait per identity matters;
//! starting a new one preempts the previous waiter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use futures::future::{abortable, AbortHandle, Aborted};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use shared::domain::IdentityKey;
use shared::protocol::ChannelRecord;

use crate::badge::BadgeAggregator;
use crate::channel_updates::ChannelUpdateSupervisor;
use crate::engine::{ChannelHandle, Invite, ProtocolEngine, Swarm};
use crate::{serialize, BridgeError};

struct PendingInvite {
    request_id: Vec<u8>,
    encoded_request: String,
    /// The single outstanding waiter, if any, keyed so a settled wait never
    /// clears a successor's handle.
    waiter: Option<(Uuid, AbortHandle)>,
}

pub struct InviteCoordinator {
    engine: Arc<dyn ProtocolEngine>,
    swarm: Arc<dyn Swarm>,
    badge: Arc<BadgeAggregator>,
    channel_updates: Arc<ChannelUpdateSupervisor>,
    pending: Mutex<HashMap<IdentityKey, PendingInvite>>,
}

impl InviteCoordinator {
    pub fn new(
        engine: Arc<dyn ProtocolEngine>,
        swarm: Arc<dyn Swarm>,
        badge: Arc<BadgeAggregator>,
        channel_updates: Arc<ChannelUpdateSupervisor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine,
            swarm,
            badge,
            channel_updates,
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Issue an invite request for `identity_key`, or return the cached
    /// encoded request when one is already outstanding.
    pub async fn request(&self, identity_key: &IdentityKey) -> Result<String, BridgeError> {
        let mut pending = self.pending.lock().await;
        if let Some(entry) = pending.get(identity_key) {
            return Ok(entry.encoded_request.clone());
        }
        let identity = self
            .engine
            .identity(identity_key)
            .await
            .ok_or_else(|| BridgeError::NotFound(format!("identity {identity_key}")))?;
        let request = identity.create_invite_request().await?;
        let encoded_request = serialize::encode_blob(&request.request);
        info!(identity_key = %identity_key, "invites: request issued");
        pending.insert(
            identity_key.clone(),
            PendingInvite {
                request_id: request.request_id,
                encoded_request: encoded_request.clone(),
                waiter: None,
            },
        );
        Ok(encoded_request)
    }

    /// Wait for the outstanding request of `identity_key` to be accepted.
    ///
    /// Preempts any waiter already parked on the same request. Cancellation,
    /// timeout, and swarm/engine failures all yield `Ok(None)` with the
    /// `requested` state intact so the caller may simply wait again.
    pub async fn wait(
        &self,
        identity_key: &IdentityKey,
        timeout: Option<Duration>,
    ) -> Result<Option<ChannelRecord>, BridgeError> {
        let request_id = {
            let mut pending = self.pending.lock().await;
            let entry = pending.get_mut(identity_key).ok_or_else(|| {
                BridgeError::NotFound(format!("no pending invite for identity {identity_key}"))
            })?;
            if let Some((_, previous)) = entry.waiter.take() {
                debug!(identity_key = %identity_key, "invites: preempting previous waiter");
                previous.abort();
            }
            entry.request_id.clone()
        };

        let identity = self
            .engine
            .identity(identity_key)
            .await
            .ok_or_else(|| BridgeError::NotFound(format!("identity {identity_key}")))?;

        let waiter_id = Uuid::new_v4();
        let (accept, abort_handle) = abortable(self.swarm.wait_for_invite(&request_id));
        {
            let mut pending = self.pending.lock().await;
            match pending.get_mut(identity_key) {
                // The identity was removed while we were setting up.
                None => {
                    abort_handle.abort();
                    return Ok(None);
                }
                Some(entry) => entry.waiter = Some((waiter_id, abort_handle)),
            }
        }

        let outcome = match timeout {
            Some(deadline) => match tokio::time::timeout(deadline, accept).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    debug!(identity_key = %identity_key, "invites: wait timed out");
                    self.clear_waiter(identity_key, waiter_id).await;
                    return Ok(None);
                }
            },
            None => accept.await,
        };

        let encrypted = match outcome {
            Err(Aborted) => {
                debug!(identity_key = %identity_key, "invites: wait aborted");
                self.clear_waiter(identity_key, waiter_id).await;
                return Ok(None);
            }
            Ok(Err(err)) => {
                warn!(identity_key = %identity_key, error = %err, "invites: swarm wait failed");
                self.clear_waiter(identity_key, waiter_id).await;
                return Ok(None);
            }
            Ok(Ok(encrypted)) => encrypted,
        };

        let invite = match identity.decrypt_invite(&request_id, &encrypted).await {
            Ok(invite) => invite,
            Err(err) => {
                warn!(identity_key = %identity_key, error = %err, "invites: decrypt failed");
                self.clear_waiter(identity_key, waiter_id).await;
                return Ok(None);
            }
        };

        match self.fulfill(&invite).await {
            Ok(record) => {
                self.pending.lock().await.remove(identity_key);
                info!(
                    identity_key = %identity_key,
                    channel_id = %record.id,
                    "invites: accepted"
                );
                Ok(Some(record))
            }
            Err(err) => {
                warn!(identity_key = %identity_key, error = %err, "invites: fulfillment failed");
                self.clear_waiter(identity_key, waiter_id).await;
                Ok(None)
            }
        }
    }

    /// Turn a decrypted invite into a live channel: resolve the name, attach
    /// or create, mark non-feed, persist, join the swarm, start the update
    /// loop.
    async fn fulfill(&self, invite: &Invite) -> anyhow::Result<ChannelRecord> {
        let channel = self.resolve_channel(invite).await?;

        let mut metadata = channel.metadata().await;
        metadata.is_feed = false;
        channel.set_metadata(metadata).await?;
        channel.save().await?;

        self.badge.recompute().await;
        self.swarm.join_channel(&channel.id()).await?;
        self.channel_updates.watch(Arc::clone(&channel)).await;

        serialize::channel_record(channel.as_ref()).await
    }

    /// Channel-name resolution: an existing channel with the same name and
    /// the same key is reused silently; a name taken by a different key gets
    /// an increasing numeric suffix, unbounded.
    async fn resolve_channel(&self, invite: &Invite) -> anyhow::Result<Arc<dyn ChannelHandle>> {
        let base = invite.channel_name.clone();
        let mut candidate = base.clone();
        let mut suffix = 0u32;
        loop {
            match self.engine.channel_by_name(&candidate).await {
                Some(existing) if existing.public_key() == invite.channel_key => {
                    debug!(name = %candidate, "invites: reusing existing channel");
                    return Ok(existing);
                }
                Some(_) => {
                    suffix += 1;
                    candidate = format!("{base}-{suffix}");
                }
                None => {
                    return self.engine.channel_from_invite(invite, &candidate).await;
                }
            }
        }
    }

    /// Identity removal trigger: cancel any outstanding waiter and drop the
    /// pending entry. Infallible even when nothing is pending.
    pub async fn remove_identity(&self, identity_key: &IdentityKey) {
        let entry = self.pending.lock().await.remove(identity_key);
        if let Some(entry) = entry {
            if let Some((_, abort_handle)) = entry.waiter {
                abort_handle.abort();
            }
            debug!(identity_key = %identity_key, "invites: pending invite dropped");
        }
    }

    /// Abort every outstanding waiter and forget all pending invites.
    pub async fn clear(&self) {
        let drained: Vec<PendingInvite> = {
            let mut pending = self.pending.lock().await;
            pending.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            if let Some((_, abort_handle)) = entry.waiter {
                abort_handle.abort();
            }
        }
    }

    pub async fn has_pending(&self, identity_key: &IdentityKey) -> bool {
        self.pending.lock().await.contains_key(identity_key)
    }

    /// Drop the waiter slot only if it still belongs to this wait; a
    /// preempting successor must keep its own handle.
    async fn clear_waiter(&self, identity_key: &IdentityKey, waiter_id: Uuid) {
        let mut pending = self.pending.lock().await;
        if let Some(entry) = pending.get_mut(identity_key) {
            if matches!(entry.waiter, Some((id, _)) if id == waiter_id) {
                entry.waiter = None;
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/invites_tests.rs"]
mod tests;

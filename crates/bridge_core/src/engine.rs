//! Collaborator traits for the externally supplied domain objects.
//!
//! The protocol engine, the peer swarm, and persistent storage are opaque to
//! this crate; everything the coordination layer consumes from them is
//! expressed here. Hosts wire in real implementations, tests wire in doubles.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use shared::domain::{ChainMap, ChannelId, ChannelMetadata, IdentityKey, PeerId};

/// A message as the engine hands it over, before wire projection.
#[derive(Debug, Clone)]
pub struct EngineMessage {
    /// 32-byte message digest.
    pub hash: Vec<u8>,
    pub height: u64,
    /// Public keys of the signing path, channel root first.
    pub author_path: Vec<Vec<u8>>,
    pub timestamp: DateTime<Utc>,
    pub body: serde_json::Value,
}

/// An invite request issued by an identity that wants to join a channel.
#[derive(Debug, Clone)]
pub struct InviteRequest {
    /// Correlation key the swarm resolves acceptance against.
    pub request_id: Vec<u8>,
    /// Opaque request blob the requester hands to a channel member.
    pub request: Vec<u8>,
}

/// A decrypted, accepted invite.
#[derive(Debug, Clone)]
pub struct Invite {
    pub channel_name: String,
    /// Public key of the channel the invite grants membership in.
    pub channel_key: Vec<u8>,
    /// Opaque payload the engine needs to reconstruct the channel.
    pub payload: Vec<u8>,
}

/// An invite issued for a peer's request, ready to hand to the swarm.
#[derive(Debug, Clone)]
pub struct IssuedInvite {
    /// Requester's swarm peer id, recovered from the request blob.
    pub peer_id: PeerId,
    pub encrypted_invite: Vec<u8>,
}

#[async_trait]
pub trait ProtocolEngine: Send + Sync {
    /// Load persisted chains and identities. Called once from `init`;
    /// failure is fatal to the whole process.
    async fn bootstrap(&self) -> Result<()>;

    async fn channels(&self) -> Vec<Arc<dyn ChannelHandle>>;
    async fn identities(&self) -> Vec<Arc<dyn IdentityHandle>>;
    async fn channel(&self, id: &ChannelId) -> Option<Arc<dyn ChannelHandle>>;
    async fn channel_by_name(&self, name: &str) -> Option<Arc<dyn ChannelHandle>>;
    async fn identity(&self, key: &IdentityKey) -> Option<Arc<dyn IdentityHandle>>;

    /// Create a fresh identity together with its own channel.
    async fn create_identity_pair(
        &self,
        name: &str,
    ) -> Result<(Arc<dyn IdentityHandle>, Arc<dyn ChannelHandle>)>;

    /// Construct (or attach) a channel from a decrypted invite under the
    /// given resolved name.
    async fn channel_from_invite(
        &self,
        invite: &Invite,
        name: &str,
    ) -> Result<Arc<dyn ChannelHandle>>;

    /// Remove the channel and its paired identity. Returns the removed
    /// identity's key so dependent state can be torn down.
    async fn remove_identity_pair(&self, channel_id: &ChannelId) -> Result<IdentityKey>;

    /// Rename the channel and its paired identity, persisting both.
    async fn rename_identity_pair(&self, channel_id: &ChannelId, name: &str) -> Result<()>;

    async fn compute_chain_map(&self) -> Result<ChainMap>;

    /// Block until the cross-channel chain map changed. `Ok(true)` means an
    /// update happened, `Ok(false)` means the poll window elapsed idle; any
    /// error means the engine itself is defunct.
    async fn wait_for_chain_update(&self, timeout: Duration) -> Result<bool>;
}

#[async_trait]
pub trait ChannelHandle: Send + Sync {
    fn id(&self) -> ChannelId;
    fn name(&self) -> String;
    /// Channel public key, used for invite name-collision checks.
    fn public_key(&self) -> Vec<u8>;

    async fn metadata(&self) -> ChannelMetadata;
    async fn set_metadata(&self, metadata: ChannelMetadata) -> Result<()>;
    /// Persist the channel and its metadata.
    async fn save(&self) -> Result<()>;

    async fn message_count(&self) -> Result<u64>;
    /// Reverse-chronological page of messages starting `offset` from the
    /// newest.
    async fn messages_at_offset(&self, offset: u64, limit: u64) -> Result<Vec<EngineMessage>>;

    async fn post(
        &self,
        identity: Arc<dyn IdentityHandle>,
        body: serde_json::Value,
    ) -> Result<EngineMessage>;

    /// Block until a message is delivered on this channel. `Ok(true)` means a
    /// delivery, `Ok(false)` means the poll window elapsed idle; an error
    /// (channel removed, engine fault) is terminal for the update loop.
    async fn wait_for_incoming(&self, timeout: Duration) -> Result<bool>;
}

#[async_trait]
pub trait IdentityHandle: Send + Sync {
    fn name(&self) -> String;
    fn public_key(&self) -> Vec<u8>;
    async fn channel_ids(&self) -> Vec<ChannelId>;

    async fn create_invite_request(&self) -> Result<InviteRequest>;
    async fn decrypt_invite(&self, request_id: &[u8], encrypted: &[u8]) -> Result<Invite>;
    /// Issue an encrypted invite for a peer's request against a channel this
    /// identity is a member of.
    async fn issue_invite(
        &self,
        channel: Arc<dyn ChannelHandle>,
        request: &[u8],
    ) -> Result<IssuedInvite>;
}

#[async_trait]
pub trait Swarm: Send + Sync {
    async fn join_channel(&self, channel_id: &ChannelId) -> Result<()>;
    /// Resolves with the encrypted invite once a channel member accepts the
    /// request. Callers cancel by dropping/aborting the returned future.
    async fn wait_for_invite(&self, request_id: &[u8]) -> Result<Vec<u8>>;
    async fn send_invite(
        &self,
        peer_id: &PeerId,
        encrypted_invite: &[u8],
        timeout: Duration,
    ) -> Result<()>;
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn open(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;
    async fn clear(&self) -> Result<()>;
    async fn entity_count(&self) -> Result<usize>;
}

#[async_trait]
pub trait BadgeSink: Send + Sync {
    async fn set_badge_count(&self, count: u64);
}

/// Sink for hosts without a dock/taskbar badge.
pub struct NullBadgeSink;

#[async_trait]
impl BadgeSink for NullBadgeSink {
    async fn set_badge_count(&self, _count: u64) {}
}

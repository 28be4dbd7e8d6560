//! Request dispatch: one inbound envelope in, exactly one response out.
//!
//! The serve loop spawns a task per request so a parked wait never stalls
//! unrelated operations, and every handler failure (error or panic) is
//! converted into a tagged error response instead of escaping.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use shared::domain::{ChannelId, ChannelMetadata, IdentityKey};
use shared::error::{ErrorCode, ResponseError};
use shared::protocol::{
    BridgeRequest, BridgeResponse, RequestEnvelope, ResponseEnvelope, ResponsePayload,
    StatusRecord,
};

use crate::engine::{ChannelHandle, IdentityHandle, IssuedInvite};
use crate::{serialize, Bridge, BridgeError};

impl Bridge {
    /// Spawn a serve loop over a fresh channel pair sized by the settings.
    pub fn open_session(
        self: &Arc<Self>,
    ) -> (mpsc::Sender<RequestEnvelope>, mpsc::Receiver<ResponseEnvelope>) {
        let (request_tx, request_rx) = mpsc::channel(self.settings.request_queue_depth);
        let (response_tx, response_rx) = mpsc::channel(self.settings.request_queue_depth);
        tokio::spawn(Arc::clone(self).serve(request_rx, response_tx));
        (request_tx, response_rx)
    }

    pub async fn serve(
        self: Arc<Self>,
        requests: mpsc::Receiver<RequestEnvelope>,
        responses: mpsc::Sender<ResponseEnvelope>,
    ) {
        let mut requests = ReceiverStream::new(requests);
        while let Some(envelope) = requests.next().await {
            let bridge = Arc::clone(&self);
            let responses = responses.clone();
            tokio::spawn(async move {
                let seq = envelope.seq;
                let op = envelope.request.op_name();
                let handler = tokio::spawn({
                    let bridge = Arc::clone(&bridge);
                    async move { bridge.handle(envelope).await }
                });
                let response = match handler.await {
                    Ok(response) => response,
                    Err(fault) => {
                        error!(op, seq, error = %fault, "router: handler fault");
                        ResponseEnvelope {
                            seq,
                            response: BridgeResponse::Error {
                                error: ResponseError::new(
                                    ErrorCode::Internal,
                                    format!("operation {op} failed abnormally"),
                                ),
                            },
                        }
                    }
                };
                if responses.send(response).await.is_err() {
                    debug!(seq, "router: response channel closed");
                }
            });
        }
        debug!("router: request channel closed; serve loop exiting");
    }

    /// Handle one request and produce its single correlated response.
    pub async fn handle(self: &Arc<Self>, envelope: RequestEnvelope) -> ResponseEnvelope {
        let seq = envelope.seq;
        let op = envelope.request.op_name();
        if !self.is_ready() && !envelope.request.allowed_before_ready() {
            return ResponseEnvelope {
                seq,
                response: BridgeResponse::Error {
                    error: BridgeError::NotReady.to_response(),
                },
            };
        }
        match self.dispatch(envelope.request).await {
            Ok(payload) => ResponseEnvelope {
                seq,
                response: BridgeResponse::Ok { payload },
            },
            Err(err) => {
                warn!(op, seq, error = %err, "router: request failed");
                ResponseEnvelope {
                    seq,
                    response: BridgeResponse::Error {
                        error: err.to_response(),
                    },
                }
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, request: BridgeRequest) -> Result<ResponsePayload, BridgeError> {
        match request {
            BridgeRequest::Init => self.init().await,
            BridgeRequest::Erase => self.erase().await,
            BridgeRequest::GetStatus => self.status().await,
            BridgeRequest::GetChannels => self.get_channels().await,
            BridgeRequest::GetIdentities => self.get_identities().await,
            BridgeRequest::CreateIdentityPair { name } => self.create_identity_pair(&name).await,
            BridgeRequest::RemoveIdentityPair { channel_id } => {
                self.remove_identity_pair(&channel_id).await
            }
            BridgeRequest::RenameIdentityPair { channel_id, name } => {
                self.rename_identity_pair(&channel_id, &name).await
            }
            BridgeRequest::UpdateChannelMetadata {
                channel_id,
                metadata,
            } => self.update_channel_metadata(&channel_id, metadata).await,
            BridgeRequest::PostMessage {
                channel_id,
                identity_key,
                text,
            } => self.post_message(&channel_id, &identity_key, &text).await,
            BridgeRequest::GetMessageCount { channel_id } => {
                let channel = self.resolve_channel(&channel_id).await?;
                Ok(ResponsePayload::MessageCount(channel.message_count().await?))
            }
            BridgeRequest::GetMessages {
                channel_id,
                offset,
                limit,
            } => {
                let channel = self.resolve_channel(&channel_id).await?;
                let messages = channel.messages_at_offset(offset, limit).await?;
                Ok(ResponsePayload::Messages(
                    messages.iter().map(serialize::message_record).collect(),
                ))
            }
            BridgeRequest::RequestInvite { identity_key } => {
                let encoded_request = self.invites.request(&identity_key).await?;
                Ok(ResponsePayload::InviteRequest { encoded_request })
            }
            BridgeRequest::WaitForInvite {
                identity_key,
                timeout_ms,
            } => {
                let channel = self
                    .invites
                    .wait(&identity_key, timeout_ms.map(Duration::from_millis))
                    .await?;
                Ok(ResponsePayload::InviteWait { channel })
            }
            BridgeRequest::Invite {
                channel_id,
                identity_key,
                encoded_request,
            } => {
                let issued = self
                    .issue_invite(&channel_id, &identity_key, &encoded_request)
                    .await?;
                Ok(ResponsePayload::InviteIssued {
                    peer_id: issued.peer_id,
                    encrypted_invite: serialize::encode_blob(&issued.encrypted_invite),
                })
            }
            BridgeRequest::SendInvite {
                peer_id,
                encrypted_invite,
            } => {
                let blob = serialize::decode_blob(&encrypted_invite)?;
                self.swarm
                    .send_invite(&peer_id, &blob, self.settings.invite_send_timeout)
                    .await?;
                Ok(ResponsePayload::Done)
            }
            BridgeRequest::AcceptInvite {
                channel_id,
                identity_key,
                encoded_request,
            } => {
                let issued = self
                    .issue_invite(&channel_id, &identity_key, &encoded_request)
                    .await?;
                self.swarm
                    .send_invite(
                        &issued.peer_id,
                        &issued.encrypted_invite,
                        self.settings.invite_send_timeout,
                    )
                    .await?;
                info!(channel_id = %channel_id, peer_id = %issued.peer_id, "router: invite accepted and sent");
                Ok(ResponsePayload::Done)
            }
            BridgeRequest::WaitForIncomingMessage {
                channel_id,
                timeout_ms,
            } => {
                self.resolve_channel(&channel_id).await?;
                let updated = self
                    .channel_updates
                    .wait_for_incoming_message(&channel_id, timeout_ms.map(Duration::from_millis))
                    .await?;
                Ok(ResponsePayload::Updated(updated))
            }
            BridgeRequest::WaitForChainUpdate { timeout_ms } => {
                let updated = self
                    .chain_updates
                    .wait_for_update(timeout_ms.map(Duration::from_millis))
                    .await?;
                Ok(ResponsePayload::Updated(updated))
            }
            BridgeRequest::ComputeChainMap => {
                let map = self.engine.compute_chain_map().await?;
                Ok(ResponsePayload::ChainMap(serialize::chain_map_record(&map)))
            }
        }
    }

    /// Open storage, bootstrap the engine, and start every background loop.
    /// Idempotent once ready; any bootstrap failure is fatal.
    async fn init(self: &Arc<Self>) -> Result<ResponsePayload, BridgeError> {
        if self.is_ready() {
            return Ok(ResponsePayload::Done);
        }
        self.storage
            .open()
            .await
            .map_err(|err| BridgeError::Fatal(format!("storage open failed: {err}")))?;
        self.engine
            .bootstrap()
            .await
            .map_err(|err| BridgeError::Fatal(format!("engine bootstrap failed: {err}")))?;

        self.chain_updates.start().await;
        for channel in self.engine.channels().await {
            if let Err(err) = self.swarm.join_channel(&channel.id()).await {
                // The swarm may be offline at startup; delivery loops still
                // run and the join is retried by the swarm layer.
                warn!(channel_id = %channel.id(), error = %err, "router: swarm join failed");
            }
            self.channel_updates.watch(channel).await;
        }
        self.badge.recompute().await;
        self.set_ready();
        info!("router: initialized");
        Ok(ResponsePayload::Done)
    }

    /// Wipe storage. Only valid before initialization succeeded.
    async fn erase(self: &Arc<Self>) -> Result<ResponsePayload, BridgeError> {
        if self.is_ready() {
            return Err(BridgeError::Fatal(
                "erase is only valid before initialization".to_string(),
            ));
        }
        self.invites.clear().await;
        self.storage.clear().await?;
        info!("router: storage erased");
        Ok(ResponsePayload::Done)
    }

    async fn status(self: &Arc<Self>) -> Result<ResponsePayload, BridgeError> {
        let entity_count = match self.storage.entity_count().await {
            Ok(count) => count,
            Err(err) => {
                debug!(error = %err, "router: entity count unavailable");
                0
            }
        };
        Ok(ResponsePayload::Status(StatusRecord {
            ready: self.is_ready(),
            channel_count: self.engine.channels().await.len(),
            identity_count: self.engine.identities().await.len(),
            entity_count,
        }))
    }

    async fn get_channels(self: &Arc<Self>) -> Result<ResponsePayload, BridgeError> {
        let mut records = Vec::new();
        for channel in self.engine.channels().await {
            records.push(serialize::channel_record(channel.as_ref()).await?);
        }
        Ok(ResponsePayload::Channels(records))
    }

    async fn get_identities(self: &Arc<Self>) -> Result<ResponsePayload, BridgeError> {
        let mut records = Vec::new();
        for identity in self.engine.identities().await {
            records.push(serialize::identity_record(identity.as_ref()).await);
        }
        Ok(ResponsePayload::Identities(records))
    }

    async fn create_identity_pair(
        self: &Arc<Self>,
        name: &str,
    ) -> Result<ResponsePayload, BridgeError> {
        let (identity, channel) = self.engine.create_identity_pair(name).await?;
        channel.save().await?;
        self.swarm.join_channel(&channel.id()).await?;
        self.channel_updates.watch(Arc::clone(&channel)).await;
        self.badge.recompute().await;
        info!(name, channel_id = %channel.id(), "router: identity pair created");
        Ok(ResponsePayload::IdentityPair {
            identity: serialize::identity_record(identity.as_ref()).await,
            channel: serialize::channel_record(channel.as_ref()).await?,
        })
    }

    async fn remove_identity_pair(
        self: &Arc<Self>,
        channel_id: &ChannelId,
    ) -> Result<ResponsePayload, BridgeError> {
        self.resolve_channel(channel_id).await?;
        let identity_key = self.engine.remove_identity_pair(channel_id).await?;
        self.channel_updates.unwatch(channel_id).await;
        self.invites.remove_identity(&identity_key).await;
        self.badge.recompute().await;
        info!(channel_id = %channel_id, "router: identity pair removed");
        Ok(ResponsePayload::Done)
    }

    async fn rename_identity_pair(
        self: &Arc<Self>,
        channel_id: &ChannelId,
        name: &str,
    ) -> Result<ResponsePayload, BridgeError> {
        self.resolve_channel(channel_id).await?;
        self.engine.rename_identity_pair(channel_id, name).await?;
        self.badge.recompute().await;
        let channel = self.resolve_channel(channel_id).await?;
        Ok(ResponsePayload::Channel(
            serialize::channel_record(channel.as_ref()).await?,
        ))
    }

    async fn update_channel_metadata(
        self: &Arc<Self>,
        channel_id: &ChannelId,
        metadata: ChannelMetadata,
    ) -> Result<ResponsePayload, BridgeError> {
        let channel = self.resolve_channel(channel_id).await?;
        channel.set_metadata(metadata).await?;
        channel.save().await?;
        self.badge.recompute().await;
        Ok(ResponsePayload::Channel(
            serialize::channel_record(channel.as_ref()).await?,
        ))
    }

    async fn post_message(
        self: &Arc<Self>,
        channel_id: &ChannelId,
        identity_key: &IdentityKey,
        text: &str,
    ) -> Result<ResponsePayload, BridgeError> {
        let channel = self.resolve_channel(channel_id).await?;
        let identity = self.resolve_identity(identity_key).await?;
        let message = channel
            .post(identity, serde_json::json!({ "text": text }))
            .await?;
        self.badge.recompute().await;
        Ok(ResponsePayload::Message(serialize::message_record(&message)))
    }

    async fn issue_invite(
        self: &Arc<Self>,
        channel_id: &ChannelId,
        identity_key: &IdentityKey,
        encoded_request: &str,
    ) -> Result<IssuedInvite, BridgeError> {
        let request = serialize::decode_blob(encoded_request)?;
        let channel = self.resolve_channel(channel_id).await?;
        let identity = self.resolve_identity(identity_key).await?;
        Ok(identity.issue_invite(channel, &request).await?)
    }

    async fn resolve_channel(
        self: &Arc<Self>,
        channel_id: &ChannelId,
    ) -> Result<Arc<dyn ChannelHandle>, BridgeError> {
        self.engine
            .channel(channel_id)
            .await
            .ok_or_else(|| BridgeError::NotFound(format!("channel {channel_id}")))
    }

    async fn resolve_identity(
        self: &Arc<Self>,
        identity_key: &IdentityKey,
    ) -> Result<Arc<dyn IdentityHandle>, BridgeError> {
        self.engine
            .identity(identity_key)
            .await
            .ok_or_else(|| BridgeError::NotFound(format!("identity {identity_key}")))
    }
}

#[cfg(test)]
#[path = "tests/router_tests.rs"]
mod tests;

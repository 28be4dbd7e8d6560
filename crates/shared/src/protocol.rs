use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ChannelId, ChannelMetadata, IdentityKey, PeerId},
    error::ResponseError,
};

/// One front-end call. The sequence number is caller-assigned and echoed
/// verbatim on the single response produced for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub seq: u64,
    pub request: BridgeRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub seq: u64,
    pub response: BridgeResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BridgeResponse {
    Ok { payload: ResponsePayload },
    Error { error: ResponseError },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum BridgeRequest {
    Init,
    Erase,
    GetStatus,
    GetChannels,
    GetIdentities,
    CreateIdentityPair {
        name: String,
    },
    RemoveIdentityPair {
        channel_id: ChannelId,
    },
    RenameIdentityPair {
        channel_id: ChannelId,
        name: String,
    },
    UpdateChannelMetadata {
        channel_id: ChannelId,
        metadata: ChannelMetadata,
    },
    PostMessage {
        channel_id: ChannelId,
        identity_key: IdentityKey,
        text: String,
    },
    GetMessageCount {
        channel_id: ChannelId,
    },
    GetMessages {
        channel_id: ChannelId,
        offset: u64,
        limit: u64,
    },
    RequestInvite {
        identity_key: IdentityKey,
    },
    WaitForInvite {
        identity_key: IdentityKey,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    Invite {
        channel_id: ChannelId,
        identity_key: IdentityKey,
        encoded_request: String,
    },
    SendInvite {
        peer_id: PeerId,
        encrypted_invite: String,
    },
    AcceptInvite {
        channel_id: ChannelId,
        identity_key: IdentityKey,
        encoded_request: String,
    },
    WaitForIncomingMessage {
        channel_id: ChannelId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    WaitForChainUpdate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    ComputeChainMap,
}

impl BridgeRequest {
    /// Wire name of the operation, for logging and gate checks.
    pub fn op_name(&self) -> &'static str {
        match self {
            BridgeRequest::Init => "init",
            BridgeRequest::Erase => "erase",
            BridgeRequest::GetStatus => "get_status",
            BridgeRequest::GetChannels => "get_channels",
            BridgeRequest::GetIdentities => "get_identities",
            BridgeRequest::CreateIdentityPair { .. } => "create_identity_pair",
            BridgeRequest::RemoveIdentityPair { .. } => "remove_identity_pair",
            BridgeRequest::RenameIdentityPair { .. } => "rename_identity_pair",
            BridgeRequest::UpdateChannelMetadata { .. } => "update_channel_metadata",
            BridgeRequest::PostMessage { .. } => "post_message",
            BridgeRequest::GetMessageCount { .. } => "get_message_count",
            BridgeRequest::GetMessages { .. } => "get_messages",
            BridgeRequest::RequestInvite { .. } => "request_invite",
            BridgeRequest::WaitForInvite { .. } => "wait_for_invite",
            BridgeRequest::Invite { .. } => "invite",
            BridgeRequest::SendInvite { .. } => "send_invite",
            BridgeRequest::AcceptInvite { .. } => "accept_invite",
            BridgeRequest::WaitForIncomingMessage { .. } => "wait_for_incoming_message",
            BridgeRequest::WaitForChainUpdate { .. } => "wait_for_chain_update",
            BridgeRequest::ComputeChainMap => "compute_chain_map",
        }
    }

    /// Operations allowed before `init` has completed.
    pub fn allowed_before_ready(&self) -> bool {
        matches!(
            self,
            BridgeRequest::Init | BridgeRequest::Erase | BridgeRequest::GetStatus
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ResponsePayload {
    Done,
    Status(StatusRecord),
    Channels(Vec<ChannelRecord>),
    Channel(ChannelRecord),
    Identities(Vec<IdentityRecord>),
    IdentityPair {
        identity: IdentityRecord,
        channel: ChannelRecord,
    },
    Message(MessageRecord),
    Messages(Vec<MessageRecord>),
    MessageCount(u64),
    InviteRequest {
        encoded_request: String,
    },
    InviteIssued {
        peer_id: PeerId,
        encrypted_invite: String,
    },
    /// `channel` is absent when the wait was cancelled, preempted, or timed
    /// out; "not yet accepted" is an expected outcome, not a fault.
    InviteWait {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<ChannelRecord>,
    },
    /// `true`: an update was delivered. `false`: the backing update loop
    /// terminated.
    Updated(bool),
    ChainMap(ChainMapRecord),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub ready: bool,
    pub channel_count: usize,
    pub identity_count: usize,
    pub entity_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub id: ChannelId,
    pub name: String,
    pub is_feed: bool,
    pub message_count: u64,
    pub metadata: ChannelMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Hex of the message digest.
    pub hash: String,
    pub height: u64,
    /// Base58 public keys of the signing path, root first.
    pub author: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub body: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub name: String,
    pub public_key: IdentityKey,
    /// Channel ids this identity is a member of.
    pub channel_ids: Vec<ChannelId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainMapRecord {
    pub entries: Vec<ChainMapEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainMapEntry {
    pub channel_id: ChannelId,
    pub path: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_envelope_round_trips_unit_and_struct_variants() {
        let init = RequestEnvelope {
            seq: 7,
            request: BridgeRequest::Init,
        };
        let raw = serde_json::to_string(&init).expect("serialize");
        assert!(raw.contains("\"type\":\"init\""));
        let back: RequestEnvelope = serde_json::from_str(&raw).expect("deserialize");
        assert_eq!(back.seq, 7);
        assert!(matches!(back.request, BridgeRequest::Init));

        let wait = RequestEnvelope {
            seq: 8,
            request: BridgeRequest::WaitForIncomingMessage {
                channel_id: ChannelId::from("aabb"),
                timeout_ms: Some(250),
            },
        };
        let raw = serde_json::to_string(&wait).expect("serialize");
        let back: RequestEnvelope = serde_json::from_str(&raw).expect("deserialize");
        match back.request {
            BridgeRequest::WaitForIncomingMessage {
                channel_id,
                timeout_ms,
            } => {
                assert_eq!(channel_id.0, "aabb");
                assert_eq!(timeout_ms, Some(250));
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn pre_ready_allow_list_is_exactly_init_erase_status() {
        assert!(BridgeRequest::Init.allowed_before_ready());
        assert!(BridgeRequest::Erase.allowed_before_ready());
        assert!(BridgeRequest::GetStatus.allowed_before_ready());
        assert!(!BridgeRequest::GetChannels.allowed_before_ready());
        assert!(!BridgeRequest::ComputeChainMap.allowed_before_ready());
    }

    #[test]
    fn error_response_serializes_code_snake_case() {
        use crate::error::{ErrorCode, ResponseError};
        let envelope = ResponseEnvelope {
            seq: 3,
            response: BridgeResponse::Error {
                error: ResponseError::new(ErrorCode::NotReady, "engine is not ready"),
            },
        };
        let raw = serde_json::to_string(&envelope).expect("serialize");
        assert!(raw.contains("\"code\":\"not_ready\""));
        assert!(raw.contains("\"status\":\"error\""));
    }
}

//! Projections of engine objects into wire-safe records.
//!
//! Pure and side-effect free: every function here reads the given object and
//! builds a record, nothing more. Keys travel as base58, digests as lowercase
//! hex, opaque invite blobs as base64.

use base64::{engine::general_purpose::STANDARD, Engine as _};

use shared::domain::{ChainMap, IdentityKey};
use shared::protocol::{
    ChainMapEntry, ChainMapRecord, ChannelRecord, IdentityRecord, MessageRecord,
};

use crate::engine::{ChannelHandle, EngineMessage, IdentityHandle};
use crate::BridgeError;

pub fn encode_key(key: &[u8]) -> String {
    bs58::encode(key).into_string()
}

pub fn decode_key(raw: &str) -> Result<Vec<u8>, BridgeError> {
    bs58::decode(raw)
        .into_vec()
        .map_err(|err| BridgeError::InvalidEncoding(format!("bad base58 key: {err}")))
}

pub fn encode_digest(digest: &[u8]) -> String {
    hex::encode(digest)
}

pub fn decode_digest(raw: &str) -> Result<Vec<u8>, BridgeError> {
    hex::decode(raw).map_err(|err| BridgeError::InvalidEncoding(format!("bad hex digest: {err}")))
}

pub fn encode_blob(blob: &[u8]) -> String {
    STANDARD.encode(blob)
}

pub fn decode_blob(raw: &str) -> Result<Vec<u8>, BridgeError> {
    STANDARD
        .decode(raw)
        .map_err(|err| BridgeError::InvalidEncoding(format!("bad base64 payload: {err}")))
}

pub async fn channel_record(channel: &dyn ChannelHandle) -> anyhow::Result<ChannelRecord> {
    let metadata = channel.metadata().await;
    Ok(ChannelRecord {
        id: channel.id(),
        name: channel.name(),
        is_feed: metadata.is_feed,
        message_count: channel.message_count().await?,
        metadata,
    })
}

pub fn message_record(message: &EngineMessage) -> MessageRecord {
    MessageRecord {
        hash: encode_digest(&message.hash),
        height: message.height,
        author: message.author_path.iter().map(|key| encode_key(key)).collect(),
        timestamp: message.timestamp,
        body: message.body.clone(),
    }
}

pub async fn identity_record(identity: &dyn IdentityHandle) -> IdentityRecord {
    IdentityRecord {
        name: identity.name(),
        public_key: IdentityKey(encode_key(&identity.public_key())),
        channel_ids: identity.channel_ids().await,
    }
}

pub fn chain_map_record(map: &ChainMap) -> ChainMapRecord {
    let mut entries: Vec<ChainMapEntry> = map
        .paths
        .iter()
        .map(|(channel_id, path)| ChainMapEntry {
            channel_id: channel_id.clone(),
            path: path.clone(),
        })
        .collect();
    entries.sort_by(|a, b| a.channel_id.0.cmp(&b.channel_id.0));
    ChainMapRecord { entries }
}

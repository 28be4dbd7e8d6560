use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

// Channel ids are lowercase hex of the 32-byte channel digest, identity keys
// are base58 of the 32-byte public key, peer ids are swarm-assigned opaque
// strings.
id_newtype!(ChannelId);
id_newtype!(IdentityKey);
id_newtype!(PeerId);

/// Mutable per-channel metadata stored alongside the channel itself.
///
/// `read_count` is the number of messages the front end has marked as seen;
/// the unread badge is derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ChannelMetadata {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub read_count: u64,
    #[serde(default)]
    pub is_feed: bool,
}

/// Cross-channel trust map: for every channel, the display path of signing
/// identities from the channel root to the local member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ChainMap {
    pub paths: HashMap<ChannelId, Vec<String>>,
}

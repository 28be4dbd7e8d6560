use std::collections::HashMap;
use std::fs;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// Poll window handed to the engine's per-channel blocking wait.
    pub channel_poll_timeout: Duration,
    /// Poll window for the global chain-map wait.
    pub chain_poll_timeout: Duration,
    /// Deadline for handing an issued invite to the swarm.
    pub invite_send_timeout: Duration,
    /// Depth of the serve loop's inbound request queue.
    pub request_queue_depth: usize,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            channel_poll_timeout: Duration::from_secs(30),
            chain_poll_timeout: Duration::from_secs(30),
            invite_send_timeout: Duration::from_secs(15),
            request_queue_depth: 64,
        }
    }
}

/// Defaults, overlaid by `bridge.toml`, overlaid by `APP__*` environment
/// variables. Malformed values fall back rather than fail; this runs before
/// any error channel to the front end exists.
pub fn load_settings() -> BridgeSettings {
    let mut settings = BridgeSettings::default();

    if let Ok(raw) = fs::read_to_string("bridge.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            apply(&mut settings, |key| file_cfg.get(key).cloned());
        }
    }

    apply(&mut settings, |key| {
        std::env::var(format!("APP__{}", key.to_uppercase())).ok()
    });

    settings
}

fn apply(settings: &mut BridgeSettings, get: impl Fn(&str) -> Option<String>) {
    if let Some(secs) = get("channel_poll_timeout_secs").and_then(|v| v.parse().ok()) {
        settings.channel_poll_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = get("chain_poll_timeout_secs").and_then(|v| v.parse().ok()) {
        settings.chain_poll_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = get("invite_send_timeout_secs").and_then(|v| v.parse().ok()) {
        settings.invite_send_timeout = Duration::from_secs(secs);
    }
    if let Some(depth) = get("request_queue_depth").and_then(|v| v.parse().ok()) {
        settings.request_queue_depth = depth;
    }
}

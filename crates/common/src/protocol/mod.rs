// Wire protocol for the parley-chat.v1 WebSocket surface.

pub mod ws;

/// The current (latest) protocol version.
pub const CURRENT_PROTOCOL_VERSION: &str = "parley-chat.v1";

/// All protocol versions the gateway accepts, newest first.
/// When a new version ships, the previous one moves to the N-1 slot.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] =
    &[CURRENT_PROTOCOL_VERSION, "parley-chat.v0"];

#[must_use]
pub fn is_supported_protocol_version(version: &str) -> bool {
    SUPPORTED_PROTOCOL_VERSIONS.contains(&version)
}

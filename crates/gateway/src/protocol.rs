// Protocol version negotiation and N-1 support.
//
// Clients may send a protocol version string (e.g. "parley-chat.v1") as a
// `protocol` query parameter on the upgrade URL. The gateway rejects
// unsupported versions with an UPGRADE_REQUIRED error. N-1 support is
// maintained for at least one release cycle.

use crate::error::{ErrorCode, GatewayError};
use parley_common::protocol::{
    is_supported_protocol_version, CURRENT_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};
use serde_json::json;

/// Validates a client-supplied protocol version. Returns `Ok(())` if
/// supported, or a `GatewayError` with code `UPGRADE_REQUIRED` and
/// `details.supported_versions` if not.
pub fn require_supported(version: &str) -> Result<(), GatewayError> {
    if is_supported_protocol_version(version) {
        Ok(())
    } else {
        Err(GatewayError::new(
            ErrorCode::UpgradeRequired,
            format!("unsupported protocol version: {version}"),
        )
        .with_details(json!({
            "requested_version": version,
            "supported_versions": SUPPORTED_PROTOCOL_VERSIONS,
            "current_version": CURRENT_PROTOCOL_VERSION,
        })))
    }
}

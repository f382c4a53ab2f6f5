//! Heartbeat wire messages.
//!
//! Messages are short UTF-8 strings, one per line: the prober sends
//! [`HANDSHAKE`] once and [`CHECK`] afterwards, the probed side answers
//! `checked;<uuid>` to the former and [`CHECKED`] to the latter.

use crate::error::HeartbeatError;

/// First message of a connection; asks the peer for its uuid.
pub const HANDSHAKE: &str = "handshake";

/// Liveness probe.
pub const CHECK: &str = "check";

/// Reply to a probe.
pub const CHECKED: &str = "checked";

/// Reply to a handshake carrying `uuid`.
pub fn checked_reply(uuid: &str) -> String {
    format!("{CHECKED};{uuid}")
}

/// The uuid of a handshake reply: everything after the first `;`.
pub fn parse_handshake_reply(reply: &str) -> Result<&str, HeartbeatError> {
    reply
        .split_once(';')
        .map(|(_, uuid)| uuid)
        .ok_or_else(|| HeartbeatError::MalformedReply(reply.to_string()))
}

/// What the probed side answers to `message`.
///
/// Anything other than a handshake is answered like a check.
pub fn reply_to(message: &str, uuid: &str) -> String {
    if message == HANDSHAKE {
        checked_reply(uuid)
    } else {
        CHECKED.to_string()
    }
}

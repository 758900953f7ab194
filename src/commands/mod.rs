pub mod mqtt;
pub mod poller;

use crate::relay::RelayState;

/// Normalize an externally authored action verb.
///
/// Accepts `on`/`off` and the dashboard's `ligar`/`desligar`, in any case and
/// with surrounding whitespace. Anything else is `None`.
pub fn parse_action(raw: &str) -> Option<RelayState> {
    match raw.trim().to_lowercase().as_str() {
        "on" | "ligar" => Some(RelayState::On),
        "off" | "desligar" => Some(RelayState::Off),
        _ => None,
    }
}

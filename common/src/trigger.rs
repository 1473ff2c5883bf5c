//! Typed shape of the external trigger message that parameterizes a sender
//! run: `{frame_id, destination_tag}`.
//!
//! The trigger bus itself (request/reply transport, orchestration) is out
//! of scope for this crate; consuming it is the supervisor's job. This
//! module gives that external collaborator a strict, named interface to
//! parse against instead of ad hoc dynamic JSON: unknown fields are
//! rejected rather than silently ignored.

use serde::{Deserialize, Serialize};

/// `{frame_id, destination_tag}` as received from the trigger bus.
/// `frame_id` becomes a sender's `start_after` marker; `destination_tag`
/// is mapped by the orchestrator to a destination path suffix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TriggerMessage {
    pub frame_id: String,
    pub destination_tag: String,
}

impl TriggerMessage {
    /// Parse a trigger message from its wire JSON, rejecting unknown
    /// fields instead of ignoring them.
    pub fn parse(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_well_formed_message() {
        let msg =
            TriggerMessage::parse(r#"{"frame_id":"frame_cam01_000000123.jpg","destination_tag":"ball7"}"#)
                .unwrap();
        assert_eq!(msg.frame_id, "frame_cam01_000000123.jpg");
        assert_eq!(msg.destination_tag, "ball7");
    }

    #[test]
    fn rejects_unknown_fields() {
        let err = TriggerMessage::parse(
            r#"{"frame_id":"f","destination_tag":"t","extra":"nope"}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown field"));
    }

    #[test]
    fn rejects_missing_fields() {
        assert!(TriggerMessage::parse(r#"{"frame_id":"f"}"#).is_err());
    }
}

//! JSON wire codec.
//!
//! One message per frame. Decoding failures are reported, never panics; the
//! caller drops the frame.

use crate::error::{Result, SyncError};
use crate::messages::SyncMessage;

/// Frames above this size are refused before parsing.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Encode a message as a JSON frame.
pub fn encode(message: &SyncMessage) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}

/// Decode a JSON frame.
pub fn decode(frame: &str) -> Result<SyncMessage> {
    if frame.len() > MAX_FRAME_LEN {
        return Err(SyncError::InvalidMessage(format!(
            "frame of {} bytes exceeds {MAX_FRAME_LEN}",
            frame.len()
        )));
    }
    serde_json::from_str(frame).map_err(|e| SyncError::InvalidMessage(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use covalue_core::{CoId, KnownState};

    #[test]
    fn test_roundtrip() {
        let message = SyncMessage::correction(KnownState::empty(CoId([9; 32])));
        let frame = encode(&message).unwrap();
        assert_eq!(decode(&frame).unwrap(), message);
    }

    #[test]
    fn test_invalid_id_rejected() {
        for frame in [
            r#"{"action":"load","id":"","header":false,"sessions":{}}"#,
            r#"{"action":"load","id":"co_zNOT-BASE58","header":false,"sessions":{}}"#,
            r#"{"action":"load","header":false,"sessions":{}}"#,
        ] {
            assert!(matches!(decode(frame), Err(SyncError::InvalidMessage(_))), "{frame}");
        }
    }

    #[test]
    fn test_unknown_action_rejected() {
        let frame = r#"{"action":"gossip","id":"co_z1"}"#;
        assert!(decode(frame).is_err());
        assert!(decode("not json").is_err());
    }
}

//! Command envelopes sent by browser clients
//!
//! Every text frame a client sends to the gateway is one JSON object:
//!
//! ```json
//! {"target": "10.0.0.5", "data": "", "type": "text"}
//! ```
//!
//! `target` names the host running the agent. `data` and `type` are part
//! of the contract with the browser UI but do not influence dispatch.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// A command request received from a client
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Destination host identifier (only consulted when no transport exists yet)
    #[serde(default)]
    pub target: String,
    /// Opaque payload
    #[serde(default)]
    pub data: String,
    /// Frame discriminator
    #[serde(default, rename = "type")]
    pub kind: String,
}

impl CommandEnvelope {
    /// Parse an envelope from a text frame payload
    pub fn parse(payload: &str) -> Result<Self, ProtocolError> {
        let envelope = serde_json::from_str(payload)?;
        Ok(envelope)
    }

    /// Return the target host, failing if it is blank
    pub fn require_target(&self) -> Result<&str, ProtocolError> {
        let target = self.target.trim();
        if target.is_empty() {
            return Err(ProtocolError::EmptyTarget);
        }
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_envelope() {
        let envelope =
            CommandEnvelope::parse(r#"{"target":"10.0.0.5","data":"","type":"text"}"#).unwrap();

        assert_eq!(envelope.target, "10.0.0.5");
        assert_eq!(envelope.data, "");
        assert_eq!(envelope.kind, "text");
        assert_eq!(envelope.require_target().unwrap(), "10.0.0.5");
    }

    #[test]
    fn test_parse_missing_optional_fields() {
        let envelope = CommandEnvelope::parse(r#"{"target":"web-01"}"#).unwrap();
        assert_eq!(envelope.target, "web-01");
        assert!(envelope.data.is_empty());
        assert!(envelope.kind.is_empty());
    }

    #[test]
    fn test_missing_target_is_rejected_on_use() {
        let envelope = CommandEnvelope::parse(r#"{"data":"x","type":"text"}"#).unwrap();
        assert!(matches!(
            envelope.require_target(),
            Err(ProtocolError::EmptyTarget)
        ));

        let blank = CommandEnvelope::parse(r#"{"target":"   "}"#).unwrap();
        assert!(blank.require_target().is_err());
    }

    #[test]
    fn test_parse_rejects_non_json() {
        assert!(matches!(
            CommandEnvelope::parse("not json"),
            Err(ProtocolError::MalformedEnvelope(_))
        ));
        assert!(CommandEnvelope::parse("42").is_err());
        assert!(CommandEnvelope::parse(r#"{"target": 5}"#).is_err());
    }

    #[test]
    fn test_serialize_uses_type_field() {
        let envelope = CommandEnvelope {
            target: "host".to_string(),
            data: String::new(),
            kind: "text".to_string(),
        };
        let json = serde_json::to_string(&envelope).unwrap();
        assert_eq!(json, r#"{"target":"host","data":"","type":"text"}"#);
    }
}

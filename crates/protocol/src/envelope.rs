use serde::{Deserialize, Serialize};

use crate::ProtocolError;
use crate::constants::MessageType;

/// Envelope for messages posted by a background worker.
///
/// The `payload` field uses `serde_json::value::RawValue` to defer
/// deserialization until the receiver knows which payload type to expect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeMessage {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub task_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<serde_json::value::RawValue>>,
}

impl BridgeMessage {
    /// Creates a new message with the given type and payload.
    pub fn new<T: Serialize>(
        msg_type: MessageType,
        task_id: impl Into<String>,
        payload: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        let raw = match payload {
            Some(p) => {
                let json = serde_json::to_string(p)?;
                Some(serde_json::value::RawValue::from_string(json)?)
            }
            None => None,
        };
        Ok(Self {
            msg_type,
            task_id: task_id.into(),
            payload: raw,
        })
    }

    /// Deserializes the payload into the given type.
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(
        &self,
    ) -> Result<Option<T>, serde_json::Error> {
        match &self.payload {
            Some(raw) => Ok(Some(serde_json::from_str(raw.get())?)),
            None => Ok(None),
        }
    }

    /// Like [`parse_payload`](Self::parse_payload) but treats a missing payload as an error.
    pub fn expect_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, ProtocolError> {
        self.parse_payload()?
            .ok_or(ProtocolError::MissingPayload(self.msg_type))
    }
}

//! Wire messages exchanged with the browser client.
//!
//! Inbound messages accept both the camelCase field names and the older
//! snake_case spellings still sent by deployed frontends.

use crate::error::SessionError;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Kind of live input being aligned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    #[default]
    Audio,
    Midi,
}

impl fmt::Display for InputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputType::Audio => write!(f, "audio"),
            InputType::Midi => write!(f, "midi"),
        }
    }
}

/// Where the performance comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// A physical audio or MIDI input device.
    LiveDevice,
    /// A recorded performance fetched from the cloud service.
    PlaybackFile,
}

/// Device chosen by the client: an index, or a port/device name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeviceSelector {
    Index(u32),
    Name(String),
}

impl DeviceSelector {
    /// Numeric index, also accepting names that are plain integers.
    pub fn as_index(&self) -> Option<u32> {
        match self {
            DeviceSelector::Index(i) => Some(*i),
            DeviceSelector::Name(name) => name.trim().parse().ok(),
        }
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSelector::Index(i) => write!(f, "#{}", i),
            DeviceSelector::Name(name) => write!(f, "{}", name),
        }
    }
}

/// First message on a score-following connection.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitMessage {
    #[serde(alias = "file_id", deserialize_with = "string_or_number")]
    pub file_id: String,

    #[serde(default, alias = "input_type")]
    pub input_type: InputType,

    #[serde(default, alias = "isPerformceModel", alias = "is_performance_model")]
    pub is_performance_model: bool,

    #[serde(default, deserialize_with = "optional_device")]
    pub device: Option<DeviceSelector>,
}

impl InitMessage {
    /// Parse and validate an init message.
    pub fn from_value(value: serde_json::Value) -> Result<Self, SessionError> {
        let init: InitMessage = serde_json::from_value(value)
            .map_err(|e| SessionError::Initialization(e.to_string()))?;

        if init.file_id.trim().is_empty() {
            return Err(SessionError::Initialization("fileId is empty".to_string()));
        }

        Ok(init)
    }

    pub fn mode(&self) -> SessionMode {
        if self.is_performance_model {
            SessionMode::PlaybackFile
        } else {
            SessionMode::LiveDevice
        }
    }
}

/// First message on a tuner connection.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunerInit {
    #[serde(default, alias = "device_index")]
    pub device_index: usize,
}

impl TunerInit {
    pub fn from_value(value: serde_json::Value) -> Result<Self, SessionError> {
        serde_json::from_value(value).map_err(|e| SessionError::Initialization(e.to_string()))
    }
}

/// Control message sent by the client while a session runs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ControlMessage {
    #[serde(default)]
    pub action: Option<String>,
}

impl ControlMessage {
    pub fn is_stop(&self) -> bool {
        self.action.as_deref() == Some("stop")
    }
}

/// Terminal status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusReport {
    Completed,
}

/// Every message the server sends. Each variant serializes to exactly one
/// JSON object shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Position {
        #[serde(rename = "beatPosition")]
        beat_position: f64,
    },
    Status {
        status: StatusReport,
    },
    Error {
        error: String,
    },
    Pitch {
        frequency: f32,
        volume: f32,
    },
    NoSound {
        #[serde(rename = "noSound")]
        no_sound: bool,
    },
}

impl ServerMessage {
    pub fn position(beat_position: f64) -> Self {
        ServerMessage::Position { beat_position }
    }

    pub fn completed() -> Self {
        ServerMessage::Status {
            status: StatusReport::Completed,
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        ServerMessage::Error {
            error: error.into(),
        }
    }

    pub fn no_sound() -> Self {
        ServerMessage::NoSound { no_sound: true }
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Text(String),
        Number(i64),
    }

    Ok(match Repr::deserialize(deserializer)? {
        Repr::Text(s) => s,
        Repr::Number(n) => n.to_string(),
    })
}

/// `null`, `""` and missing all mean "use the default device".
fn optional_device<'de, D>(deserializer: D) -> Result<Option<DeviceSelector>, D::Error>
where
    D: Deserializer<'de>,
{
    let device = Option::<DeviceSelector>::deserialize(deserializer)?;
    Ok(device.filter(|d| !matches!(d, DeviceSelector::Name(name) if name.trim().is_empty())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_init_camel_case() {
        let init = InitMessage::from_value(json!({
            "fileId": "abc",
            "inputType": "midi",
            "isPerformanceModel": true,
            "device": 3
        }))
        .unwrap();

        assert_eq!(init.file_id, "abc");
        assert_eq!(init.input_type, InputType::Midi);
        assert_eq!(init.mode(), SessionMode::PlaybackFile);
        assert_eq!(init.device, Some(DeviceSelector::Index(3)));
    }

    #[test]
    fn test_init_legacy_spelling() {
        let init = InitMessage::from_value(json!({
            "file_id": 17,
            "input_type": "audio",
            "isPerformceModel": false,
            "device": ""
        }))
        .unwrap();

        assert_eq!(init.file_id, "17");
        assert_eq!(init.input_type, InputType::Audio);
        assert_eq!(init.mode(), SessionMode::LiveDevice);
        assert_eq!(init.device, None);
    }

    #[test]
    fn test_init_defaults() {
        let init = InitMessage::from_value(json!({ "fileId": "x" })).unwrap();
        assert_eq!(init.input_type, InputType::Audio);
        assert!(!init.is_performance_model);
        assert_eq!(init.device, None);
    }

    #[test]
    fn test_init_rejects_missing_file_id() {
        let err = InitMessage::from_value(json!({ "inputType": "audio" })).unwrap_err();
        assert_eq!(err.kind(), "initialization");
    }

    #[test]
    fn test_init_rejects_blank_file_id() {
        assert!(InitMessage::from_value(json!({ "fileId": "  " })).is_err());
    }

    #[test]
    fn test_init_rejects_unknown_input_type() {
        assert!(InitMessage::from_value(json!({ "fileId": "a", "inputType": "video" })).is_err());
    }

    #[test]
    fn test_device_selector_index() {
        assert_eq!(DeviceSelector::Name(" 2 ".to_string()).as_index(), Some(2));
        assert_eq!(DeviceSelector::Name("Piano".to_string()).as_index(), None);
    }

    #[test]
    fn test_tuner_init() {
        assert_eq!(TunerInit::from_value(json!({ "deviceIndex": 4 })).unwrap().device_index, 4);
        assert_eq!(TunerInit::from_value(json!({ "device_index": 1 })).unwrap().device_index, 1);
        assert_eq!(TunerInit::from_value(json!({})).unwrap().device_index, 0);
        assert!(TunerInit::from_value(json!({ "deviceIndex": "left" })).is_err());
    }

    #[test]
    fn test_control_message() {
        let stop: ControlMessage = serde_json::from_value(json!({ "action": "stop" })).unwrap();
        assert!(stop.is_stop());
        let other: ControlMessage = serde_json::from_value(json!({ "action": "pause" })).unwrap();
        assert!(!other.is_stop());
    }

    #[test]
    fn test_server_message_shapes() {
        assert_eq!(
            serde_json::to_value(ServerMessage::position(4.5)).unwrap(),
            json!({ "beatPosition": 4.5 })
        );
        assert_eq!(
            serde_json::to_value(ServerMessage::completed()).unwrap(),
            json!({ "status": "completed" })
        );
        assert_eq!(
            serde_json::to_value(ServerMessage::error("boom")).unwrap(),
            json!({ "error": "boom" })
        );
        assert_eq!(
            serde_json::to_value(ServerMessage::no_sound()).unwrap(),
            json!({ "noSound": true })
        );
        assert_eq!(
            serde_json::to_value(ServerMessage::Pitch { frequency: 440.0, volume: 0.5 }).unwrap(),
            json!({ "frequency": 440.0, "volume": 0.5 })
        );
    }
}

//! Input device enumeration.

use cpal::traits::{DeviceTrait, HostTrait};
use midir::MidiInput;
use serde::Serialize;
use tracing::error;

pub const NO_AUDIO_DEVICES: &str = "No audio devices found";
pub const NO_MIDI_DEVICES: &str = "No midi devices found";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub index: usize,
    pub name: String,
}

impl DeviceInfo {
    pub fn new(index: usize, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
        }
    }

    fn placeholder(name: &str) -> Vec<Self> {
        vec![Self::new(0, name)]
    }
}

/// Move the first device named `default_name` to the front.
///
/// Order of the others is kept and nothing is duplicated.
pub fn order_default_first(mut devices: Vec<DeviceInfo>, default_name: Option<&str>) -> Vec<DeviceInfo> {
    if let Some(name) = default_name {
        if let Some(pos) = devices.iter().position(|d| d.name == name) {
            let default = devices.remove(pos);
            devices.insert(0, default);
        }
    }
    devices
}

/// Audio inputs, default device first.
pub fn list_audio_inputs() -> Vec<DeviceInfo> {
    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    let devices = match host.input_devices() {
        Ok(devices) => devices,
        Err(e) => {
            error!("error enumerating audio devices: {}", e);
            return DeviceInfo::placeholder(NO_AUDIO_DEVICES);
        }
    };

    let listed = devices
        .enumerate()
        .map(|(index, device)| {
            let name = device.name().unwrap_or_else(|_| format!("Input {}", index));
            DeviceInfo::new(index, name)
        })
        .collect();

    order_default_first(listed, default_name.as_deref())
}

/// MIDI input ports in system order.
pub fn list_midi_inputs() -> Vec<DeviceInfo> {
    let input = match MidiInput::new("scorefollow-devices") {
        Ok(input) => input,
        Err(e) => {
            error!("error opening MIDI client: {}", e);
            return DeviceInfo::placeholder(NO_MIDI_DEVICES);
        }
    };

    input
        .ports()
        .iter()
        .enumerate()
        .map(|(index, port)| {
            let name = input
                .port_name(port)
                .unwrap_or_else(|_| format!("MIDI {}", index));
            DeviceInfo::new(index, name)
        })
        .collect()
}

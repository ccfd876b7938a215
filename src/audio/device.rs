//! Audio output device enumeration

use cpal::traits::{DeviceTrait, HostTrait};

/// Information about an audio output device
#[derive(Debug, Clone)]
pub struct AudioDevice {
    pub name: String,
    pub is_default: bool,
}

/// List the playback devices the host exposes. Enumeration failures yield
/// an empty list; the receiver only ever opens the default device.
pub fn list_output_devices() -> Vec<AudioDevice> {
    let host = cpal::default_host();
    let default_name = host
        .default_output_device()
        .and_then(|device| device.name().ok());

    let mut devices = Vec::new();
    let Ok(outputs) = host.output_devices() else {
        return devices;
    };
    for device in outputs {
        let Ok(name) = device.name() else {
            continue;
        };
        let is_default = default_name.as_deref() == Some(name.as_str());
        devices.push(AudioDevice { name, is_default });
    }
    devices
}

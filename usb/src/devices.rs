// Finding audio devices on the bus and checking we're allowed to talk to them. This stands in
// for the platform's permission prompt: a handle is only produced when the device could actually
// be opened, a refusal comes back as PermissionDenied rather than a handle that fails later.
use crate::device::descriptor::{has_audio_interface, read_alt_settings, select_streaming_endpoint};
use crate::error::AcquireError;
use log::{debug, warn};
use rusb::{Device, GlobalContext};
use uac_types::DeviceHandle;

#[derive(Debug, Clone)]
pub struct AudioDevice {
    pub handle: DeviceHandle,

    /// Whether the device has an AudioStreaming interface we can capture from.
    pub can_capture: bool,
}

pub fn find_audio_devices() -> Vec<AudioDevice> {
    let mut found_devices = Vec::new();

    if let Ok(devices) = rusb::devices() {
        for device in devices.iter() {
            if let Some(found) = describe(&device) {
                found_devices.push(found);
            }
        }
    }

    found_devices
}

fn describe(device: &Device<GlobalContext>) -> Option<AudioDevice> {
    let descriptor = device.device_descriptor().ok()?;
    let settings = match read_alt_settings(device) {
        Ok(settings) => settings,
        Err(e) => {
            debug!("Unable to read configuration of {:?}: {}", device, e);
            return None;
        }
    };

    if !has_audio_interface(&settings) {
        return None;
    }

    let handle = DeviceHandle::by_location(
        descriptor.vendor_id(),
        descriptor.product_id(),
        device.bus_number(),
        device.address(),
    );
    debug!("Audio class device: {}", handle);

    Some(AudioDevice {
        handle,
        can_capture: select_streaming_endpoint(&settings).is_some(),
    })
}

/// Produces a handle for the device at the given location, as long as we have permission to
/// open it.
pub fn acquire(bus_number: u8, address: u8) -> Result<DeviceHandle, AcquireError> {
    let location = format!("{:03}/{:03}", bus_number, address);

    for device in rusb::devices()?.iter() {
        if device.bus_number() != bus_number || device.address() != address {
            continue;
        }

        let descriptor = device.device_descriptor()?;
        return match device.open() {
            // The trial handle is dropped here, the session opens its own.
            Ok(_) => Ok(DeviceHandle::by_location(
                descriptor.vendor_id(),
                descriptor.product_id(),
                bus_number,
                address,
            )),
            Err(e) => Err(open_error(location, e)),
        };
    }

    Err(AcquireError::DeviceNotFound(location))
}

// A refused open is the platform withholding permission, not a fault.
fn open_error(location: String, error: rusb::Error) -> AcquireError {
    match error {
        rusb::Error::Access => {
            warn!("Permission denied for device {}", location);
            AcquireError::PermissionDenied(location)
        }
        rusb::Error::NoDevice | rusb::Error::NotFound => AcquireError::DeviceNotFound(location),
        e => AcquireError::UsbError(e),
    }
}

/// The first audio device with a capture interface, if we're permitted to use it.
pub fn acquire_first_capture_device() -> Result<DeviceHandle, AcquireError> {
    let device = find_audio_devices()
        .into_iter()
        .find(|device| device.can_capture)
        .ok_or_else(|| AcquireError::DeviceNotFound(String::from("any location")))?;

    acquire(device.handle.bus_number(), device.handle.device_number())
}

use anyhow::{bail, Result};
use cpal::traits::{DeviceTrait, HostTrait};
use cpal::Device;
use log::{debug, info};

/// Finds an output device named as 'HOST*DEVICE', falling back to the default output.
pub(crate) fn get_output_device(device: Option<&str>) -> Result<Device> {
    // Basically, if *ANYTHING* goes wrong here, we'll fall through to default.
    if let Some(device_name) = device {
        debug!("Looking for Device: {}", device_name);
        if let Some(found) = find_named(device_name) {
            info!(
                "Output device found: {}",
                found.name().unwrap_or_else(|_| String::from("UNKNOWN"))
            );
            return Ok(found);
        }
        info!("Output device {} not found, using default", device_name);
    }

    match cpal::default_host().default_output_device() {
        Some(device) => Ok(device),
        None => bail!("Unable to find Default Device"),
    }
}

fn find_named(device_name: &str) -> Option<Device> {
    let (str_host, str_device) = device_name.split_once('*')?;

    let host_id = cpal::available_hosts()
        .into_iter()
        .find(|host| host.name() == str_host)?;
    debug!("Host {} found, checking devices", host_id.name());

    let host = cpal::host_from_id(host_id).ok()?;
    let mut devices = host.output_devices().ok()?;
    devices.find(|device| {
        device.name().unwrap_or_else(|_| String::from("UNKNOWN")) == str_device
    })
}

pub fn get_outputs() -> Vec<String> {
    let mut list = vec![];

    for host_id in cpal::available_hosts() {
        let Ok(host) = cpal::host_from_id(host_id) else {
            continue;
        };
        if let Ok(devices) = host.output_devices() {
            for device in devices {
                if let Ok(name) = device.name() {
                    list.push(format!("{}*{}", host_id.name(), name));
                }
            }
        }
    }
    list
}

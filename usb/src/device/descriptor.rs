// Locating the AudioStreaming interface we capture from. The descriptors are first copied into
// plain structs so the selection itself doesn't need a live device.
use rusb::{Device, Direction, TransferType, UsbContext};
use uac_types::{CLASS_AUDIO, SUBCLASS_AUDIO_STREAMING};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    pub address: u8,
    pub input: bool,
    pub isochronous: bool,
    pub max_packet_size: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AltSettingInfo {
    pub interface: u8,
    pub setting: u8,
    pub class_code: u8,
    pub sub_class_code: u8,
    pub endpoints: Vec<EndpointInfo>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StreamingEndpoint {
    pub interface: u8,
    pub alt_setting: u8,
    pub address: u8,
    pub max_packet_size: u16,
}

impl StreamingEndpoint {
    /// Bytes per isochronous packet, the high bandwidth multiplier bits are masked off.
    pub fn packet_size(&self) -> usize {
        (self.max_packet_size & 0x07ff) as usize
    }
}

/// Picks the first AudioStreaming alternate setting which has an isochronous IN endpoint.
///
/// Alt setting 0 of a streaming interface is the zero bandwidth setting, with no endpoints, so
/// it's skipped naturally.
pub fn select_streaming_endpoint(settings: &[AltSettingInfo]) -> Option<StreamingEndpoint> {
    settings
        .iter()
        .filter(|alt| alt.class_code == CLASS_AUDIO && alt.sub_class_code == SUBCLASS_AUDIO_STREAMING)
        .find_map(|alt| {
            alt.endpoints
                .iter()
                .find(|endpoint| endpoint.input && endpoint.isochronous)
                .map(|endpoint| StreamingEndpoint {
                    interface: alt.interface,
                    alt_setting: alt.setting,
                    address: endpoint.address,
                    max_packet_size: endpoint.max_packet_size,
                })
        })
}

pub fn read_alt_settings<T: UsbContext>(device: &Device<T>) -> Result<Vec<AltSettingInfo>, rusb::Error> {
    let config = device.config_descriptor(0)?;
    let mut settings = vec![];

    for interface in config.interfaces() {
        for alt in interface.descriptors() {
            let endpoints = alt
                .endpoint_descriptors()
                .map(|endpoint| EndpointInfo {
                    address: endpoint.address(),
                    input: endpoint.direction() == Direction::In,
                    isochronous: endpoint.transfer_type() == TransferType::Isochronous,
                    max_packet_size: endpoint.max_packet_size(),
                })
                .collect();

            settings.push(AltSettingInfo {
                interface: alt.interface_number(),
                setting: alt.setting_number(),
                class_code: alt.class_code(),
                sub_class_code: alt.sub_class_code(),
                endpoints,
            });
        }
    }
    Ok(settings)
}

pub fn has_audio_interface(settings: &[AltSettingInfo]) -> bool {
    settings.iter().any(|alt| alt.class_code == CLASS_AUDIO)
}

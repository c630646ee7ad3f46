use byteorder::{ByteOrder, LittleEndian};
use std::fmt::{Debug, Formatter};
use strum::{Display, EnumIter, FromRepr};

// USB Audio Class interface codes, as they appear in the interface descriptors.
pub const CLASS_AUDIO: u8 = 0x01;
pub const SUBCLASS_AUDIO_CONTROL: u8 = 0x01;
pub const SUBCLASS_AUDIO_STREAMING: u8 = 0x02;

/// The identity of a USB device that we've been granted access to.
///
/// A handle is produced once by the acquisition layer, and is never modified afterwards. The
/// file descriptor (when present) belongs to that layer, and stays valid until it's revoked
/// there, so a session built on this handle must not outlive it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    vendor_id: u16,
    product_id: u16,
    file_descriptor: i32,
    bus_number: u8,
    device_number: u8,
}

impl DeviceHandle {
    /// Used when the platform hands us an already opened descriptor for the device.
    pub fn new(
        vendor_id: u16,
        product_id: u16,
        file_descriptor: i32,
        bus_number: u8,
        device_number: u8,
    ) -> Self {
        Self {
            vendor_id,
            product_id,
            file_descriptor,
            bus_number,
            device_number,
        }
    }

    /// Used when there's no pre-opened descriptor, the device will be opened by location.
    pub fn by_location(vendor_id: u16, product_id: u16, bus_number: u8, device_number: u8) -> Self {
        Self::new(vendor_id, product_id, -1, bus_number, device_number)
    }

    pub fn vendor_id(&self) -> u16 {
        self.vendor_id
    }
    pub fn product_id(&self) -> u16 {
        self.product_id
    }
    pub fn file_descriptor(&self) -> Option<i32> {
        if self.file_descriptor >= 0 {
            return Some(self.file_descriptor);
        }
        None
    }
    pub fn bus_number(&self) -> u8 {
        self.bus_number
    }
    pub fn device_number(&self) -> u8 {
        self.device_number
    }
}

impl std::fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:04x}:{:04x} at {:03}/{:03}",
            self.vendor_id, self.product_id, self.bus_number, self.device_number
        )
    }
}

/// Description of an interleaved PCM stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl PcmFormat {
    /// The only format the relay carries, 48kHz 16bit signed stereo.
    pub const STEREO_48K_S16: PcmFormat = PcmFormat {
        sample_rate: 48_000,
        channels: 2,
        bits_per_sample: 16,
    };

    pub fn bytes_per_sample(&self) -> usize {
        self.bits_per_sample as usize / 8
    }

    /// Bytes used by a single sample across all channels.
    pub fn bytes_per_frame(&self) -> usize {
        self.bytes_per_sample() * self.channels as usize
    }

    pub fn bytes_per_second(&self) -> usize {
        self.bytes_per_frame() * self.sample_rate as usize
    }

    /// How many bytes are needed to hold `millis` of audio, rounded down to a whole frame.
    pub fn bytes_for_millis(&self, millis: usize) -> usize {
        let frames = (self.sample_rate as usize * millis) / 1000;
        frames * self.bytes_per_frame()
    }

    /// The UAC1 sampling frequency control payload (3 bytes, little endian).
    pub fn sample_rate_payload(&self) -> [u8; 3] {
        let mut payload = [0; 3];
        LittleEndian::write_u24(&mut payload, self.sample_rate);
        payload
    }
}

/// One block of PCM received from the device.
///
/// The bytes are owned by the frame, they've been copied out of whatever buffer the USB layer
/// used, so a frame can be moved between threads freely. Once built it can't be changed.
#[derive(Clone, PartialEq, Eq)]
pub struct AudioFrame {
    data: Box<[u8]>,
}

impl AudioFrame {
    pub fn new(data: impl Into<Box<[u8]>>) -> Self {
        Self { data: data.into() }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Iterates the little endian 16bit samples, a trailing odd byte is ignored.
    pub fn samples(&self) -> impl Iterator<Item = i16> + '_ {
        self.data.chunks_exact(2).map(LittleEndian::read_i16)
    }
}

impl Debug for AudioFrame {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioFrame")
            .field("len", &self.data.len())
            .finish()
    }
}

impl From<Vec<u8>> for AudioFrame {
    fn from(value: Vec<u8>) -> Self {
        Self::new(value)
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, Display, EnumIter, FromRepr, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Opening,
    Ready,
    Running,
    Stopping,
    Closed,
    Failed,
}

impl SessionState {
    /// States in which the native side holds device resources.
    pub fn is_open(&self) -> bool {
        matches!(self, SessionState::Ready | SessionState::Running)
    }
}

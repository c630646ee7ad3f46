pub use rusb;
pub mod devices;
pub mod error;

mod device;

pub use device::base::NativeSession;
pub use device::descriptor::StreamingEndpoint;
pub use device::libusb::device::LibUsbSession;

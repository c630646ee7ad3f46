pub mod base;
pub mod descriptor;
pub mod libusb;

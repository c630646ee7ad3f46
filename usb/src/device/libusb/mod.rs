pub mod device;
pub mod transfer;

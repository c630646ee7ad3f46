pub mod device;
pub mod playback;

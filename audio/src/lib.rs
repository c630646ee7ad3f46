mod audio;
mod error;
mod sink;
mod tap;
mod wav;

#[cfg(all(target_os = "linux", feature = "pulse"))]
mod pulse;

#[cfg(feature = "cpal")]
mod cpal;

pub use crate::audio::{
    get_output_opener, AudioOutput, AudioSpecification, OpenOutputStream, OutputTarget,
};
pub use crate::error::SinkError;
pub use crate::sink::{AudioSink, Delivery, FrameObserver, SinkConfig, SinkHandle, SinkStats};
pub use crate::tap::{tap_observer, SampleTap};
pub use crate::wav::WavOpener;

/// Names of the output devices the platform backend can be pointed at.
pub fn get_audio_outputs() -> Vec<String> {
    #[cfg(feature = "cpal")]
    {
        crate::cpal::device::get_outputs()
    }

    #[cfg(not(feature = "cpal"))]
    {
        Vec::new()
    }
}

use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;
use uac_types::PcmFormat;

/// An open, streaming PCM output.
///
/// Writes block while the output's buffer is full, but no longer than the specification's
/// write timeout, after which they fail.
pub trait AudioOutput: Send {
    fn write(&mut self, pcm: &[u8]) -> Result<()>;
    fn play(&mut self) -> Result<()>;
    fn pause(&mut self) -> Result<()>;
    fn release(&mut self);
}

pub trait OpenOutputStream: Send + Sync {
    /// The smallest buffer, in bytes, the output can stream this format with.
    fn min_buffer_size(&self, spec: &AudioSpecification) -> Result<usize>;
    fn open(&self, spec: AudioSpecification) -> Result<Box<dyn AudioOutput>>;
}

#[derive(Debug, Clone)]
pub struct AudioSpecification {
    pub format: PcmFormat,
    pub buffer_size: usize,
    pub device: Option<String>,
    pub write_timeout: Duration,
}

#[derive(Debug, Clone)]
pub enum OutputTarget {
    /// The platform's playback system, optionally a named device.
    Platform(Option<String>),
    Wav(PathBuf),
}

pub fn get_output_opener(target: &OutputTarget) -> Result<Box<dyn OpenOutputStream>> {
    match target {
        OutputTarget::Wav(path) => Ok(Box::new(crate::wav::WavOpener::new(path.clone()))),
        OutputTarget::Platform(_) => get_platform_opener(),
    }
}

#[cfg(all(target_os = "linux", feature = "pulse"))]
fn get_platform_opener() -> Result<Box<dyn OpenOutputStream>> {
    Ok(Box::new(crate::pulse::playback::PulseOpener))
}

#[cfg(all(not(all(target_os = "linux", feature = "pulse")), feature = "cpal"))]
fn get_platform_opener() -> Result<Box<dyn OpenOutputStream>> {
    Ok(Box::new(crate::cpal::playback::CpalOpener))
}

#[cfg(not(any(all(target_os = "linux", feature = "pulse"), feature = "cpal")))]
fn get_platform_opener() -> Result<Box<dyn OpenOutputStream>> {
    anyhow::bail!("No platform audio output was built in, enable the 'pulse' or 'cpal' feature")
}

use crate::audio::{AudioOutput, AudioSpecification, OpenOutputStream};
use anyhow::{anyhow, bail, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use hound::{SampleFormat, WavSpec, WavWriter};
use log::{debug, info, warn};
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

// A file never fills up, so any reasonable chunk will do.
const MIN_BUFFER_MILLIS: usize = 20;

pub struct WavOpener {
    path: PathBuf,
}

impl WavOpener {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl OpenOutputStream for WavOpener {
    fn min_buffer_size(&self, spec: &AudioSpecification) -> Result<usize> {
        Ok(spec.format.bytes_for_millis(MIN_BUFFER_MILLIS))
    }

    fn open(&self, spec: AudioSpecification) -> Result<Box<dyn AudioOutput>> {
        if spec.format.bits_per_sample != 16 {
            bail!("Only 16bit PCM can be written to WAV");
        }

        let wav_spec = WavSpec {
            channels: spec.format.channels,
            sample_rate: spec.format.sample_rate,
            bits_per_sample: spec.format.bits_per_sample,
            sample_format: SampleFormat::Int,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Could not create {}", parent.display()))?;
            }
        }

        let writer = WavWriter::create(&self.path, wav_spec)
            .with_context(|| format!("Could not create {}", self.path.display()))?;
        info!("Writing audio to {}", self.path.display());

        Ok(Box::new(WavOutput {
            writer: Some(writer),
            path: self.path.clone(),
        }))
    }
}

struct WavOutput {
    writer: Option<WavWriter<BufWriter<File>>>,
    path: PathBuf,
}

impl AudioOutput for WavOutput {
    fn write(&mut self, pcm: &[u8]) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| anyhow!("WAV output has been released"))?;

        if pcm.len() % 2 != 0 {
            bail!("Odd number of bytes ({}) in 16bit PCM", pcm.len());
        }

        for chunk in pcm.chunks_exact(2) {
            writer.write_sample(LittleEndian::read_i16(chunk))?;
        }
        Ok(())
    }

    fn play(&mut self) -> Result<()> {
        debug!("WAV output playing");
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    fn release(&mut self) {
        if let Some(writer) = self.writer.take() {
            let samples = writer.len();
            match writer.finalize() {
                Ok(()) => info!("Wrote {} samples to {}", samples, self.path.display()),
                Err(e) => warn!("Failed to finalise {}: {}", self.path.display(), e),
            }
        }
    }
}

impl Drop for WavOutput {
    fn drop(&mut self) {
        self.release();
    }
}

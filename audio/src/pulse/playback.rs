use crate::audio::{AudioOutput, AudioSpecification, OpenOutputStream};
use anyhow::{anyhow, bail, Result};
use libpulse_binding::def::BufferAttr;
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_binding::time::MicroSeconds;
use libpulse_simple_binding::Simple;
use log::debug;

// Pulse will happily stream smaller chunks than this, but it's where underruns start.
const MIN_LATENCY: MicroSeconds = MicroSeconds(25_000);

pub(crate) struct PulseOpener;

impl PulseOpener {
    fn pulse_spec(spec: &AudioSpecification) -> Result<Spec> {
        if spec.format.bits_per_sample != 16 {
            bail!("Pulse playback only supports 16bit PCM");
        }

        let pulse_spec = Spec {
            format: Format::S16le,
            channels: spec.format.channels as u8,
            rate: spec.format.sample_rate,
        };

        if !pulse_spec.is_valid() {
            // Invalid Specification, Error Out..
            bail!("Invalid Pulse Specification");
        }
        Ok(pulse_spec)
    }
}

impl OpenOutputStream for PulseOpener {
    fn min_buffer_size(&self, spec: &AudioSpecification) -> Result<usize> {
        Ok(Self::pulse_spec(spec)?.usec_to_bytes(MIN_LATENCY))
    }

    fn open(&self, spec: AudioSpecification) -> Result<Box<dyn AudioOutput>> {
        let pulse_spec = Self::pulse_spec(&spec)?;

        // Target the buffer we were asked for, leave the rest to the server.
        let pulse_buffer_attributes = BufferAttr {
            maxlength: u32::MAX,
            tlength: spec.buffer_size as u32,
            prebuf: u32::MAX,
            minreq: u32::MAX,
            fragsize: u32::MAX,
        };

        let pulse = Simple::new(
            None,
            env!("CARGO_PKG_NAME"),
            Direction::Playback,
            spec.device.as_deref(),
            "USB Audio",
            &pulse_spec,
            None,
            Some(&pulse_buffer_attributes),
        )
        .map_err(|e| anyhow!("Unable to Connect to Pulse: {}", e))?;

        debug!("Pulse stream open, target length {} bytes", spec.buffer_size);
        Ok(Box::new(PulsePlayback {
            pulse_simple: Some(pulse),
            paused: true,
            held: HeldAudio::new(spec.buffer_size),
        }))
    }
}

// The simple API can't cork a stream, so audio written while paused is held here and played
// ahead of anything newer once playback resumes.
struct PulsePlayback {
    pulse_simple: Option<Simple>,
    paused: bool,
    held: HeldAudio,
}

impl AudioOutput for PulsePlayback {
    fn write(&mut self, pcm: &[u8]) -> Result<()> {
        let pulse = self
            .pulse_simple
            .as_ref()
            .ok_or_else(|| anyhow!("Pulse stream has been released"))?;
        if self.paused {
            return self.held.hold(pcm);
        }

        // Blocks until the server has room for all of it.
        pulse
            .write(pcm)
            .map_err(|e| anyhow!("Pulse write failed: {}", e))
    }

    fn play(&mut self) -> Result<()> {
        self.paused = false;

        let held = self.held.take();
        if let (Some(pulse), false) = (&self.pulse_simple, held.is_empty()) {
            debug!("Playing {} bytes held while paused", held.len());
            pulse
                .write(&held)
                .map_err(|e| anyhow!("Pulse write failed: {}", e))?;
        }
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.paused = true;
        if let Some(pulse) = &self.pulse_simple {
            pulse
                .drain()
                .map_err(|e| anyhow!("Pulse drain failed: {}", e))?;
        }
        Ok(())
    }

    fn release(&mut self) {
        self.held.take();
        if let Some(pulse) = self.pulse_simple.take() {
            let _ = pulse.flush();
        }
    }
}

struct HeldAudio {
    buffer: Vec<u8>,
    capacity: usize,
}

impl HeldAudio {
    fn new(capacity: usize) -> Self {
        Self {
            buffer: Vec::new(),
            capacity,
        }
    }

    // Nothing can play this out until the sink is started again, so once the output buffer's
    // worth is held further writes fail rather than wait.
    fn hold(&mut self, pcm: &[u8]) -> Result<()> {
        if self.buffer.len() + pcm.len() > self.capacity {
            bail!(
                "Playback is paused with {} of {} bytes already held",
                self.buffer.len(),
                self.capacity
            );
        }
        self.buffer.extend_from_slice(pcm);
        Ok(())
    }

    fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }
}

use crate::audio::{AudioOutput, AudioSpecification, OpenOutputStream};
use crate::cpal::device::get_output_device;
use anyhow::{anyhow, bail, Result};
use byteorder::{ByteOrder, LittleEndian};
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::SupportedBufferSize;
use crossbeam_channel::{bounded, unbounded, Sender};
use log::{debug, warn};
use rb::{Producer, RbConsumer, RbError, RbProducer, SpscRb, RB};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

// Used when the device won't tell us its own minimum.
const FALLBACK_MIN_MILLIS: usize = 20;

enum Command {
    Play,
    Pause,
    Release,
}

pub(crate) struct CpalOpener;

impl OpenOutputStream for CpalOpener {
    fn min_buffer_size(&self, spec: &AudioSpecification) -> Result<usize> {
        let device = get_output_device(spec.device.as_deref())?;
        let config = device.default_output_config()?;

        let frames = match config.buffer_size() {
            SupportedBufferSize::Range { min, .. } if *min > 0 => *min as usize,
            _ => return Ok(spec.format.bytes_for_millis(FALLBACK_MIN_MILLIS)),
        };
        Ok(frames * spec.format.bytes_per_frame())
    }

    fn open(&self, spec: AudioSpecification) -> Result<Box<dyn AudioOutput>> {
        // The ring buffer is in samples, not bytes.
        let buffer = SpscRb::<i16>::new(spec.buffer_size / spec.format.bytes_per_sample());
        let producer = buffer.producer();
        let consumer = buffer.consumer();

        let stream_closed = Arc::new(AtomicBool::new(false));
        let stream_closed_inner = stream_closed.clone();

        let (command_tx, command_rx) = unbounded::<Command>();
        let (ready_tx, ready_rx) = bounded::<Result<()>>(1);

        // CPAL streams can't leave the thread that built them on every platform, so one thread
        // owns the stream for its whole life and takes orders over a channel.
        let thread_spec = spec.clone();
        let owner = thread::Builder::new()
            .name(String::from("cpal-output"))
            .spawn(move || {
                let build = || -> Result<cpal::Stream> {
                    let device = get_output_device(thread_spec.device.as_deref())?;
                    let config = cpal::StreamConfig {
                        channels: thread_spec.format.channels as cpal::ChannelCount,
                        sample_rate: cpal::SampleRate(thread_spec.format.sample_rate),
                        buffer_size: cpal::BufferSize::Default,
                    };

                    let stream = device.build_output_stream(
                        &config,
                        move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                            let written = consumer.read(data).unwrap_or(0);

                            // Underrun, pad with silence.
                            data[written..].iter_mut().for_each(|s| *s = 0);
                        },
                        move |e| {
                            warn!("Error on Playback Stream, Stopping.. {}", e);
                            stream_closed_inner.store(true, Ordering::Relaxed);
                        },
                        Some(Duration::from_millis(500)),
                    )?;
                    Ok(stream)
                };

                let stream = match build() {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                while let Ok(command) = command_rx.recv() {
                    let result = match command {
                        Command::Play => stream.play().map_err(|e| e.to_string()),
                        Command::Pause => stream.pause().map_err(|e| e.to_string()),
                        Command::Release => break,
                    };
                    if let Err(e) = result {
                        warn!("Playback stream control failed: {}", e);
                    }
                }
                debug!("CPAL output thread stopping");
            })?;

        ready_rx
            .recv()
            .map_err(|_| anyhow!("CPAL output thread exited during setup"))??;

        Ok(Box::new(CpalPlayback {
            producer,
            stream_closed,
            commands: command_tx,
            owner: Some(owner),
            write_timeout: spec.write_timeout,
        }))
    }
}

struct CpalPlayback {
    producer: Producer<i16>,
    stream_closed: Arc<AtomicBool>,

    commands: Sender<Command>,
    owner: Option<JoinHandle<()>>,
    write_timeout: Duration,
}

impl CpalPlayback {
    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| anyhow!("Playback stream has gone away"))
    }
}

impl AudioOutput for CpalPlayback {
    fn write(&mut self, pcm: &[u8]) -> Result<()> {
        if self.owner.is_none() {
            bail!("Stream has been released");
        }
        if self.stream_closed.load(Ordering::Relaxed) {
            bail!("Stream has been closed");
        }

        // Do nothing if there are no samples sent..
        if pcm.is_empty() {
            return Ok(());
        }

        let mut samples = vec![0i16; pcm.len() / 2];
        LittleEndian::read_i16_into(&pcm[..samples.len() * 2], &mut samples);

        write_until(&self.producer, &samples, self.write_timeout, &self.stream_closed)
    }

    fn play(&mut self) -> Result<()> {
        self.send(Command::Play)
    }

    fn pause(&mut self) -> Result<()> {
        self.send(Command::Pause)
    }

    fn release(&mut self) {
        if let Some(owner) = self.owner.take() {
            let _ = self.commands.send(Command::Release);
            if owner.join().is_err() {
                warn!("CPAL output thread panicked");
            }
        }
    }
}

// Blocks on the ring buffer until every sample is queued, or the timeout runs out.
fn write_until(
    producer: &Producer<i16>,
    samples: &[i16],
    timeout: Duration,
    closed: &AtomicBool,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let mut position = 0;
    while position < samples.len() {
        if closed.load(Ordering::Relaxed) {
            bail!("Stream closed while writing");
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        match producer.write_blocking_timeout(&samples[position..], remaining) {
            Ok(Some(written)) => position += written,
            Ok(None) => break,
            Err(RbError::TimedOut) => bail!(
                "Output still full after {}ms, {} samples unwritten",
                timeout.as_millis(),
                samples.len() - position
            ),
            Err(e) => bail!("Ring buffer write failed: {}", e),
        }
    }
    Ok(())
}

impl Drop for CpalPlayback {
    fn drop(&mut self) {
        self.release();
    }
}

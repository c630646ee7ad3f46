// Stand-ins for the device and the speaker, so the state machine and the loop can be driven
// without hardware.
use anyhow::Result;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use uac_audio::{AudioOutput, AudioSink, AudioSpecification, OpenOutputStream, SinkConfig};
use uac_types::{AudioFrame, DeviceHandle};
use uac_usb::error::{NativeError, StepError};
use uac_usb::{rusb, NativeSession};

pub(crate) enum Scripted {
    Frames(Vec<Vec<u8>>),
    Transient,
    Detach,
    Fatal,
}

#[derive(Default)]
pub(crate) struct NativeTally {
    pub opens: usize,
    pub starts: usize,
    pub stops: usize,
    pub closes: usize,

    pub fail_open: bool,
    pub fail_start: bool,

    /// Start reports the device gone, the way libusb does for an unplugged device.
    pub detach_on_start: bool,

    /// Consumed one entry per step while running.
    pub script: VecDeque<Scripted>,

    /// How long a step that has a script entry takes before returning it.
    pub step_delay: Duration,
}

pub(crate) type Tally = Arc<Mutex<NativeTally>>;

pub(crate) struct ScriptedNative {
    tally: Tally,
    open: bool,
    running: bool,
    bytes: u64,
}

impl ScriptedNative {
    pub fn new() -> (Self, Tally) {
        let tally = Tally::default();
        let native = Self {
            tally: tally.clone(),
            open: false,
            running: false,
            bytes: 0,
        };
        (native, tally)
    }
}

impl NativeSession for ScriptedNative {
    fn open(&mut self, handle: &DeviceHandle) -> Result<(), NativeError> {
        let mut tally = self.tally.lock().unwrap();
        tally.opens += 1;
        if tally.fail_open {
            return Err(NativeError::DeviceNotFound(format!(
                "{:03}/{:03}",
                handle.bus_number(),
                handle.device_number()
            )));
        }
        self.open = true;
        Ok(())
    }

    fn start(&mut self) -> Result<(), NativeError> {
        if !self.open {
            return Err(NativeError::NotOpen);
        }
        let mut tally = self.tally.lock().unwrap();
        if tally.detach_on_start {
            return Err(NativeError::UsbError(rusb::Error::NoDevice));
        }
        if tally.fail_start {
            return Err(NativeError::TransferAllocation);
        }
        tally.starts += 1;
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), NativeError> {
        if self.running {
            self.tally.lock().unwrap().stops += 1;
            self.running = false;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), NativeError> {
        if self.open {
            self.tally.lock().unwrap().closes += 1;
            self.open = false;
            self.running = false;
        }
        Ok(())
    }

    fn step(&mut self, deliver: &mut dyn FnMut(AudioFrame)) -> Result<usize, StepError> {
        let next = if self.running {
            let mut tally = self.tally.lock().unwrap();
            tally.script.pop_front().map(|next| (next, tally.step_delay))
        } else {
            None
        };

        let Some((next, delay)) = next else {
            thread::sleep(Duration::from_millis(1));
            return Ok(0);
        };
        thread::sleep(delay);

        match next {
            Scripted::Frames(frames) => {
                let count = frames.len();
                for frame in frames {
                    self.bytes += frame.len() as u64;
                    deliver(AudioFrame::from(frame));
                }
                Ok(count)
            }
            Scripted::Transient => Err(StepError::Transient(String::from("scripted"))),
            Scripted::Detach => Err(StepError::Detached),
            Scripted::Fatal => Err(StepError::Fatal(String::from("scripted"))),
        }
    }

    fn measure(&self) -> u64 {
        self.bytes
    }
}

#[derive(Default)]
pub(crate) struct Captured {
    pub bytes: Vec<u8>,
    pub releases: usize,
    pub playing: bool,
}

pub(crate) type Memory = Arc<Mutex<Captured>>;

struct MemoryOpener {
    memory: Memory,
}

impl OpenOutputStream for MemoryOpener {
    fn min_buffer_size(&self, spec: &AudioSpecification) -> Result<usize> {
        Ok(spec.format.bytes_for_millis(10))
    }

    fn open(&self, _: AudioSpecification) -> Result<Box<dyn AudioOutput>> {
        Ok(Box::new(MemoryOutput {
            memory: self.memory.clone(),
        }))
    }
}

struct MemoryOutput {
    memory: Memory,
}

impl AudioOutput for MemoryOutput {
    fn write(&mut self, pcm: &[u8]) -> Result<()> {
        self.memory.lock().unwrap().bytes.extend_from_slice(pcm);
        Ok(())
    }

    fn play(&mut self) -> Result<()> {
        self.memory.lock().unwrap().playing = true;
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.memory.lock().unwrap().playing = false;
        Ok(())
    }

    fn release(&mut self) {
        self.memory.lock().unwrap().releases += 1;
    }
}

/// A sink that records everything written to it. It still needs setting up.
pub(crate) fn memory_sink() -> (Arc<AudioSink>, Memory) {
    let memory = Memory::default();
    let opener = MemoryOpener {
        memory: memory.clone(),
    };
    let sink = AudioSink::new(Box::new(opener), SinkConfig::default());
    (Arc::new(sink), memory)
}

pub(crate) fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

use crate::audio::{AudioOutput, AudioSpecification, OpenOutputStream};
use crate::error::SinkError;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uac_types::{AudioFrame, PcmFormat};

/// Called with every frame successfully written to the output, in delivery order.
pub type FrameObserver = Arc<dyn Fn(&AudioFrame) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// How much audio the output buffer should hold, the platform minimum wins if it's larger.
    pub buffer_millis: usize,

    /// Longest a single push may block on a full output before it's counted as failed.
    pub write_timeout: Duration,

    pub device: Option<String>,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            buffer_millis: 200,
            write_timeout: Duration::from_millis(500),
            device: None,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SinkHandle {
    pub generation: u64,
    pub buffer_size: usize,
}

/// What happened to a pushed frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Delivery {
    Written,

    /// The output refused the write, the frame is lost but the sink carries on.
    WriteFailed,

    /// There's no output (never set up, or released), the frame was discarded.
    NoOutput,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct SinkStats {
    pub frames_written: u64,
    pub bytes_written: u64,
    pub write_failures: u64,
    pub frames_dropped: u64,
}

struct ActiveOutput {
    handle: SinkHandle,
    output: Box<dyn AudioOutput>,
    playing: bool,
}

pub struct AudioSink {
    opener: Box<dyn OpenOutputStream>,
    config: SinkConfig,
    format: PcmFormat,

    output: Mutex<Option<ActiveOutput>>,
    observer: Mutex<Option<FrameObserver>>,

    generation: AtomicU64,
    frames_written: AtomicU64,
    bytes_written: AtomicU64,
    write_failures: AtomicU64,
    frames_dropped: AtomicU64,
}

impl AudioSink {
    pub fn new(opener: Box<dyn OpenOutputStream>, config: SinkConfig) -> Self {
        Self {
            opener,
            config,
            format: PcmFormat::STEREO_48K_S16,

            output: Mutex::new(None),
            observer: Mutex::new(None),

            generation: AtomicU64::new(0),
            frames_written: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        }
    }

    pub fn format(&self) -> PcmFormat {
        self.format
    }

    /// Opens a fresh output, tearing down any previous one first.
    pub fn setup(&self, observer: Option<FrameObserver>) -> Result<SinkHandle, SinkError> {
        self.release();

        let mut spec = AudioSpecification {
            format: self.format,
            buffer_size: 0,
            device: self.config.device.clone(),
            write_timeout: self.config.write_timeout,
        };

        let minimum = self
            .opener
            .min_buffer_size(&spec)
            .map_err(|e| SinkError::ResourceUnavailable(e.to_string()))?;
        if minimum == 0 {
            return Err(SinkError::InvalidBufferSize(minimum));
        }

        let requested = self.format.bytes_for_millis(self.config.buffer_millis);
        let frame = self.format.bytes_per_frame();
        let buffer_size = minimum.max(requested).div_ceil(frame) * frame;
        spec.buffer_size = buffer_size;
        debug!(
            "Output buffer: {} bytes (minimum {}, requested {})",
            buffer_size, minimum, requested
        );

        let output = self
            .opener
            .open(spec)
            .map_err(|e| SinkError::ResourceUnavailable(e.to_string()))?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = SinkHandle {
            generation,
            buffer_size,
        };

        *lock(&self.observer) = observer;
        *lock(&self.output) = Some(ActiveOutput {
            handle,
            output,
            playing: false,
        });

        info!("Audio output ready, {} byte buffer", buffer_size);
        Ok(handle)
    }

    /// The currently open output, if any.
    pub fn handle(&self) -> Option<SinkHandle> {
        lock(&self.output).as_ref().map(|active| active.handle)
    }

    pub fn start(&self) {
        let mut output = lock(&self.output);
        let Some(active) = output.as_mut() else {
            debug!("Start requested with no output, ignoring");
            return;
        };
        if active.playing {
            return;
        }
        match active.output.play() {
            Ok(()) => active.playing = true,
            Err(e) => warn!("Unable to start playback: {}", e),
        }
    }

    pub fn stop(&self) {
        let mut output = lock(&self.output);
        if let Some(active) = output.as_mut() {
            if !active.playing {
                return;
            }
            if let Err(e) = active.output.pause() {
                warn!("Unable to pause playback: {}", e);
            }
            active.playing = false;
        }
    }

    /// Writes the frame to the output, blocking while the output is full, then hands it to
    /// the observer. Failures are counted and logged, never returned.
    pub fn push(&self, frame: AudioFrame) -> Delivery {
        let result = {
            let mut output = lock(&self.output);
            let Some(active) = output.as_mut() else {
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                return Delivery::NoOutput;
            };
            active.output.write(frame.as_bytes())
        };

        if let Err(e) = result {
            let failures = self.write_failures.fetch_add(1, Ordering::Relaxed) + 1;
            warn!("Failed to write {} bytes to output ({} failures): {}", frame.len(), failures, e);
            return Delivery::WriteFailed;
        }

        self.frames_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(frame.len() as u64, Ordering::Relaxed);

        let observer = lock(&self.observer).clone();
        if let Some(observer) = observer {
            observer(&frame);
        }
        Delivery::Written
    }

    pub fn release(&self) {
        lock(&self.observer).take();

        let active = lock(&self.output).take();
        if let Some(mut active) = active {
            if active.playing {
                if let Err(e) = active.output.pause() {
                    debug!("Error pausing output during release: {}", e);
                }
            }
            active.output.release();
            debug!("Released output {}", active.handle.generation);
        }
    }

    pub fn stats(&self) -> SinkStats {
        SinkStats {
            frames_written: self.frames_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

impl Drop for AudioSink {
    fn drop(&mut self) {
        self.release();
    }
}

// A panic mid-write leaves nothing half-updated that we rely on, so take the guard back.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{bail, Result};
    use std::sync::Condvar;
    use std::thread;

    #[derive(Default)]
    struct Captured {
        bytes: Vec<u8>,
        playing: bool,
        releases: usize,
        capacity: Option<usize>,
    }

    type Shared = Arc<(Mutex<Captured>, Condvar)>;

    struct TestOutput {
        shared: Shared,
        fail_writes: bool,
    }

    impl AudioOutput for TestOutput {
        fn write(&mut self, pcm: &[u8]) -> Result<()> {
            if self.fail_writes {
                bail!("Write refused");
            }
            let (captured, space) = &*self.shared;
            let mut captured = captured.lock().unwrap();
            while let Some(capacity) = captured.capacity {
                if captured.bytes.len() + pcm.len() <= capacity {
                    break;
                }
                captured = space.wait(captured).unwrap();
            }
            captured.bytes.extend_from_slice(pcm);
            Ok(())
        }

        fn play(&mut self) -> Result<()> {
            self.shared.0.lock().unwrap().playing = true;
            Ok(())
        }

        fn pause(&mut self) -> Result<()> {
            self.shared.0.lock().unwrap().playing = false;
            Ok(())
        }

        fn release(&mut self) {
            self.shared.0.lock().unwrap().releases += 1;
        }
    }

    struct TestOpener {
        shared: Shared,
        minimum: usize,
        fail_writes: bool,
        fail_open: bool,
    }

    impl TestOpener {
        fn new(shared: &Shared) -> Self {
            Self {
                shared: shared.clone(),
                minimum: 3840,
                fail_writes: false,
                fail_open: false,
            }
        }
    }

    impl OpenOutputStream for TestOpener {
        fn min_buffer_size(&self, _: &AudioSpecification) -> Result<usize> {
            Ok(self.minimum)
        }

        fn open(&self, _: AudioSpecification) -> Result<Box<dyn AudioOutput>> {
            if self.fail_open {
                bail!("No output devices");
            }
            Ok(Box::new(TestOutput {
                shared: self.shared.clone(),
                fail_writes: self.fail_writes,
            }))
        }
    }

    fn shared() -> Shared {
        Arc::new((Mutex::new(Captured::default()), Condvar::new()))
    }

    fn frame(bytes: &[u8]) -> AudioFrame {
        AudioFrame::from(bytes.to_vec())
    }

    #[test]
    fn frames_reach_output_and_observer_in_order() {
        let shared = shared();
        let sink = AudioSink::new(Box::new(TestOpener::new(&shared)), SinkConfig::default());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_inner = seen.clone();
        let observer: FrameObserver = Arc::new(move |frame: &AudioFrame| {
            seen_inner.lock().unwrap().push(frame.as_bytes().to_vec());
        });

        sink.setup(Some(observer)).unwrap();
        sink.start();

        for data in [[1u8, 1, 1, 1], [2, 2, 2, 2], [3, 3, 3, 3]] {
            assert_eq!(sink.push(frame(&data)), Delivery::Written);
        }

        assert_eq!(
            shared.0.lock().unwrap().bytes,
            vec![1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3]
        );
        assert_eq!(
            *seen.lock().unwrap(),
            vec![vec![1, 1, 1, 1], vec![2, 2, 2, 2], vec![3, 3, 3, 3]]
        );
        assert_eq!(sink.stats().frames_written, 3);
        assert_eq!(sink.stats().bytes_written, 12);
    }

    #[test]
    fn buffer_size_takes_the_larger_of_minimum_and_requested() {
        let shared = shared();
        let sink = AudioSink::new(Box::new(TestOpener::new(&shared)), SinkConfig::default());
        assert_eq!(sink.setup(None).unwrap().buffer_size, 38400);

        let mut opener = TestOpener::new(&shared);
        opener.minimum = 50_001;
        let sink = AudioSink::new(Box::new(opener), SinkConfig::default());
        assert_eq!(sink.setup(None).unwrap().buffer_size, 50_004);
    }

    #[test]
    fn zero_minimum_buffer_is_rejected() {
        let shared = shared();
        let mut opener = TestOpener::new(&shared);
        opener.minimum = 0;
        let sink = AudioSink::new(Box::new(opener), SinkConfig::default());

        assert!(matches!(sink.setup(None), Err(SinkError::InvalidBufferSize(0))));
        assert_eq!(sink.handle(), None);
    }

    #[test]
    fn open_failure_is_resource_unavailable() {
        let shared = shared();
        let mut opener = TestOpener::new(&shared);
        opener.fail_open = true;
        let sink = AudioSink::new(Box::new(opener), SinkConfig::default());

        assert!(matches!(sink.setup(None), Err(SinkError::ResourceUnavailable(_))));
    }

    #[test]
    fn setup_replaces_previous_output() {
        let shared = shared();
        let sink = AudioSink::new(Box::new(TestOpener::new(&shared)), SinkConfig::default());

        let first = sink.setup(None).unwrap();
        let second = sink.setup(None).unwrap();

        assert!(second.generation > first.generation);
        assert_eq!(sink.handle(), Some(second));
        assert_eq!(shared.0.lock().unwrap().releases, 1);
    }

    #[test]
    fn release_twice_releases_once() {
        let shared = shared();
        let sink = AudioSink::new(Box::new(TestOpener::new(&shared)), SinkConfig::default());
        sink.setup(None).unwrap();
        sink.start();

        sink.release();
        sink.release();

        let captured = shared.0.lock().unwrap();
        assert_eq!(captured.releases, 1);
        assert!(!captured.playing);
        drop(captured);
        assert_eq!(sink.handle(), None);
    }

    #[test]
    fn push_without_output_is_counted_as_dropped() {
        let shared = shared();
        let sink = AudioSink::new(Box::new(TestOpener::new(&shared)), SinkConfig::default());

        assert_eq!(sink.push(frame(&[0, 0, 0, 0])), Delivery::NoOutput);

        sink.setup(None).unwrap();
        sink.release();
        assert_eq!(sink.push(frame(&[0, 0, 0, 0])), Delivery::NoOutput);

        assert_eq!(sink.stats().frames_dropped, 2);
        assert!(shared.0.lock().unwrap().bytes.is_empty());
    }

    #[test]
    fn start_and_stop_without_output_do_nothing() {
        let shared = shared();
        let sink = AudioSink::new(Box::new(TestOpener::new(&shared)), SinkConfig::default());
        sink.start();
        sink.stop();
        assert!(!shared.0.lock().unwrap().playing);
    }

    #[test]
    fn stop_is_resumable() {
        let shared = shared();
        let sink = AudioSink::new(Box::new(TestOpener::new(&shared)), SinkConfig::default());
        sink.setup(None).unwrap();

        sink.start();
        sink.stop();
        assert!(!shared.0.lock().unwrap().playing);
        sink.start();
        assert!(shared.0.lock().unwrap().playing);
    }

    #[test]
    fn write_failure_skips_observer_and_continues() {
        let shared = shared();
        let mut opener = TestOpener::new(&shared);
        opener.fail_writes = true;
        let sink = AudioSink::new(Box::new(opener), SinkConfig::default());

        let calls = Arc::new(AtomicU64::new(0));
        let calls_inner = calls.clone();
        let observer: FrameObserver = Arc::new(move |_: &AudioFrame| {
            calls_inner.fetch_add(1, Ordering::SeqCst);
        });
        sink.setup(Some(observer)).unwrap();

        assert_eq!(sink.push(frame(&[1, 2, 3, 4])), Delivery::WriteFailed);
        assert_eq!(sink.push(frame(&[5, 6, 7, 8])), Delivery::WriteFailed);

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(sink.stats().write_failures, 2);
    }

    #[test]
    fn full_output_blocks_push_until_space_frees() {
        let shared = shared();
        shared.0.lock().unwrap().capacity = Some(8);

        let sink = Arc::new(AudioSink::new(
            Box::new(TestOpener::new(&shared)),
            SinkConfig::default(),
        ));
        sink.setup(None).unwrap();
        assert_eq!(sink.push(frame(&[1; 8])), Delivery::Written);

        let pusher = {
            let sink = sink.clone();
            thread::spawn(move || sink.push(frame(&[2; 4])))
        };

        // The second frame can't fit until we consume what's there.
        thread::sleep(Duration::from_millis(50));
        assert!(!pusher.is_finished());
        assert_eq!(shared.0.lock().unwrap().bytes.len(), 8);

        {
            let (captured, space) = &*shared;
            captured.lock().unwrap().bytes.clear();
            space.notify_all();
        }

        assert_eq!(pusher.join().unwrap(), Delivery::Written);
        assert_eq!(shared.0.lock().unwrap().bytes, vec![2; 4]);
    }
}

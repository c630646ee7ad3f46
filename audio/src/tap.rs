use crate::sink::FrameObserver;
use log::warn;
use rb::{Consumer, Producer, RB, RbConsumer, RbInspector, RbProducer, SpscRb};
use std::sync::{Arc, Mutex};
use uac_types::{AudioFrame, PcmFormat};

/// A fixed-size window over the most recent samples that went to the output.
///
/// Writing never blocks: when the window is full the oldest samples are skipped to make room,
/// so reading always returns the newest audio available.
pub struct SampleTap {
    buffer: SpscRb<i16>,
    consumer: Consumer<i16>,
    producer: Producer<i16>,
}

impl SampleTap {
    pub fn new(size: usize) -> Self {
        let buffer = SpscRb::<i16>::new(size);
        let (producer, consumer) = (buffer.producer(), buffer.consumer());

        Self {
            buffer,
            consumer,
            producer,
        }
    }

    pub fn for_millis(format: PcmFormat, millis: usize) -> Self {
        let samples = format.bytes_for_millis(millis) / format.bytes_per_sample();
        Self::new(samples.max(1))
    }

    pub fn write_into(&self, data: &[i16]) -> anyhow::Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        if self.buffer.slots_free() >= data.len() {
            self.producer.write(data).map_err(anyhow::Error::msg)?;
            return Ok(());
        }

        // Too big to ever fit, keep the tail.
        if self.buffer.capacity() < data.len() {
            if !self.buffer.is_empty() {
                self.consumer.skip_pending().map_err(anyhow::Error::msg)?;
            }

            let start = data.len() - self.buffer.capacity();
            self.producer
                .write(&data[start..])
                .map_err(anyhow::Error::msg)?;
            return Ok(());
        }

        let skip = data.len() - self.buffer.slots_free();
        self.consumer.skip(skip).map_err(anyhow::Error::msg)?;
        self.producer.write(data).map_err(anyhow::Error::msg)?;

        Ok(())
    }

    pub fn read_buffer(&self) -> anyhow::Result<Vec<i16>> {
        let mut buffer = vec![0; self.buffer.count()];
        if buffer.is_empty() {
            return Ok(buffer);
        }

        let count = self.consumer.get(&mut buffer).map_err(anyhow::Error::msg)?;
        buffer.truncate(count);
        Ok(buffer)
    }

    /// The largest absolute sample value currently in the window.
    pub fn peak(&self) -> u16 {
        match self.read_buffer() {
            Ok(samples) => samples.iter().map(|s| s.unsigned_abs()).max().unwrap_or(0),
            Err(e) => {
                warn!("Unable to read sample tap: {}", e);
                0
            }
        }
    }

    pub fn peak_dbfs(&self) -> f32 {
        let peak = self.peak();
        if peak == 0 {
            return f32::NEG_INFINITY;
        }
        20.0 * (peak as f32 / 32768.0).log10()
    }
}

/// Builds an observer that copies every delivered frame into the tap.
pub fn tap_observer(tap: Arc<Mutex<SampleTap>>) -> FrameObserver {
    Arc::new(move |frame: &AudioFrame| {
        let samples: Vec<i16> = frame.samples().collect();
        let tap = tap.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = tap.write_into(&samples) {
            warn!("Unable to write to sample tap: {}", e);
        }
    })
}

// This is the boundary between the relay and whatever actually talks to the hardware. A session
// is driven from two threads: the control thread opens, starts, stops and closes it, while the
// dispatch thread repeatedly calls `step`. Callers serialise access (the relay keeps the session
// behind a mutex), so implementations only need to be Send.
use crate::error::{NativeError, StepError};
use uac_types::{AudioFrame, DeviceHandle};

pub trait NativeSession: Send {
    /// Acquire the device and prepare its streaming interface.
    fn open(&mut self, handle: &DeviceHandle) -> Result<(), NativeError>;

    /// Begin capturing from the device.
    fn start(&mut self) -> Result<(), NativeError>;

    /// Stop capturing, the device stays open and can be started again.
    fn stop(&mut self) -> Result<(), NativeError>;

    /// Release every device resource. Calling this on a closed session does nothing.
    fn close(&mut self) -> Result<(), NativeError>;

    /// Service any completed USB work, handing each decoded frame to `deliver` in the order it
    /// was received. Frames are moved out, the session keeps no reference to them. Returns the
    /// number of frames delivered.
    ///
    /// A step that reports an error may still have delivered frames first.
    fn step(&mut self, deliver: &mut dyn FnMut(AudioFrame)) -> Result<usize, StepError>;

    /// Total bytes received since the session was opened.
    fn measure(&self) -> u64;
}

use crate::device::base::NativeSession;
use crate::device::descriptor::{read_alt_settings, select_streaming_endpoint, StreamingEndpoint};
use crate::device::libusb::transfer::TransferPool;
use crate::error::{NativeError, StepError};
use log::{debug, error, info, warn};
use rusb::{Context, Direction, Recipient, RequestType, UsbContext};
use std::time::{Duration, Instant};
use uac_types::{AudioFrame, DeviceHandle, PcmFormat};

// UAC1 endpoint control, SET_CUR on the sampling frequency selector.
const REQUEST_SET_CUR: u8 = 0x01;
const SAMPLING_FREQ_CONTROL: u16 = 0x0100;

// How long we'll keep handling events while waiting for cancelled transfers to come back.
const REAP_ATTEMPTS: usize = 10;
const REAP_TIMEOUT: Duration = Duration::from_millis(100);

pub struct LibUsbSession {
    context: Option<Context>,
    handle: Option<rusb::DeviceHandle<Context>>,
    endpoint: Option<StreamingEndpoint>,
    pool: Option<TransferPool>,

    format: PcmFormat,
    timeout: Duration,
    step_timeout: Duration,

    bytes_received: u64,
    transfers_received: u64,
    started: Option<Instant>,
}

impl LibUsbSession {
    pub fn new(step_timeout: Duration) -> Self {
        Self {
            context: None,
            handle: None,
            endpoint: None,
            pool: None,

            format: PcmFormat::STEREO_48K_S16,
            timeout: Duration::from_secs(1),
            step_timeout,

            bytes_received: 0,
            transfers_received: 0,
            started: None,
        }
    }

    fn set_sample_rate(&self, usb: &rusb::DeviceHandle<Context>, endpoint: &StreamingEndpoint) {
        let rate = self.format.sample_rate_payload();
        let result = usb.write_control(
            rusb::request_type(Direction::Out, RequestType::Class, Recipient::Endpoint),
            REQUEST_SET_CUR,
            SAMPLING_FREQ_CONTROL,
            endpoint.address as u16,
            &rate,
            self.timeout,
        );

        // Plenty of devices have a fixed rate and stall this request, that's not fatal.
        match result {
            Ok(written) if written == rate.len() => {
                debug!("Sample rate set to {}Hz ({:02x?})", self.format.sample_rate, rate);
            }
            Ok(written) => warn!("Short write setting sample rate ({} bytes)", written),
            Err(e) => warn!("Unable to set sample rate: {}", e),
        }
    }

    fn reap(&mut self, pool: TransferPool) {
        pool.cancel();
        if let Some(context) = &self.context {
            for _ in 0..REAP_ATTEMPTS {
                if pool.in_flight() == 0 {
                    break;
                }
                if let Err(e) = context.handle_events(Some(REAP_TIMEOUT)) {
                    debug!("Error handling events while cancelling: {}", e);
                }
            }
        }

        let (transfers, bytes) = pool.totals();
        let (transfer_errors, packet_errors) = pool.errors();
        self.transfers_received += transfers;
        self.bytes_received += bytes;
        if transfer_errors > 0 || packet_errors > 0 {
            warn!(
                "Capture saw {} failed transfers and {} failed packets",
                transfer_errors, packet_errors
            );
        }
        debug!("All transfers cancelled");
    }

    fn log_throughput(&self) {
        if let Some(started) = self.started {
            let elapsed = started.elapsed().as_millis().max(1) as u64;
            info!(
                "{} transfers (total {} bytes) in {} milliseconds => {} bytes/sec",
                self.transfers_received,
                self.bytes_received,
                elapsed,
                (self.bytes_received * 1000) / elapsed
            );
        }
    }
}

impl NativeSession for LibUsbSession {
    fn open(&mut self, handle: &DeviceHandle) -> Result<(), NativeError> {
        if self.handle.is_some() {
            self.close()?;
        }

        let context = Context::new()?;
        debug!("Opening USB device {}", handle);
        let mut usb = open_device(&context, handle)?;

        let device = usb.device();
        let descriptor = device.device_descriptor()?;
        if descriptor.vendor_id() != handle.vendor_id()
            || descriptor.product_id() != handle.product_id()
        {
            return Err(NativeError::DeviceMismatch {
                expected: format!("{:04x}:{:04x}", handle.vendor_id(), handle.product_id()),
                found: format!("{:04x}:{:04x}", descriptor.vendor_id(), descriptor.product_id()),
            });
        }

        let settings = read_alt_settings(&device)?;
        let endpoint = select_streaming_endpoint(&settings).ok_or(NativeError::NoStreamingInterface)?;
        info!(
            "Found AudioStreaming interface {} (alt {}), endpoint 0x{:02x}",
            endpoint.interface, endpoint.alt_setting, endpoint.address
        );

        // Only Linux exposes this, elsewhere it's NotSupported and we carry on.
        let detached = usb.kernel_driver_active(endpoint.interface).unwrap_or(false);
        if detached {
            debug!("Detaching kernel driver from interface {}", endpoint.interface);
            usb.detach_kernel_driver(endpoint.interface)?;
        }

        claim_streaming(&mut usb, &endpoint, detached)?;
        self.set_sample_rate(&usb, &endpoint);

        self.context = Some(context);
        self.handle = Some(usb);
        self.endpoint = Some(endpoint);
        self.bytes_received = 0;
        self.transfers_received = 0;
        Ok(())
    }

    fn start(&mut self) -> Result<(), NativeError> {
        if self.pool.is_some() {
            return Ok(());
        }

        let (usb, endpoint) = match (&self.handle, &self.endpoint) {
            (Some(usb), Some(endpoint)) => (usb, endpoint),
            _ => return Err(NativeError::NotOpen),
        };

        let packet_size = endpoint.packet_size().max(self.format.bytes_for_millis(1));
        debug!("Starting capture, {} bytes per packet", packet_size);
        let pool = TransferPool::submit(usb.as_raw(), endpoint.address, packet_size)?;

        self.pool = Some(pool);
        self.started = Some(Instant::now());
        Ok(())
    }

    fn stop(&mut self) -> Result<(), NativeError> {
        if let Some(pool) = self.pool.take() {
            self.reap(pool);
            self.log_throughput();
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), NativeError> {
        self.stop()?;

        if let Some(mut usb) = self.handle.take() {
            if let Some(endpoint) = self.endpoint.take() {
                let result = usb.release_interface(endpoint.interface);
                debug!("Released interface {}: {:?}", endpoint.interface, result);

                // Hand the device back to the kernel, if it wanted it.
                if let Err(e) = usb.attach_kernel_driver(endpoint.interface) {
                    debug!("Kernel driver not reattached: {}", e);
                }
            }
        }
        self.context = None;
        Ok(())
    }

    fn step(&mut self, deliver: &mut dyn FnMut(AudioFrame)) -> Result<usize, StepError> {
        let (context, pool) = match (&self.context, &self.pool) {
            (Some(context), Some(pool)) => (context, pool),
            _ => return Ok(0),
        };

        match context.handle_events(Some(self.step_timeout)) {
            Ok(()) | Err(rusb::Error::Interrupted) | Err(rusb::Error::Timeout) => {}
            Err(rusb::Error::NoDevice) => return Err(StepError::Detached),
            Err(e) => {
                error!("Error handling USB events: {}", e);
                return Err(StepError::Transient(e.to_string()));
            }
        }

        let completed = pool.take_completed();
        let count = completed.frames.len();
        for frame in completed.frames {
            deliver(AudioFrame::from(frame));
        }

        if completed.detached {
            return Err(StepError::Detached);
        }
        if completed.in_flight == 0 {
            return Err(StepError::Fatal(String::from(
                "No isochronous transfers remain queued",
            )));
        }
        Ok(count)
    }

    fn measure(&self) -> u64 {
        let current = self.pool.as_ref().map(|pool| pool.totals().1).unwrap_or(0);
        self.bytes_received + current
    }
}

impl Drop for LibUsbSession {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("Error closing USB session: {}", e);
        }
    }
}

// The interface calls `open` makes on a handle, split out so the rollback can be exercised
// without a device.
trait InterfaceControl {
    fn claim_interface(&mut self, interface: u8) -> rusb::Result<()>;
    fn set_alternate_setting(&mut self, interface: u8, setting: u8) -> rusb::Result<()>;
    fn release_interface(&mut self, interface: u8) -> rusb::Result<()>;
    fn attach_kernel_driver(&mut self, interface: u8) -> rusb::Result<()>;
}

impl InterfaceControl for rusb::DeviceHandle<Context> {
    fn claim_interface(&mut self, interface: u8) -> rusb::Result<()> {
        rusb::DeviceHandle::claim_interface(self, interface)
    }

    fn set_alternate_setting(&mut self, interface: u8, setting: u8) -> rusb::Result<()> {
        rusb::DeviceHandle::set_alternate_setting(self, interface, setting)
    }

    fn release_interface(&mut self, interface: u8) -> rusb::Result<()> {
        rusb::DeviceHandle::release_interface(self, interface)
    }

    fn attach_kernel_driver(&mut self, interface: u8) -> rusb::Result<()> {
        rusb::DeviceHandle::attach_kernel_driver(self, interface)
    }
}

/// Claims the streaming interface and selects its alternate setting. On failure the interface
/// is released and, if we took it from the kernel, handed back.
fn claim_streaming(
    usb: &mut impl InterfaceControl,
    endpoint: &StreamingEndpoint,
    detached: bool,
) -> rusb::Result<()> {
    let claimed = match usb.claim_interface(endpoint.interface) {
        Ok(()) => {
            let selected = usb.set_alternate_setting(endpoint.interface, endpoint.alt_setting);
            if selected.is_err() {
                let _ = usb.release_interface(endpoint.interface);
            }
            selected
        }
        Err(e) => Err(e),
    };

    if let Err(e) = claimed {
        warn!("Unable to claim interface {}: {}", endpoint.interface, e);
        if detached {
            if let Err(e) = usb.attach_kernel_driver(endpoint.interface) {
                warn!("Kernel driver not reattached: {}", e);
            }
        }
        return Err(e);
    }
    Ok(())
}

fn open_by_location(
    context: &Context,
    handle: &DeviceHandle,
) -> Result<rusb::DeviceHandle<Context>, NativeError> {
    for device in context.devices()?.iter() {
        if device.bus_number() == handle.bus_number() && device.address() == handle.device_number() {
            return Ok(device.open()?);
        }
    }
    Err(NativeError::DeviceNotFound(format!(
        "{:03}/{:03}",
        handle.bus_number(),
        handle.device_number()
    )))
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        fn open_device(
            context: &Context,
            handle: &DeviceHandle,
        ) -> Result<rusb::DeviceHandle<Context>, NativeError> {
            if let Some(fd) = handle.file_descriptor() {
                debug!("Wrapping pre-opened descriptor {}", fd);

                // The acquisition layer keeps this descriptor open until it revokes the device,
                // and the session is closed before that happens.
                return Ok(unsafe { context.open_device_with_fd(fd)? });
            }
            open_by_location(context, handle)
        }
    } else {
        fn open_device(
            context: &Context,
            handle: &DeviceHandle,
        ) -> Result<rusb::DeviceHandle<Context>, NativeError> {
            if handle.file_descriptor().is_some() {
                return Err(NativeError::DescriptorUnsupported);
            }
            open_by_location(context, handle)
        }
    }
}

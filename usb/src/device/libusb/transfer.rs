// A fixed set of isochronous IN transfers which are kept queued on the device.
//
// Several transfers are submitted up front so the host controller always has one scheduled while
// we're handling another, a single transfer leaves gaps in the bus schedule. Completion callbacks
// only ever run inside `libusb_handle_events`, which the owning session calls while it holds
// exclusive access, so the pool's state is only touched from one thread at a time. It still lives
// behind a mutex, as the callback only gets a raw pointer to it.
use log::{debug, error, warn};
use rusb::ffi;
use std::os::raw::{c_int, c_uint, c_void};
use std::ptr::{addr_of, addr_of_mut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::NativeError;

pub const TRANSFER_COUNT: usize = 10;
pub const PACKETS_PER_TRANSFER: usize = 10;

const TRANSFER_TIMEOUT_MS: c_uint = 1000;

// Values from libusb.h
const TRANSFER_TYPE_ISOCHRONOUS: u8 = 1;
const TRANSFER_COMPLETED: c_int = 0;
const TRANSFER_CANCELLED: c_int = 3;
const TRANSFER_NO_DEVICE: c_int = 5;
const ERROR_NO_DEVICE: c_int = -4;

#[derive(Debug, Default)]
pub struct TransferState {
    completed: Vec<Vec<u8>>,
    in_flight: usize,
    stopping: bool,
    detached: bool,
    packet_errors: u64,
    transfer_errors: u64,
    bytes: u64,
    transfers: u64,
}

/// Everything the callbacks produced since the last call to `take_completed`.
#[derive(Debug, Default)]
pub struct Completed {
    pub frames: Vec<Vec<u8>>,
    pub detached: bool,
    pub in_flight: usize,
}

pub struct TransferPool {
    transfers: Vec<*mut ffi::libusb_transfer>,
    buffers: Vec<Box<[u8]>>,
    state: Arc<Mutex<TransferState>>,
}

// The raw transfers are only dereferenced by libusb, and by callbacks running inside
// handle_events on whichever thread currently owns the pool.
unsafe impl Send for TransferPool {}

impl TransferPool {
    pub fn submit(
        handle: *mut ffi::libusb_device_handle,
        endpoint: u8,
        packet_size: usize,
    ) -> Result<Self, NativeError> {
        let mut pool = Self {
            transfers: Vec::with_capacity(TRANSFER_COUNT),
            buffers: Vec::with_capacity(TRANSFER_COUNT),
            state: Arc::new(Mutex::new(TransferState::default())),
        };

        let user_data = Arc::as_ptr(&pool.state) as *mut c_void;
        let mut last_error = 0;

        for index in 0..TRANSFER_COUNT {
            let transfer = unsafe { ffi::libusb_alloc_transfer(PACKETS_PER_TRANSFER as c_int) };
            if transfer.is_null() {
                error!("Could not allocate transfer {}", index);
                pool.cancel();
                return Err(NativeError::TransferAllocation);
            }

            let mut buffer = vec![0; packet_size * PACKETS_PER_TRANSFER].into_boxed_slice();
            unsafe {
                fill_iso_transfer(transfer, handle, endpoint, &mut buffer, packet_size, user_data);
            }
            pool.transfers.push(transfer);
            pool.buffers.push(buffer);

            // Count it before submitting, the callback will balance it out.
            pool.lock().in_flight += 1;
            let result = unsafe { ffi::libusb_submit_transfer(transfer) };
            if result < 0 {
                error!("Unable to submit transfer {}, libusb error {}", index, result);
                pool.lock().in_flight -= 1;
                last_error = result;
            } else {
                debug!("Submitted transfer {}", index);
            }
        }

        if pool.in_flight() == 0 {
            return Err(NativeError::TransferSubmit(last_error));
        }
        Ok(pool)
    }

    fn lock(&self) -> MutexGuard<'_, TransferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    /// Returns (transfers, bytes) received through this pool.
    pub fn totals(&self) -> (u64, u64) {
        let state = self.lock();
        (state.transfers, state.bytes)
    }

    pub fn errors(&self) -> (u64, u64) {
        let state = self.lock();
        (state.transfer_errors, state.packet_errors)
    }

    pub fn take_completed(&self) -> Completed {
        let mut state = self.lock();
        Completed {
            frames: std::mem::take(&mut state.completed),
            detached: state.detached,
            in_flight: state.in_flight,
        }
    }

    /// Prevents resubmission and asks libusb to cancel everything still queued. The transfers
    /// are only retired once their cancellation callbacks have been handled.
    pub fn cancel(&self) {
        self.lock().stopping = true;
        for transfer in &self.transfers {
            // Transfers which have already been retired report NOT_FOUND, that's fine.
            unsafe {
                ffi::libusb_cancel_transfer(*transfer);
            }
        }
    }
}

impl Drop for TransferPool {
    fn drop(&mut self) {
        let in_flight = self.in_flight();
        if in_flight > 0 {
            // libusb still owns these, freeing them now would hand it dangling buffers.
            error!(
                "{} isochronous transfers failed to cancel, leaking their buffers",
                in_flight
            );
            std::mem::forget(std::mem::take(&mut self.buffers));
            std::mem::forget(self.state.clone());
            return;
        }

        for transfer in self.transfers.drain(..) {
            unsafe {
                ffi::libusb_free_transfer(transfer);
            }
        }
    }
}

unsafe fn fill_iso_transfer(
    transfer: *mut ffi::libusb_transfer,
    handle: *mut ffi::libusb_device_handle,
    endpoint: u8,
    buffer: &mut [u8],
    packet_size: usize,
    user_data: *mut c_void,
) {
    (*transfer).dev_handle = handle;
    (*transfer).endpoint = endpoint;
    (*transfer).transfer_type = TRANSFER_TYPE_ISOCHRONOUS;
    (*transfer).timeout = TRANSFER_TIMEOUT_MS;
    (*transfer).buffer = buffer.as_mut_ptr();
    (*transfer).length = buffer.len() as c_int;
    (*transfer).num_iso_packets = PACKETS_PER_TRANSFER as c_int;
    (*transfer).callback = transfer_complete;
    (*transfer).user_data = user_data;

    let packets = addr_of_mut!((*transfer).iso_packet_desc) as *mut ffi::libusb_iso_packet_descriptor;
    for index in 0..PACKETS_PER_TRANSFER {
        (*packets.add(index)).length = packet_size as c_uint;
    }
}

/// A single isochronous packet, as reported back by the controller.
pub struct IsoPacket<'a> {
    pub status: c_int,
    pub data: &'a [u8],
}

/// Joins the received packets of one transfer into a single block of PCM. Packets which failed
/// are skipped, and counted.
pub fn assemble_frame(packets: &[IsoPacket<'_>]) -> (Vec<u8>, u64) {
    let mut frame = Vec::with_capacity(packets.iter().map(|packet| packet.data.len()).sum());
    let mut errors = 0;
    for packet in packets {
        if packet.status != TRANSFER_COMPLETED {
            errors += 1;
            continue;
        }
        frame.extend_from_slice(packet.data);
    }
    (frame, errors)
}

unsafe fn read_packets(transfer: *mut ffi::libusb_transfer) -> (Vec<u8>, u64) {
    let count = (*transfer).num_iso_packets.max(0) as usize;
    let length = (*transfer).length.max(0) as usize;
    let packet_size = length / count.max(1);
    let descriptors = addr_of!((*transfer).iso_packet_desc) as *const ffi::libusb_iso_packet_descriptor;

    let mut packets = Vec::with_capacity(count);
    for index in 0..count {
        let descriptor = &*descriptors.add(index);
        let received = (descriptor.actual_length as usize).min(packet_size);
        let start = (*transfer).buffer.add(index * packet_size);
        packets.push(IsoPacket {
            status: descriptor.status,
            data: std::slice::from_raw_parts(start, received),
        });
    }
    assemble_frame(&packets)
}

extern "system" fn transfer_complete(transfer: *mut ffi::libusb_transfer) {
    let (status, user_data) = unsafe { ((*transfer).status, (*transfer).user_data) };
    if user_data.is_null() {
        return;
    }

    // The pool keeps this alive for as long as any of its transfers are in flight.
    let shared = unsafe { &*(user_data as *const Mutex<TransferState>) };
    let mut state = shared.lock().unwrap_or_else(PoisonError::into_inner);

    match status {
        TRANSFER_COMPLETED => {
            let (frame, errors) = unsafe { read_packets(transfer) };
            if errors > 0 {
                debug!("{} isochronous packets failed in this transfer", errors);
                state.packet_errors += errors;
            }
            if !frame.is_empty() {
                state.bytes += frame.len() as u64;
                state.transfers += 1;
                state.completed.push(frame);
            }
        }
        TRANSFER_CANCELLED => {
            state.in_flight = state.in_flight.saturating_sub(1);
            return;
        }
        TRANSFER_NO_DEVICE => {
            warn!("Transfer reported the device as gone");
            state.detached = true;
            state.in_flight = state.in_flight.saturating_sub(1);
            return;
        }
        other => {
            debug!("Transfer completed with status {}", other);
            state.transfer_errors += 1;
        }
    }

    if state.stopping {
        state.in_flight = state.in_flight.saturating_sub(1);
        return;
    }

    let result = unsafe { ffi::libusb_submit_transfer(transfer) };
    if result < 0 {
        if result == ERROR_NO_DEVICE {
            state.detached = true;
        } else {
            error!("Error re-submitting transfer, libusb error {}", result);
        }
        state.in_flight = state.in_flight.saturating_sub(1);
    }
}

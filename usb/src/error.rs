#[derive(thiserror::Error, Debug)]
pub enum NativeError {
    #[error("USB error: {0}")]
    UsbError(#[from] rusb::Error),

    #[error("No USB device was found at {0}")]
    DeviceNotFound(String),

    #[error("Expected device {expected}, found {found}")]
    DeviceMismatch { expected: String, found: String },

    #[error("Device has no AudioStreaming interface with an isochronous input")]
    NoStreamingInterface,

    #[error("Opening a device by file descriptor isn't supported on this platform")]
    DescriptorUnsupported,

    #[error("The native session has not been opened")]
    NotOpen,

    #[error("Unable to allocate an isochronous transfer")]
    TransferAllocation,

    #[error("Unable to submit any isochronous transfers (libusb error {0})")]
    TransferSubmit(i32),
}

impl NativeError {
    /// The device is gone, nothing further will work on this handle.
    pub fn is_detached(&self) -> bool {
        matches!(self, NativeError::UsbError(rusb::Error::NoDevice))
    }
}

/// Failures reported by a single dispatch step.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StepError {
    #[error("The device has been detached")]
    Detached,

    #[error("Transient USB error: {0}")]
    Transient(String),

    #[error("Fatal USB error: {0}")]
    Fatal(String),
}

#[derive(thiserror::Error, Debug)]
pub enum AcquireError {
    #[error("Permission denied for device {0}")]
    PermissionDenied(String),

    #[error("No USB device was found at {0}")]
    DeviceNotFound(String),

    #[error("USB error: {0}")]
    UsbError(#[from] rusb::Error),
}

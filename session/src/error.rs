use uac_audio::SinkError;
use uac_types::SessionState;
use uac_usb::error::AcquireError;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Output unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("I/O error: {0}")]
    TransientIoError(String),

    /// The dispatch loop never acknowledged the close. Whatever it held, including the
    /// device descriptor, has been abandoned.
    #[error("Session did not close within {timeout_millis}ms, device resources were leaked")]
    SessionTimeout {
        timeout_millis: u64,
        descriptor: Option<i32>,
    },

    #[error("The device was detached")]
    Detached,

    #[error("Cannot {operation} a session that is {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
}

impl From<AcquireError> for SessionError {
    fn from(value: AcquireError) -> Self {
        match value {
            AcquireError::PermissionDenied(location) => SessionError::PermissionDenied(location),
            AcquireError::DeviceNotFound(location) => {
                SessionError::DeviceUnavailable(format!("no device at {}", location))
            }
            AcquireError::UsbError(e) => SessionError::DeviceUnavailable(e.to_string()),
        }
    }
}

impl From<SinkError> for SessionError {
    fn from(value: SinkError) -> Self {
        SessionError::ResourceUnavailable(value.to_string())
    }
}

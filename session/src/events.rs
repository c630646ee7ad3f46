use uac_types::SessionState;

/// Sent from the dispatch loop when something happens that the control side didn't ask for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Detached,
    Failed(String),
    LoopExited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub state: SessionState,

    /// Every frame the loop took from the device and handed to the sink.
    pub frames_relayed: u64,
    pub bytes_relayed: u64,

    /// Frames that arrived after the sink had been released.
    pub frames_dropped: u64,
    pub write_failures: u64,
    pub transient_errors: u64,

    /// Bytes the device has delivered, as last reported by the native session.
    pub native_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FailureCause {
    SetupFailed(String),
    Detached,
    Fatal(String),
    TimedOut { timeout_millis: u64 },
}

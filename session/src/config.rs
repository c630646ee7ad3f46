use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long `close` waits for the dispatch loop to acknowledge before giving up on it.
    pub close_timeout: Duration,

    /// How often a parked loop (session Ready but not Running) checks for work.
    pub poll_interval: Duration,

    /// Consecutive transient step errors tolerated before the session fails. `None` never
    /// gives up.
    pub max_consecutive_errors: Option<u32>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            close_timeout: Duration::from_millis(2000),
            poll_interval: Duration::from_millis(20),
            max_consecutive_errors: None,
        }
    }
}

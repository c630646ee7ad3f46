mod config;
mod dispatch;
mod error;
mod events;
mod session;
mod state;

#[cfg(test)]
mod testing;

pub use crate::config::SessionConfig;
pub use crate::error::SessionError;
pub use crate::events::{SessionEvent, SessionStats};
pub use crate::session::{UsbSession, STATS_UNAVAILABLE};
pub use crate::state::SessionStateCell;
pub use uac_types::SessionState;

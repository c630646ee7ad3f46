use std::sync::atomic::{AtomicU8, Ordering};
use uac_types::SessionState;

/// The one piece of session data both the control and dispatch threads change.
///
/// Every change goes through `transition`, so only one thread can ever move the state out of
/// a given value.
#[derive(Debug)]
pub struct SessionStateCell {
    state: AtomicU8,
}

impl SessionStateCell {
    pub fn new(state: SessionState) -> Self {
        Self {
            state: AtomicU8::new(state as u8),
        }
    }

    pub fn load(&self) -> SessionState {
        decode(self.state.load(Ordering::Acquire))
    }

    /// Moves to `to` if the current state is one of `from`, returning the state that was
    /// replaced. When the current state isn't allowed, it's returned as the error and nothing
    /// changes.
    pub fn transition(
        &self,
        from: &[SessionState],
        to: SessionState,
    ) -> Result<SessionState, SessionState> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let state = decode(current);
            if !from.contains(&state) {
                return Err(state);
            }

            match self.state.compare_exchange_weak(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(state),
                Err(actual) => current = actual,
            }
        }
    }
}

fn decode(value: u8) -> SessionState {
    // Only ever written from a SessionState.
    SessionState::from_repr(value).unwrap_or(SessionState::Failed)
}

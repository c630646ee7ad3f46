use crate::events::{FailureCause, SessionEvent};
use crate::session::{lock, SessionShared};
use crossbeam_channel::Sender;
use log::{debug, error, warn};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use uac_audio::{AudioSink, Delivery};
use uac_types::{AudioFrame, SessionState};
use uac_usb::error::StepError;

/// The worker that services a session. It's the only thread that ever calls the native step,
/// and so the only one that ever pushes into the sink.
pub(crate) struct DispatchLoop {
    shared: Arc<SessionShared>,
    sink: Arc<AudioSink>,
    _ack: AckOnExit,
}

impl DispatchLoop {
    pub(crate) fn new(shared: Arc<SessionShared>, sink: Arc<AudioSink>, ack: Sender<()>) -> Self {
        Self {
            shared,
            sink,
            _ack: AckOnExit(ack),
        }
    }

    pub(crate) fn run(self) {
        debug!("Dispatch loop started");
        let mut frames: Vec<AudioFrame> = Vec::new();
        let mut consecutive_errors = 0;

        loop {
            match self.shared.state.load() {
                SessionState::Running => {}
                SessionState::Idle | SessionState::Opening | SessionState::Ready => {
                    // Parked until start or close wakes us, the timeout is only a backstop.
                    let _ = self.shared.wake_rx.recv_timeout(self.shared.config.poll_interval);
                    continue;
                }
                SessionState::Stopping | SessionState::Closed | SessionState::Failed => break,
            }

            let result = {
                let mut native = lock(&self.shared.native);
                let result = native.step(&mut |frame| frames.push(frame));
                self.shared
                    .counters
                    .native_bytes
                    .store(native.measure(), Ordering::Relaxed);
                result
            };

            // Whatever the step produced goes out, even if we've been stopped meanwhile.
            for frame in frames.drain(..) {
                self.relay(frame);
            }

            match result {
                Ok(_) => consecutive_errors = 0,
                Err(StepError::Transient(e)) => {
                    consecutive_errors += 1;
                    let total = self
                        .shared
                        .counters
                        .transient_errors
                        .fetch_add(1, Ordering::Relaxed)
                        + 1;
                    warn!("Transient error servicing device ({} total): {}", total, e);

                    if let Some(max) = self.shared.config.max_consecutive_errors {
                        if consecutive_errors >= max {
                            error!("{} consecutive errors, giving up on the device", consecutive_errors);
                            self.fail(FailureCause::Fatal(format!(
                                "{} consecutive errors, last: {}",
                                consecutive_errors, e
                            )));
                            break;
                        }
                    }
                }
                Err(StepError::Detached) => {
                    warn!("Device detached");
                    self.fail(FailureCause::Detached);
                    break;
                }
                Err(StepError::Fatal(e)) => {
                    error!("Fatal error servicing device: {}", e);
                    self.fail(FailureCause::Fatal(e));
                    break;
                }
            }
        }

        debug!("Dispatch loop exiting");
        self.shared.send_event(SessionEvent::LoopExited);
    }

    fn relay(&self, frame: AudioFrame) {
        let counters = &self.shared.counters;
        counters.frames_relayed.fetch_add(1, Ordering::Relaxed);
        counters
            .bytes_relayed
            .fetch_add(frame.len() as u64, Ordering::Relaxed);

        match self.sink.push(frame) {
            Delivery::Written => {}
            Delivery::WriteFailed => {
                counters.write_failures.fetch_add(1, Ordering::Relaxed);
            }
            Delivery::NoOutput => {
                counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn fail(&self, cause: FailureCause) {
        // Held across the transition so anyone who sees Failed also sees why.
        let mut failure = lock(&self.shared.failure);

        let running = [SessionState::Ready, SessionState::Running];
        if self.shared.state.transition(&running, SessionState::Failed).is_err() {
            // Already closing, that wins.
            return;
        }

        let event = match &cause {
            FailureCause::Detached => SessionEvent::Detached,
            FailureCause::SetupFailed(e) | FailureCause::Fatal(e) => SessionEvent::Failed(e.clone()),
            FailureCause::TimedOut { .. } => SessionEvent::Failed(String::from("close timed out")),
        };
        *failure = Some(cause);
        drop(failure);
        self.shared.send_event(event);
    }
}

// The acknowledgement `close` waits on, sent however the loop ends.
struct AckOnExit(Sender<()>);

impl Drop for AckOnExit {
    fn drop(&mut self) {
        // Nobody listening means close already gave up on us.
        let _ = self.0.try_send(());
    }
}

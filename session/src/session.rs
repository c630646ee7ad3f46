use crate::config::SessionConfig;
use crate::dispatch::DispatchLoop;
use crate::error::SessionError;
use crate::events::{FailureCause, SessionEvent, SessionStats};
use crate::state::SessionStateCell;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;
use uac_audio::AudioSink;
use uac_types::{DeviceHandle, SessionState};
use uac_usb::NativeSession;

/// What `measure` reports when the session isn't open.
pub const STATS_UNAVAILABLE: u64 = u64::MAX;

#[derive(Default)]
pub(crate) struct Counters {
    pub(crate) frames_relayed: AtomicU64,
    pub(crate) bytes_relayed: AtomicU64,
    pub(crate) frames_dropped: AtomicU64,
    pub(crate) write_failures: AtomicU64,
    pub(crate) transient_errors: AtomicU64,
    pub(crate) native_bytes: AtomicU64,
}

/// Everything the dispatch loop shares with the control side.
pub(crate) struct SessionShared {
    pub(crate) state: SessionStateCell,
    pub(crate) native: Mutex<Box<dyn NativeSession>>,
    pub(crate) counters: Counters,
    pub(crate) failure: Mutex<Option<FailureCause>>,
    pub(crate) config: SessionConfig,
    events: Option<mpsc::Sender<SessionEvent>>,

    // Cuts a parked loop's sleep short when the state changes under it.
    wake_tx: Sender<()>,
    pub(crate) wake_rx: Receiver<()>,
}

impl SessionShared {
    pub(crate) fn send_event(&self, event: SessionEvent) {
        if let Some(sender) = &self.events {
            if let Err(e) = sender.try_send(event) {
                debug!("Session event not delivered: {}", e);
            }
        }
    }

    pub(crate) fn wake(&self) {
        // A wake already pending covers this one.
        let _ = self.wake_tx.try_send(());
    }
}

struct Worker {
    thread: JoinHandle<()>,
    ack: Receiver<()>,
}

/// A capture session on one device, relaying everything it captures into a sink.
///
/// The sink must be set up before the session is started, and only released once `close` has
/// returned. Frames that turn up after a release are counted as dropped rather than written.
pub struct UsbSession {
    shared: Arc<SessionShared>,
    sink: Arc<AudioSink>,
    handle: Option<DeviceHandle>,
    worker: Option<Worker>,
}

impl UsbSession {
    pub fn new(
        native: Box<dyn NativeSession>,
        sink: Arc<AudioSink>,
        config: SessionConfig,
        events: Option<mpsc::Sender<SessionEvent>>,
    ) -> Self {
        let (wake_tx, wake_rx) = bounded(1);
        Self {
            shared: Arc::new(SessionShared {
                state: SessionStateCell::new(SessionState::Idle),
                native: Mutex::new(native),
                counters: Counters::default(),
                failure: Mutex::new(None),
                config,
                events,
                wake_tx,
                wake_rx,
            }),
            sink,
            handle: None,
            worker: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.state.load()
    }

    pub fn worker_alive(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| !worker.thread.is_finished())
    }

    pub fn setup(&mut self, handle: DeviceHandle) -> Result<(), SessionError> {
        let previous = self
            .shared
            .state
            .transition(&[SessionState::Idle, SessionState::Ready], SessionState::Opening)
            .map_err(|state| SessionError::InvalidState {
                operation: "set up",
                state,
            })?;

        if previous == SessionState::Ready {
            debug!("Re-opening session on {}", handle);
        }
        info!("Opening session on {}", handle);

        let result = lock(&self.shared.native).open(&handle);
        match result {
            Ok(()) => {
                self.shared
                    .state
                    .transition(&[SessionState::Opening], SessionState::Ready)
                    .map_err(|state| SessionError::InvalidState {
                        operation: "set up",
                        state,
                    })?;
                self.handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                error!("Unable to open {}: {}", handle, e);
                let reason = e.to_string();
                self.fail_from(SessionState::Opening, FailureCause::SetupFailed(reason.clone()));
                Err(SessionError::DeviceUnavailable(reason))
            }
        }
    }

    /// Starts capturing. Already running is fine, there's only ever one dispatch thread.
    pub fn start(&mut self) -> Result<(), SessionError> {
        match self.shared.state.load() {
            SessionState::Running => return Ok(()),
            SessionState::Ready => {}
            SessionState::Failed | SessionState::Closed => return Err(self.unavailable()),
            state => {
                return Err(SessionError::InvalidState {
                    operation: "start",
                    state,
                })
            }
        }

        self.ensure_worker()?;
        let started = lock(&self.shared.native).start();
        if let Err(e) = started {
            // Nothing steps a stopped session, so this is where an unplug shows up.
            if e.is_detached() {
                warn!("Device detached while stopped");
                self.fail_from(SessionState::Ready, FailureCause::Detached);
                return Err(SessionError::Detached);
            }
            error!("Unable to start capture: {}", e);
            return Err(SessionError::DeviceUnavailable(e.to_string()));
        }

        if let Err(state) = self
            .shared
            .state
            .transition(&[SessionState::Ready], SessionState::Running)
        {
            warn!("Session became {} while starting", state);
            let _ = lock(&self.shared.native).stop();
            return Err(self.unavailable());
        }
        self.shared.wake();

        info!("Session running");
        Ok(())
    }

    /// Stops capturing, the device stays open. The dispatch thread parks until the next
    /// `start`, anything it already took from the device is still relayed.
    pub fn stop(&mut self) -> Result<(), SessionError> {
        match self
            .shared
            .state
            .transition(&[SessionState::Running], SessionState::Ready)
        {
            Ok(_) => {}
            Err(SessionState::Ready) | Err(SessionState::Closed) => return Ok(()),
            Err(SessionState::Failed) => return Err(self.failure_error()),
            Err(state) => {
                return Err(SessionError::InvalidState {
                    operation: "stop",
                    state,
                })
            }
        }

        lock(&self.shared.native).stop().map_err(|e| {
            warn!("Error stopping capture: {}", e);
            SessionError::TransientIoError(e.to_string())
        })?;

        info!("Session stopped");
        Ok(())
    }

    /// Tells the dispatch loop to finish, waits for it, then releases the device.
    ///
    /// If the loop doesn't acknowledge within the close timeout it's abandoned, along with
    /// everything it holds. The session goes to Failed and the leak is logged.
    pub fn close(&mut self) -> Result<(), SessionError> {
        if let Some(timeout) = self.timed_out() {
            return Err(timeout);
        }

        let closable = [
            SessionState::Idle,
            SessionState::Ready,
            SessionState::Running,
            SessionState::Failed,
        ];
        match self.shared.state.transition(&closable, SessionState::Stopping) {
            Ok(previous) => {
                debug!("Closing session from {}", previous);
                self.shared.wake();
            }
            Err(SessionState::Closed) => return Ok(()),
            Err(state) => {
                return Err(SessionError::InvalidState {
                    operation: "close",
                    state,
                })
            }
        }

        if let Some(worker) = self.worker.take() {
            match worker.ack.recv_timeout(self.shared.config.close_timeout) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    if worker.thread.join().is_err() {
                        error!("Dispatch thread panicked");
                    }
                }
                Err(RecvTimeoutError::Timeout) => return Err(self.abandon(worker)),
            }
        }

        if let Err(e) = lock(&self.shared.native).close() {
            warn!("Error closing native session: {}", e);
        }

        let _ = self
            .shared
            .state
            .transition(&[SessionState::Stopping], SessionState::Closed);
        info!("Session closed");
        Ok(())
    }

    /// Frames relayed so far, or `STATS_UNAVAILABLE` outside Ready and Running.
    pub fn measure(&self) -> u64 {
        if self.shared.state.load().is_open() {
            self.shared.counters.frames_relayed.load(Ordering::Relaxed)
        } else {
            STATS_UNAVAILABLE
        }
    }

    pub fn stats(&self) -> SessionStats {
        let counters = &self.shared.counters;
        SessionStats {
            state: self.shared.state.load(),
            frames_relayed: counters.frames_relayed.load(Ordering::Relaxed),
            bytes_relayed: counters.bytes_relayed.load(Ordering::Relaxed),
            frames_dropped: counters.frames_dropped.load(Ordering::Relaxed),
            write_failures: counters.write_failures.load(Ordering::Relaxed),
            transient_errors: counters.transient_errors.load(Ordering::Relaxed),
            native_bytes: counters.native_bytes.load(Ordering::Relaxed),
        }
    }

    fn ensure_worker(&mut self) -> Result<(), SessionError> {
        if self.worker_alive() {
            return Ok(());
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.thread.join();
        }

        let (ack_tx, ack_rx) = bounded(1);
        let dispatch = DispatchLoop::new(self.shared.clone(), self.sink.clone(), ack_tx);
        let thread = thread::Builder::new()
            .name(String::from("uac-dispatch"))
            .spawn(move || dispatch.run())
            .map_err(|e| {
                SessionError::DeviceUnavailable(format!("Unable to spawn dispatch thread: {}", e))
            })?;

        self.worker = Some(Worker {
            thread,
            ack: ack_rx,
        });
        Ok(())
    }

    fn abandon(&mut self, worker: Worker) -> SessionError {
        let timeout_millis = self.shared.config.close_timeout.as_millis() as u64;
        let descriptor = self.handle.as_ref().and_then(|handle| handle.file_descriptor());

        {
            let mut failure = lock(&self.shared.failure);
            let _ = self
                .shared
                .state
                .transition(&[SessionState::Stopping], SessionState::Failed);
            *failure = Some(FailureCause::TimedOut { timeout_millis });
        }

        let device = self
            .handle
            .as_ref()
            .map(|handle| handle.to_string())
            .unwrap_or_else(|| String::from("unknown device"));
        match descriptor {
            Some(fd) => error!(
                "Dispatch loop did not stop within {}ms, abandoning it with descriptor {} for {} still open",
                timeout_millis, fd, device
            ),
            None => error!(
                "Dispatch loop did not stop within {}ms, abandoning it with {} still claimed",
                timeout_millis, device
            ),
        }

        // Dropping the handle detaches the thread, it'll exit whenever its step returns.
        drop(worker);
        self.shared
            .send_event(SessionEvent::Failed(String::from("close timed out")));

        SessionError::SessionTimeout {
            timeout_millis,
            descriptor,
        }
    }

    fn fail_from(&self, from: SessionState, cause: FailureCause) {
        let mut failure = lock(&self.shared.failure);
        if self.shared.state.transition(&[from], SessionState::Failed).is_ok() {
            let event = match &cause {
                FailureCause::Detached => SessionEvent::Detached,
                FailureCause::SetupFailed(e) | FailureCause::Fatal(e) => {
                    SessionEvent::Failed(e.clone())
                }
                FailureCause::TimedOut { .. } => {
                    SessionEvent::Failed(String::from("close timed out"))
                }
            };
            *failure = Some(cause);
            drop(failure);
            self.shared.send_event(event);
            self.shared.wake();
        }
    }

    fn timed_out(&self) -> Option<SessionError> {
        match *lock(&self.shared.failure) {
            Some(FailureCause::TimedOut { timeout_millis }) => Some(SessionError::SessionTimeout {
                timeout_millis,
                descriptor: self.handle.as_ref().and_then(|handle| handle.file_descriptor()),
            }),
            _ => None,
        }
    }

    /// What a failed session reports from `stop`.
    fn failure_error(&self) -> SessionError {
        match &*lock(&self.shared.failure) {
            Some(FailureCause::Detached) => SessionError::Detached,
            Some(FailureCause::TimedOut { timeout_millis }) => SessionError::SessionTimeout {
                timeout_millis: *timeout_millis,
                descriptor: self.handle.as_ref().and_then(|handle| handle.file_descriptor()),
            },
            Some(FailureCause::SetupFailed(e)) | Some(FailureCause::Fatal(e)) => {
                SessionError::DeviceUnavailable(e.clone())
            }
            None => SessionError::DeviceUnavailable(String::from("session failed")),
        }
    }

    /// What `start` reports once the session can't be started again.
    fn unavailable(&self) -> SessionError {
        if self.shared.state.load() == SessionState::Closed {
            return SessionError::DeviceUnavailable(String::from("session is closed"));
        }
        let reason = match &*lock(&self.shared.failure) {
            Some(FailureCause::Detached) => String::from("device was detached"),
            Some(FailureCause::TimedOut { .. }) => String::from("session timed out closing"),
            Some(FailureCause::SetupFailed(e)) | Some(FailureCause::Fatal(e)) => e.clone(),
            None => String::from("session failed"),
        };
        SessionError::DeviceUnavailable(reason)
    }
}

impl Drop for UsbSession {
    fn drop(&mut self) {
        if self.shared.state.load() == SessionState::Closed {
            return;
        }
        if let Err(e) = self.close() {
            debug!("Session not closed cleanly on drop: {}", e);
        }
    }
}

// A panicking thread can't leave any of our mutexes half-updated, so carry on past poison.
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{memory_sink, wait_until, Memory, Tally, Scripted, ScriptedNative};
    use std::time::Duration;
    use uac_audio::FrameObserver;
    use uac_types::AudioFrame;

    fn handle() -> DeviceHandle {
        DeviceHandle::new(0x0d8c, 0x0014, 7, 1, 4)
    }

    fn config() -> SessionConfig {
        SessionConfig {
            close_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(1),
            max_consecutive_errors: None,
        }
    }

    struct Rig {
        session: UsbSession,
        sink: Arc<AudioSink>,
        tally: Tally,
        memory: Memory,
    }

    fn rig_with(config: SessionConfig, events: Option<mpsc::Sender<SessionEvent>>) -> Rig {
        let (native, tally) = ScriptedNative::new();
        let (sink, memory) = memory_sink();
        let session = UsbSession::new(Box::new(native), sink.clone(), config, events);
        Rig {
            session,
            sink,
            tally,
            memory,
        }
    }

    fn rig() -> Rig {
        rig_with(config(), None)
    }

    // Sink ready, session open and running.
    fn running(rig: &mut Rig) {
        rig.sink.setup(None).unwrap();
        rig.sink.start();
        rig.session.setup(handle()).unwrap();
        rig.session.start().unwrap();
    }

    fn script(rig: &Rig, entry: Scripted) {
        rig.tally.lock().unwrap().script.push_back(entry);
    }

    fn script_taken(rig: &Rig) -> bool {
        rig.tally.lock().unwrap().script.is_empty()
    }

    fn written(rig: &Rig) -> Vec<u8> {
        rig.memory.lock().unwrap().bytes.clone()
    }

    #[test]
    fn setup_then_close_is_closed_with_no_worker() {
        let mut rig = rig();
        rig.session.setup(handle()).unwrap();
        assert_eq!(rig.session.state(), SessionState::Ready);

        rig.session.close().unwrap();

        assert_eq!(rig.session.state(), SessionState::Closed);
        assert!(!rig.session.worker_alive());
        assert_eq!(rig.tally.lock().unwrap().closes, 1);
    }

    #[test]
    fn close_joins_running_worker() {
        let mut rig = rig();
        running(&mut rig);
        assert!(rig.session.worker_alive());

        rig.session.close().unwrap();

        assert_eq!(rig.session.state(), SessionState::Closed);
        assert!(!rig.session.worker_alive());
        assert_eq!(rig.tally.lock().unwrap().closes, 1);
    }

    #[test]
    fn start_with_no_frames_is_fine() {
        let mut rig = rig();
        running(&mut rig);

        assert_eq!(rig.session.state(), SessionState::Running);
        assert_eq!(rig.session.measure(), 0);

        // A second start neither fails nor starts anything new.
        rig.session.start().unwrap();
        assert_eq!(rig.tally.lock().unwrap().starts, 1);
    }

    #[test]
    fn start_before_setup_is_rejected() {
        let mut rig = rig();
        assert_eq!(
            rig.session.start(),
            Err(SessionError::InvalidState {
                operation: "start",
                state: SessionState::Idle
            })
        );
        assert!(!rig.session.worker_alive());
    }

    #[test]
    fn frames_are_relayed_in_order() {
        let mut rig = rig();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_inner = seen.clone();
        let observer: FrameObserver = Arc::new(move |frame: &AudioFrame| {
            seen_inner.lock().unwrap().push(frame.as_bytes()[0]);
        });
        rig.sink.setup(Some(observer)).unwrap();
        rig.sink.start();
        rig.session.setup(handle()).unwrap();
        rig.session.start().unwrap();

        script(&rig, Scripted::Frames(vec![vec![1; 4], vec![2; 4]]));
        script(&rig, Scripted::Frames(vec![vec![3; 4]]));

        assert!(wait_until(|| seen.lock().unwrap().len() == 3));
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(written(&rig), vec![1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3]);

        assert_eq!(rig.session.measure(), 3);
        let stats = rig.session.stats();
        assert_eq!(stats.bytes_relayed, 12);
        assert_eq!(stats.native_bytes, 12);

        rig.session.close().unwrap();
    }

    #[test]
    fn measure_is_sentinel_when_not_open() {
        let mut rig = rig();
        assert_eq!(rig.session.measure(), STATS_UNAVAILABLE);

        rig.session.setup(handle()).unwrap();
        assert_eq!(rig.session.measure(), 0);

        rig.session.close().unwrap();
        assert_eq!(rig.session.measure(), STATS_UNAVAILABLE);
    }

    #[test]
    fn close_twice_has_one_effect() {
        let mut rig = rig();
        running(&mut rig);

        assert_eq!(rig.session.close(), Ok(()));
        assert_eq!(rig.session.close(), Ok(()));

        assert_eq!(rig.session.state(), SessionState::Closed);
        assert_eq!(rig.tally.lock().unwrap().closes, 1);
    }

    #[test]
    fn failed_setup_fails_session() {
        let mut rig = rig();
        rig.tally.lock().unwrap().fail_open = true;

        let result = rig.session.setup(handle());

        assert!(matches!(result, Err(SessionError::DeviceUnavailable(_))));
        assert_eq!(rig.session.state(), SessionState::Failed);
        assert_eq!(rig.session.measure(), STATS_UNAVAILABLE);
        assert!(matches!(
            rig.session.start(),
            Err(SessionError::DeviceUnavailable(_))
        ));
    }

    #[test]
    fn detach_while_running_fails_session() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut rig = rig_with(config(), Some(tx));
        running(&mut rig);

        script(&rig, Scripted::Detach);

        assert!(wait_until(|| rig.session.state() == SessionState::Failed));
        assert!(matches!(
            rig.session.start(),
            Err(SessionError::DeviceUnavailable(_))
        ));
        assert_eq!(rig.session.stop(), Err(SessionError::Detached));

        assert!(wait_until(|| !rig.session.worker_alive()));
        assert_eq!(rx.try_recv(), Ok(SessionEvent::Detached));
        assert_eq!(rx.try_recv(), Ok(SessionEvent::LoopExited));

        // Closing still hands the device back.
        rig.session.close().unwrap();
        assert_eq!(rig.session.state(), SessionState::Closed);
        assert_eq!(rig.tally.lock().unwrap().closes, 1);
    }

    #[test]
    fn fatal_step_fails_session() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut rig = rig_with(config(), Some(tx));
        running(&mut rig);

        script(&rig, Scripted::Fatal);

        assert!(wait_until(|| !rig.session.worker_alive()));
        assert_eq!(rig.session.state(), SessionState::Failed);
        assert_eq!(rx.try_recv(), Ok(SessionEvent::Failed(String::from("scripted"))));
    }

    #[test]
    fn transient_errors_are_tolerated_by_default() {
        let mut rig = rig();
        running(&mut rig);

        script(&rig, Scripted::Transient);
        script(&rig, Scripted::Transient);
        script(&rig, Scripted::Frames(vec![vec![9; 4]]));

        assert!(wait_until(|| written(&rig).len() == 4));
        assert_eq!(rig.session.state(), SessionState::Running);
        assert_eq!(rig.session.stats().transient_errors, 2);
    }

    #[test]
    fn consecutive_transient_errors_hit_threshold() {
        let mut config = config();
        config.max_consecutive_errors = Some(3);
        let mut rig = rig_with(config, None);
        running(&mut rig);

        for _ in 0..3 {
            script(&rig, Scripted::Transient);
        }

        assert!(wait_until(|| rig.session.state() == SessionState::Failed));
        assert_eq!(rig.session.stats().transient_errors, 3);
    }

    #[test]
    fn a_good_step_resets_the_error_count() {
        let mut config = config();
        config.max_consecutive_errors = Some(2);
        let mut rig = rig_with(config, None);
        running(&mut rig);

        script(&rig, Scripted::Transient);
        script(&rig, Scripted::Frames(vec![vec![1; 4]]));
        script(&rig, Scripted::Transient);
        script(&rig, Scripted::Frames(vec![vec![2; 4]]));

        assert!(wait_until(|| written(&rig).len() == 8));
        assert_eq!(rig.session.state(), SessionState::Running);
    }

    #[test]
    fn frames_in_flight_at_stop_are_still_relayed() {
        let mut rig = rig();
        running(&mut rig);
        rig.tally.lock().unwrap().step_delay = Duration::from_millis(100);

        script(&rig, Scripted::Frames(vec![vec![1; 4], vec![2; 4], vec![3; 4]]));
        assert!(wait_until(|| script_taken(&rig)));

        rig.session.stop().unwrap();
        assert_eq!(rig.session.state(), SessionState::Ready);

        assert!(wait_until(|| written(&rig).len() == 12));
        assert_eq!(rig.tally.lock().unwrap().stops, 1);
        assert_eq!(rig.session.stats().frames_dropped, 0);
    }

    #[test]
    fn frames_after_release_are_dropped() {
        let mut rig = rig();
        running(&mut rig);
        rig.tally.lock().unwrap().step_delay = Duration::from_millis(100);

        script(&rig, Scripted::Frames(vec![vec![1; 4], vec![2; 4], vec![3; 4]]));
        assert!(wait_until(|| script_taken(&rig)));
        rig.sink.release();

        assert!(wait_until(|| rig.session.stats().frames_dropped == 3));
        assert!(written(&rig).is_empty());
        assert_eq!(rig.session.measure(), 3);
    }

    #[test]
    fn stop_then_start_resumes() {
        let mut rig = rig();
        running(&mut rig);

        script(&rig, Scripted::Frames(vec![vec![1; 4]]));
        assert!(wait_until(|| written(&rig).len() == 4));

        rig.session.stop().unwrap();
        rig.session.stop().unwrap();
        assert_eq!(rig.session.state(), SessionState::Ready);
        assert!(rig.session.worker_alive());

        rig.session.start().unwrap();
        script(&rig, Scripted::Frames(vec![vec![2; 4]]));
        assert!(wait_until(|| written(&rig).len() == 8));

        let tally = rig.tally.lock().unwrap();
        assert_eq!(tally.starts, 2);
        assert_eq!(tally.stops, 1);
    }

    #[test]
    fn stopped_session_closes_without_waiting_out_the_poll() {
        let mut config = config();
        config.poll_interval = Duration::from_secs(5);
        config.close_timeout = Duration::from_millis(500);
        let mut rig = rig_with(config, None);
        running(&mut rig);

        script(&rig, Scripted::Frames(vec![vec![1; 4]]));
        assert!(wait_until(|| written(&rig).len() == 4));
        rig.session.stop().unwrap();

        let started = std::time::Instant::now();
        assert_eq!(rig.session.close(), Ok(()));
        assert!(started.elapsed() < Duration::from_millis(500));

        assert_eq!(rig.session.state(), SessionState::Closed);
        assert!(!rig.session.worker_alive());
        assert_eq!(rig.tally.lock().unwrap().closes, 1);
    }

    #[test]
    fn detach_while_stopped_fails_on_start() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut rig = rig_with(config(), Some(tx));
        running(&mut rig);
        rig.session.stop().unwrap();
        rig.tally.lock().unwrap().detach_on_start = true;

        assert_eq!(rig.session.start(), Err(SessionError::Detached));
        assert_eq!(rig.session.state(), SessionState::Failed);
        assert!(matches!(
            rig.session.start(),
            Err(SessionError::DeviceUnavailable(_))
        ));
        assert_eq!(rig.session.stop(), Err(SessionError::Detached));

        assert!(wait_until(|| !rig.session.worker_alive()));
        let events: Vec<SessionEvent> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(events.contains(&SessionEvent::Detached));

        rig.session.close().unwrap();
        assert_eq!(rig.session.state(), SessionState::Closed);
        assert_eq!(rig.tally.lock().unwrap().closes, 1);
    }

    #[test]
    fn start_failure_that_is_not_a_detach_leaves_session_ready() {
        let mut rig = rig();
        rig.session.setup(handle()).unwrap();
        rig.tally.lock().unwrap().fail_start = true;

        assert!(matches!(
            rig.session.start(),
            Err(SessionError::DeviceUnavailable(_))
        ));
        assert_eq!(rig.session.state(), SessionState::Ready);

        rig.tally.lock().unwrap().fail_start = false;
        rig.session.start().unwrap();
        assert_eq!(rig.session.state(), SessionState::Running);
        rig.session.close().unwrap();
    }

    #[test]
    fn unacknowledged_close_times_out() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut config = config();
        config.close_timeout = Duration::from_millis(50);
        let mut rig = rig_with(config, Some(tx));
        running(&mut rig);
        rig.tally.lock().unwrap().step_delay = Duration::from_millis(500);

        script(&rig, Scripted::Frames(vec![vec![0; 4]]));
        assert!(wait_until(|| script_taken(&rig)));

        let expected = SessionError::SessionTimeout {
            timeout_millis: 50,
            descriptor: Some(7),
        };
        assert_eq!(rig.session.close(), Err(expected.clone()));
        assert_eq!(rig.session.state(), SessionState::Failed);
        assert_eq!(rig.session.measure(), STATS_UNAVAILABLE);

        // Nothing further happens on a second close, the native side is never touched.
        assert_eq!(rig.session.close(), Err(expected));
        assert_eq!(rig.tally.lock().unwrap().closes, 0);
        assert_eq!(
            rx.try_recv(),
            Ok(SessionEvent::Failed(String::from("close timed out")))
        );
    }
}

use crate::cli::{Cli, OutputKind};
use crate::settings::SettingsHandle;
use crate::shutdown::{Shutdown, ShutdownReason};
use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use uac_audio::{
    get_audio_outputs, get_output_opener, tap_observer, AudioSink, OpenOutputStream, OutputTarget, SampleTap,
};
use uac_session::{SessionError, SessionEvent, UsbSession, STATS_UNAVAILABLE};
use uac_types::DeviceHandle;
use uac_usb::devices;
use uac_usb::error::AcquireError;
use uac_usb::LibUsbSession;

// How long a single native step waits for USB events before checking the session state again.
const STEP_TIMEOUT: Duration = Duration::from_millis(50);

// The window the level meter looks at.
const TAP_MILLIS: usize = 250;

pub fn list_devices() {
    let devices = devices::find_audio_devices();
    if devices.is_empty() {
        println!("No USB audio devices found");
    }
    for device in devices {
        let capture = if device.can_capture {
            "capture"
        } else {
            "no capture interface"
        };
        println!("{} ({})", device.handle, capture);
    }

    // Only the CPAL backend can name its outputs, these are what `output_device` accepts.
    let outputs = get_audio_outputs();
    if !outputs.is_empty() {
        println!();
        println!("Audio outputs:");
        for output in outputs {
            println!("  {}", output);
        }
    }
}

pub fn acquire_device(args: &Cli) -> Result<DeviceHandle> {
    let result = match (args.bus, args.address) {
        (Some(bus), Some(address)) => devices::acquire(bus, address),
        _ => devices::acquire_first_capture_device(),
    };
    check_acquired(result)
}

fn check_acquired(result: Result<DeviceHandle, AcquireError>) -> Result<DeviceHandle> {
    match result {
        Ok(handle) => {
            info!("Using device {}", handle);
            Ok(handle)
        }
        Err(AcquireError::PermissionDenied(location)) => {
            error!("Permission denied opening the device at {}.", location);
            error!("The relay needs write access to the device node, usually granted with a");
            error!("udev rule for the device's vendor and product id.");
            Err(SessionError::PermissionDenied(location).into())
        }
        Err(e) => Err(SessionError::from(e)).context("Unable to acquire a USB audio device"),
    }
}

fn get_opener(args: &Cli, settings_device: Option<String>) -> Result<Box<dyn OpenOutputStream>> {
    let wav = OutputTarget::Wav(args.wav_path.clone());
    match args.output {
        OutputKind::Wav => get_output_opener(&wav),
        OutputKind::Auto => match get_output_opener(&OutputTarget::Platform(settings_device)) {
            Ok(opener) => Ok(opener),
            Err(e) => {
                warn!("{}, writing to {} instead", e, args.wav_path.display());
                get_output_opener(&wav)
            }
        },
    }
}

/// Relays audio from the device until asked to stop, or the device goes away.
pub async fn run(
    args: &Cli,
    settings: &SettingsHandle,
    handle: DeviceHandle,
    mut shutdown: Shutdown,
) -> Result<()> {
    let sink_config = settings.sink_config().await;
    let opener = get_opener(args, sink_config.device.clone())?;
    let sink = Arc::new(AudioSink::new(opener, sink_config));

    let tap = Arc::new(Mutex::new(SampleTap::for_millis(sink.format(), TAP_MILLIS)));
    sink.setup(Some(tap_observer(tap.clone())))
        .map_err(SessionError::from)
        .context("Unable to open the audio output")?;

    let (event_tx, mut event_rx) = mpsc::channel(8);
    let native = LibUsbSession::new(STEP_TIMEOUT);
    let mut session = UsbSession::new(
        Box::new(native),
        sink.clone(),
        settings.session_config().await,
        Some(event_tx),
    );

    if let Err(e) = session.setup(handle) {
        sink.release();
        return Err(e).context("Unable to set up the capture session");
    }

    sink.start();
    if let Err(e) = session.start() {
        let _ = session.close();
        sink.release();
        return Err(e).context("Unable to start capturing");
    }

    let mut stats_timer = tokio::time::interval(settings.stats_interval().await);
    stats_timer.tick().await;

    let reason = loop {
        tokio::select! {
            reason = shutdown.recv() => break reason,
            Some(event) = event_rx.recv() => match event {
                SessionEvent::Detached => {
                    warn!("Device {} has been detached", handle);
                    break ShutdownReason::DeviceLost;
                }
                SessionEvent::Failed(e) => {
                    error!("Capture session failed: {}", e);
                    break ShutdownReason::DeviceLost;
                }
                SessionEvent::LoopExited => debug!("Dispatch loop has exited"),
            },
            _ = stats_timer.tick() => log_stats(&session, &sink, &tap),
        }
    };
    info!("Stopping relay: {}", reason);

    // The session has to be fully closed before the sink is paused or released, the frames
    // drained after stop still have to reach a playing output.
    if let Err(e) = session.stop() {
        debug!("Stop reported: {}", e);
    }
    let closed = session.close();
    sink.stop();
    log_stats(&session, &sink, &tap);
    sink.release();

    match closed {
        Err(e @ SessionError::SessionTimeout { .. }) => Err(e).context("Device was not released"),
        _ => Ok(()),
    }
}

fn log_stats(session: &UsbSession, sink: &AudioSink, tap: &Mutex<SampleTap>) {
    let stats = session.stats();
    let sink_stats = sink.stats();
    let peak = tap
        .lock()
        .map(|tap| tap.peak_dbfs())
        .unwrap_or(f32::NEG_INFINITY);

    let frames = match session.measure() {
        STATS_UNAVAILABLE => String::from("-"),
        frames => frames.to_string(),
    };

    info!(
        "[{}] frames {} ({} bytes relayed, {} from device), {} written, {} dropped, {} write failures, {} transient errors, peak {:.1} dBFS",
        stats.state,
        frames,
        stats.bytes_relayed,
        stats.native_bytes,
        sink_stats.frames_written,
        stats.frames_dropped,
        stats.write_failures,
        stats.transient_errors,
        peak
    );
}

pub async fn await_ctrl_c(shutdown: Shutdown) {
    if tokio::signal::ctrl_c().await.is_ok() {
        shutdown.trigger(ShutdownReason::Interrupted);
    }
}

pub async fn stop_after(duration: Duration, shutdown: Shutdown) {
    tokio::time::sleep(duration).await;
    shutdown.trigger(ShutdownReason::DurationElapsed);
}

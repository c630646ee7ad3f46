use clap::{Parser, ValueEnum};
use directories::ProjectDirs;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(about, version)]
pub struct Cli {
    /// Minimum log level to print out
    #[clap(long, value_enum, default_value = "info")]
    pub log_level: LevelFilter,

    /// Location of the relay configuration file on disk
    #[clap(long, default_value_os_t = default_config_location())]
    pub config: PathBuf,

    /// List the USB audio devices that can be seen, then exit
    #[clap(long)]
    pub list: bool,

    /// Bus number of the device to capture from (defaults to the first capture device found)
    #[clap(long, requires = "address")]
    pub bus: Option<u8>,

    /// Address of the device on its bus
    #[clap(long, requires = "bus")]
    pub address: Option<u8>,

    /// Where captured audio should go
    #[clap(long, value_enum, default_value = "auto")]
    pub output: OutputKind,

    /// File to write when the output is a WAV file
    #[clap(long, default_value = "capture.wav")]
    pub wav_path: PathBuf,

    /// Stop after this many seconds, rather than waiting for Ctrl+C
    #[clap(long)]
    pub duration: Option<u64>,
}

fn default_config_location() -> PathBuf {
    match ProjectDirs::from("org", "uac-relay", "UAC-Relay") {
        Some(proj_dirs) => proj_dirs.config_dir().join("settings.json"),
        None => PathBuf::from("settings.json"),
    }
}

#[derive(ValueEnum, Copy, Clone, Eq, PartialEq, Debug)]
pub enum OutputKind {
    /// The platform's audio system, falling back to a WAV file if it's not available
    Auto,
    /// Always write to a WAV file
    Wav,
}

#[repr(usize)]
#[derive(ValueEnum, Copy, Clone, Eq, PartialEq, Debug)]
pub enum LevelFilter {
    /// A level lower than all log levels.
    Off,
    /// Corresponds to the `Error` log level.
    Error,
    /// Corresponds to the `Warn` log level.
    Warn,
    /// Corresponds to the `Info` log level.
    Info,
    /// Corresponds to the `Debug` log level.
    Debug,
    /// Corresponds to the `Trace` log level.
    Trace,
}

impl From<LevelFilter> for log::LevelFilter {
    fn from(value: LevelFilter) -> Self {
        match value {
            LevelFilter::Off => log::LevelFilter::Off,
            LevelFilter::Error => log::LevelFilter::Error,
            LevelFilter::Warn => log::LevelFilter::Warn,
            LevelFilter::Info => log::LevelFilter::Info,
            LevelFilter::Debug => log::LevelFilter::Debug,
            LevelFilter::Trace => log::LevelFilter::Trace,
        }
    }
}

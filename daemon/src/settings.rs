use anyhow::{Context, Result};
use log::error;
use serde::{Deserialize, Serialize};
use std::fs::{create_dir_all, File};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uac_audio::SinkConfig;
use uac_session::SessionConfig;

#[derive(Clone)]
pub struct SettingsHandle {
    path: PathBuf,
    settings: Arc<RwLock<Settings>>,
}

impl SettingsHandle {
    pub async fn load(path: PathBuf) -> Result<SettingsHandle> {
        let settings = Settings::read(&path)?;
        let handle = SettingsHandle {
            path,
            settings: Arc::new(RwLock::new(settings)),
        };
        handle.save().await;
        Ok(handle)
    }

    pub async fn save(&self) {
        let settings = self.settings.read().await;
        if let Err(e) = settings.write(&self.path) {
            error!(
                "Couldn't save settings to {}: {}",
                self.path.to_string_lossy(),
                e
            );
        }
    }

    pub async fn session_config(&self) -> SessionConfig {
        self.settings.read().await.session_config()
    }

    pub async fn sink_config(&self) -> SinkConfig {
        self.settings.read().await.sink_config()
    }

    pub async fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.settings.read().await.stats_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub buffer_millis: usize,
    pub close_timeout_millis: u64,
    pub poll_interval_millis: u64,
    pub max_consecutive_errors: Option<u32>,
    pub write_timeout_millis: u64,
    pub output_device: Option<String>,
    pub stats_interval_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            buffer_millis: 200,
            close_timeout_millis: 2000,
            poll_interval_millis: 20,
            max_consecutive_errors: None,
            write_timeout_millis: 500,
            output_device: None,
            stats_interval_secs: 5,
        }
    }
}

impl Settings {
    pub fn read(path: &Path) -> Result<Settings> {
        match File::open(path) {
            Ok(reader) => serde_json::from_reader(reader).context(format!(
                "Could not parse relay settings file at {}",
                path.to_string_lossy()
            )),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(Settings::default()),
            Err(error) => Err(error).context(format!(
                "Could not open relay settings file for reading at {}",
                path.to_string_lossy()
            )),
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if let Err(e) = create_dir_all(parent) {
                if e.kind() != ErrorKind::AlreadyExists {
                    return Err(e).context(format!(
                        "Could not create settings directory at {}",
                        parent.to_string_lossy()
                    ))?;
                }
            }
        }
        let writer = File::create(path).context(format!(
            "Could not open relay settings file for writing at {}",
            path.to_string_lossy()
        ))?;
        serde_json::to_writer_pretty(writer, self).context(format!(
            "Could not write to relay settings file at {}",
            path.to_string_lossy()
        ))?;
        Ok(())
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            close_timeout: Duration::from_millis(self.close_timeout_millis),
            poll_interval: Duration::from_millis(self.poll_interval_millis.max(1)),
            max_consecutive_errors: self.max_consecutive_errors,
        }
    }

    pub fn sink_config(&self) -> SinkConfig {
        SinkConfig {
            buffer_millis: self.buffer_millis,
            write_timeout: Duration::from_millis(self.write_timeout_millis),
            device: self.output_device.clone(),
        }
    }
}

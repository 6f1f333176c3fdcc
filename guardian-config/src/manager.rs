//! Owner of the current validated configuration.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use tokio::sync::watch;
use tracing::info;

use crate::error::{ConfigError, Result};
use crate::loader::load_file;
use crate::models::GuardianConfig;
use crate::validation::validate;

/// Loads, validates, and atomically swaps the configuration document.
///
/// Consumers hold `Arc<GuardianConfig>` value snapshots; a swap never mutates
/// a snapshot someone else is reading. Reload notifications carry the
/// generation counter and are published at most once per successful swap
/// (the watch channel coalesces bursts, which is fine because the supervisor
/// re-reads `current()` when it wakes).
#[derive(Debug)]
pub struct ConfigManager {
    path: Option<PathBuf>,
    current: RwLock<Arc<GuardianConfig>>,
    reload_tx: watch::Sender<u64>,
}

impl ConfigManager {
    /// Wrap an already-built document. Used by tests and embedders.
    pub fn from_value(config: GuardianConfig) -> Result<Self> {
        validate(&config)?;
        let (reload_tx, _) = watch::channel(0);
        Ok(Self {
            path: None,
            current: RwLock::new(Arc::new(config)),
            reload_tx,
        })
    }

    /// Load from a TOML file (plus environment overlay) and remember the path
    /// for subsequent [`ConfigManager::reload`] calls.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = load_file(&path)?;
        let (reload_tx, _) = watch::channel(0);
        Ok(Self {
            path: Some(path),
            current: RwLock::new(Arc::new(config)),
            reload_tx,
        })
    }

    /// Snapshot of the current validated document.
    pub fn current(&self) -> Arc<GuardianConfig> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Number of successful swaps since startup.
    pub fn generation(&self) -> u64 {
        *self.reload_tx.borrow()
    }

    /// Subscribe to reload notifications. The payload is the generation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.reload_tx.subscribe()
    }

    /// Re-read the backing file, validate, and swap. The old document stays
    /// in place when anything fails.
    pub fn reload(&self) -> Result<Arc<GuardianConfig>> {
        let path = self.path.as_ref().ok_or_else(|| {
            ConfigError::Validation("reload requested but no config path is set".into())
        })?;
        let config = load_file(path)?;
        Ok(self.swap(config))
    }

    /// Validate and swap in a new document, notifying subscribers.
    pub fn replace(&self, config: GuardianConfig) -> Result<Arc<GuardianConfig>> {
        validate(&config)?;
        Ok(self.swap(config))
    }

    fn swap(&self, config: GuardianConfig) -> Arc<GuardianConfig> {
        let config = Arc::new(config);
        {
            let mut current = self
                .current
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *current = config.clone();
        }
        self.reload_tx.send_modify(|generation| *generation += 1);
        info!(generation = self.generation(), "configuration swapped");
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CameraConfig, ChannelOverrides};
    use std::io::Write;

    fn config_with_camera(input: &str) -> GuardianConfig {
        let mut config = GuardianConfig::default();
        config.video.cameras.push(CameraConfig {
            id: "front".into(),
            channel: Some("cam-a".into()),
            input: input.into(),
            overrides: ChannelOverrides::default(),
        });
        config
    }

    #[test]
    fn replace_notifies_subscribers_once_per_swap() {
        let manager = ConfigManager::from_value(config_with_camera("rtsp://a")).unwrap();
        let rx = manager.subscribe();
        assert_eq!(manager.generation(), 0);

        manager.replace(config_with_camera("rtsp://b")).unwrap();
        assert_eq!(manager.generation(), 1);
        assert!(rx.has_changed().unwrap());
        assert_eq!(
            manager.current().video.cameras[0].input,
            "rtsp://b".to_string()
        );
    }

    #[test]
    fn invalid_replacement_keeps_old_document() {
        let manager = ConfigManager::from_value(config_with_camera("rtsp://a")).unwrap();
        let mut bad = config_with_camera("rtsp://b");
        bad.logging.level = "verbose".into();

        assert!(manager.replace(bad).is_err());
        assert_eq!(manager.generation(), 0);
        assert_eq!(manager.current().video.cameras[0].input, "rtsp://a");
    }

    #[test]
    fn reload_reads_backing_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "[[video.cameras]]\nid = \"front\"\nchannel = \"cam-a\"\ninput = \"rtsp://a\"\n"
        )
        .unwrap();
        file.flush().unwrap();

        let manager = ConfigManager::load(file.path()).unwrap();
        assert_eq!(manager.current().video.cameras[0].input, "rtsp://a");

        // Rewrite the file and reload.
        let mut handle = std::fs::File::create(file.path()).unwrap();
        write!(
            handle,
            "[[video.cameras]]\nid = \"front\"\nchannel = \"cam-a\"\ninput = \"rtsp://b\"\n"
        )
        .unwrap();
        handle.flush().unwrap();

        let reloaded = manager.reload().unwrap();
        assert_eq!(reloaded.video.cameras[0].input, "rtsp://b");
        assert_eq!(manager.generation(), 1);
    }

    #[test]
    fn reload_without_path_fails() {
        let manager = ConfigManager::from_value(config_with_camera("rtsp://a")).unwrap();
        assert!(manager.reload().is_err());
    }
}

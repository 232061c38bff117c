//! Persisted settings (spec.md §6): a small versioned record behind a
//! `SettingsStore` trait, saved with a 250 ms debounce so a burst of slider
//! movements collapses into one write.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

pub const SETTINGS_VERSION: u8 = 1;
pub const SAVE_DEBOUNCE: std::time::Duration = std::time::Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSettings {
    pub version: u8,
    pub volume_pct: u8,
    pub mic_gain_db: i8,
    pub flags: u8,
}

pub const FLAG_AUTO_ANSWER: u8 = 0x01;
pub const FLAG_AEC_ENABLED: u8 = 0x02;

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            volume_pct: 100,
            mic_gain_db: 0,
            flags: FLAG_AEC_ENABLED,
        }
    }
}

impl EndpointSettings {
    pub fn auto_answer(&self) -> bool {
        self.flags & FLAG_AUTO_ANSWER != 0
    }

    pub fn aec_enabled(&self) -> bool {
        self.flags & FLAG_AEC_ENABLED != 0
    }

    pub fn set_auto_answer(&mut self, enabled: bool) {
        set_flag(&mut self.flags, FLAG_AUTO_ANSWER, enabled);
    }

    pub fn set_aec_enabled(&mut self, enabled: bool) {
        set_flag(&mut self.flags, FLAG_AEC_ENABLED, enabled);
    }
}

fn set_flag(flags: &mut u8, bit: u8, enabled: bool) {
    if enabled {
        *flags |= bit;
    } else {
        *flags &= !bit;
    }
}

/// The external key/value collaborator spec.md §1 scopes out of this
/// spec's core; this trait is the interface the rest of the crate depends
/// on instead of a concrete store.
pub trait SettingsStore: Send + Sync {
    fn load(&self) -> Option<EndpointSettings>;
    fn save(&self, settings: &EndpointSettings);
}

/// JSON file-backed store under one stable path, standing in for the
/// "external key/value under one stable key" spec.md describes.
pub struct FileSettingsStore {
    path: PathBuf,
}

impl FileSettingsStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl SettingsStore for FileSettingsStore {
    fn load(&self) -> Option<EndpointSettings> {
        let data = std::fs::read(&self.path).ok()?;
        match serde_json::from_slice::<EndpointSettings>(&data) {
            Ok(settings) if settings.version == SETTINGS_VERSION => Some(settings),
            Ok(other) => {
                warn!(
                    "ignoring settings file with unknown version {}",
                    other.version
                );
                None
            }
            Err(e) => {
                warn!("failed to parse settings file: {e}");
                None
            }
        }
    }

    fn save(&self, settings: &EndpointSettings) {
        match serde_json::to_vec_pretty(settings) {
            Ok(data) => {
                if let Some(parent) = self.path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                if let Err(e) = std::fs::write(&self.path, data) {
                    warn!("failed to write settings file: {e}");
                }
            }
            Err(e) => warn!("failed to serialize settings: {e}"),
        }
    }
}

/// Debounces writes to a `SettingsStore`: each `mutate` call updates the
/// in-memory value immediately and schedules a save 250 ms later, cancelling
/// (via a generation counter) any save scheduled by an earlier mutation.
pub struct DebouncedSettings {
    current: AsyncMutex<EndpointSettings>,
    store: Arc<dyn SettingsStore>,
    generation: Arc<AtomicU64>,
}

impl DebouncedSettings {
    pub fn new(store: Arc<dyn SettingsStore>) -> Self {
        let initial = store.load().unwrap_or_default();
        Self {
            current: AsyncMutex::new(initial),
            store,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn get(&self) -> EndpointSettings {
        *self.current.lock().await
    }

    /// Applies `f` to the current settings and schedules a debounced save.
    pub async fn mutate(&self, f: impl FnOnce(&mut EndpointSettings)) {
        let snapshot = {
            let mut guard = self.current.lock().await;
            f(&mut guard);
            *guard
        };

        let my_gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let store = self.store.clone();
        let generation = self.generation.clone();

        tokio::spawn(async move {
            tokio::time::sleep(SAVE_DEBOUNCE).await;
            if generation.load(Ordering::SeqCst) == my_gen {
                debug!("saving debounced settings");
                store.save(&snapshot);
            }
        });
    }
}

//! # Config
//!
//! Tunables for the image core, saved and loaded from the user's preferences directory.
//! A missing or broken file is never fatal - defaults are used. A broken file is remembered (see
//! [`ImageConfig::did_fail_to_load`]), so that callers can warn instead of overwriting the user's file.

const DOCUMENTATION: &str = r"# Fuzzpaint image core settings. You may edit this file, but be aware that formatting and comments
# will not be preserved.
#
# worker_threads    - Number of threads executing stroke jobs. 0 picks one per available core.
# update_delay_ms   - How long overlay updates settle before being recomputed.
# message_capacity  - How many document notifications may be buffered per listener.
# [lod]             - Level-of-detail preferences. `desired_level` 0 is full resolution, each level halves it.

";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("no preferences directory found")]
    NoPreferencesDir,
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error(transparent)]
    Parse(#[from] toml::de::Error),
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct LodConfig {
    pub supported: bool,
    pub preferred: bool,
    pub desired_level: u8,
}
impl Default for LodConfig {
    fn default() -> Self {
        Self {
            supported: true,
            preferred: false,
            desired_level: 2,
        }
    }
}
impl From<LodConfig> for crate::scheduler::LodPreferences {
    fn from(value: LodConfig) -> Self {
        use crate::scheduler::LodFlags;
        let mut flags = LodFlags::empty();
        flags.set(LodFlags::SUPPORTED, value.supported);
        flags.set(LodFlags::PREFERRED, value.preferred);
        Self {
            flags,
            desired_level: value.desired_level,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    #[serde(skip)]
    failed_to_load: bool,
    pub worker_threads: usize,
    pub update_delay_ms: u64,
    pub message_capacity: usize,
    pub lod: LodConfig,
}
impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            failed_to_load: false,
            worker_threads: 0,
            update_delay_ms: 100,
            message_capacity: 256,
            lod: LodConfig::default(),
        }
    }
}

#[must_use]
pub fn preferences_dir() -> Option<std::path::PathBuf> {
    let mut base_dir = dirs::preference_dir()?;
    base_dir.push("fuzzpaint");
    Some(base_dir)
}

impl ImageConfig {
    const FILENAME: &'static str = "image.toml";
    /// Shared global config, loaded from user preferences on first access.
    /// (Or defaulted, if unavailable for some reason)
    #[must_use]
    pub fn get() -> &'static Self {
        static GLOBAL_CONFIG: std::sync::OnceLock<ImageConfig> = std::sync::OnceLock::new();

        GLOBAL_CONFIG.get_or_init(|| Self::from_loaded(Self::load()))
    }
    /// Default on failure. A file that exists but can't be used is flagged, see [`Self::did_fail_to_load`].
    fn from_loaded(loaded: Result<Self, ConfigError>) -> Self {
        match loaded {
            Ok(config) => config,
            Err(ConfigError::IO(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No image config yet, defaulting");
                Self::default()
            }
            Err(e) => {
                log::warn!("Image config wasn't available, defaulting: {e}");
                Self {
                    failed_to_load: true,
                    ..Self::default()
                }
            }
        }
    }
    /// Return true if the user's file exists but loading it failed. Saving over it would lose their settings.
    #[must_use]
    pub fn did_fail_to_load(&self) -> bool {
        self.failed_to_load
    }
    fn load() -> Result<Self, ConfigError> {
        let mut path = preferences_dir().ok_or(ConfigError::NoPreferencesDir)?;
        path.push(Self::FILENAME);
        let string = std::fs::read_to_string(path)?;
        Self::from_toml(&string)
    }
    pub fn from_toml(string: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(string)?)
    }
    pub fn save(&self) -> Result<(), ConfigError> {
        let mut preferences = preferences_dir().ok_or(ConfigError::NoPreferencesDir)?;
        // Explicity do *not* create recursively. If the parent is missing, the user probably has a good reason.
        let _ = std::fs::DirBuilder::new().create(&preferences);

        preferences.push(Self::FILENAME);
        let string = DOCUMENTATION.to_owned() + &toml::ser::to_string_pretty(self)?;
        std::fs::write(preferences, string)?;
        Ok(())
    }
    /// Worker count with the "0 means automatic" rule applied.
    #[must_use]
    pub fn effective_worker_threads(&self) -> usize {
        if self.worker_threads == 0 {
            std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get)
        } else {
            self.worker_threads
        }
    }
    #[must_use]
    pub fn update_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.update_delay_ms)
    }
}

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Largest batch the permutation repair may ever be asked to order (10! orderings).
pub const MAX_BATCH_LIMIT: usize = 10;

/// Upper bound for music fade lengths, in milliseconds.
pub const MAX_FADE_MS: u64 = 10_000;

/// Directories holding the three announcement file categories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CategoryDirs {
    /// Files prefixed `ca`.
    pub announcements: PathBuf,
    /// Files prefixed `sp`.
    pub specials: PathBuf,
    /// Files prefixed `ad`.
    pub adverts: PathBuf,
}

impl Default for CategoryDirs {
    fn default() -> Self {
        CategoryDirs {
            announcements: PathBuf::from("announcements"),
            specials: PathBuf::from("specials"),
            adverts: PathBuf::from("adverts"),
        }
    }
}

/// Cadence (seconds) of the periodic station tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerIntervals {
    pub announcements_secs: i64,
    pub music_check_secs: i64,
    pub heartbeat_secs: i64,
}

impl Default for SchedulerIntervals {
    fn default() -> Self {
        SchedulerIntervals {
            announcements_secs: 10,
            music_check_secs: 2,
            heartbeat_secs: 60,
        }
    }
}

/// Every tunable the broadcast core consumes. Plain parameters: the core
/// never reads files itself, only the host calls [`BroadcastConfig::load`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Announcements played per interruption of the music (1..=10).
    pub max_per_batch: usize,
    /// Music time enforced between two regular batches. 0 enables back-to-back batches.
    pub min_gap_between_batches_secs: u64,
    /// Slots older than this are reported missed instead of played.
    pub miss_after_minutes: i64,
    pub fade_in_ms: u64,
    pub fade_out_ms: u64,
    /// Wait after a reported song end before trusting it.
    pub device_latency_report_ms: u64,
    /// Wait after a stop/play command before trusting device state.
    pub device_latency_do_ms: u64,
    /// Playback controller poll cadence.
    pub poll_interval_ms: u64,
    /// Minimum spacing of freeze checks.
    pub freeze_check_secs: i64,
    /// Let the current song end before a regular batch instead of fading it out.
    pub wait_for_song_end: bool,
    pub music_enabled: bool,
    /// Playlist queued on the device when music resumes.
    pub music_playlist: Option<PathBuf>,
    pub music_volume: u8,
    pub announce_volume: u8,
    pub dirs: CategoryDirs,
    pub intervals: SchedulerIntervals,
    /// Sleep of the host loop between scheduler ticks.
    pub tick_interval_ms: u64,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        BroadcastConfig {
            max_per_batch: 3,
            min_gap_between_batches_secs: 240,
            miss_after_minutes: 15,
            fade_in_ms: 5000,
            fade_out_ms: 5000,
            device_latency_report_ms: 8000,
            device_latency_do_ms: 1500,
            poll_interval_ms: 100,
            freeze_check_secs: 2,
            wait_for_song_end: false,
            music_enabled: true,
            music_playlist: None,
            music_volume: 80,
            announce_volume: 100,
            dirs: CategoryDirs::default(),
            intervals: SchedulerIntervals::default(),
            tick_interval_ms: 1000,
        }
    }
}

impl BroadcastConfig {
    /// Check every bound the core relies on.
    pub fn validate(&self) -> Result<()> {
        if self.max_per_batch == 0 || self.max_per_batch > MAX_BATCH_LIMIT {
            return Err(Error::Config(format!(
                "max_per_batch must be between 1 and {}, got {}",
                MAX_BATCH_LIMIT, self.max_per_batch
            )));
        }
        if self.miss_after_minutes <= 0 || self.miss_after_minutes >= 10_000 {
            return Err(Error::Config(format!(
                "miss_after_minutes must be between 1 and 9999, got {}",
                self.miss_after_minutes
            )));
        }
        if self.min_gap_between_batches_secs > 3600 {
            return Err(Error::Config(format!(
                "min_gap_between_batches_secs must be at most 3600, got {}",
                self.min_gap_between_batches_secs
            )));
        }
        for (name, value) in [("fade_in_ms", self.fade_in_ms), ("fade_out_ms", self.fade_out_ms)] {
            if value > MAX_FADE_MS {
                return Err(Error::Config(format!(
                    "{} must be at most {}, got {}",
                    name, MAX_FADE_MS, value
                )));
            }
        }
        for (name, value) in [
            ("music_volume", self.music_volume),
            ("announce_volume", self.announce_volume),
        ] {
            if value > 100 {
                return Err(Error::Config(format!("{} must be a percentage, got {}", name, value)));
            }
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::Config("poll_interval_ms must be positive".into()));
        }
        if self.freeze_check_secs <= 0 {
            return Err(Error::Config("freeze_check_secs must be positive".into()));
        }
        let iv = &self.intervals;
        for (name, value) in [
            ("announcements_secs", iv.announcements_secs),
            ("music_check_secs", iv.music_check_secs),
            ("heartbeat_secs", iv.heartbeat_secs),
        ] {
            if value <= 0 {
                return Err(Error::Config(format!("intervals.{} must be positive, got {}", name, value)));
            }
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn latency_report(&self) -> Duration {
        Duration::from_millis(self.device_latency_report_ms)
    }

    pub fn latency_do(&self) -> Duration {
        Duration::from_millis(self.device_latency_do_ms)
    }

    /// Read and validate a JSON config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "No config file, using defaults");
            return Ok(BroadcastConfig::default());
        }
        let data = fs::read_to_string(path)?;
        let config: BroadcastConfig = serde_json::from_str(&data)
            .map_err(|e| Error::Config(format!("'{}': {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Persist as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

/// `<config dir>/storecast/config.json`, or `config.json` when the platform has no config dir.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("storecast").join("config.json"))
        .unwrap_or_else(|| PathBuf::from("config.json"))
}

/// `<data dir>/storecast/slots.json`, or `slots.json` as a fallback.
pub fn default_slots_path() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("storecast").join("slots.json"))
        .unwrap_or_else(|| PathBuf::from("slots.json"))
}

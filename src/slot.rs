use crate::config::CategoryDirs;
use crate::error::{Error, Result};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Repository identifier of a slot.
pub type SlotId = i64;

// --- Volume ---

/// Play-volume instruction attached to a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum VolumeSpec {
    /// Percentage of the announcement level.
    Percent(u8),
    /// Play at whatever the background music is set to.
    MusicVolume,
    /// Play at the default announcement level.
    DefaultAnnounce,
}

impl VolumeSpec {
    /// Parse the repository's play-volume column.
    ///
    /// Unrecognised text falls back to the default announcement level.
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        match text.to_ascii_uppercase().as_str() {
            "MUS" | "MUSIC" => VolumeSpec::MusicVolume,
            "ADV" | "PROMO" | "000" | "" => VolumeSpec::DefaultAnnounce,
            other => match other.parse::<i64>() {
                Ok(n) => VolumeSpec::Percent(n.clamp(0, 100) as u8),
                Err(_) => {
                    tracing::warn!(value = text, "Unknown play volume, using default announce level");
                    VolumeSpec::DefaultAnnounce
                }
            },
        }
    }
}

impl Default for VolumeSpec {
    fn default() -> Self {
        VolumeSpec::DefaultAnnounce
    }
}

impl From<String> for VolumeSpec {
    fn from(text: String) -> Self {
        VolumeSpec::parse(&text)
    }
}

impl From<VolumeSpec> for String {
    fn from(spec: VolumeSpec) -> Self {
        match spec {
            VolumeSpec::Percent(p) => p.to_string(),
            VolumeSpec::MusicVolume => "MUS".to_string(),
            VolumeSpec::DefaultAnnounce => "ADV".to_string(),
        }
    }
}

/// Current device levels used to turn a [`VolumeSpec`] into a number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeLevels {
    pub music: u8,
    pub announce: u8,
}

impl VolumeLevels {
    pub fn resolve(&self, spec: VolumeSpec) -> u8 {
        match spec {
            VolumeSpec::Percent(p) => {
                ((self.announce as u32 * p.min(100) as u32) / 100) as u8
            }
            VolumeSpec::MusicVolume => self.music,
            VolumeSpec::DefaultAnnounce => self.announce,
        }
    }
}

// --- Category ---

/// Announcement family, taken from the two-letter file prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileCategory {
    Announcement,
    Special,
    Advert,
}

impl FileCategory {
    /// `ca…` announcements, `sp…` specials, `ad…` adverts.
    pub fn from_file(file: &str) -> Result<Self> {
        let name = Path::new(file)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(file);
        let prefix: String = name.chars().take(2).collect::<String>().to_ascii_lowercase();
        match prefix.as_str() {
            "ca" => Ok(FileCategory::Announcement),
            "sp" => Ok(FileCategory::Special),
            "ad" => Ok(FileCategory::Advert),
            _ => Err(Error::DataIntegrity(format!(
                "Unknown category prefix on file '{}'",
                file
            ))),
        }
    }

    pub fn dir<'a>(&self, dirs: &'a CategoryDirs) -> &'a Path {
        match self {
            FileCategory::Announcement => &dirs.announcements,
            FileCategory::Special => &dirs.specials,
            FileCategory::Advert => &dirs.adverts,
        }
    }
}

// --- Slot ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotStatus {
    Loaded,
    ListedToPlay,
    Played,
    Missed,
    Deleted,
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SlotStatus::Loaded => "loaded",
            SlotStatus::ListedToPlay => "listed",
            SlotStatus::Played => "played",
            SlotStatus::Missed => "missed",
            SlotStatus::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// One scheduling-repository row: a candidate announcement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledSlot {
    pub id: SlotId,
    /// File name, relative to its category directory.
    pub file: String,
    /// Category label used for per-batch de-duplication. Empty never clashes.
    #[serde(default)]
    pub category: String,
    /// Announcer voice code. Empty never clashes.
    #[serde(default)]
    pub announcer: String,
    /// Lower plays first.
    #[serde(default)]
    pub priority: i32,
    pub scheduled_at: DateTime<Local>,
    #[serde(default)]
    pub forced_at: Option<DateTime<Local>>,
    #[serde(default)]
    pub volume: VolumeSpec,
    pub status: SlotStatus,
    #[serde(default)]
    pub played_at: Option<DateTime<Local>>,
}

impl ScheduledSlot {
    pub fn new(id: SlotId, file: impl Into<String>, scheduled_at: DateTime<Local>) -> Self {
        ScheduledSlot {
            id,
            file: file.into(),
            category: String::new(),
            announcer: String::new(),
            priority: 0,
            scheduled_at,
            forced_at: None,
            volume: VolumeSpec::DefaultAnnounce,
            status: SlotStatus::Loaded,
            played_at: None,
        }
    }

    pub fn with_announcer(mut self, code: impl Into<String>) -> Self {
        self.announcer = code.into();
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_forced(mut self, at: DateTime<Local>) -> Self {
        self.forced_at = Some(at);
        self
    }

    pub fn with_volume(mut self, volume: VolumeSpec) -> Self {
        self.volume = volume;
        self
    }

    pub fn is_forced(&self) -> bool {
        self.forced_at.is_some()
    }

    /// Forced time when present, else the scheduled start.
    pub fn effective_time(&self) -> DateTime<Local> {
        self.forced_at.unwrap_or(self.scheduled_at)
    }

    pub fn file_category(&self) -> Result<FileCategory> {
        FileCategory::from_file(&self.file)
    }
}

// --- Batch ---

/// Ordered set of slots to play during one interruption of the music.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub slots: Vec<ScheduledSlot>,
}

impl Batch {
    pub fn new(slots: Vec<ScheduledSlot>) -> Self {
        Batch { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn ids(&self) -> Vec<SlotId> {
        self.slots.iter().map(|s| s.id).collect()
    }

    /// Any forced-time entry disables waiting for the current song.
    pub fn has_forced(&self) -> bool {
        self.slots.iter().any(|s| s.is_forced())
    }
}

/// A slot resolved for the device: absolute path plus numeric volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub slot_id: SlotId,
    pub path: PathBuf,
    pub volume: u8,
}

impl QueueEntry {
    pub fn resolve(slot: &ScheduledSlot, dirs: &CategoryDirs, levels: VolumeLevels) -> Result<Self> {
        let category = slot.file_category()?;
        Ok(QueueEntry {
            slot_id: slot.id,
            path: category.dir(dirs).join(&slot.file),
            volume: levels.resolve(slot.volume),
        })
    }
}

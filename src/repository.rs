use crate::error::{Error, Result};
use crate::slot::{ScheduledSlot, SlotId, SlotStatus};
use chrono::{DateTime, Local};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Time range of slots the selector wants to see.
///
/// Anything in `[from, to]` by effective time is returned so the selector can
/// both pick eligible slots and report the stale ones as missed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DueWindow {
    pub from: DateTime<Local>,
    pub to: DateTime<Local>,
}

impl DueWindow {
    /// How far back stale slots are still reported.
    pub const MISSED_LOOKBACK_HOURS: i64 = 24;

    pub fn ending_at(now: DateTime<Local>) -> Self {
        DueWindow {
            from: now - chrono::Duration::hours(Self::MISSED_LOOKBACK_HOURS),
            to: now,
        }
    }

    pub fn contains(&self, when: DateTime<Local>) -> bool {
        when >= self.from && when <= self.to
    }
}

/// Scheduling data store consumed by the broadcast core.
///
/// Every failure should be reported as [`Error::TransientRepository`]; the
/// core retries on the next cycle.
pub trait SlotRepository {
    /// `Loaded` slots whose effective time falls inside the window.
    fn fetch_due_slots(&mut self, now: DateTime<Local>, window: &DueWindow) -> Result<Vec<ScheduledSlot>>;
    fn mark_listed_to_play(&mut self, ids: &[SlotId]) -> Result<()>;
    fn mark_played(&mut self, id: SlotId, when: DateTime<Local>) -> Result<()>;
    fn mark_missed(&mut self, ids: &[SlotId]) -> Result<()>;
    /// Put every `ListedToPlay` slot back to `Loaded`. Returns how many changed.
    fn reset_listed_to_play(&mut self) -> Result<usize>;
}

// ── shared status transitions ──

fn due_slots(slots: &[ScheduledSlot], window: &DueWindow) -> Vec<ScheduledSlot> {
    slots
        .iter()
        .filter(|s| s.status == SlotStatus::Loaded && window.contains(s.effective_time()))
        .cloned()
        .collect()
}

fn set_status(slots: &mut [ScheduledSlot], ids: &[SlotId], from: SlotStatus, to: SlotStatus) {
    for slot in slots.iter_mut().filter(|s| ids.contains(&s.id)) {
        if slot.status == from {
            slot.status = to;
        } else {
            tracing::debug!(id = slot.id, status = %slot.status, target = %to, "Skipping status change");
        }
    }
}

fn set_played(slots: &mut [ScheduledSlot], id: SlotId, when: DateTime<Local>) -> Result<()> {
    let slot = slots
        .iter_mut()
        .find(|s| s.id == id)
        .ok_or_else(|| Error::DataIntegrity(format!("Slot {} not found", id)))?;
    if slot.status != SlotStatus::ListedToPlay {
        tracing::warn!(id, status = %slot.status, "Not marking played, slot is no longer listed");
        return Ok(());
    }
    slot.status = SlotStatus::Played;
    slot.played_at = Some(when);
    Ok(())
}

fn reset_listed(slots: &mut [ScheduledSlot]) -> usize {
    let mut count = 0;
    for slot in slots.iter_mut().filter(|s| s.status == SlotStatus::ListedToPlay) {
        slot.status = SlotStatus::Loaded;
        count += 1;
    }
    count
}

// ── In-memory ──

#[derive(Debug, Default)]
struct MemoryInner {
    slots: Vec<ScheduledSlot>,
    fail_next: usize,
}

/// Vector-backed repository for tests and dry runs.
///
/// Clones share the same table, so a test can keep a handle while the
/// station owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryRepository {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryRepository {
    pub fn new(slots: Vec<ScheduledSlot>) -> Self {
        MemoryRepository {
            inner: Arc::new(Mutex::new(MemoryInner { slots, fail_next: 0 })),
        }
    }

    pub fn insert(&self, slot: ScheduledSlot) {
        self.lock().slots.push(slot);
    }

    pub fn slots(&self) -> Vec<ScheduledSlot> {
        self.lock().slots.clone()
    }

    pub fn get(&self, id: SlotId) -> Option<ScheduledSlot> {
        self.lock().slots.iter().find(|s| s.id == id).cloned()
    }

    /// Make the next `count` calls fail with a transient error.
    pub fn fail_next(&self, count: usize) {
        self.lock().fail_next = count;
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn checked(&self) -> Result<MutexGuard<'_, MemoryInner>> {
        let mut inner = self.lock();
        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Err(Error::repository("simulated outage"));
        }
        Ok(inner)
    }
}

impl SlotRepository for MemoryRepository {
    fn fetch_due_slots(&mut self, _now: DateTime<Local>, window: &DueWindow) -> Result<Vec<ScheduledSlot>> {
        let inner = self.checked()?;
        Ok(due_slots(&inner.slots, window))
    }

    fn mark_listed_to_play(&mut self, ids: &[SlotId]) -> Result<()> {
        let mut inner = self.checked()?;
        set_status(&mut inner.slots, ids, SlotStatus::Loaded, SlotStatus::ListedToPlay);
        Ok(())
    }

    fn mark_played(&mut self, id: SlotId, when: DateTime<Local>) -> Result<()> {
        let mut inner = self.checked()?;
        set_played(&mut inner.slots, id, when)
    }

    fn mark_missed(&mut self, ids: &[SlotId]) -> Result<()> {
        let mut inner = self.checked()?;
        set_status(&mut inner.slots, ids, SlotStatus::Loaded, SlotStatus::Missed);
        Ok(())
    }

    fn reset_listed_to_play(&mut self) -> Result<usize> {
        let mut inner = self.checked()?;
        Ok(reset_listed(&mut inner.slots))
    }
}

// ── JSON file ──

/// Slot table kept in a single JSON file.
///
/// Loads from disk on each operation and saves after mutations, so an
/// external scheduler can rewrite the file between cycles.
pub struct JsonSlotStore {
    path: PathBuf,
}

impl JsonSlotStore {
    pub fn new(path: &Path) -> Self {
        Self { path: path.to_path_buf() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All slots in the file. A missing file is an empty table.
    pub fn load(&self) -> Result<Vec<ScheduledSlot>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = fs::read_to_string(&self.path)
            .map_err(|e| Error::repository(format!("read '{}': {}", self.path.display(), e)))?;
        serde_json::from_str(&data)
            .map_err(|e| Error::repository(format!("parse '{}': {}", self.path.display(), e)))
    }

    pub fn save(&self, slots: &[ScheduledSlot]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| Error::repository(format!("create '{}': {}", parent.display(), e)))?;
            }
        }
        let json = serde_json::to_string_pretty(slots)?;
        fs::write(&self.path, json)
            .map_err(|e| Error::repository(format!("write '{}': {}", self.path.display(), e)))
    }

    fn update<T>(&self, f: impl FnOnce(&mut Vec<ScheduledSlot>) -> Result<T>) -> Result<T> {
        let mut slots = self.load()?;
        let out = f(&mut slots)?;
        self.save(&slots)?;
        Ok(out)
    }
}

impl SlotRepository for JsonSlotStore {
    fn fetch_due_slots(&mut self, _now: DateTime<Local>, window: &DueWindow) -> Result<Vec<ScheduledSlot>> {
        Ok(due_slots(&self.load()?, window))
    }

    fn mark_listed_to_play(&mut self, ids: &[SlotId]) -> Result<()> {
        self.update(|slots| {
            set_status(slots, ids, SlotStatus::Loaded, SlotStatus::ListedToPlay);
            Ok(())
        })
    }

    fn mark_played(&mut self, id: SlotId, when: DateTime<Local>) -> Result<()> {
        self.update(|slots| set_played(slots, id, when))
    }

    fn mark_missed(&mut self, ids: &[SlotId]) -> Result<()> {
        self.update(|slots| {
            set_status(slots, ids, SlotStatus::Loaded, SlotStatus::Missed);
            Ok(())
        })
    }

    fn reset_listed_to_play(&mut self) -> Result<usize> {
        self.update(|slots| Ok(reset_listed(slots)))
    }
}

//! Announcement playback state machine.
//!
//! [`PlaybackController::begin`] fades the music out and starts the first
//! entry; [`PlaybackController::poll`] is then called every ~100 ms to follow
//! the device through the rest of the batch. [`PlaybackController::drive`]
//! wraps the poll loop with completion callbacks, cancellation and freeze
//! detection.

use crate::clock::Clock;
use crate::config::{BroadcastConfig, CategoryDirs};
use crate::crossfade::CrossfadeEngine;
use crate::device::PlaybackDevice;
use crate::error::{Error, Result};
use crate::freeze::{FreezeCheck, FreezeDetector};
use crate::slot::{Batch, QueueEntry, SlotId, VolumeLevels};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

// --- Constants ---

/// Cadence of the "is the current song over yet" check.
const SONG_END_POLL: Duration = Duration::from_millis(500);

/// Longest we wait for a song to end before fading it out anyway.
const MAX_SONG_WAIT: Duration = Duration::from_secs(20 * 60);

/// Observable playback state, refreshed in place by every poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaybackStatus {
    pub complete: bool,
    pub current_entry_id: Option<SlotId>,
    pub stopped_by_device: bool,
    pub user_paused: bool,
    pub unexpected_error: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Starting,
    Playing,
    Finished,
    Interrupted,
    FrozenRecovered,
}

/// How a driven batch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackOutcome {
    pub state: ControllerState,
    /// Entries that played to the end, in order.
    pub completed: Vec<SlotId>,
    /// Entries that never finished; they are retried on a later cycle.
    pub abandoned: Vec<SlotId>,
    /// Entries dropped because their file could not be played.
    pub skipped: Vec<SlotId>,
    /// The device froze and has to be restarted by the host.
    pub restart_required: bool,
}

pub struct PlaybackController {
    clock: Arc<dyn Clock>,
    crossfade: CrossfadeEngine,
    levels: VolumeLevels,
    fade_in_ms: u64,
    fade_out_ms: u64,
    latency_report: Duration,
    latency_do: Duration,
    poll_interval: Duration,
    music_enabled: bool,
    /// Leave the music down when the current batch ends.
    hold_music: bool,
    music_playlist: Option<PathBuf>,
    freeze: FreezeDetector,
    queue: VecDeque<QueueEntry>,
    total: usize,
    played: usize,
    last_entry: Option<SlotId>,
    skipped: Vec<SlotId>,
    state: ControllerState,
}

impl PlaybackController {
    pub fn new(config: &BroadcastConfig, clock: Arc<dyn Clock>) -> Self {
        PlaybackController {
            crossfade: CrossfadeEngine::new(clock.clone()),
            clock,
            levels: VolumeLevels {
                music: config.music_volume,
                announce: config.announce_volume,
            },
            fade_in_ms: config.fade_in_ms,
            fade_out_ms: config.fade_out_ms,
            latency_report: config.latency_report(),
            latency_do: config.latency_do(),
            poll_interval: config.poll_interval(),
            music_enabled: config.music_enabled,
            hold_music: false,
            music_playlist: config.music_playlist.clone(),
            freeze: FreezeDetector::new(config.freeze_check_secs),
            queue: VecDeque::new(),
            total: 0,
            played: 0,
            last_entry: None,
            skipped: Vec::new(),
            state: ControllerState::Idle,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn levels(&self) -> VolumeLevels {
        self.levels
    }

    pub fn set_levels(&mut self, levels: VolumeLevels) {
        self.levels = levels;
    }

    pub fn music_enabled(&self) -> bool {
        self.music_enabled
    }

    /// Keep the music down after the current batch, for a back-to-back
    /// follow-up. Set per batch; `music_enabled` is left untouched.
    pub fn set_hold_music(&mut self, hold: bool) {
        self.hold_music = hold;
    }

    pub fn hold_music(&self) -> bool {
        self.hold_music
    }

    pub fn music_playlist(&self) -> Option<&Path> {
        self.music_playlist.as_deref()
    }

    /// Ids still waiting to start.
    pub fn pending(&self) -> Vec<SlotId> {
        self.queue.iter().map(|e| e.slot_id).collect()
    }

    /// Resolve the batch, take the music down and start the first entry.
    ///
    /// With `wait_for_song_end` the current song is allowed to finish first,
    /// unless the batch holds a forced-time entry. Returns whether playback is
    /// still busy.
    pub fn begin(
        &mut self,
        device: &mut dyn PlaybackDevice,
        batch: &Batch,
        dirs: &CategoryDirs,
        wait_for_song_end: bool,
        status: &mut PlaybackStatus,
    ) -> Result<bool> {
        if batch.is_empty() {
            return Err(Error::logic("No announcements queued"));
        }
        *status = PlaybackStatus::default();
        self.reset();
        self.state = ControllerState::Starting;

        for slot in &batch.slots {
            match QueueEntry::resolve(slot, dirs, self.levels) {
                Ok(entry) => self.queue.push_back(entry),
                Err(e) => {
                    tracing::warn!(id = slot.id, error = %e, "Skipping announcement");
                    self.skipped.push(slot.id);
                }
            }
        }
        self.total = self.queue.len();

        if wait_for_song_end && !batch.has_forced() {
            self.wait_for_song_end(device)?;
        } else {
            self.crossfade.slide_from_current(device, 0, self.fade_out_ms)?;
            device.stop()?;
            tracing::debug!(wait_ms = self.latency_do.as_millis() as u64, "Waiting for device to catch up");
            self.clock.sleep(self.latency_do);
        }
        device.queue_clear()?;

        self.load_next(device, status)
    }

    /// One step of the playback protocol. Returns whether still busy.
    pub fn poll(&mut self, device: &mut dyn PlaybackDevice, status: &mut PlaybackStatus) -> Result<bool> {
        match device.queue_length()? {
            1 => {
                if device.playing()? {
                    status.current_entry_id = self.last_entry;
                    status.stopped_by_device = false;
                    return Ok(true);
                }
                if device.paused()? {
                    // Never auto-resumed here; the host decides.
                    status.user_paused = true;
                    status.stopped_by_device = false;
                    return Ok(false);
                }
                if !status.stopped_by_device {
                    // Grace tick: give the caller a chance to see the stop first.
                    status.stopped_by_device = true;
                    return Ok(true);
                }
            }
            0 => {
                if self.played > 0 {
                    return Err(Error::logic(
                        "Device queue was cleared during announcement playback",
                    ));
                }
            }
            n => {
                return Err(Error::logic(format!(
                    "Device queue should hold 0 or 1 items during announcements, not {}",
                    n
                )));
            }
        }
        self.load_next(device, status)
    }

    /// Run the whole batch to an end.
    ///
    /// `on_complete` is invoked once per entry that finished, as soon as the
    /// next one starts (or the batch ends). `still_enabled` is checked before
    /// every poll.
    pub fn drive(
        &mut self,
        device: &mut dyn PlaybackDevice,
        status: &mut PlaybackStatus,
        still_enabled: &mut dyn FnMut() -> bool,
        on_complete: &mut dyn FnMut(SlotId),
    ) -> Result<PlaybackOutcome> {
        let mut completed = Vec::new();
        let mut reported = status.current_entry_id;
        self.freeze.reset();

        if self.state == ControllerState::Finished {
            return Ok(self.outcome(ControllerState::Finished, completed, Vec::new(), false));
        }

        loop {
            self.clock.sleep(self.poll_interval);

            if !still_enabled() {
                tracing::info!("Playback disabled during announcements");
                let abandoned = self.abandon(reported);
                return Ok(self.outcome(ControllerState::Interrupted, completed, abandoned, false));
            }

            if let FreezeCheck::Frozen { .. } = self.freeze.check(device, self.clock.now())? {
                let abandoned = self.abandon(reported);
                return Ok(self.outcome(ControllerState::FrozenRecovered, completed, abandoned, true));
            }

            let busy = match self.poll(device, status) {
                Ok(busy) => busy,
                Err(e) => {
                    status.unexpected_error = true;
                    tracing::error!(error = %e, "Unexpected device state during announcements");
                    self.abandon(reported);
                    self.state = ControllerState::Interrupted;
                    return Err(e);
                }
            };

            if status.current_entry_id != reported {
                if let Some(prev) = reported {
                    on_complete(prev);
                    completed.push(prev);
                }
                reported = status.current_entry_id;
            }

            if !busy {
                break;
            }
        }

        if status.user_paused {
            tracing::info!("Detected: device paused during announcements");
            let abandoned = self.abandon(reported);
            return Ok(self.outcome(ControllerState::Interrupted, completed, abandoned, false));
        }

        if let Some(last) = reported {
            on_complete(last);
            completed.push(last);
        }
        Ok(self.outcome(ControllerState::Finished, completed, Vec::new(), false))
    }

    /// Restart background music: silent start, then fade in.
    pub fn resume_music(&mut self, device: &mut dyn PlaybackDevice) -> Result<()> {
        let Some(playlist) = self.music_playlist.clone() else {
            tracing::warn!("No music playlist configured, music stays silent");
            return Ok(());
        };
        device.set_volume(0, false)?;
        device.queue_clear()?;
        device.queue_add(&playlist)?;
        device.play()?;
        self.crossfade.slide(device, 0, self.levels.music, self.fade_in_ms)?;
        Ok(())
    }

    fn wait_for_song_end(&mut self, device: &mut dyn PlaybackDevice) -> Result<()> {
        let song = device.song_path()?;
        let remaining = device.song_remaining_ms()?;
        tracing::info!(
            song = %song,
            remaining_ms = remaining.unwrap_or(-1),
            "Waiting for the current song to finish playing"
        );
        let deadline = self.clock.now() + chrono::Duration::from_std(MAX_SONG_WAIT).unwrap_or(chrono::Duration::zero());
        while device.playing()? && device.song_path()? == song {
            if self.clock.now() >= deadline {
                tracing::warn!("Song did not end in time, fading out instead");
                self.crossfade.slide_from_current(device, 0, self.fade_out_ms)?;
                break;
            }
            self.clock.sleep(SONG_END_POLL);
        }
        device.stop()?;
        tracing::debug!(wait_ms = self.latency_report.as_millis() as u64, "Waiting for device to finish playing");
        self.clock.sleep(self.latency_report);
        Ok(())
    }

    /// Start the next playable entry, or finish the batch when none is left.
    fn load_next(&mut self, device: &mut dyn PlaybackDevice, status: &mut PlaybackStatus) -> Result<bool> {
        while let Some(entry) = self.queue.pop_front() {
            if !device.can_play(&entry.path) {
                tracing::error!(
                    id = entry.slot_id,
                    path = %entry.path.display(),
                    "Announcement file not found"
                );
                self.skipped.push(entry.slot_id);
                continue;
            }
            if self.played > 0 {
                self.clock.sleep(self.latency_report);
            }
            device.set_volume(entry.volume, false)?;
            device.queue_clear()?;
            device.queue_add(&entry.path)?;
            device.play()?;

            self.played += 1;
            self.last_entry = Some(entry.slot_id);
            self.state = ControllerState::Playing;
            status.stopped_by_device = false;
            status.current_entry_id = Some(entry.slot_id);
            tracing::info!(
                "Playing announcement ({}/{}) : {} (id: {})",
                self.played,
                self.total,
                entry.path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default(),
                entry.slot_id
            );
            return Ok(true);
        }

        if self.music_enabled && !self.hold_music {
            if self.played > 0 {
                self.clock.sleep(self.latency_report);
            }
            tracing::info!("Announcements done, music playback resumed");
            self.resume_music(device)?;
        }
        status.complete = true;
        self.state = ControllerState::Finished;
        Ok(false)
    }

    /// Drop the remaining queue. Returns the ids that never finished.
    fn abandon(&mut self, current: Option<SlotId>) -> Vec<SlotId> {
        let mut abandoned: Vec<SlotId> = current.into_iter().collect();
        abandoned.extend(self.queue.drain(..).map(|e| e.slot_id));
        if !abandoned.is_empty() {
            tracing::warn!(
                count = abandoned.len(),
                "Announcement(s) failed and will be retried later"
            );
        }
        abandoned
    }

    fn outcome(
        &mut self,
        state: ControllerState,
        completed: Vec<SlotId>,
        abandoned: Vec<SlotId>,
        restart_required: bool,
    ) -> PlaybackOutcome {
        self.state = state;
        PlaybackOutcome {
            state,
            completed,
            abandoned,
            skipped: std::mem::take(&mut self.skipped),
            restart_required,
        }
    }

    fn reset(&mut self) {
        self.queue.clear();
        self.total = 0;
        self.played = 0;
        self.last_entry = None;
        self.skipped.clear();
    }
}

//! One announcement cycle: recover, select, report misses, play, mark played.

use crate::clock::Clock;
use crate::config::BroadcastConfig;
use crate::controller::{ControllerState, PlaybackController, PlaybackOutcome, PlaybackStatus};
use crate::device::PlaybackDevice;
use crate::error::Result;
use crate::repository::SlotRepository;
use crate::selector::{AnnouncementSelector, MissedSummary};
use crate::slot::SlotId;
use chrono::{DateTime, Local};
use std::sync::Arc;

/// Result of [`Orchestrator::run_cycle`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Playback was disabled; nothing was looked at.
    pub skipped: bool,
    pub batch_size: usize,
    /// Another cycle should start as soon as this one is done.
    pub run_again_immediately: bool,
    /// Slots marked missed this cycle.
    pub missed: Vec<SlotId>,
    /// `ListedToPlay` slots put back to `Loaded` before selecting.
    pub recovered: usize,
    pub outcome: Option<PlaybackOutcome>,
}

/// Ties the selector to the playback controller.
pub struct Orchestrator {
    clock: Arc<dyn Clock>,
    config: BroadcastConfig,
    selector: AnnouncementSelector,
    controller: PlaybackController,
    last_regular_batch: Option<DateTime<Local>>,
    last_cycle: Option<DateTime<Local>>,
    pending_run_again: bool,
    /// Music resume was skipped for a back-to-back batch.
    music_held: bool,
}

impl Orchestrator {
    pub fn new(config: BroadcastConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let selector = AnnouncementSelector::new(&config)?;
        let controller = PlaybackController::new(&config, clock.clone());
        Ok(Orchestrator {
            clock,
            config,
            selector,
            controller,
            last_regular_batch: None,
            last_cycle: None,
            pending_run_again: false,
            music_held: false,
        })
    }

    pub fn config(&self) -> &BroadcastConfig {
        &self.config
    }

    pub fn controller(&self) -> &PlaybackController {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut PlaybackController {
        &mut self.controller
    }

    /// The last cycle asked for an immediate follow-up batch.
    pub fn pending_run_again(&self) -> bool {
        self.pending_run_again
    }

    pub fn last_regular_batch(&self) -> Option<DateTime<Local>> {
        self.last_regular_batch
    }

    /// Run one full announcement cycle at `now`.
    ///
    /// Repository and device errors end the cycle early and propagate; slots
    /// left `ListedToPlay` are recovered at the start of the next cycle.
    pub fn run_cycle(
        &mut self,
        now: DateTime<Local>,
        repo: &mut dyn SlotRepository,
        device: &mut dyn PlaybackDevice,
        still_enabled: &mut dyn FnMut() -> bool,
    ) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        self.pending_run_again = false;

        if !still_enabled() {
            tracing::debug!("Playback disabled, skipping announcement cycle");
            report.skipped = true;
            return Ok(report);
        }

        if let Some(last) = self.last_cycle {
            if now < last {
                tracing::warn!("Clock moved backwards, forgetting last batch time");
                self.last_regular_batch = None;
            }
        }
        self.last_cycle = Some(now);

        report.recovered = repo.reset_listed_to_play()?;
        if report.recovered > 0 {
            tracing::info!(count = report.recovered, "Recovered unplayed announcement(s)");
        }

        let gap = chrono::Duration::seconds(self.config.min_gap_between_batches_secs as i64);
        let regular_allowed = self.last_regular_batch.is_none_or(|last| last + gap <= now);

        let selection = self.selector.select_batch(now, repo, regular_allowed)?;

        if !selection.missed.is_empty() {
            repo.mark_missed(&selection.missed)?;
            for summary in &selection.missed_summary {
                log_missed(summary);
            }
            report.missed = selection.missed.clone();
        }

        if selection.batch.is_empty() {
            if self.music_held {
                // The follow-up batch came up empty; music was never resumed.
                self.release_music_hold();
                if self.controller.music_enabled() {
                    self.controller.resume_music(device)?;
                }
            }
            return Ok(report);
        }

        report.batch_size = selection.batch.len();
        report.run_again_immediately = selection.run_again_immediately;
        self.music_held = selection.run_again_immediately;
        self.controller.set_hold_music(selection.run_again_immediately);

        tracing::info!(
            count = selection.batch.len(),
            eligible = selection.eligible_count,
            "Starting announcement batch"
        );

        let mut status = PlaybackStatus::default();
        if let Err(e) = self.controller.begin(
            device,
            &selection.batch,
            &self.config.dirs,
            self.config.wait_for_song_end,
            &mut status,
        ) {
            self.release_music_hold();
            return Err(e);
        }

        let clock = self.clock.clone();
        let mut mark_played = |id: SlotId| {
            if let Err(e) = repo.mark_played(id, clock.now()) {
                tracing::error!(id, error = %e, "Could not mark announcement as played");
            }
        };
        let outcome = match self
            .controller
            .drive(device, &mut status, still_enabled, &mut mark_played)
        {
            Ok(outcome) => outcome,
            Err(e) => {
                self.release_music_hold();
                return Err(e);
            }
        };

        let played_regular = selection
            .batch
            .slots
            .iter()
            .any(|s| !s.is_forced() && outcome.completed.contains(&s.id));
        if played_regular {
            self.last_regular_batch = Some(now);
        }

        match outcome.state {
            ControllerState::Finished => {
                self.pending_run_again = selection.run_again_immediately;
            }
            ControllerState::FrozenRecovered => {
                tracing::error!("Playback device froze during announcements, restarting it");
                self.release_music_hold();
                device.restart()?;
            }
            _ => self.release_music_hold(),
        }

        report.outcome = Some(outcome);
        Ok(report)
    }

    /// No follow-up batch will pick the music back up.
    fn release_music_hold(&mut self) {
        self.music_held = false;
        self.controller.set_hold_music(false);
    }
}

fn log_missed(summary: &MissedSummary) {
    if summary.count == 1 {
        tracing::warn!(
            "Announcement missed: {} at {}",
            summary.file,
            summary.first.format("%H:%M")
        );
    } else {
        tracing::warn!(
            "Announcement missed {} times: {} (first {}, last {})",
            summary.count,
            summary.file,
            summary.first.format("%H:%M"),
            summary.last.format("%H:%M")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::device::MemoryDevice;
    use crate::error::Error;
    use crate::repository::MemoryRepository;
    use crate::slot::{ScheduledSlot, SlotStatus};
    use chrono::TimeZone;
    use std::path::PathBuf;
    use std::time::Duration;

    fn noon() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 5, 6, 12, 0, 0).unwrap()
    }

    fn make_config() -> BroadcastConfig {
        BroadcastConfig {
            music_playlist: Some("music.m3u".into()),
            ..BroadcastConfig::default()
        }
    }

    fn make_setup(config: BroadcastConfig) -> (Orchestrator, MemoryRepository, MemoryDevice, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(noon()));
        let device = MemoryDevice::new(clock.clone());
        device.set_default_length(Duration::from_secs(5));
        let orchestrator = Orchestrator::new(config, clock.clone()).unwrap();
        (orchestrator, MemoryRepository::default(), device, clock)
    }

    fn due(id: SlotId, minutes_ago: i64) -> ScheduledSlot {
        ScheduledSlot::new(id, format!("ca_{}.mp3", id), noon() - chrono::Duration::minutes(minutes_ago))
    }

    fn is_music(path: &PathBuf) -> bool {
        path == &PathBuf::from("music.m3u")
    }

    #[test]
    fn plays_batch_and_marks_played() {
        let (mut orch, mut repo, mut device, clock) = make_setup(make_config());
        repo.insert(due(1, 2));
        repo.insert(due(2, 1));

        let report = orch
            .run_cycle(clock.now(), &mut repo, &mut device, &mut || true)
            .unwrap();
        assert_eq!(report.batch_size, 2);
        assert!(!report.run_again_immediately);
        let outcome = report.outcome.unwrap();
        assert_eq!(outcome.state, ControllerState::Finished);
        assert_eq!(outcome.completed, vec![1, 2]);
        for id in [1, 2] {
            let slot = repo.get(id).unwrap();
            assert_eq!(slot.status, SlotStatus::Played);
            assert!(slot.played_at.unwrap() > noon());
        }
        assert!(device.started().last().is_some_and(is_music));
        assert_eq!(orch.last_regular_batch(), Some(noon()));
    }

    #[test]
    fn disabled_playback_skips_everything() {
        let (mut orch, mut repo, mut device, clock) = make_setup(make_config());
        repo.insert(due(1, 1));
        let report = orch
            .run_cycle(clock.now(), &mut repo, &mut device, &mut || false)
            .unwrap();
        assert!(report.skipped);
        assert_eq!(repo.get(1).unwrap().status, SlotStatus::Loaded);
        assert!(device.started().is_empty());
    }

    #[test]
    fn min_gap_holds_regular_but_not_forced() {
        let (mut orch, mut repo, mut device, clock) = make_setup(make_config());
        repo.insert(due(1, 1));
        orch.run_cycle(clock.now(), &mut repo, &mut device, &mut || true)
            .unwrap();

        let now = clock.now();
        repo.insert(ScheduledSlot::new(2, "ca_2.mp3", now));
        repo.insert(ScheduledSlot::new(3, "sp_3.mp3", now - chrono::Duration::minutes(1)).with_forced(now));
        let report = orch
            .run_cycle(now, &mut repo, &mut device, &mut || true)
            .unwrap();
        assert_eq!(report.batch_size, 1);
        assert_eq!(repo.get(3).unwrap().status, SlotStatus::Played);
        assert_eq!(repo.get(2).unwrap().status, SlotStatus::Loaded);
        // A forced-only batch does not restart the gap.
        assert_eq!(orch.last_regular_batch(), Some(noon()));

        let later = noon() + chrono::Duration::seconds(240);
        clock.set(later);
        let report = orch
            .run_cycle(later, &mut repo, &mut device, &mut || true)
            .unwrap();
        assert_eq!(report.batch_size, 1);
        assert_eq!(repo.get(2).unwrap().status, SlotStatus::Played);
    }

    #[test]
    fn overflow_runs_again_without_music_in_between() {
        let config = BroadcastConfig {
            min_gap_between_batches_secs: 0,
            ..make_config()
        };
        let (mut orch, mut repo, mut device, clock) = make_setup(config);
        for id in 1..=5 {
            repo.insert(due(id, 6 - id));
        }

        let first = orch
            .run_cycle(clock.now(), &mut repo, &mut device, &mut || true)
            .unwrap();
        assert_eq!(first.batch_size, 3);
        assert!(first.run_again_immediately);
        assert!(orch.pending_run_again());
        assert!(!device.started().iter().any(is_music));

        let second = orch
            .run_cycle(clock.now(), &mut repo, &mut device, &mut || true)
            .unwrap();
        assert_eq!(second.batch_size, 2);
        assert!(!orch.pending_run_again());
        assert!(device.started().last().is_some_and(is_music));
        assert!(repo.slots().iter().all(|s| s.status == SlotStatus::Played));
    }

    #[test]
    fn empty_follow_up_resumes_music() {
        let config = BroadcastConfig {
            min_gap_between_batches_secs: 0,
            max_per_batch: 1,
            ..make_config()
        };
        let (mut orch, mut repo, mut device, clock) = make_setup(config);
        repo.insert(due(1, 2));
        repo.insert(due(2, 1));
        orch.run_cycle(clock.now(), &mut repo, &mut device, &mut || true)
            .unwrap();
        assert!(orch.pending_run_again());

        // Slot 2 was taken out of the schedule in the meantime.
        repo.mark_missed(&[2]).unwrap();
        let report = orch
            .run_cycle(clock.now(), &mut repo, &mut device, &mut || true)
            .unwrap();
        assert_eq!(report.batch_size, 0);
        assert!(device.started().last().is_some_and(is_music));
    }

    #[test]
    fn interrupted_follow_up_releases_music_hold() {
        let config = BroadcastConfig {
            min_gap_between_batches_secs: 0,
            max_per_batch: 1,
            ..make_config()
        };
        let (mut orch, mut repo, mut device, clock) = make_setup(config);
        for id in 1..=3 {
            repo.insert(due(id, 4 - id));
        }
        let mut polls = 0;
        let report = orch
            .run_cycle(clock.now(), &mut repo, &mut device, &mut || {
                polls += 1;
                polls <= 4
            })
            .unwrap();
        assert!(report.run_again_immediately);
        assert_eq!(report.outcome.unwrap().state, ControllerState::Interrupted);
        assert!(!orch.pending_run_again());
        assert!(orch.controller().music_enabled());
        assert!(!orch.controller().hold_music());

        // Everything left goes stale; the empty cycle leaves music to the music check.
        let later = noon() + chrono::Duration::minutes(20);
        clock.set(later);
        let report = orch
            .run_cycle(later, &mut repo, &mut device, &mut || true)
            .unwrap();
        assert_eq!(report.batch_size, 0);
        let mut missed = report.missed.clone();
        missed.sort();
        assert_eq!(missed, vec![1, 2, 3]);
        assert!(orch.controller().music_enabled());
    }

    #[test]
    fn stale_slots_are_marked_missed() {
        let (mut orch, mut repo, mut device, clock) = make_setup(make_config());
        repo.insert(due(1, 30));
        repo.insert(due(2, 40));
        repo.insert(due(3, 1));
        let report = orch
            .run_cycle(clock.now(), &mut repo, &mut device, &mut || true)
            .unwrap();
        let mut missed = report.missed.clone();
        missed.sort();
        assert_eq!(missed, vec![1, 2]);
        assert_eq!(repo.get(1).unwrap().status, SlotStatus::Missed);
        assert_eq!(repo.get(3).unwrap().status, SlotStatus::Played);
    }

    #[test]
    fn listed_slots_are_recovered() {
        let (mut orch, mut repo, mut device, clock) = make_setup(make_config());
        repo.insert(due(1, 1));
        repo.mark_listed_to_play(&[1]).unwrap();
        let report = orch
            .run_cycle(clock.now(), &mut repo, &mut device, &mut || true)
            .unwrap();
        assert_eq!(report.recovered, 1);
        assert_eq!(repo.get(1).unwrap().status, SlotStatus::Played);
    }

    #[test]
    fn repository_outage_is_retried_next_cycle() {
        let (mut orch, mut repo, mut device, clock) = make_setup(make_config());
        repo.insert(due(1, 1));
        repo.fail_next(1);
        let err = orch
            .run_cycle(clock.now(), &mut repo, &mut device, &mut || true)
            .unwrap_err();
        assert!(matches!(err, Error::TransientRepository(_)));
        assert!(err.is_retryable());
        assert_eq!(repo.get(1).unwrap().status, SlotStatus::Loaded);

        orch.run_cycle(clock.now(), &mut repo, &mut device, &mut || true)
            .unwrap();
        assert_eq!(repo.get(1).unwrap().status, SlotStatus::Played);
    }

    #[test]
    fn missing_file_stays_for_retry() {
        let (mut orch, mut repo, mut device, clock) = make_setup(make_config());
        repo.insert(due(1, 1));
        repo.insert(due(2, 1));
        device.mark_missing("announcements/ca_2.mp3");
        let report = orch
            .run_cycle(clock.now(), &mut repo, &mut device, &mut || true)
            .unwrap();
        assert_eq!(report.outcome.unwrap().skipped, vec![2]);
        assert_eq!(repo.get(1).unwrap().status, SlotStatus::Played);
        assert_eq!(repo.get(2).unwrap().status, SlotStatus::ListedToPlay);
    }

    #[test]
    fn backward_clock_forgets_last_batch() {
        let (mut orch, mut repo, mut device, clock) = make_setup(make_config());
        repo.insert(due(1, 1));
        orch.run_cycle(clock.now(), &mut repo, &mut device, &mut || true)
            .unwrap();
        assert!(orch.last_regular_batch().is_some());

        let earlier = noon() - chrono::Duration::hours(1);
        clock.set(earlier);
        orch.run_cycle(earlier, &mut repo, &mut device, &mut || true)
            .unwrap();
        assert_eq!(orch.last_regular_batch(), None);
    }
}

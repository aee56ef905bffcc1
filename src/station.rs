//! Station — host wiring for the broadcast core.
//!
//! Owns the scheduler, the repository, the device and the orchestrator, and
//! registers the periodic tasks that keep a store's audio going:
//! `announcements`, `music_check` and `heartbeat`. The host either calls
//! [`Station::do_events`] from its own loop or hands control to
//! [`Station::run`].

use crate::clock::Clock;
use crate::config::BroadcastConfig;
use crate::device::PlaybackDevice;
use crate::error::Result;
use crate::freeze::{FreezeCheck, FreezeDetector};
use crate::orchestrator::{CycleReport, Orchestrator};
use crate::repository::SlotRepository;
use crate::scheduler::{TickReport, TimedEventScheduler};
use chrono::{DateTime, Local};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

// ── Task ids ────────────────────────────────────────────────────────────────

pub const ANNOUNCEMENTS_TASK: &str = "announcements";
pub const MUSIC_CHECK_TASK: &str = "music_check";
pub const HEARTBEAT_TASK: &str = "heartbeat";

/// Upper bound on back-to-back batches after one tick.
const MAX_BACK_TO_BACK: usize = 20;

// ── Context ─────────────────────────────────────────────────────────────────

/// Everything a scheduled task may touch.
pub struct StationContext {
    pub orchestrator: Orchestrator,
    pub repository: Box<dyn SlotRepository>,
    pub device: Box<dyn PlaybackDevice>,
    pub clock: Arc<dyn Clock>,
    playback_enabled: Arc<AtomicBool>,
    freeze: FreezeDetector,
    last_cycle: Option<CycleReport>,
    restarts: usize,
}

impl StationContext {
    pub fn playback_enabled(&self) -> bool {
        self.playback_enabled.load(Ordering::Relaxed)
    }

    pub fn last_cycle(&self) -> Option<&CycleReport> {
        self.last_cycle.as_ref()
    }

    /// Device restarts after freezes, from either task.
    pub fn restarts(&self) -> usize {
        self.restarts
    }

    fn run_announcements(&mut self, now: DateTime<Local>) -> Result<()> {
        let flag = self.playback_enabled.clone();
        let mut still_enabled = move || flag.load(Ordering::Relaxed);
        let report = match self.orchestrator.run_cycle(
            now,
            self.repository.as_mut(),
            self.device.as_mut(),
            &mut still_enabled,
        ) {
            Ok(report) => report,
            Err(e) => {
                self.freeze.reset();
                return Err(e);
            }
        };
        if report.batch_size > 0 {
            // Announcements moved the device; the next freeze sample starts fresh.
            self.freeze.reset();
        }
        if report.outcome.as_ref().is_some_and(|o| o.restart_required) {
            self.restarts += 1;
        }
        self.last_cycle = Some(report);
        Ok(())
    }

    /// Freeze detection, then restart the music if it should be playing.
    fn check_music(&mut self, now: DateTime<Local>) -> Result<()> {
        // Back-to-back batches keep the music down until the last one is done.
        if !self.playback_enabled() || self.orchestrator.pending_run_again() {
            return Ok(());
        }
        if let FreezeCheck::Frozen { .. } = self.freeze.check(self.device.as_mut(), now)? {
            tracing::error!("Music playback froze, restarting device");
            self.device.restart()?;
            self.freeze.reset();
            self.restarts += 1;
        }

        let controller = self.orchestrator.controller_mut();
        if !controller.music_enabled() || controller.music_playlist().is_none() {
            return Ok(());
        }
        // A paused device was paused on purpose; leave it alone.
        if !self.device.playing()? && !self.device.paused()? {
            tracing::info!("Music not playing, restarting it");
            controller.resume_music(self.device.as_mut())?;
        }
        Ok(())
    }

    fn heartbeat(&mut self, _now: DateTime<Local>) -> Result<()> {
        let playing = self.device.playing()?;
        let volume = self.device.get_volume()?;
        tracing::info!(
            playing,
            volume,
            music_volume = self.orchestrator.controller().levels().music,
            enabled = self.playback_enabled(),
            "Station running"
        );
        Ok(())
    }
}

// ── Station ─────────────────────────────────────────────────────────────────

pub struct Station {
    scheduler: TimedEventScheduler<StationContext>,
    context: StationContext,
    tick_interval: Duration,
}

impl Station {
    /// Build the station and register its periodic tasks.
    ///
    /// Slots stuck in `ListedToPlay` from a previous run are put back to
    /// `Loaded` right away; a repository outage here is only logged.
    pub fn new(
        config: BroadcastConfig,
        mut repository: Box<dyn SlotRepository>,
        device: Box<dyn PlaybackDevice>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let intervals = config.intervals.clone();
        let tick_interval = Duration::from_millis(config.tick_interval_ms.max(1));
        let freeze = FreezeDetector::new(config.freeze_check_secs);

        match repository.reset_listed_to_play() {
            Ok(0) => {}
            Ok(n) => tracing::info!(count = n, "Recovered announcements left from last run"),
            Err(e) => tracing::warn!(error = %e, "Startup recovery failed, retrying next cycle"),
        }

        let orchestrator = Orchestrator::new(config, clock.clone())?;
        let mut scheduler = TimedEventScheduler::new(clock.clone());
        scheduler.register(
            ANNOUNCEMENTS_TASK,
            intervals.announcements_secs,
            true,
            Box::new(|ctx: &mut StationContext, now: DateTime<Local>| ctx.run_announcements(now)),
        )?;
        scheduler.register(
            MUSIC_CHECK_TASK,
            intervals.music_check_secs,
            true,
            Box::new(|ctx: &mut StationContext, now: DateTime<Local>| ctx.check_music(now)),
        )?;
        scheduler.register(
            HEARTBEAT_TASK,
            intervals.heartbeat_secs,
            true,
            Box::new(|ctx: &mut StationContext, now: DateTime<Local>| ctx.heartbeat(now)),
        )?;

        Ok(Station {
            scheduler,
            context: StationContext {
                orchestrator,
                repository,
                device,
                clock,
                playback_enabled: Arc::new(AtomicBool::new(true)),
                freeze,
                last_cycle: None,
                restarts: 0,
            },
            tick_interval,
        })
    }

    pub fn context(&self) -> &StationContext {
        &self.context
    }

    pub fn scheduler(&self) -> &TimedEventScheduler<StationContext> {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut TimedEventScheduler<StationContext> {
        &mut self.scheduler
    }

    /// Shared flag checked by the playback loop on every poll.
    pub fn playback_flag(&self) -> Arc<AtomicBool> {
        self.context.playback_enabled.clone()
    }

    /// Turn playback on or off. Turning it off stops the device.
    pub fn set_playback_enabled(&mut self, enabled: bool) {
        self.context.playback_enabled.store(enabled, Ordering::Relaxed);
        if !enabled {
            tracing::info!("Playback disabled");
            if let Err(e) = self.context.device.stop() {
                tracing::warn!(error = %e, "Could not stop device");
            }
        } else {
            tracing::info!("Playback enabled");
        }
    }

    /// One pass of the host loop: tick the scheduler, then play any
    /// back-to-back batches the last cycle asked for.
    pub fn do_events(&mut self) -> TickReport {
        let now = self.context.clock.now();
        let report = self.scheduler.tick(&mut self.context, now);

        let mut reruns = 0;
        while self.context.orchestrator.pending_run_again() {
            if reruns == MAX_BACK_TO_BACK {
                tracing::warn!(reruns, "Too many back-to-back batches, waiting for next tick");
                break;
            }
            reruns += 1;
            tracing::debug!(rerun = reruns, "Running next announcement batch immediately");
            if let Err(e) = self.scheduler.run_task_now(ANNOUNCEMENTS_TASK, &mut self.context) {
                tracing::error!(error = %e, "Could not rerun announcements");
                break;
            }
        }
        report
    }

    /// Host loop: one [`do_events`](Self::do_events) per tick until the
    /// process is killed.
    pub fn run(&mut self) -> ! {
        tracing::info!(tick_ms = self.tick_interval.as_millis() as u64, "Station started");
        loop {
            self.do_events();
            self.context.clock.sleep(self.tick_interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::device::MemoryDevice;
    use crate::repository::MemoryRepository;
    use crate::slot::{ScheduledSlot, SlotStatus};
    use chrono::TimeZone;
    use std::path::PathBuf;

    fn noon() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 5, 6, 12, 0, 0).unwrap()
    }

    fn make_station() -> (Station, MemoryRepository, MemoryDevice, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(noon()));
        let repo = MemoryRepository::default();
        let device = MemoryDevice::new(clock.clone());
        device.set_default_length(Duration::from_secs(5));
        device.set_length("music.m3u", Duration::from_secs(3600));
        let config = BroadcastConfig {
            music_playlist: Some("music.m3u".into()),
            ..BroadcastConfig::default()
        };
        let station = Station::new(
            config,
            Box::new(repo.clone()),
            Box::new(device.clone()),
            clock.clone(),
        )
        .unwrap();
        (station, repo, device, clock)
    }

    #[test]
    fn registers_three_tasks() {
        let (station, _repo, _device, _clock) = make_station();
        let ids: Vec<&str> = station.scheduler().timings().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, vec![ANNOUNCEMENTS_TASK, MUSIC_CHECK_TASK, HEARTBEAT_TASK]);
    }

    #[test]
    fn startup_recovers_listed_slots() {
        let clock = Arc::new(ManualClock::new(noon()));
        let mut repo = MemoryRepository::default();
        repo.insert(ScheduledSlot::new(1, "ca_a.mp3", noon()));
        repo.mark_listed_to_play(&[1]).unwrap();
        let _station = Station::new(
            BroadcastConfig::default(),
            Box::new(repo.clone()),
            Box::new(MemoryDevice::new(clock.clone())),
            clock,
        )
        .unwrap();
        assert_eq!(repo.get(1).unwrap().status, SlotStatus::Loaded);
    }

    #[test]
    fn music_check_starts_idle_music() {
        let (mut station, _repo, device, clock) = make_station();
        clock.advance(Duration::from_secs(2));
        let report = station.do_events();
        assert_eq!(report.ran, vec![MUSIC_CHECK_TASK.to_string()]);
        assert_eq!(device.started(), vec![PathBuf::from("music.m3u")]);
        assert_eq!(device.current_volume(), 80);
    }

    #[test]
    fn announcement_task_plays_due_slot() {
        let (mut station, repo, _device, clock) = make_station();
        repo.insert(ScheduledSlot::new(1, "ca_a.mp3", noon()));
        clock.advance(Duration::from_secs(10));
        let report = station.do_events();
        assert!(report.ran.contains(&ANNOUNCEMENTS_TASK.to_string()));
        assert_eq!(repo.get(1).unwrap().status, SlotStatus::Played);
        assert_eq!(station.context().last_cycle().unwrap().batch_size, 1);
    }

    #[test]
    fn disabled_playback_stops_device_and_skips() {
        let (mut station, repo, device, clock) = make_station();
        clock.advance(Duration::from_secs(2));
        station.do_events();
        assert!(device.is_playing());

        station.set_playback_enabled(false);
        assert!(!device.is_playing());
        repo.insert(ScheduledSlot::new(1, "ca_a.mp3", clock.now()));
        clock.advance(Duration::from_secs(10));
        station.do_events();
        assert_eq!(repo.get(1).unwrap().status, SlotStatus::Loaded);
        assert!(!device.is_playing());
    }

    #[test]
    fn frozen_music_is_restarted() {
        let (mut station, _repo, device, clock) = make_station();
        clock.advance(Duration::from_secs(2));
        station.do_events();
        device.freeze();
        for _ in 0..5 {
            clock.advance(Duration::from_secs(2));
            station.do_events();
        }
        assert_eq!(station.context().restarts(), 1);
        assert!(!device.is_frozen());
        // Music is queued up again after the restart.
        assert_eq!(device.started().len(), 2);
    }
}

use crate::clock::Clock;
use crate::error::{Error, Result};
use chrono::{DateTime, Local};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Command surface of an external audio player with a single play queue.
///
/// All calls are blocking. A failed command is reported as
/// [`Error::DeviceProtocol`] and aborts the current cycle.
pub trait PlaybackDevice {
    fn play(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    fn pause(&mut self) -> Result<()>;
    fn playing(&mut self) -> Result<bool>;
    fn paused(&mut self) -> Result<bool>;
    fn queue_clear(&mut self) -> Result<()>;
    fn queue_add(&mut self, path: &Path) -> Result<()>;
    fn queue_length(&mut self) -> Result<i32>;
    fn song_position_ms(&mut self) -> Result<i64>;
    /// Path of the current song, empty when nothing is loaded.
    fn song_path(&mut self) -> Result<String>;
    /// `verbose` marks the final step of a slide, worth a log line.
    fn set_volume(&mut self, percent: u8, verbose: bool) -> Result<()>;
    fn get_volume(&mut self) -> Result<u8>;

    /// Time left in the current song, when the device can tell.
    fn song_remaining_ms(&mut self) -> Result<Option<i64>> {
        Ok(None)
    }

    /// Whether `path` can be queued at all.
    fn can_play(&self, path: &Path) -> bool {
        path.is_file()
    }

    /// Bring a frozen device back to a usable, stopped state.
    fn restart(&mut self) -> Result<()> {
        Ok(())
    }
}

// ── Software device ──

#[derive(Debug, Clone, Copy, PartialEq)]
enum Transport {
    Stopped,
    Playing { started: DateTime<Local>, offset_ms: i64 },
    Paused { position_ms: i64 },
}

#[derive(Debug)]
struct DeviceState {
    queue: Vec<PathBuf>,
    transport: Transport,
    volume: u8,
    volume_log: Vec<(u8, bool)>,
    started: Vec<PathBuf>,
    lengths: HashMap<PathBuf, Duration>,
    default_length: Duration,
    missing: HashSet<PathBuf>,
    frozen: Option<(i64, String)>,
    fail_next: usize,
}

/// Player that runs entirely in memory on the injected clock.
///
/// Each queued file "plays" for its configured length. Clones share state,
/// so tests can inspect a device the station owns.
#[derive(Clone)]
pub struct MemoryDevice {
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<DeviceState>>,
}

impl MemoryDevice {
    pub const DEFAULT_LENGTH: Duration = Duration::from_secs(30);

    pub fn new(clock: Arc<dyn Clock>) -> Self {
        MemoryDevice {
            clock,
            state: Arc::new(Mutex::new(DeviceState {
                queue: Vec::new(),
                transport: Transport::Stopped,
                volume: 100,
                volume_log: Vec::new(),
                started: Vec::new(),
                lengths: HashMap::new(),
                default_length: Self::DEFAULT_LENGTH,
                missing: HashSet::new(),
                frozen: None,
                fail_next: 0,
            })),
        }
    }

    /// Play length for one file.
    pub fn set_length(&self, path: impl Into<PathBuf>, length: Duration) {
        self.lock().lengths.insert(path.into(), length);
    }

    pub fn set_default_length(&self, length: Duration) {
        self.lock().default_length = length;
    }

    /// Report `path` as unplayable.
    pub fn mark_missing(&self, path: impl Into<PathBuf>) {
        self.lock().missing.insert(path.into());
    }

    /// Hang in "playing" at the current position until [`PlaybackDevice::restart`].
    pub fn freeze(&self) {
        let now = self.clock.now();
        let mut state = self.lock();
        let position = state.position_ms(now);
        let path = state.current_path();
        state.frozen = Some((position, path));
    }

    pub fn is_frozen(&self) -> bool {
        self.lock().frozen.is_some()
    }

    /// Fail the next `count` commands.
    pub fn fail_next(&self, count: usize) {
        self.lock().fail_next = count;
    }

    /// Every volume call as `(percent, verbose)`.
    pub fn volume_log(&self) -> Vec<(u8, bool)> {
        self.lock().volume_log.clone()
    }

    pub fn clear_volume_log(&self) {
        self.lock().volume_log.clear();
    }

    /// Files in the order playback started from the top.
    pub fn started(&self) -> Vec<PathBuf> {
        self.lock().started.clone()
    }

    /// Transport state without going through the command surface.
    pub fn is_playing(&self) -> bool {
        let now = self.clock.now();
        let mut state = self.lock();
        if state.frozen.is_some() {
            return true;
        }
        state.settle(now);
        matches!(state.transport, Transport::Playing { .. })
    }

    pub fn current_volume(&self) -> u8 {
        self.lock().volume
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn checked(&self) -> Result<MutexGuard<'_, DeviceState>> {
        let mut state = self.lock();
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(Error::device("simulated command failure"));
        }
        Ok(state)
    }
}

impl DeviceState {
    fn current_length(&self) -> Duration {
        self.queue
            .first()
            .and_then(|p| self.lengths.get(p).copied())
            .unwrap_or(self.default_length)
    }

    fn current_path(&self) -> String {
        self.queue
            .first()
            .map(|p| p.display().to_string())
            .unwrap_or_default()
    }

    fn position_ms(&self, now: DateTime<Local>) -> i64 {
        if let Some((position, _)) = &self.frozen {
            return *position;
        }
        let length = self.current_length().as_millis() as i64;
        match self.transport {
            Transport::Stopped => 0,
            Transport::Paused { position_ms } => position_ms,
            Transport::Playing { started, offset_ms } => {
                let elapsed = (now - started).num_milliseconds().max(0) + offset_ms;
                elapsed.min(length)
            }
        }
    }

    /// Finished songs fall back to stopped.
    fn settle(&mut self, now: DateTime<Local>) {
        if self.frozen.is_some() {
            return;
        }
        if let Transport::Playing { .. } = self.transport {
            let length = self.current_length().as_millis() as i64;
            if self.position_ms(now) >= length {
                self.transport = Transport::Stopped;
            }
        }
    }
}

impl PlaybackDevice for MemoryDevice {
    fn play(&mut self) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.checked()?;
        state.settle(now);
        let transport = state.transport;
        match transport {
            Transport::Playing { .. } => {}
            Transport::Paused { position_ms } => {
                state.transport = Transport::Playing { started: now, offset_ms: position_ms };
            }
            Transport::Stopped => {
                if let Some(first) = state.queue.first().cloned() {
                    state.started.push(first);
                    state.transport = Transport::Playing { started: now, offset_ms: 0 };
                }
            }
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let mut state = self.checked()?;
        if state.frozen.is_none() {
            state.transport = Transport::Stopped;
        }
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.checked()?;
        state.settle(now);
        let transport = state.transport;
        if let Transport::Playing { .. } = transport {
            let position_ms = state.position_ms(now);
            state.transport = Transport::Paused { position_ms };
        }
        Ok(())
    }

    fn playing(&mut self) -> Result<bool> {
        let now = self.clock.now();
        let mut state = self.checked()?;
        if state.frozen.is_some() {
            return Ok(true);
        }
        state.settle(now);
        Ok(matches!(state.transport, Transport::Playing { .. }))
    }

    fn paused(&mut self) -> Result<bool> {
        let state = self.checked()?;
        Ok(matches!(state.transport, Transport::Paused { .. }))
    }

    fn queue_clear(&mut self) -> Result<()> {
        let mut state = self.checked()?;
        if state.frozen.is_none() {
            state.queue.clear();
            state.transport = Transport::Stopped;
        }
        Ok(())
    }

    fn queue_add(&mut self, path: &Path) -> Result<()> {
        let mut state = self.checked()?;
        state.queue.push(path.to_path_buf());
        Ok(())
    }

    fn queue_length(&mut self) -> Result<i32> {
        let state = self.checked()?;
        Ok(state.queue.len() as i32)
    }

    fn song_position_ms(&mut self) -> Result<i64> {
        let now = self.clock.now();
        let state = self.checked()?;
        Ok(state.position_ms(now))
    }

    fn song_path(&mut self) -> Result<String> {
        let state = self.checked()?;
        Ok(match &state.frozen {
            Some((_, path)) => path.clone(),
            None => state.current_path(),
        })
    }

    fn set_volume(&mut self, percent: u8, verbose: bool) -> Result<()> {
        let mut state = self.checked()?;
        let percent = percent.min(100);
        state.volume = percent;
        state.volume_log.push((percent, verbose));
        if verbose {
            tracing::info!(volume = percent, "Volume set");
        } else {
            tracing::trace!(volume = percent, "Volume step");
        }
        Ok(())
    }

    fn get_volume(&mut self) -> Result<u8> {
        Ok(self.checked()?.volume)
    }

    fn song_remaining_ms(&mut self) -> Result<Option<i64>> {
        let now = self.clock.now();
        let state = self.checked()?;
        if state.queue.is_empty() {
            return Ok(None);
        }
        let length = state.current_length().as_millis() as i64;
        Ok(Some((length - state.position_ms(now)).max(0)))
    }

    fn can_play(&self, path: &Path) -> bool {
        !self.lock().missing.contains(path)
    }

    fn restart(&mut self) -> Result<()> {
        let mut state = self.lock();
        state.frozen = None;
        state.transport = Transport::Stopped;
        state.queue.clear();
        tracing::info!("Memory device restarted");
        Ok(())
    }
}

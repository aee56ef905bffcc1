use crate::device::PlaybackDevice;
use crate::error::Result;
use chrono::{DateTime, Local};

/// Outcome of one freeze check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FreezeCheck {
    /// Device not playing; nothing to watch.
    Idle,
    /// Too soon after the last sample.
    NotDue,
    Progressing,
    /// Playing, but position and song are unchanged since the last sample.
    Frozen { position_ms: i64, path: String },
}

#[derive(Debug, Clone)]
struct Sample {
    at: DateTime<Local>,
    position_ms: i64,
    path: String,
}

/// Detects a device that claims to play while making no progress.
///
/// Frozen is reported, never retried here: the caller restarts the device.
#[derive(Debug, Clone)]
pub struct FreezeDetector {
    interval: chrono::Duration,
    last: Option<Sample>,
}

impl FreezeDetector {
    pub fn new(interval_secs: i64) -> Self {
        FreezeDetector {
            interval: chrono::Duration::seconds(interval_secs.max(1)),
            last: None,
        }
    }

    pub fn reset(&mut self) {
        self.last = None;
    }

    pub fn check(&mut self, device: &mut dyn PlaybackDevice, now: DateTime<Local>) -> Result<FreezeCheck> {
        if !device.playing()? {
            self.last = None;
            return Ok(FreezeCheck::Idle);
        }
        if let Some(last) = &self.last {
            // A backwards clock also counts as due; the sample is simply replaced.
            if now >= last.at && now - last.at < self.interval {
                return Ok(FreezeCheck::NotDue);
            }
        }

        let position_ms = device.song_position_ms()?;
        let path = device.song_path()?;
        let frozen = self
            .last
            .as_ref()
            .is_some_and(|last| last.position_ms == position_ms && last.path == path);
        self.last = Some(Sample {
            at: now,
            position_ms,
            path: path.clone(),
        });

        if frozen {
            tracing::error!(position_ms, path = %path, "Playback device appears frozen");
            Ok(FreezeCheck::Frozen { position_ms, path })
        } else {
            Ok(FreezeCheck::Progressing)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::device::MemoryDevice;
    use chrono::TimeZone;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    fn make_playing_device() -> (MemoryDevice, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Local.with_ymd_and_hms(2024, 5, 6, 12, 0, 0).unwrap()));
        let mut device = MemoryDevice::new(clock.clone());
        device.set_default_length(Duration::from_secs(600));
        device.queue_add(Path::new("music.m3u")).unwrap();
        device.play().unwrap();
        (device, clock)
    }

    #[test]
    fn progressing_device_is_not_frozen() {
        let (mut device, clock) = make_playing_device();
        let mut detector = FreezeDetector::new(2);
        assert_eq!(detector.check(&mut device, clock.now()).unwrap(), FreezeCheck::Progressing);
        clock.advance(Duration::from_secs(1));
        assert_eq!(detector.check(&mut device, clock.now()).unwrap(), FreezeCheck::NotDue);
        clock.advance(Duration::from_secs(1));
        assert_eq!(detector.check(&mut device, clock.now()).unwrap(), FreezeCheck::Progressing);
    }

    #[test]
    fn stuck_device_is_frozen() {
        let (mut device, clock) = make_playing_device();
        let mut detector = FreezeDetector::new(2);
        clock.advance(Duration::from_secs(3));
        device.freeze();
        detector.check(&mut device, clock.now()).unwrap();
        clock.advance(Duration::from_secs(2));
        assert_eq!(
            detector.check(&mut device, clock.now()).unwrap(),
            FreezeCheck::Frozen {
                position_ms: 3000,
                path: "music.m3u".to_string()
            }
        );
    }

    #[test]
    fn stopped_device_resets_state() {
        let (mut device, clock) = make_playing_device();
        let mut detector = FreezeDetector::new(2);
        detector.check(&mut device, clock.now()).unwrap();
        device.stop().unwrap();
        clock.advance(Duration::from_secs(5));
        assert_eq!(detector.check(&mut device, clock.now()).unwrap(), FreezeCheck::Idle);
        device.play().unwrap();
        assert_eq!(detector.check(&mut device, clock.now()).unwrap(), FreezeCheck::Progressing);
    }
}

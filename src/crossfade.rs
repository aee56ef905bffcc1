use crate::clock::Clock;
use crate::device::PlaybackDevice;
use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;

// --- Constants ---

/// Cadence of volume steps during a slide.
pub const STEP_MS: u64 = 200;

/// One volume ramp. Lives only for the duration of a slide call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeSlide {
    pub start_percent: u8,
    pub end_percent: u8,
    pub duration_ms: u64,
    pub elapsed_ms: u64,
}

impl VolumeSlide {
    pub fn new(start_percent: u8, end_percent: u8, duration_ms: u64) -> Self {
        VolumeSlide {
            start_percent: start_percent.min(100),
            end_percent: end_percent.min(100),
            duration_ms,
            elapsed_ms: 0,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.start_percent == self.end_percent
    }

    /// Number of intervals; the slide issues `steps + 1` candidate values.
    pub fn steps(&self) -> u64 {
        self.duration_ms.div_ceil(STEP_MS)
    }

    /// Rounded volume at `elapsed_ms` into the slide.
    pub fn volume_at(&self, elapsed_ms: u64) -> u8 {
        if self.duration_ms == 0 || elapsed_ms >= self.duration_ms {
            return self.end_percent;
        }
        let start = self.start_percent as f64;
        let end = self.end_percent as f64;
        let v = start + (end - start) * elapsed_ms as f64 / self.duration_ms as f64;
        v.round().clamp(0.0, 100.0) as u8
    }
}

/// Issues time-ramped volume changes against a device.
///
/// A slide blocks the caller for its whole duration and cannot be
/// interrupted.
pub struct CrossfadeEngine {
    clock: Arc<dyn Clock>,
}

impl CrossfadeEngine {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        CrossfadeEngine { clock }
    }

    /// Ramp from `from` to `to` over `duration_ms`. Returns the number of
    /// volume calls issued.
    pub fn slide(
        &self,
        device: &mut dyn PlaybackDevice,
        from: u8,
        to: u8,
        duration_ms: u64,
    ) -> Result<usize> {
        let mut slide = VolumeSlide::new(from, to, duration_ms);
        if slide.is_noop() {
            return Ok(0);
        }
        tracing::debug!(
            from = slide.start_percent,
            to = slide.end_percent,
            duration_ms,
            "Initiated volume slide"
        );

        let steps = slide.steps();
        let mut last: Option<u8> = None;
        let mut issued = 0;
        for i in 0..=steps {
            slide.elapsed_ms = (i * STEP_MS).min(duration_ms);
            let volume = slide.volume_at(slide.elapsed_ms);
            let final_step = i == steps;
            if final_step || last != Some(volume) {
                device.set_volume(volume, final_step)?;
                last = Some(volume);
                issued += 1;
            }
            if !final_step {
                self.clock.sleep(Duration::from_millis(STEP_MS));
            }
        }
        Ok(issued)
    }

    /// Ramp from the device's current volume to `to`.
    pub fn slide_from_current(
        &self,
        device: &mut dyn PlaybackDevice,
        to: u8,
        duration_ms: u64,
    ) -> Result<usize> {
        let current = device.get_volume()?;
        self.slide(device, current, to, duration_ms)
    }
}

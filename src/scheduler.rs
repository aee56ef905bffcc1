use crate::clock::Clock;
use crate::error::{Error, Result};
use chrono::{DateTime, Local};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Body of a periodic task. Receives the shared context and the tick time.
pub type TaskFn<C> = Box<dyn FnMut(&mut C, DateTime<Local>) -> Result<()>>;

/// Timing record of one registered task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTiming {
    pub task_id: String,
    pub interval_secs: i64,
    pub enabled: bool,
    pub next_run_at: DateTime<Local>,
}

impl EventTiming {
    fn interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.interval_secs)
    }

    fn resync(&mut self, now: DateTime<Local>) {
        self.next_run_at = now + self.interval();
    }
}

/// What one call to [`TimedEventScheduler::tick`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Tasks that ran and returned `Ok`.
    pub ran: Vec<String>,
    /// Tasks that returned an error or panicked.
    pub failed: Vec<String>,
    /// The clock moved backwards since the last tick; everything was resynced.
    pub clock_skew: bool,
}

impl TickReport {
    pub fn fired(&self) -> usize {
        self.ran.len() + self.failed.len()
    }
}

struct TaskEntry<C> {
    timing: EventTiming,
    run: TaskFn<C>,
}

/// Interval-driven task runner.
///
/// Creates no threads: the host calls [`tick`](Self::tick) repeatedly and
/// every due task runs inline, in registration order. A failing or panicking
/// task is logged and never stops the others.
pub struct TimedEventScheduler<C> {
    clock: Arc<dyn Clock>,
    tasks: Vec<TaskEntry<C>>,
    enabled: bool,
    last_tick: Option<DateTime<Local>>,
}

impl<C> TimedEventScheduler<C> {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        TimedEventScheduler {
            clock,
            tasks: Vec::new(),
            enabled: true,
            last_tick: None,
        }
    }

    /// Register a task. Its first run is one interval from now.
    pub fn register(
        &mut self,
        id: &str,
        interval_secs: i64,
        enabled: bool,
        run: TaskFn<C>,
    ) -> Result<()> {
        if self.find(id).is_some() {
            return Err(Error::DuplicateTask(id.to_string()));
        }
        check_interval(id, interval_secs)?;
        let timing = EventTiming {
            task_id: id.to_string(),
            interval_secs,
            enabled,
            next_run_at: self.clock.now() + chrono::Duration::seconds(interval_secs),
        };
        tracing::debug!(task = id, interval_secs, enabled, "Registered task");
        self.tasks.push(TaskEntry { timing, run });
        Ok(())
    }

    pub fn unregister(&mut self, id: &str) -> Result<EventTiming> {
        let pos = self
            .tasks
            .iter()
            .position(|t| t.timing.task_id == id)
            .ok_or_else(|| Error::UnknownTask(id.to_string()))?;
        Ok(self.tasks.remove(pos).timing)
    }

    pub fn enable_task(&mut self, id: &str) -> Result<()> {
        self.find_mut(id)?.timing.enabled = true;
        Ok(())
    }

    pub fn disable_task(&mut self, id: &str) -> Result<()> {
        self.find_mut(id)?.timing.enabled = false;
        Ok(())
    }

    /// Change the cadence. The pending next run is kept.
    pub fn set_interval(&mut self, id: &str, interval_secs: i64) -> Result<()> {
        check_interval(id, interval_secs)?;
        self.find_mut(id)?.timing.interval_secs = interval_secs;
        Ok(())
    }

    pub fn enable_all(&mut self) {
        self.enabled = true;
    }

    pub fn disable_all(&mut self) {
        self.enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn timing(&self, id: &str) -> Option<&EventTiming> {
        self.find(id).map(|t| &t.timing)
    }

    pub fn timings(&self) -> impl Iterator<Item = &EventTiming> {
        self.tasks.iter().map(|t| &t.timing)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Run every enabled task that is due at `now`.
    ///
    /// A backward clock jump resyncs every task to `now + interval` and fires
    /// nothing on that call. An enabled task scheduled further out than its
    /// own interval is resynced the same way, but only while the scheduler is
    /// enabled.
    pub fn tick(&mut self, ctx: &mut C, now: DateTime<Local>) -> TickReport {
        let mut report = TickReport::default();

        if let Some(last) = self.last_tick {
            if now < last {
                tracing::warn!(
                    last = %last.format("%H:%M:%S"),
                    now = %now.format("%H:%M:%S"),
                    "Clock moved backwards, resyncing all tasks"
                );
                for task in &mut self.tasks {
                    task.timing.resync(now);
                }
                self.last_tick = Some(now);
                report.clock_skew = true;
                return report;
            }
        }
        self.last_tick = Some(now);

        if !self.enabled {
            return report;
        }

        for task in &mut self.tasks {
            if !task.timing.enabled {
                continue;
            }
            if task.timing.next_run_at - now > task.timing.interval() {
                tracing::warn!(task = %task.timing.task_id, "Next run too far ahead, resyncing");
                task.timing.resync(now);
            }
            if task.timing.next_run_at > now {
                continue;
            }
            let id = task.timing.task_id.clone();
            if run_isolated(&id, &mut task.run, ctx, now) {
                report.ran.push(id);
            } else {
                report.failed.push(id);
            }
            task.timing.resync(now);
        }
        report
    }

    /// Run one task immediately, outside its cadence. Its next run is not moved.
    pub fn run_task_now(&mut self, id: &str, ctx: &mut C) -> Result<bool> {
        let now = self.clock.now();
        let task = self.find_mut(id)?;
        Ok(run_isolated(id, &mut task.run, ctx, now))
    }

    fn find(&self, id: &str) -> Option<&TaskEntry<C>> {
        self.tasks.iter().find(|t| t.timing.task_id == id)
    }

    fn find_mut(&mut self, id: &str) -> Result<&mut TaskEntry<C>> {
        self.tasks
            .iter_mut()
            .find(|t| t.timing.task_id == id)
            .ok_or_else(|| Error::UnknownTask(id.to_string()))
    }
}

fn check_interval(id: &str, interval_secs: i64) -> Result<()> {
    if interval_secs <= 0 {
        return Err(Error::InvalidInterval {
            task: id.to_string(),
            interval: interval_secs,
        });
    }
    Ok(())
}

/// Returns false when the task failed or panicked.
fn run_isolated<C>(id: &str, run: &mut TaskFn<C>, ctx: &mut C, now: DateTime<Local>) -> bool {
    match catch_unwind(AssertUnwindSafe(|| run(ctx, now))) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::error!(task = id, error = %e, "Task failed");
            false
        }
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(task = id, panic = %msg, "Task panicked");
            false
        }
    }
}

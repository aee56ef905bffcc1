//! Announcement batch selection.
//!
//! Due slots are ordered by priority, picked greedily into a batch, and any
//! slot held back because of an announcer clash is retried by searching the
//! orderings of the batch for one where no two neighbours share an announcer.

use crate::config::{BroadcastConfig, MAX_BATCH_LIMIT};
use crate::error::{Error, Result};
use crate::repository::{DueWindow, SlotRepository};
use crate::slot::{Batch, ScheduledSlot, SlotId};
use chrono::{DateTime, Local};
use std::collections::BTreeMap;

/// Output of [`plan_batch`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchPlan {
    /// Final play order.
    pub batch: Vec<ScheduledSlot>,
    /// Held back by announcer clashes that no ordering could resolve.
    pub deferred: Vec<ScheduledSlot>,
    /// Dropped for repeating a file or category already in the batch.
    pub duplicates: Vec<ScheduledSlot>,
    /// How many times the ordering search ran.
    pub searches: usize,
}

/// Stale slots of one file, for a single summary log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissedSummary {
    pub file: String,
    pub count: usize,
    pub first: DateTime<Local>,
    pub last: DateTime<Local>,
}

/// Result of one selection cycle.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub batch: Batch,
    /// More slots were eligible than fit, and back-to-back batches are allowed.
    pub run_again_immediately: bool,
    pub missed: Vec<SlotId>,
    pub missed_summary: Vec<MissedSummary>,
    /// Eligible slots that did not make this batch.
    pub left_over: Vec<SlotId>,
    pub eligible_count: usize,
}

pub struct AnnouncementSelector {
    max_per_batch: usize,
    miss_after: chrono::Duration,
    min_gap_between_batches_secs: u64,
}

impl AnnouncementSelector {
    pub fn new(config: &BroadcastConfig) -> Result<Self> {
        if config.max_per_batch == 0 || config.max_per_batch > MAX_BATCH_LIMIT {
            return Err(Error::Config(format!(
                "max_per_batch must be between 1 and {}, got {}",
                MAX_BATCH_LIMIT, config.max_per_batch
            )));
        }
        Ok(AnnouncementSelector {
            max_per_batch: config.max_per_batch,
            miss_after: chrono::Duration::minutes(config.miss_after_minutes),
            min_gap_between_batches_secs: config.min_gap_between_batches_secs,
        })
    }

    pub fn max_per_batch(&self) -> usize {
        self.max_per_batch
    }

    /// Pick the next batch and mark it `ListedToPlay`.
    ///
    /// Repository errors propagate unchanged. Missed slots are reported, not
    /// marked; that is left to the caller.
    pub fn select_batch(
        &self,
        now: DateTime<Local>,
        repo: &mut dyn SlotRepository,
        regular_batches_allowed: bool,
    ) -> Result<Selection> {
        let slots = repo.fetch_due_slots(now, &DueWindow::ending_at(now))?;

        let cutoff = now - self.miss_after;
        let mut eligible = Vec::new();
        let mut missed = Vec::new();
        for slot in slots {
            if let Err(e) = slot.file_category() {
                tracing::warn!(id = slot.id, error = %e, "Skipping slot");
                continue;
            }
            let when = slot.effective_time();
            if when > now {
                continue;
            }
            if when < cutoff {
                missed.push(slot);
            } else if slot.is_forced() || regular_batches_allowed {
                eligible.push(slot);
            }
        }

        let eligible_count = eligible.len();
        let plan = plan_batch(eligible.clone(), self.max_per_batch);
        let batch = Batch::new(plan.batch);
        let placed = batch.ids();
        let left_over: Vec<SlotId> = eligible
            .iter()
            .map(|s| s.id)
            .filter(|id| !placed.contains(id))
            .collect();
        let run_again_immediately =
            eligible_count > batch.len() && self.min_gap_between_batches_secs == 0;

        if !batch.is_empty() {
            repo.mark_listed_to_play(&placed)?;
            tracing::debug!(
                batch = ?placed,
                eligible = eligible_count,
                searches = plan.searches,
                "Selected announcement batch"
            );
        }

        Ok(Selection {
            batch,
            run_again_immediately,
            missed: missed.iter().map(|s| s.id).collect(),
            missed_summary: summarize_missed(&missed),
            left_over,
            eligible_count,
        })
    }
}

/// Order and cap a set of eligible slots.
pub fn plan_batch(mut candidates: Vec<ScheduledSlot>, max_per_batch: usize) -> BatchPlan {
    candidates.sort_by(|a, b| {
        (a.priority, a.scheduled_at, a.id).cmp(&(b.priority, b.scheduled_at, b.id))
    });

    let mut plan = BatchPlan::default();

    // Greedy pass.
    for slot in candidates {
        if plan.batch.len() >= max_per_batch {
            break;
        }
        if duplicates_any(&plan.batch, &slot) {
            plan.duplicates.push(slot);
            continue;
        }
        let clashes_last = plan
            .batch
            .last()
            .is_some_and(|last| announcers_clash(&last.announcer, &slot.announcer));
        if clashes_last {
            plan.deferred.push(slot);
        } else {
            plan.batch.push(slot);
        }
    }

    // Repair: keep retrying the deferred list while placements succeed.
    let mut placed_any = true;
    while placed_any && !plan.deferred.is_empty() && plan.batch.len() < max_per_batch {
        placed_any = false;
        let mut i = 0;
        while i < plan.deferred.len() && plan.batch.len() < max_per_batch {
            if duplicates_any(&plan.batch, &plan.deferred[i]) {
                let dup = plan.deferred.remove(i);
                plan.duplicates.push(dup);
                continue;
            }
            let mut trial = plan.batch.clone();
            trial.push(plan.deferred[i].clone());
            let codes: Vec<&str> = trial.iter().map(|s| s.announcer.as_str()).collect();
            plan.searches += 1;
            match find_clash_free_order(&codes) {
                Some(order) => {
                    plan.batch = order.iter().map(|&k| trial[k].clone()).collect();
                    plan.deferred.remove(i);
                    placed_any = true;
                }
                None => i += 1,
            }
        }
    }

    plan
}

/// Find an ordering of `codes` with no two equal non-empty neighbours.
///
/// Walks every permutation by adjacent transpositions (Steinhaus-Johnson-
/// Trotter), starting from the given order, and returns the first valid one
/// as indices into `codes`. `None` once all `n!` orderings are exhausted.
pub fn find_clash_free_order(codes: &[&str]) -> Option<Vec<usize>> {
    let n = codes.len();
    let mut perm: Vec<usize> = (0..n).collect();
    if is_clash_free(codes, &perm) {
        return Some(perm);
    }

    // Direction per element value: -1 left, +1 right.
    let mut dir: Vec<isize> = vec![-1; n];
    loop {
        let mut mobile: Option<usize> = None;
        for pos in 0..n {
            let value = perm[pos];
            let target = pos as isize + dir[value];
            if target < 0 || target >= n as isize {
                continue;
            }
            if perm[target as usize] < value && mobile.is_none_or(|m| perm[m] < value) {
                mobile = Some(pos);
            }
        }
        let pos = mobile?;
        let value = perm[pos];
        let target = (pos as isize + dir[value]) as usize;
        perm.swap(pos, target);
        for (v, d) in dir.iter_mut().enumerate() {
            if v > value {
                *d = -*d;
            }
        }
        if is_clash_free(codes, &perm) {
            return Some(perm);
        }
    }
}

fn is_clash_free(codes: &[&str], order: &[usize]) -> bool {
    order
        .windows(2)
        .all(|w| !announcers_clash(codes[w[0]], codes[w[1]]))
}

/// Empty codes never clash.
fn announcers_clash(a: &str, b: &str) -> bool {
    !a.is_empty() && a == b
}

fn duplicates_any(batch: &[ScheduledSlot], slot: &ScheduledSlot) -> bool {
    batch.iter().any(|s| {
        s.file == slot.file || (!slot.category.is_empty() && s.category == slot.category)
    })
}

/// Group stale slots by file, oldest first.
pub fn summarize_missed(missed: &[ScheduledSlot]) -> Vec<MissedSummary> {
    let mut by_file: BTreeMap<&str, MissedSummary> = BTreeMap::new();
    for slot in missed {
        let when = slot.effective_time();
        by_file
            .entry(slot.file.as_str())
            .and_modify(|m| {
                m.count += 1;
                m.first = m.first.min(when);
                m.last = m.last.max(when);
            })
            .or_insert_with(|| MissedSummary {
                file: slot.file.clone(),
                count: 1,
                first: when,
                last: when,
            });
    }
    let mut out: Vec<MissedSummary> = by_file.into_values().collect();
    out.sort_by_key(|m| m.first);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryRepository;
    use crate::slot::SlotStatus;
    use chrono::TimeZone;
    use std::collections::HashSet;

    fn noon() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 5, 6, 12, 0, 0).unwrap()
    }

    fn make_slot(id: SlotId, announcer: &str, mins_ago: i64) -> ScheduledSlot {
        ScheduledSlot::new(id, format!("ca_{}.mp3", id), noon() - chrono::Duration::minutes(mins_ago))
            .with_announcer(announcer)
    }

    fn ids(slots: &[ScheduledSlot]) -> Vec<SlotId> {
        slots.iter().map(|s| s.id).collect()
    }

    fn make_selector(max: usize, gap: u64) -> AnnouncementSelector {
        let config = BroadcastConfig {
            max_per_batch: max,
            min_gap_between_batches_secs: gap,
            ..BroadcastConfig::default()
        };
        AnnouncementSelector::new(&config).unwrap()
    }

    #[test]
    fn clash_is_repaired_by_reordering() {
        let slots = vec![make_slot(1, "X", 3), make_slot(2, "X", 2), make_slot(3, "Y", 1)];
        let plan = plan_batch(slots, 3);
        assert_eq!(ids(&plan.batch), vec![1, 3, 2]);
        assert!(plan.deferred.is_empty());
    }

    #[test]
    fn single_announcer_places_only_one() {
        let slots = vec![make_slot(1, "X", 3), make_slot(2, "X", 2), make_slot(3, "X", 1)];
        let plan = plan_batch(slots, 3);
        assert_eq!(ids(&plan.batch), vec![1]);
        assert_eq!(ids(&plan.deferred), vec![2, 3]);
    }

    #[test]
    fn distinct_announcers_keep_greedy_order() {
        let slots = vec![make_slot(3, "Z", 1), make_slot(1, "X", 3), make_slot(2, "Y", 2)];
        let plan = plan_batch(slots, 3);
        assert_eq!(ids(&plan.batch), vec![1, 2, 3]);
        assert_eq!(plan.searches, 0);
    }

    #[test]
    fn empty_announcer_never_clashes() {
        let slots = vec![make_slot(1, "", 3), make_slot(2, "", 2)];
        let plan = plan_batch(slots, 3);
        assert_eq!(ids(&plan.batch), vec![1, 2]);
    }

    #[test]
    fn priority_then_time_then_id() {
        let slots = vec![
            make_slot(5, "A", 10).with_priority(2),
            make_slot(4, "B", 1).with_priority(1),
            make_slot(2, "C", 5).with_priority(1),
            make_slot(1, "D", 5).with_priority(1),
        ];
        let plan = plan_batch(slots, 10);
        assert_eq!(ids(&plan.batch), vec![1, 2, 4, 5]);
    }

    #[test]
    fn order_uses_scheduled_start_not_forced_time() {
        let forced = make_slot(1, "A", 60).with_forced(noon() - chrono::Duration::minutes(1));
        let regular = make_slot(2, "B", 10);
        let plan = plan_batch(vec![regular, forced], 1);
        assert_eq!(ids(&plan.batch), vec![1]);
    }

    #[test]
    fn duplicate_file_and_category_are_dropped() {
        let mut dup_file = make_slot(2, "Y", 2);
        dup_file.file = "ca_1.mp3".into();
        let slots = vec![
            make_slot(1, "X", 3).with_category("sale"),
            dup_file,
            make_slot(3, "Z", 1).with_category("sale"),
            make_slot(4, "W", 0),
        ];
        let plan = plan_batch(slots, 3);
        assert_eq!(ids(&plan.batch), vec![1, 4]);
        assert_eq!(ids(&plan.duplicates), vec![2, 3]);
    }

    #[test]
    fn batch_respects_cap_and_uniqueness() {
        let announcers = ["A", "A", "B", "A", "C", "B", "B", "", "C", "A", "D", "A"];
        let slots: Vec<ScheduledSlot> = announcers
            .iter()
            .enumerate()
            .map(|(i, a)| {
                let mut s = make_slot(i as SlotId, a, 20 - i as i64);
                if i % 4 == 0 {
                    s.category = "shared".into();
                }
                s
            })
            .collect();
        for max in 1..=6 {
            let plan = plan_batch(slots.clone(), max);
            assert!(plan.batch.len() <= max);
            let files: HashSet<&str> = plan.batch.iter().map(|s| s.file.as_str()).collect();
            assert_eq!(files.len(), plan.batch.len());
            let shared = plan.batch.iter().filter(|s| s.category == "shared").count();
            assert!(shared <= 1);
            assert!(plan.batch.windows(2).all(|w| !announcers_clash(&w[0].announcer, &w[1].announcer)));
        }
    }

    #[test]
    fn deferred_slot_placed_after_later_pick() {
        // B clashes with A, C is a different announcer; B fits after C.
        let slots = vec![make_slot(1, "X", 4), make_slot(2, "X", 3), make_slot(3, "Y", 2), make_slot(4, "X", 1)];
        let plan = plan_batch(slots, 4);
        assert_eq!(plan.batch.len(), 3);
        assert!(plan.batch.windows(2).all(|w| w[0].announcer != w[1].announcer));
        assert_eq!(plan.deferred.len(), 1);
    }

    #[test]
    fn search_finds_interleaving() {
        let order = find_clash_free_order(&["X", "X", "Y", "Y"]).unwrap();
        let codes = ["X", "X", "Y", "Y"];
        assert!(order.windows(2).all(|w| codes[w[0]] != codes[w[1]]));
        let mut sorted = order.clone();
        sorted.sort();
        assert_eq!(sorted, vec![0, 1, 2, 3]);
    }

    #[test]
    fn search_exhausts_to_none() {
        assert_eq!(find_clash_free_order(&["X", "X", "Y", "X"]), None);
        assert_eq!(find_clash_free_order(&["Q", "Q"]), None);
    }

    #[test]
    fn search_trivial_sizes() {
        assert_eq!(find_clash_free_order(&[]), Some(vec![]));
        assert_eq!(find_clash_free_order(&["X"]), Some(vec![0]));
        assert_eq!(find_clash_free_order(&["X", "Y", "Z"]), Some(vec![0, 1, 2]));
    }

    #[test]
    fn search_visits_every_permutation() {
        // The start order clashes on the two B's; a later permutation splits them.
        let codes = ["A", "B", "B", "C"];
        let order = find_clash_free_order(&codes).unwrap();
        assert!(order.windows(2).all(|w| codes[w[0]] != codes[w[1]]));
    }

    #[test]
    fn forced_and_regular_overflow_requests_rerun() {
        let mut slots = Vec::new();
        for id in 1..=2 {
            slots.push(make_slot(id, &format!("F{}", id), 30).with_forced(noon() - chrono::Duration::minutes(id)));
        }
        for id in 3..=7 {
            slots.push(make_slot(id, &format!("R{}", id), id));
        }
        let mut repo = MemoryRepository::new(slots);
        let selector = make_selector(3, 0);
        let selection = selector.select_batch(noon(), &mut repo, true).unwrap();
        assert_eq!(selection.batch.len(), 3);
        assert!(selection.run_again_immediately);
        assert_eq!(selection.eligible_count, 7);
        for id in selection.batch.ids() {
            assert_eq!(repo.get(id).unwrap().status, SlotStatus::ListedToPlay);
        }
        assert_eq!(selection.left_over.len(), 4);
    }

    #[test]
    fn rerun_not_requested_with_gap() {
        let slots = (1..=5).map(|id| make_slot(id, "", id)).collect();
        let mut repo = MemoryRepository::new(slots);
        let selection = make_selector(3, 240).select_batch(noon(), &mut repo, true).unwrap();
        assert_eq!(selection.batch.len(), 3);
        assert!(!selection.run_again_immediately);
    }

    #[test]
    fn regular_slots_wait_when_not_allowed() {
        let slots = vec![
            make_slot(1, "A", 2),
            make_slot(2, "B", 40).with_forced(noon() - chrono::Duration::minutes(1)),
        ];
        let mut repo = MemoryRepository::new(slots);
        let selection = make_selector(3, 240).select_batch(noon(), &mut repo, false).unwrap();
        assert_eq!(selection.batch.ids(), vec![2]);
        assert!(selection.missed.is_empty());
        assert_eq!(repo.get(1).unwrap().status, SlotStatus::Loaded);
    }

    #[test]
    fn stale_slots_are_reported_missed() {
        let mut stale_a = make_slot(1, "A", 20);
        stale_a.file = "ad_x.mp3".into();
        let mut stale_b = make_slot(2, "A", 50);
        stale_b.file = "ad_x.mp3".into();
        let slots = vec![
            stale_a,
            stale_b,
            make_slot(3, "B", 16),
            make_slot(4, "C", 5),
            make_slot(5, "D", -5),
        ];
        let mut repo = MemoryRepository::new(slots);
        let selection = make_selector(3, 240).select_batch(noon(), &mut repo, true).unwrap();
        assert_eq!(selection.batch.ids(), vec![4]);
        let mut missed = selection.missed.clone();
        missed.sort();
        assert_eq!(missed, vec![1, 2, 3]);
        assert_eq!(selection.missed_summary.len(), 2);
        let grouped = selection.missed_summary.iter().find(|m| m.file == "ad_x.mp3").unwrap();
        assert_eq!(grouped.count, 2);
        assert_eq!(grouped.first, noon() - chrono::Duration::minutes(50));
        assert_eq!(grouped.last, noon() - chrono::Duration::minutes(20));
    }

    #[test]
    fn unknown_prefix_is_skipped() {
        let mut bad = make_slot(1, "A", 1);
        bad.file = "zz_bad.mp3".into();
        let mut repo = MemoryRepository::new(vec![bad, make_slot(2, "B", 1)]);
        let selection = make_selector(3, 240).select_batch(noon(), &mut repo, true).unwrap();
        assert_eq!(selection.batch.ids(), vec![2]);
        assert_eq!(repo.get(1).unwrap().status, SlotStatus::Loaded);
    }

    #[test]
    fn repository_errors_propagate() {
        let mut repo = MemoryRepository::new(vec![make_slot(1, "A", 1)]);
        repo.fail_next(1);
        let err = make_selector(3, 240).select_batch(noon(), &mut repo, true).unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(repo.get(1).unwrap().status, SlotStatus::Loaded);
    }

    #[test]
    fn selector_rejects_oversized_batches() {
        let config = BroadcastConfig {
            max_per_batch: 11,
            ..BroadcastConfig::default()
        };
        assert!(matches!(AnnouncementSelector::new(&config), Err(Error::Config(_))));
    }
}

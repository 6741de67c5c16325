/// Per-schedule fire guard
///
/// Enforces at most one concurrent execution per schedule and coalesces missed
/// ticks: several ticks missed since the last fire produce a single catch-up
/// run, unless the latest of them is older than the misfire grace window.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Ticks counted per fire; anything beyond is still coalesced into one run
const MAX_COUNTED_TICKS: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The previous fire of this schedule is still executing
    Overlap,
    /// The latest due tick fell outside the grace window
    Misfire { due: DateTime<Utc> },
}

#[derive(Debug)]
struct GuardState {
    schedule: cron::Schedule,
    running: bool,
    last_fire: Option<DateTime<Utc>>,
}

/// Outlives cron job replacements of the same schedule
#[derive(Debug)]
pub struct FireGuard {
    grace: ChronoDuration,
    tolerance: ChronoDuration,
    state: Mutex<GuardState>,
}

/// Held for the duration of one execution
#[derive(Debug)]
pub struct FirePermit {
    guard: Arc<FireGuard>,
    /// Ticks folded into this run besides the one being served
    pub missed: usize,
    pub due: DateTime<Utc>,
}

impl Drop for FirePermit {
    fn drop(&mut self) {
        self.guard.lock().running = false;
    }
}

impl FireGuard {
    pub fn new(schedule: cron::Schedule, grace: Duration) -> Self {
        Self {
            grace: ChronoDuration::from_std(grace).unwrap_or_else(|_| ChronoDuration::seconds(300)),
            tolerance: ChronoDuration::seconds(1),
            state: Mutex::new(GuardState {
                schedule,
                running: false,
                last_fire: None,
            }),
        }
    }

    /// Swap the cron schedule, keeping the running flag and last fire
    pub fn reschedule(&self, schedule: cron::Schedule) {
        self.lock().schedule = schedule;
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub fn last_fire(&self) -> Option<DateTime<Utc>> {
        self.lock().last_fire
    }

    /// Claim the right to execute a fire arriving at `now`
    pub fn try_begin(self: &Arc<Self>, now: DateTime<Utc>) -> Result<FirePermit, SkipReason> {
        let mut state = self.lock();
        if state.running {
            return Err(SkipReason::Overlap);
        }

        let (due, missed) = match state.last_fire {
            None => (now, 0),
            Some(last) => {
                let horizon = now + self.tolerance;
                let mut ticks = 0usize;
                let mut latest = None;
                for tick in state
                    .schedule
                    .after(&last)
                    .take_while(|tick| *tick <= horizon)
                    .take(MAX_COUNTED_TICKS)
                {
                    ticks += 1;
                    latest = Some(tick);
                }
                (latest.unwrap_or(now), ticks.saturating_sub(1))
            }
        };

        if now - due > self.grace {
            state.last_fire = Some(now);
            return Err(SkipReason::Misfire { due });
        }

        state.running = true;
        state.last_fire = Some(now);

        Ok(FirePermit {
            guard: Arc::clone(self),
            missed,
            due,
        })
    }

    fn lock(&self) -> MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::str::FromStr;

    fn guard(expression: &str, grace_secs: u64) -> Arc<FireGuard> {
        let schedule = cron::Schedule::from_str(expression).unwrap();
        Arc::new(FireGuard::new(schedule, Duration::from_secs(grace_secs)))
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap()
    }

    #[test]
    fn overlapping_fire_is_skipped() {
        let guard = guard("0 * * * * *", 300);
        let permit = guard.try_begin(at(10, 0, 0)).unwrap();
        assert!(guard.is_running());

        assert_eq!(guard.try_begin(at(10, 1, 0)).unwrap_err(), SkipReason::Overlap);

        drop(permit);
        assert!(!guard.is_running());
        assert!(guard.try_begin(at(10, 1, 0)).is_ok());
    }

    #[test]
    fn missed_ticks_coalesce_into_one_run() {
        let guard = guard("0 * * * * *", 300);
        drop(guard.try_begin(at(10, 0, 0)).unwrap());

        let permit = guard.try_begin(at(10, 4, 0)).unwrap();
        assert_eq!(permit.missed, 3);
        assert_eq!(permit.due, at(10, 4, 0));
    }

    #[test]
    fn stale_fire_beyond_grace_is_a_misfire() {
        let guard = guard("0 0 * * * *", 300);
        drop(guard.try_begin(at(9, 0, 0)).unwrap());

        let skipped = guard.try_begin(at(10, 6, 0)).unwrap_err();
        assert_eq!(skipped, SkipReason::Misfire { due: at(10, 0, 0) });
        assert!(!guard.is_running());
        assert_eq!(guard.last_fire(), Some(at(10, 6, 0)));
    }

    #[test]
    fn rescheduling_keeps_an_in_flight_run_exclusive() {
        let guard = guard("0 0 * * * *", 300);
        let permit = guard.try_begin(at(10, 0, 0)).unwrap();

        guard.reschedule(cron::Schedule::from_str("0 * * * * *").unwrap());
        assert!(guard.is_running());
        assert_eq!(guard.try_begin(at(10, 1, 0)).unwrap_err(), SkipReason::Overlap);

        drop(permit);
        // The 10:01 tick was skipped while the earlier run held the guard.
        let permit = guard.try_begin(at(10, 2, 0)).unwrap();
        assert_eq!(permit.missed, 1);
        assert_eq!(permit.due, at(10, 2, 0));
    }

    #[test]
    fn late_fire_within_grace_still_runs() {
        let guard = guard("0 0 * * * *", 300);
        drop(guard.try_begin(at(9, 0, 0)).unwrap());

        let permit = guard.try_begin(at(10, 4, 59)).unwrap();
        assert_eq!(permit.missed, 0);
        assert_eq!(permit.due, at(10, 0, 0));
    }
}

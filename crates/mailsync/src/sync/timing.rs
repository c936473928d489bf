//! Scheduling arithmetic
//!
//! Pure functions that can be tested without threads or clocks: every
//! function takes `now` explicitly.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::SchedulerConfig;
use crate::models::{Mailbox, SyncInterval};

/// Time from `now` until `at`, or `None` if `at` has arrived
pub fn time_until(now: DateTime<Utc>, at: DateTime<Utc>) -> Option<Duration> {
    (at - now).to_std().ok().filter(|d| !d.is_zero())
}

/// `now + delay`, saturating instead of overflowing
pub fn add_duration(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Running minimum of how long the loop may sleep
///
/// Starts at the heartbeat and only ever shrinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitBound(Duration);

impl WaitBound {
    pub fn new(heartbeat: Duration) -> Self {
        Self(heartbeat)
    }

    /// Lower the bound to `wait` if it is sooner
    pub fn tighten(&mut self, wait: Duration) {
        if wait < self.0 {
            self.0 = wait;
        }
    }

    pub fn get(&self) -> Duration {
        self.0
    }
}

/// Whether a fixed-interval mailbox should start now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalDue {
    /// Due (or overdue): start a scheduled sync
    Due,
    /// Not due yet; check again after this long
    Wait(Duration),
    /// Not an interval mailbox, or the interval is out of range
    NotScheduled,
}

/// Evaluate a mailbox's polling interval at `now`
///
/// Intervals above `max_interval_minutes` are ignored. A mailbox that has
/// never synced is due immediately.
pub fn interval_due(mailbox: &Mailbox, now: DateTime<Utc>, max_interval_minutes: u32) -> IntervalDue {
    match mailbox.interval {
        SyncInterval::Minutes(n) if n > 0 && n <= max_interval_minutes => {
            match mailbox.next_due() {
                Some(due) => match time_until(now, due) {
                    Some(wait) => IntervalDue::Wait(wait),
                    None => IntervalDue::Due,
                },
                None => IntervalDue::NotScheduled,
            }
        }
        _ => IntervalDue::NotScheduled,
    }
}

/// Status of an out-of-band wake request on a running worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestWait {
    /// The request time has arrived: alert the worker
    Due,
    /// Wake again after this long (already clamped to the minimum)
    Wait(Duration),
    /// Further away than the maximum; ignored
    TooFar(Duration),
}

/// Evaluate a worker's pending request time at `now`
pub fn request_wait(
    request_time: DateTime<Utc>,
    now: DateTime<Utc>,
    config: &SchedulerConfig,
) -> RequestWait {
    match time_until(now, request_time) {
        None => RequestWait::Due,
        Some(wait) if wait < config.max_request_wait() => {
            RequestWait::Wait(wait.max(config.min_request_wait()))
        }
        Some(wait) => RequestWait::TooFar(wait),
    }
}

/// How the loop goes idle after an evaluation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SleepPlan {
    /// How long to block waiting for a kick
    pub sleep: Duration,
    /// Scheduler alarm to arm, if the sleep is long enough to need one
    pub alarm: Option<Duration>,
}

/// Turn a signed bound (milliseconds) into a sleep plan
///
/// A negative bound means something is already overdue and becomes a one
/// second sleep. Bounds above the alarm threshold arm an alarm at
/// `bound + slack` so the host can let the device sleep.
pub fn plan_sleep(bound_ms: i64, config: &SchedulerConfig) -> SleepPlan {
    let sleep = if bound_ms < 0 {
        Duration::from_secs(1)
    } else {
        Duration::from_millis(bound_ms as u64)
    };
    let alarm = (sleep > config.alarm_threshold()).then(|| sleep + config.alarm_slack());
    SleepPlan { sleep, alarm }
}

/// Next backoff hold after another transient failure
pub fn next_hold_delay(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AccountId, MailboxId, MailboxType};
    use chrono::Duration as ChronoDuration;

    fn interval_mailbox(minutes: u32) -> Mailbox {
        Mailbox::new(MailboxId::new(1), AccountId::new(1), MailboxType::Inbox, "Inbox")
            .with_interval(SyncInterval::Minutes(minutes))
    }

    #[test]
    fn test_time_until() {
        let now = Utc::now();
        assert_eq!(
            time_until(now, now + ChronoDuration::seconds(5)),
            Some(Duration::from_secs(5))
        );
        assert_eq!(time_until(now, now), None);
        assert_eq!(time_until(now, now - ChronoDuration::seconds(5)), None);
    }

    #[test]
    fn test_wait_bound_only_shrinks() {
        let mut bound = WaitBound::new(Duration::from_secs(900));
        bound.tighten(Duration::from_secs(300));
        bound.tighten(Duration::from_secs(600));
        bound.tighten(Duration::from_secs(5));
        bound.tighten(Duration::from_secs(90));
        assert_eq!(bound.get(), Duration::from_secs(5));
    }

    #[test]
    fn test_interval_due_overdue() {
        let now = Utc::now();
        let mailbox = interval_mailbox(30).with_last_sync(now - ChronoDuration::minutes(31));
        assert_eq!(interval_due(&mailbox, now, 1440), IntervalDue::Due);
    }

    #[test]
    fn test_interval_due_waits() {
        let now = Utc::now();
        let mailbox = interval_mailbox(30).with_last_sync(now - ChronoDuration::minutes(25));
        assert_eq!(
            interval_due(&mailbox, now, 1440),
            IntervalDue::Wait(Duration::from_secs(300))
        );
    }

    #[test]
    fn test_interval_never_synced_is_due() {
        assert_eq!(interval_due(&interval_mailbox(30), Utc::now(), 1440), IntervalDue::Due);
    }

    #[test]
    fn test_interval_above_one_day_ignored() {
        assert_eq!(
            interval_due(&interval_mailbox(1441), Utc::now(), 1440),
            IntervalDue::NotScheduled
        );
        let push = interval_mailbox(5).with_interval(SyncInterval::Push);
        assert_eq!(interval_due(&push, Utc::now(), 1440), IntervalDue::NotScheduled);
    }

    #[test]
    fn test_request_wait_clamps_to_minimum() {
        let config = SchedulerConfig::default();
        let now = Utc::now();
        assert_eq!(
            request_wait(now + ChronoDuration::milliseconds(10), now, &config),
            RequestWait::Wait(Duration::from_millis(250))
        );
        assert_eq!(
            request_wait(now + ChronoDuration::seconds(30), now, &config),
            RequestWait::Wait(Duration::from_secs(30))
        );
        assert_eq!(request_wait(now, now, &config), RequestWait::Due);
    }

    #[test]
    fn test_request_wait_too_far() {
        let config = SchedulerConfig::default();
        let now = Utc::now();
        assert!(matches!(
            request_wait(now + ChronoDuration::minutes(12), now, &config),
            RequestWait::TooFar(_)
        ));
    }

    #[test]
    fn test_plan_sleep() {
        let config = SchedulerConfig::default();

        let plan = plan_sleep(-500, &config);
        assert_eq!(plan.sleep, Duration::from_secs(1));
        assert_eq!(plan.alarm, None);

        let plan = plan_sleep(5_000, &config);
        assert_eq!(plan.sleep, Duration::from_secs(5));
        assert_eq!(plan.alarm, None);

        let plan = plan_sleep(60_000, &config);
        assert_eq!(plan.sleep, Duration::from_secs(60));
        assert_eq!(plan.alarm, Some(Duration::from_secs(63)));
    }

    #[test]
    fn test_next_hold_delay_caps() {
        let max = Duration::from_secs(240);
        assert_eq!(next_hold_delay(Duration::from_secs(15), max), Duration::from_secs(30));
        assert_eq!(next_hold_delay(Duration::from_secs(120), max), max);
        assert_eq!(next_hold_delay(max, max), max);
    }
}

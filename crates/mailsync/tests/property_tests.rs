//! Property-based tests for mailsync
//!
//! These tests verify invariants that must hold for all inputs:
//! - Backoff holds never shrink and never pass the ceiling
//! - Sleep plans stay positive and arm alarms only past the threshold
//! - Interval and wake-request math never schedules in the past
//!
//! Run with: cargo test --test property_tests

use proptest::prelude::*;

// ============================================================================
// BACKOFF TESTS
// ============================================================================

mod backoff_tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use mailsync::models::{AccountId, MailboxId};
    use mailsync::sync::{SyncErrorTable, next_hold_delay};
    use mailsync::{SchedulerConfig, SyncErrorReason};
    use std::time::Duration;

    proptest! {
        /// Invariant: repeated transient failures give a non-decreasing hold capped at the max
        #[test]
        fn hold_is_monotonic_and_capped(failures in 1usize..40, gap_secs in 0i64..600) {
            let config = SchedulerConfig::default();
            let mut table = SyncErrorTable::new(config.initial_hold_delay(), config.max_hold_delay());
            let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

            let mut previous = Duration::ZERO;
            for i in 0..failures {
                let now = start + ChronoDuration::seconds(gap_secs * i as i64);
                let error = table.record(
                    MailboxId::new(1),
                    AccountId::new(1),
                    SyncErrorReason::IoError,
                    false,
                    now,
                );
                prop_assert!(error.hold_delay >= previous);
                prop_assert!(error.hold_delay <= config.max_hold_delay());
                prop_assert!(!error.fatal);
                prop_assert_eq!(
                    error.hold_end_time,
                    Some(now + ChronoDuration::from_std(error.hold_delay).unwrap())
                );
                previous = error.hold_delay;
            }
        }

        /// Invariant: the n-th failure holds for min(initial * 2^(n-1), max)
        #[test]
        fn hold_doubles_from_initial(failures in 1u32..20) {
            let initial = Duration::from_secs(15);
            let max = Duration::from_secs(240);
            let mut table = SyncErrorTable::new(initial, max);
            let now = Utc::now();

            let mut hold = Duration::ZERO;
            for _ in 0..failures {
                hold = table
                    .record(MailboxId::new(1), AccountId::new(1), SyncErrorReason::IoError, false, now)
                    .hold_delay;
            }
            let expected = initial
                .checked_mul(1u32 << (failures - 1).min(16))
                .unwrap_or(max)
                .min(max);
            prop_assert_eq!(hold, expected);
        }

        /// Invariant: next_hold_delay never exceeds the ceiling nor shrinks below the input
        #[test]
        fn next_hold_bounded(current_ms in 0u64..10_000_000, max_ms in 1u64..10_000_000) {
            let current = Duration::from_millis(current_ms.min(max_ms));
            let max = Duration::from_millis(max_ms);
            let next = next_hold_delay(current, max);
            prop_assert!(next <= max);
            prop_assert!(next >= current);
        }

        /// Invariant: non-retryable reasons always leave a fatal entry
        #[test]
        fn permanent_reasons_are_fatal(reason_index in 0usize..4, fatal in any::<bool>()) {
            let reason = [
                SyncErrorReason::LoginFailure,
                SyncErrorReason::SecurityFailure,
                SyncErrorReason::AccessDenied,
                SyncErrorReason::InternalError,
            ][reason_index];
            let mut table = SyncErrorTable::new(Duration::from_secs(15), Duration::from_secs(240));
            let error = table.record(MailboxId::new(1), AccountId::new(1), reason, fatal, Utc::now());
            prop_assert!(error.fatal);
        }
    }
}

// ============================================================================
// TIMING TESTS
// ============================================================================

mod timing_tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use mailsync::SchedulerConfig;
    use mailsync::models::{AccountId, Mailbox, MailboxId, MailboxType, SyncInterval};
    use mailsync::sync::{IntervalDue, RequestWait, interval_due, plan_sleep, request_wait};
    use std::time::Duration;

    proptest! {
        /// Invariant: a sleep plan is never zero-length on negative bounds
        #[test]
        fn sleep_plan_positive(bound_ms in -1_000_000i64..10_000_000) {
            let config = SchedulerConfig::default();
            let plan = plan_sleep(bound_ms, &config);
            if bound_ms < 0 {
                prop_assert_eq!(plan.sleep, Duration::from_secs(1));
            } else {
                prop_assert_eq!(plan.sleep, Duration::from_millis(bound_ms as u64));
            }
        }

        /// Invariant: an alarm is armed exactly when the sleep passes the threshold
        #[test]
        fn alarm_only_past_threshold(bound_ms in 0i64..10_000_000) {
            let config = SchedulerConfig::default();
            let plan = plan_sleep(bound_ms, &config);
            if plan.sleep > config.alarm_threshold() {
                prop_assert_eq!(plan.alarm, Some(plan.sleep + config.alarm_slack()));
            } else {
                prop_assert_eq!(plan.alarm, None);
            }
        }

        /// Invariant: an interval mailbox never waits longer than its interval
        #[test]
        fn interval_wait_within_interval(minutes in 1u32..1440, ago_secs in 0i64..200_000) {
            let now = Utc::now();
            let mailbox = Mailbox::new(MailboxId::new(1), AccountId::new(1), MailboxType::Other, "Box")
                .with_interval(SyncInterval::Minutes(minutes))
                .with_last_sync(now - ChronoDuration::seconds(ago_secs));

            match interval_due(&mailbox, now, 1440) {
                IntervalDue::Due => prop_assert!(ago_secs >= i64::from(minutes) * 60),
                IntervalDue::Wait(wait) => {
                    prop_assert!(wait <= Duration::from_secs(u64::from(minutes) * 60));
                    prop_assert!(ago_secs < i64::from(minutes) * 60);
                }
                IntervalDue::NotScheduled => prop_assert!(false, "interval mailbox not scheduled"),
            }
        }

        /// Invariant: a pending wake waits at least the minimum and is ignored past the maximum
        #[test]
        fn request_wait_clamped(offset_ms in -60_000i64..2_000_000) {
            let config = SchedulerConfig::default();
            let now = Utc::now();
            let at = now + ChronoDuration::milliseconds(offset_ms);

            match request_wait(at, now, &config) {
                RequestWait::Due => prop_assert!(offset_ms <= 0),
                RequestWait::Wait(wait) => {
                    prop_assert!(wait >= config.min_request_wait());
                    prop_assert!(wait < config.max_request_wait());
                }
                RequestWait::TooFar(wait) => prop_assert!(wait >= config.max_request_wait()),
            }
        }
    }
}

// ============================================================================
// MODEL ENCODING TESTS
// ============================================================================

mod interval_tests {
    use super::*;
    use mailsync::models::SyncInterval;

    proptest! {
        /// Invariant: every raw integer decodes to something that encodes back consistently
        #[test]
        fn raw_decode_is_stable(raw in any::<i64>()) {
            let decoded = SyncInterval::from_raw(raw);
            prop_assert_eq!(SyncInterval::from_raw(decoded.to_raw()), decoded);
        }
    }
}

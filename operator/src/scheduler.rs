use crate::util::Error;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cron::Schedule;
use drsync_types::RetryPolicy;
use k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, jiff::Timestamp};
use std::str::FromStr;
use std::time::Duration;

/// Parsed form of a CRD RetryPolicy with its duration strings resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl BackoffPolicy {
    pub fn from_retry(retry: &RetryPolicy) -> Result<Self, Error> {
        Ok(Self {
            max_retries: retry.max_retries,
            initial_delay: crate::util::parse_spec_duration(&retry.initial_delay)?,
            max_delay: crate::util::parse_spec_duration(&retry.max_delay)?,
        })
    }
}

/// `min(maxDelay, initialDelay × 2^consecutiveFailures)`, without jitter.
pub fn backoff_delay(policy: &BackoffPolicy, consecutive_failures: u32) -> Duration {
    let initial_ms = policy.initial_delay.as_millis() as u64;
    let max_ms = policy.max_delay.as_millis() as u64;
    let pow = if consecutive_failures >= 63 {
        u64::MAX
    } else {
        1u64 << consecutive_failures
    };
    Duration::from_millis(initial_ms.saturating_mul(pow).min(max_ms))
}

/// Backoff with uniform ±20% jitter.
pub fn backoff_delay_jittered(policy: &BackoffPolicy, consecutive_failures: u32) -> Duration {
    let base_ms = backoff_delay(policy, consecutive_failures).as_millis() as f64;
    let factor = rand::random_range(0.8..=1.2);
    Duration::from_millis((base_ms * factor) as u64)
}

/// Normalizes the 5-field cron form operators write into the 6-field form
/// the parser wants (a fixed seconds column is prepended).
fn normalize_cron(expr: &str) -> String {
    let fields = expr.split_whitespace().count();
    if fields == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

pub fn parse_schedule(expr: &str) -> Result<Schedule, Error> {
    Ok(Schedule::from_str(&normalize_cron(expr))?)
}

/// Next tick of the cron schedule strictly after `after`.
pub fn next_cron_tick(expr: &str, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, Error> {
    let schedule = parse_schedule(expr)?;
    Ok(schedule.after(&after).next())
}

/// The next attempt time after a failure: backoff target vs. the
/// schedule's next natural tick, whichever is later. Backoff only ever
/// delays the schedule, never fires sooner than it.
pub fn next_attempt(
    schedule: Option<&str>,
    now: DateTime<Utc>,
    policy: &BackoffPolicy,
    consecutive_failures: u32,
) -> Result<DateTime<Utc>, Error> {
    let delay = backoff_delay_jittered(policy, consecutive_failures);
    let backoff_target = now + ChronoDuration::from_std(delay).unwrap_or(ChronoDuration::zero());
    match schedule {
        Some(expr) => {
            let tick = next_cron_tick(expr, now)?;
            Ok(match tick {
                Some(tick) if tick > backoff_target => tick,
                _ => backoff_target,
            })
        }
        None => Ok(backoff_target),
    }
}

/// Bridges the scheduler's chrono math into the Time type status fields
/// carry.
pub fn to_k8s_time(at: DateTime<Utc>) -> Time {
    Time(Timestamp::from_second(at.timestamp()).unwrap_or_else(|_| Timestamp::now()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn policy(initial: &str, max: &str) -> BackoffPolicy {
        BackoffPolicy::from_retry(&RetryPolicy {
            max_retries: 5,
            initial_delay: initial.to_string(),
            max_delay: max.to_string(),
        })
        .unwrap()
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy("30s", "10m");
        assert_eq!(backoff_delay(&p, 0), Duration::from_secs(30));
        assert_eq!(backoff_delay(&p, 1), Duration::from_secs(60));
        assert_eq!(backoff_delay(&p, 3), Duration::from_secs(240));
        assert_eq!(backoff_delay(&p, 5), Duration::from_secs(600));
        assert_eq!(backoff_delay(&p, 40), Duration::from_secs(600));
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        let p = policy("30s", "10m");
        for _ in 0..200 {
            let d = backoff_delay_jittered(&p, 3).as_secs_f64();
            assert!((192.0..=288.0).contains(&d), "jittered delay {d} out of band");
        }
    }

    #[test]
    fn five_field_cron_is_accepted() {
        let next = next_cron_tick(
            "*/5 * * * *",
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 1, 0).unwrap(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 1, 12, 5, 0).unwrap());
    }

    #[test]
    fn malformed_cron_is_rejected() {
        assert!(parse_schedule("every five minutes").is_err());
    }

    #[test]
    fn backoff_never_beats_the_schedule() {
        // Three failures, initialDelay=30s → 240s ± 20% (192..288s), all
        // before the next 5-minute tick at 300s; the tick must win.
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 1).unwrap();
        let p = policy("30s", "10m");
        for _ in 0..50 {
            let at = next_attempt(Some("*/5 * * * *"), now, &p, 3).unwrap();
            assert_eq!(at, Utc.with_ymd_and_hms(2026, 3, 1, 12, 5, 0).unwrap());
        }
    }

    #[test]
    fn long_backoff_delays_past_the_schedule() {
        // Capped backoff of 10m lands after the 5-minute tick; backoff wins.
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 1).unwrap();
        let p = policy("30s", "10m");
        for _ in 0..50 {
            let at = next_attempt(Some("*/5 * * * *"), now, &p, 6).unwrap();
            let delta = (at - now).num_seconds();
            assert!((480..=720).contains(&delta), "attempt offset {delta}s");
            assert!(at > Utc.with_ymd_and_hms(2026, 3, 1, 12, 5, 0).unwrap());
        }
    }

    #[test]
    fn no_schedule_means_pure_backoff() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let p = policy("30s", "10m");
        let at = next_attempt(None, now, &p, 0).unwrap();
        let delta = (at - now).num_milliseconds();
        assert!((24_000..=36_000).contains(&delta));
    }
}

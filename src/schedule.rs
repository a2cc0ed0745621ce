//! Cron schedule utilities.
//!
//! Accepts standard 5-field Unix cron expressions (minute, hour,
//! day-of-month, month, day-of-week) and converts them to the 6-field
//! format the `cron` crate expects. Iteration happens in the schedule's
//! IANA timezone, so daylight-saving transitions follow the zone rules:
//! times in a spring-forward gap simply do not occur.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::str::FromStr;
use thiserror::Error;

use crate::run_state::CatchupPolicy;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid cron expression '{expr}': {message}")]
    CronInvalid { expr: String, message: String },

    #[error("invalid IANA timezone '{0}'")]
    TzInvalid(String),
}

/// Convert a 5-field Unix cron expression to the 6-field form.
///
/// The `cron` crate requires a seconds field; prepending "0" fires at
/// second 0 of each match. 6-field input passes through unchanged.
fn normalize_cron_expr(cron_expr: &str) -> String {
    let fields: Vec<&str> = cron_expr.split_whitespace().collect();
    if fields.len() == 5 {
        format!("0 {cron_expr}")
    } else {
        cron_expr.to_string()
    }
}

fn parse_cron(cron_expr: &str) -> Result<CronSchedule, ScheduleError> {
    CronSchedule::from_str(&normalize_cron_expr(cron_expr)).map_err(|e| {
        ScheduleError::CronInvalid {
            expr: cron_expr.to_string(),
            message: e.to_string(),
        }
    })
}

/// Validate a cron expression without computing fire times.
pub fn validate_cron(cron_expr: &str) -> Result<(), ScheduleError> {
    parse_cron(cron_expr).map(|_| ())
}

/// Parse an IANA timezone name.
pub fn parse_timezone(timezone: &str) -> Result<Tz, ScheduleError> {
    timezone
        .parse::<Tz>()
        .map_err(|_| ScheduleError::TzInvalid(timezone.to_string()))
}

/// First fire time strictly after `after`, in UTC.
pub fn next_fire_after(
    cron_expr: &str,
    timezone: &str,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    let schedule = parse_cron(cron_expr)?;
    let tz = parse_timezone(timezone)?;
    Ok(schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|t| t.with_timezone(&Utc)))
}

/// The next `count` fire times strictly after `after`, in UTC.
pub fn preview_fire_times(
    cron_expr: &str,
    timezone: &str,
    after: DateTime<Utc>,
    count: usize,
) -> Result<Vec<DateTime<Utc>>, ScheduleError> {
    let schedule = parse_cron(cron_expr)?;
    let tz = parse_timezone(timezone)?;
    Ok(schedule
        .after(&after.with_timezone(&tz))
        .take(count)
        .map(|t| t.with_timezone(&Utc))
        .collect())
}

/// Enumerate fire times in `[next_run_at, now + lookahead]` and apply the
/// catchup policy.
///
/// The raw sequence is the prefix of the cron iterator starting at the
/// first time at or after `next_run_at`. Policies then transform it:
/// `none` drops times strictly before `now`; `fire_immediately` keeps
/// everything; `spread` respaces the late times uniformly across the
/// lookahead window, leaving future times where they are.
pub fn enumerate_due_times(
    cron_expr: &str,
    timezone: &str,
    next_run_at: DateTime<Utc>,
    now: DateTime<Utc>,
    lookahead_ms: u64,
    catchup_policy: CatchupPolicy,
) -> Result<Vec<DateTime<Utc>>, ScheduleError> {
    let schedule = parse_cron(cron_expr)?;
    let tz = parse_timezone(timezone)?;
    let horizon = now + Duration::milliseconds(lookahead_ms as i64);

    // `after` is exclusive; back up one second so a fire time exactly at
    // next_run_at is included.
    let start = (next_run_at - Duration::seconds(1)).with_timezone(&tz);
    let times: Vec<DateTime<Utc>> = schedule
        .after(&start)
        .map(|t| t.with_timezone(&Utc))
        .take_while(|t| *t <= horizon)
        .collect();

    Ok(match catchup_policy {
        CatchupPolicy::None => times.into_iter().filter(|t| *t >= now).collect(),
        CatchupPolicy::FireImmediately => times,
        CatchupPolicy::Spread => spread_catchup_times(times, now, horizon),
    })
}

/// Respace late fire times uniformly across `(now, horizon)`, keeping them
/// monotonically increasing and ahead of any untouched future times.
fn spread_catchup_times(
    times: Vec<DateTime<Utc>>,
    now: DateTime<Utc>,
    horizon: DateTime<Utc>,
) -> Vec<DateTime<Utc>> {
    let (late, future): (Vec<_>, Vec<_>) = times.into_iter().partition(|t| *t < now);
    if late.is_empty() {
        return future;
    }
    let window = horizon - now;
    if window <= Duration::zero() {
        return future;
    }
    let step = window / (late.len() as i32 + 1);
    let mut spread: Vec<DateTime<Utc>> = (1..=late.len() as i32).map(|k| now + step * k).collect();
    spread.extend(future);
    spread
}

/// Idempotency key for one planned schedule emission:
/// `sha256(schedule_id ":" epoch_seconds(run_at))`.
pub fn schedule_idempotency_key(schedule_id: &str, run_at: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(schedule_id.as_bytes());
    hasher.update(b":");
    hasher.update(run_at.timestamp().to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Offset a fire time by up to ±`jitter_ms`.
pub fn apply_jitter<R: Rng>(run_at: DateTime<Utc>, jitter_ms: u64, rng: &mut R) -> DateTime<Utc> {
    if jitter_ms == 0 {
        return run_at;
    }
    let bound = jitter_ms as i64;
    let offset = rng.random_range(-bound..=bound);
    run_at + Duration::milliseconds(offset)
}

//! Bounded readiness polling.
//!
//! Every wait in a provisioning run goes through [`await_value`] or [`await_ready`]: a
//! side-effect free check is evaluated up to `max_attempts` times with a fixed `interval`
//! between failed attempts. Nothing is retried once the schedule is exhausted.

use crate::{Error, TimedOut};
use std::{fmt, future::Future, str::FromStr, time::Duration};
use tokio::time;
use tracing::{debug, info};

/// How many times to evaluate a readiness check and how long to wait between attempts.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Schedule {
    pub max_attempts: u32,
    pub interval: Duration,
}

// === impl Schedule ===

impl Schedule {
    pub const fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// The longest a poll on this schedule can sleep.
    pub fn budget(&self) -> Duration {
        self.interval * self.max_attempts.saturating_sub(1)
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.max_attempts, DisplayDuration(self.interval))
    }
}

/// Parses `<attempts>x<interval>`, e.g. `30x5s`.
impl FromStr for Schedule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const EXPECTED: &str = "<attempts>x<interval>, e.g. 30x5s";
        let (attempts, interval) = s
            .trim()
            .split_once('x')
            .ok_or_else(|| Error::invalid("poll schedule", s, EXPECTED))?;
        let max_attempts = attempts
            .parse::<u32>()
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| Error::invalid("poll schedule", s, EXPECTED))?;
        let interval = parse_duration(interval)?;
        Ok(Self::new(max_attempts, interval))
    }
}

/// Parses a duration such as `500ms`, `10s`, `2m`, `1h`, or `1d`. A bare `0` is accepted.
pub fn parse_duration(s: &str) -> Result<Duration, Error> {
    const UNITS: &str = "a number followed by one of 'ms', 's', 'm', 'h', or 'd'";

    let s = s.trim();
    let offset = s
        .rfind(|c: char| c.is_ascii_digit())
        .ok_or_else(|| Error::invalid("duration", s, UNITS))?;
    let (magnitude, unit) = s.split_at(offset + 1);
    let magnitude = magnitude
        .parse::<u64>()
        .map_err(|_| Error::invalid("duration", s, UNITS))?;

    let mul = match unit {
        "" if magnitude == 0 => 0,
        "ms" => 1,
        "s" => 1000,
        "m" => 1000 * 60,
        "h" => 1000 * 60 * 60,
        "d" => 1000 * 60 * 60 * 24,
        _ => return Err(Error::invalid("duration", s, UNITS)),
    };

    let ms = magnitude
        .checked_mul(mul)
        .ok_or_else(|| Error::invalid("duration", s, "a value that fits in milliseconds"))?;
    Ok(Duration::from_millis(ms))
}

struct DisplayDuration(Duration);

impl fmt::Display for DisplayDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms = self.0.as_millis();
        if ms % 1000 == 0 {
            write!(f, "{}s", ms / 1000)
        } else {
            write!(f, "{ms}ms")
        }
    }
}

/// Polls `check` until it yields a value.
///
/// `check` is called at most `schedule.max_attempts` times. Errors returned by the check
/// count as "not ready yet". The poller sleeps `schedule.interval` after each failed
/// attempt except the last, so exhaustion is reported as soon as the final check fails.
pub async fn await_value<T, F, Fut>(
    what: impl fmt::Display,
    schedule: Schedule,
    mut check: F,
) -> Result<T, TimedOut>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = crate::Result<Option<T>>>,
{
    let start = time::Instant::now();
    for attempt in 1..=schedule.max_attempts {
        match check().await {
            Ok(Some(value)) => {
                debug!(%what, attempt, elapsed = ?start.elapsed(), "ready");
                return Ok(value);
            }
            Ok(None) => {
                debug!(%what, attempt, max_attempts = schedule.max_attempts, "not ready");
            }
            Err(error) => {
                debug!(%what, attempt, %error, "readiness check failed");
            }
        }
        if attempt < schedule.max_attempts {
            time::sleep(schedule.interval).await;
        }
    }

    Err(TimedOut {
        what: what.to_string(),
        attempts: schedule.max_attempts,
        waited: start.elapsed(),
    })
}

/// Polls a boolean readiness predicate. See [`await_value`].
pub async fn await_ready<F, Fut>(
    what: impl fmt::Display,
    schedule: Schedule,
    mut check: F,
) -> Result<(), TimedOut>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = crate::Result<bool>>,
{
    await_value(what, schedule, || {
        let ready = check();
        async move { ready.await.map(|ready| ready.then_some(())) }
    })
    .await
}

/// Sleeps for a fixed grace period that lets an external system converge.
pub async fn settle(what: &str, delay: Duration) {
    if delay.is_zero() {
        return;
    }
    info!(%what, ?delay, "waiting to settle");
    time::sleep(delay).await;
}

//! Start-time arithmetic for periodic jobs.

use std::time::Duration;

use chrono::{Local, NaiveDateTime, NaiveTime, TimeDelta, Timelike};

/// Delays up to this long are aligned to the top of the hour; longer
/// ones to midnight.
const HOUR: Duration = Duration::from_secs(3600);

/// Minimum distance between `now` and the first aligned run.
const MIN_LEAD: TimeDelta = TimeDelta::minutes(1);

/// Time from `now` until the next run aligned to a wall-clock boundary.
///
/// Runs start at the top of the current hour (`delay` <= 1 h) or at
/// midnight (otherwise) and repeat every `delay`; the first one that is
/// at least a minute after `now` is chosen.
pub fn get_next_time(delay: Duration, now: NaiveDateTime) -> Duration {
    if delay.is_zero() {
        return Duration::ZERO;
    }

    let midnight = now.date().and_time(NaiveTime::MIN);
    let start = if delay <= HOUR {
        midnight + TimeDelta::hours(i64::from(now.hour()))
    } else {
        midnight
    };

    let since_start = (now - start).to_std().unwrap_or_default();
    let until_threshold = (now + MIN_LEAD - start).to_std().unwrap_or_default();

    let step = delay.as_nanos();
    let steps = until_threshold.as_nanos().div_ceil(step);
    let next = steps * step - since_start.as_nanos();
    Duration::from_nanos(u64::try_from(next).unwrap_or(u64::MAX))
}

/// Delay before the first run of a periodic job.
///
/// `fixed_start_time` wins over `immediate`; with neither, the first run
/// happens one `delay` from now.
pub fn get_start_interval(fixed_start_time: bool, immediate: bool, delay: Duration) -> Duration {
    if fixed_start_time {
        get_next_time(delay, Local::now().naive_local())
    } else if immediate {
        Duration::ZERO
    } else {
        delay
    }
}

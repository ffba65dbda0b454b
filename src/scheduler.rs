//! Daily sync trigger at a fixed wall-clock time.

use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, NaiveTime, Utc};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::service::{SyncService, TriggerOutcome};

/// First instant strictly after `now` whose local time in `offset` is `at`.
pub fn next_run_after(now: DateTime<Utc>, at: NaiveTime, offset: FixedOffset) -> DateTime<Utc> {
    let local_date = now.with_timezone(&offset).date_naive();
    let shift = ChronoDuration::seconds(i64::from(offset.local_minus_utc()));
    let mut next = (local_date.and_time(at) - shift).and_utc();
    while next <= now {
        next += ChronoDuration::days(1);
    }
    next
}

/// Spawn the daily loop. It only triggers; a cycle that is still running
/// when the time comes makes that day's trigger a no-op.
pub fn spawn_daily(service: SyncService, at: NaiveTime, offset: FixedOffset) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let now = Utc::now();
            let next = next_run_after(now, at, offset);
            info!(next = %next.with_timezone(&offset), "next scheduled sync");
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(wait).await;
            match service.trigger_sync() {
                TriggerOutcome::Accepted { run_id } => info!(%run_id, "scheduled sync started"),
                TriggerOutcome::AlreadyRunning => {
                    warn!("scheduled sync skipped; a cycle is already running")
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn dubai() -> FixedOffset {
        FixedOffset::east_opt(4 * 3600).unwrap()
    }

    fn midnight() -> NaiveTime {
        NaiveTime::from_hms_opt(0, 0, 0).unwrap()
    }

    #[test]
    fn next_local_midnight() {
        // 2024-05-01 10:00 UTC is 14:00 in UTC+4; next local midnight is 20:00 UTC.
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let next = next_run_after(now, midnight(), dubai());
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 1, 20, 0, 0).unwrap());
    }

    #[test]
    fn local_date_ahead_of_utc() {
        // 21:00 UTC is already 01:00 the next day locally.
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 21, 0, 0).unwrap();
        let next = next_run_after(now, midnight(), dubai());
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 2, 20, 0, 0).unwrap());
    }

    #[test]
    fn exact_match_moves_to_next_day() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 20, 0, 0).unwrap();
        let next = next_run_after(now, midnight(), dubai());
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 2, 20, 0, 0).unwrap());
    }

    #[test]
    fn utc_offset_zero() {
        let at = NaiveTime::from_hms_opt(6, 30, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 6, 0, 0).unwrap();
        let next = next_run_after(now, at, FixedOffset::east_opt(0).unwrap());
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 1, 6, 30, 0).unwrap());
    }
}

//! Charging-window search: given a deadline and a target battery percent,
//! pick a charging window that (ideally) avoids peak hours, trying four
//! strategies in order and accepting the first that succeeds.
//!
//! Built on `time_ext::Window`'s midnight-unwrap/disjointness/overlap
//! helpers, so the overlap and window-length arithmetic here stays
//! consistent with the off-peak reconciler's.

use chrono::{DateTime, Duration, Timelike, Utc};
use chrono_tz::Tz;

use crate::config::{Charging, Special};
use crate::time_ext::{self, Window};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    AvoidPeakStandardLead,
    AvoidPeakEarlier,
    MinimalCollision,
    Fallback,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChargingWindow {
    pub charging_start: DateTime<Utc>,
    pub charging_end: DateTime<Utc>,
    pub send_schedule_at: DateTime<Utc>,
    pub strategy: Strategy,
}

/// `h = ((target% - current%) / 100) * pack_kwh / charge_rate_kw`.
/// Returns `None` when `target% <= current%` (no plan needed).
pub fn required_hours(charging: &Charging, current_percent: u32, target_percent: u32) -> Option<f64> {
    if target_percent <= current_percent {
        return None;
    }
    let fraction = (target_percent - current_percent) as f64 / 100.0;
    Some(fraction * charging.battery_capacity_kwh / charging.charging_rate_kw)
}

fn peak_windows(special: &Special) -> Vec<Window> {
    special
        .peak_hours
        .iter()
        .map(|(start, end)| Window::new(time_ext::minutes_of_day(*start), time_ext::minutes_of_day(*end)))
        .collect()
}

fn floor_to_hour<Tz2: chrono::TimeZone>(dt: DateTime<Tz2>) -> DateTime<Tz2> {
    dt.with_minute(0).unwrap().with_second(0).unwrap().with_nanosecond(0).unwrap()
}

/// The window-of-day test: is `[start_local, start_local + duration)`
/// disjoint from every configured peak window?
fn disjoint_from_all_peaks(
    start_local: &DateTime<Tz>,
    duration_minutes: i64,
    peaks: &[Window],
) -> bool {
    let candidate = candidate_window(start_local, duration_minutes);
    peaks.iter().all(|p| candidate.disjoint_from(p))
}

fn total_peak_overlap_minutes(start_local: &DateTime<Tz>, duration_minutes: i64, peaks: &[Window]) -> i64 {
    let candidate = candidate_window(start_local, duration_minutes);
    peaks.iter().map(|p| candidate.overlap_minutes(p)).sum()
}

fn candidate_window(start_local: &DateTime<Tz>, duration_minutes: i64) -> Window {
    let start = time_ext::minutes_of_day(start_local.time());
    Window {
        start,
        end: start + duration_minutes as u32,
    }
}

fn try_accept(
    start_local: DateTime<Tz>,
    duration_minutes: i64,
    send_schedule_lead: Duration,
    now: DateTime<Utc>,
    strategy: Strategy,
) -> Option<ChargingWindow> {
    let charging_start = start_local.with_timezone(&Utc);
    let charging_end = charging_start + Duration::minutes(duration_minutes);
    let send_schedule_at = charging_start - send_schedule_lead;
    if send_schedule_at <= now {
        return None;
    }
    Some(ChargingWindow {
        charging_start,
        charging_end,
        send_schedule_at,
        strategy,
    })
}

/// Try strategies 1-4 in order, return the first that succeeds.
/// `deadline`/`now` are absolute instants; `tz` is the home timezone all
/// peak-window and floor-to-hour arithmetic happens in.
pub fn find_window(
    charging: &Charging,
    special: &Special,
    tz: Tz,
    now: DateTime<Utc>,
    deadline: DateTime<Utc>,
    current_percent: u32,
    target_percent: u32,
) -> Option<ChargingWindow> {
    let h = required_hours(charging, current_percent, target_percent)?;
    let duration_minutes = time_ext::hours_to_minutes(h);
    let deadline_local = deadline.with_timezone(&tz);
    let peaks = peak_windows(special);
    let max_lead = Duration::minutes(time_ext::hours_to_minutes(special.max_advance_hours));

    // Strategy 1: avoid-peak, standard lead.
    let s1_start = floor_to_hour(
        deadline_local - Duration::minutes(time_ext::hours_to_minutes(h + special.safety_buffer_hours)),
    );
    if disjoint_from_all_peaks(&s1_start, duration_minutes, &peaks) {
        if let Some(w) = try_accept(s1_start, duration_minutes, Duration::hours(2), now, Strategy::AvoidPeakStandardLead) {
            return Some(w);
        }
    }

    // Strategy 2: avoid-peak, earlier — shift back in 1h increments, plus
    // the "end at 06:00" and "previous evening 22:00" anchors.
    let mut candidates: Vec<DateTime<Tz>> = Vec::new();
    let mut k = 1i64;
    loop {
        let start = deadline_local - Duration::minutes(time_ext::hours_to_minutes(h + k as f64));
        if deadline_local - start > max_lead {
            break;
        }
        candidates.push(start);
        k += 1;
    }
    if let Some(morning_anchor) = anchor_ending_at(deadline_local, 6, 0, duration_minutes) {
        candidates.push(morning_anchor);
    }
    if let Some(evening_anchor) = anchor_starting_at(deadline_local, 22, 0) {
        candidates.push(evening_anchor);
    }
    for start in candidates {
        if deadline_local - start > max_lead {
            continue;
        }
        if disjoint_from_all_peaks(&start, duration_minutes, &peaks) {
            if let Some(w) = try_accept(start, duration_minutes, Duration::hours(2), now, Strategy::AvoidPeakEarlier) {
                return Some(w);
            }
        }
    }

    // Strategy 3: minimal collision among offsets {-3h..+1h} relative to
    // strategy 1's (floored) start, accepting the first whose overlap is
    // at most 50% of the required duration.
    for offset_h in [-3, -2, -1, 0, 1] {
        let start = s1_start + Duration::hours(offset_h);
        let overlap = total_peak_overlap_minutes(&start, duration_minutes, &peaks);
        if overlap * 2 <= duration_minutes {
            if let Some(w) = try_accept(start, duration_minutes, Duration::hours(2), now, Strategy::MinimalCollision) {
                return Some(w);
            }
        }
    }

    // Strategy 4: fallback, accepted unconditionally.
    let s4_start = deadline_local - Duration::minutes(time_ext::hours_to_minutes(h + 0.5));
    let charging_start = s4_start.with_timezone(&Utc);
    let charging_end = charging_start + Duration::minutes(duration_minutes);
    let send_schedule_at = charging_start - Duration::hours(1);
    tracing::warn!(
        ?charging_start,
        ?charging_end,
        "special-charging window search exhausted peak-avoidance strategies, using unconditional fallback"
    );
    Some(ChargingWindow {
        charging_start,
        charging_end,
        send_schedule_at,
        strategy: Strategy::Fallback,
    })
}

/// The window that ends exactly at `hour:minute` local time on (or just
/// before) the deadline's date.
fn anchor_ending_at(deadline_local: DateTime<Tz>, hour: u32, minute: u32, duration_minutes: i64) -> Option<DateTime<Tz>> {
    let mut end = deadline_local.date_naive().and_hms_opt(hour, minute, 0)?;
    if deadline_local.time() < chrono::NaiveTime::from_hms_opt(hour, minute, 0)? {
        end -= Duration::days(1);
    }
    use chrono::TimeZone;
    let end_local = tz_from(deadline_local).from_local_datetime(&end).single()?;
    Some(end_local - Duration::minutes(duration_minutes))
}

/// The window that starts exactly at `hour:minute` local time on the
/// evening before the deadline's date.
fn anchor_starting_at(deadline_local: DateTime<Tz>, hour: u32, minute: u32) -> Option<DateTime<Tz>> {
    let date = deadline_local.date_naive() - Duration::days(1);
    let naive = date.and_hms_opt(hour, minute, 0)?;
    use chrono::TimeZone;
    tz_from(deadline_local).from_local_datetime(&naive).single()
}

fn tz_from(dt: DateTime<Tz>) -> Tz {
    dt.timezone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tz() -> Tz {
        "America/Los_Angeles".parse().unwrap()
    }

    #[test]
    fn required_hours_for_85_percent_target_from_45_percent() {
        // target 85%, current 45% -> h ~= 2.73h.
        let charging = Charging {
            battery_capacity_kwh: 75.0,
            charging_rate_kw: 11.0,
            ..Charging::default()
        };
        let h = required_hours(&charging, 45, 85).unwrap();
        assert!((h - 2.7272).abs() < 0.01, "got {}", h);
    }

    #[test]
    fn required_hours_none_when_target_not_above_current() {
        let charging = Charging::default();
        assert!(required_hours(&charging, 80, 80).is_none());
        assert!(required_hours(&charging, 80, 70).is_none());
    }

    #[test]
    fn avoid_peak_standard_lead_end_to_end() {
        // deadline 2025-03-14 08:00 local, current 45%, target 85%.
        let tz = tz();
        let deadline = tz
            .with_ymd_and_hms(2025, 3, 14, 8, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        let now = deadline - Duration::hours(20);
        let charging = Charging::default();
        let special = Special::default();

        let window = find_window(&charging, &special, tz, now, deadline, 45, 85).unwrap();
        assert_eq!(window.strategy, Strategy::AvoidPeakStandardLead);

        let local_start = window.charging_start.with_timezone(&tz);
        assert_eq!((local_start.hour(), local_start.minute()), (3, 0));

        let local_send = window.send_schedule_at.with_timezone(&tz);
        assert_eq!((local_send.hour(), local_send.minute()), (1, 0));
    }

    #[test]
    fn fallback_is_always_accepted() {
        let tz = tz();
        // A deadline so close to `now` that strategies 1-3 can never
        // produce a strictly-future `send_schedule_at`.
        let deadline = Utc::now() + Duration::minutes(5);
        let now = Utc::now();
        let charging = Charging::default();
        let special = Special::default();

        let window = find_window(&charging, &special, tz, now, deadline, 10, 90).unwrap();
        assert_eq!(window.strategy, Strategy::Fallback);
    }
}

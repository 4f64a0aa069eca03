//! Minutes-of-day encoding and midnight-unwrap helpers.
//!
//! Off-peak schedules, special-charging windows and peak-hour guards are
//! all expressed in "minutes since local midnight", half-open on
//! `[start, end)`. A window that crosses midnight (`end < start`) is
//! unwrapped to `[start, end + 1440)` at exactly this layer so every other
//! piece of code can assume ranges never wrap.

use chrono::{Duration, NaiveTime, Timelike};

/// `[0, 1440)` minute-of-day, or `1440` meaning "next midnight".
pub type MinuteOfDay = u32;

pub const MINUTES_PER_DAY: u32 = 1440;

pub fn minutes_of_day(t: NaiveTime) -> MinuteOfDay {
    t.hour() * 60 + t.minute()
}

/// Inverse of [`minutes_of_day`] for `m in [0, 1440)`. Used only for
/// round-tripping through wire formats that speak `HH:MM`.
pub fn format_minutes(m: MinuteOfDay) -> String {
    format!("{:02}:{:02}", (m / 60) % 24, m % 60)
}

pub fn parse_minutes(s: &str) -> anyhow::Result<MinuteOfDay> {
    let t = NaiveTime::parse_from_str(s, "%H:%M")
        .map_err(|e| anyhow::anyhow!("invalid HH:MM time {:?}: {}", s, e))?;
    Ok(minutes_of_day(t))
}

/// A half-open window in minutes-since-midnight, unwrapped past 1440 if it
/// crosses midnight. Construct with [`Window::new`]; never build one by hand
/// elsewhere, so midnight-unwrap stays centralized in this module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Window {
    pub start: u32,
    pub end: u32,
}

impl Window {
    /// `start` and `end` are raw minutes-of-day as they'd appear on the
    /// vehicle's wire format (`end` may be `0..=1440`). If `end < start` the
    /// window is treated as crossing midnight and `end` is unwrapped to
    /// `start + (duration to midnight) + end`.
    pub fn new(start: MinuteOfDay, end: MinuteOfDay) -> Self {
        if end < start {
            Window {
                start,
                end: end + MINUTES_PER_DAY,
            }
        } else {
            Window { start, end }
        }
    }

    pub fn duration_minutes(&self) -> u32 {
        self.end - self.start
    }

    /// Whether this window crossed midnight before unwrapping (i.e. the
    /// original `end` field on the wire would read less than `start`).
    pub fn wraps(&self) -> bool {
        self.end > MINUTES_PER_DAY
    }

    /// The wire-format `end` value: `end mod 1440` if this window wraps,
    /// otherwise `end` unchanged (so `end = 1440` round-trips as-is).
    pub fn wire_end(&self) -> u32 {
        if self.wraps() {
            self.end % MINUTES_PER_DAY
        } else {
            self.end
        }
    }

    pub fn overlaps(&self, other: &Window) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_minute(&self, minute: MinuteOfDay) -> bool {
        self.start <= minute && minute < self.end
    }

    /// Total overlap in minutes with `other`, summed across the same
    /// ±1440 shifts `disjoint_from` checks. Used by the special-charging
    /// window search's "minimal collision" strategy to compare candidates
    /// by how much of the window a peak actually eats, not just whether
    /// it touches at all.
    pub fn overlap_minutes(&self, other: &Window) -> i64 {
        let mut total = 0i64;
        for shift in [-(MINUTES_PER_DAY as i64), 0, MINUTES_PER_DAY as i64] {
            let os = other.start as i64 + shift;
            let oe = other.end as i64 + shift;
            let lo = (self.start as i64).max(os);
            let hi = (self.end as i64).min(oe);
            if hi > lo {
                total += hi - lo;
            }
        }
        total
    }

    /// A window is disjoint from `other` iff they do not overlap, also
    /// checking the other window shifted by a full day in both directions
    /// (needed because an unwrapped window can extend past 1440 while
    /// `other` is given in its own local day).
    pub fn disjoint_from(&self, other: &Window) -> bool {
        let shifted_back = Window {
            start: other.start + MINUTES_PER_DAY,
            end: other.end + MINUTES_PER_DAY,
        };
        let shifted_fwd = if other.start >= MINUTES_PER_DAY {
            Window {
                start: other.start - MINUTES_PER_DAY,
                end: other.end - MINUTES_PER_DAY,
            }
        } else {
            *other
        };
        !self.overlaps(other) && !self.overlaps(&shifted_back) && !self.overlaps(&shifted_fwd)
    }
}

/// Whether `current_minute` (the vehicle's local time-of-day) falls inside
/// `window`, accounting for a window that wraps past midnight.
pub fn contains_now(window: Window, current_minute: MinuteOfDay) -> bool {
    window.contains_minute(current_minute) || window.contains_minute(current_minute + MINUTES_PER_DAY)
}

/// Round a (possibly fractional) number of hours to the nearest whole
/// minute, operating on minute-of-day integers throughout this crate
/// instead of `chrono::Duration`.
pub fn hours_to_minutes(hours: f64) -> i64 {
    (hours * 60.0).round() as i64
}

pub fn floor_to_hour(minute_of_day: i64) -> i64 {
    (minute_of_day.div_euclid(60)) * 60
}

pub fn duration_minutes(d: Duration) -> i64 {
    d.num_seconds() / 60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_minutes_of_day() {
        // minutes_of_day(parse(format(m))) = m for all m in [0, 1440).
        for m in 0..1440u32 {
            let s = format_minutes(m);
            let back = parse_minutes(&s).unwrap();
            assert_eq!(back, m, "round trip failed for {}", m);
        }
    }

    #[test]
    fn window_no_wrap() {
        let w = Window::new(540, 600);
        assert_eq!((w.start, w.end), (540, 600));
        assert!(!w.wraps());
        assert_eq!(w.wire_end(), 600);
    }

    #[test]
    fn window_wrap_is_unwrapped() {
        // Boundary case: start=1410 (23:30), end=30 (00:30).
        let w = Window::new(1410, 30);
        assert_eq!((w.start, w.end), (1410, 1470));
        assert!(w.wraps());
        assert_eq!(w.wire_end(), 30);
    }

    #[test]
    fn window_end_1440_is_next_midnight_not_a_wrap() {
        let w = Window::new(1439, 1440);
        assert_eq!((w.start, w.end), (1439, 1440));
        assert!(!w.wraps());
        assert_eq!(w.wire_end(), 1440);
    }

    #[test]
    fn overlap_basic() {
        let a = Window::new(720, 840);
        let b = Window::new(800, 900);
        let c = Window::new(900, 950);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn disjoint_from_handles_cross_midnight_peak_window() {
        // window [03:00, 05:43) must be disjoint from peak windows
        // 06:00-10:00 and 19:00-22:00.
        let candidate = Window::new(180, 343);
        let morning_peak = Window::new(360, 600);
        let evening_peak = Window::new(1140, 1320);
        assert!(candidate.disjoint_from(&morning_peak));
        assert!(candidate.disjoint_from(&evening_peak));
    }

    #[test]
    fn overlap_minutes_is_zero_when_disjoint() {
        let a = Window::new(180, 343);
        let peak = Window::new(360, 600);
        assert_eq!(a.overlap_minutes(&peak), 0);
    }

    #[test]
    fn overlap_minutes_counts_partial_overlap() {
        let a = Window::new(540, 660); // 09:00-11:00
        let peak = Window::new(360, 600); // 06:00-10:00
        assert_eq!(a.overlap_minutes(&peak), 60);
    }

    #[test]
    fn disjoint_from_catches_wrap_collision() {
        // A window that wraps past midnight must still collide with a peak
        // window expressed on the "next day" at its unwrapped position.
        let candidate = Window::new(1410, 90); // unwrapped [1410, 1530)
        let early_morning_peak = Window::new(60, 120); // 01:00-02:00, i.e. [1500,1560) shifted
        assert!(!candidate.disjoint_from(&early_morning_peak));
    }
}

//! Wire <-> domain conversion for `ChargeSchedule`.

use serde::{Deserialize, Serialize};

use crate::model::{ChargeSchedule, DaysOfWeek, Weekday};
use crate::time_ext::Window;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeScheduleWire {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<u32>,
    pub start_enabled: bool,
    pub end_enabled: bool,
    /// Bitmask: bit `i` <-> `Weekday` variant `i` (Sunday = bit 0).
    pub days_of_week: u8,
    pub latitude: f64,
    pub longitude: f64,
    pub one_time: bool,
}

fn bitmask_to_weekdays(mask: u8) -> DaysOfWeek {
    let days: Vec<Weekday> = Weekday::ALL
        .iter()
        .copied()
        .filter(|d| mask & (1 << d.bit()) != 0)
        .collect();
    DaysOfWeek::List(days)
}

impl ChargeScheduleWire {
    pub fn from_domain(s: &ChargeSchedule) -> Self {
        // A domain schedule may carry an unwrapped `end` past 1440 (a
        // window that crosses midnight); the wire format always
        // normalizes back to `end mod 1440`, with `1440` itself round-
        // tripping as "next midnight" rather than folding to 0.
        let end_time = match (s.start_minutes_of_day, s.end_minutes_of_day) {
            (Some(start), Some(end)) => Some(Window::new(start, end).wire_end()),
            (None, end) => end,
        };

        ChargeScheduleWire {
            id: s.id,
            enabled: s.enabled,
            start_time: s.start_minutes_of_day,
            end_time,
            start_enabled: s.start_enabled,
            end_enabled: s.end_enabled,
            days_of_week: s.days_of_week.to_bitmask(),
            latitude: s.lat,
            longitude: s.lon,
            one_time: s.one_time,
        }
    }

    pub fn to_domain(&self) -> ChargeSchedule {
        ChargeSchedule {
            id: self.id,
            enabled: self.enabled,
            start_minutes_of_day: self.start_time,
            end_minutes_of_day: self.end_time,
            start_enabled: self.start_enabled,
            end_enabled: self.end_enabled,
            days_of_week: bitmask_to_weekdays(self.days_of_week),
            lat: self.latitude,
            lon: self.longitude,
            one_time: self.one_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DaysOfWeek;

    #[test]
    fn round_trips_all_days() {
        let schedule = ChargeSchedule {
            id: None,
            enabled: true,
            start_minutes_of_day: Some(720),
            end_minutes_of_day: Some(840),
            start_enabled: true,
            end_enabled: true,
            days_of_week: DaysOfWeek::all(),
            lat: 37.0,
            lon: -122.0,
            one_time: false,
        };
        let wire = ChargeScheduleWire::from_domain(&schedule);
        assert_eq!(wire.days_of_week, 0b0111_1111);

        let back = wire.to_domain();
        assert_eq!(back.days_of_week.to_bitmask(), 0b0111_1111);
    }
}

//! Domain types: vehicle observations, last-known state, monitoring cases,
//! charge schedules, off-peak plans and special-charging sessions.
//!
//! Vendor-shaped wire structs stay in `vehicle::`; this module holds the
//! domain types the rest of the crate actually reasons about.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::time_ext::MinuteOfDay;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VehicleState {
    Online,
    Asleep,
    Offline,
}

/// A single reading of vehicle state, emitted by the gateway and passed
/// through the sampler to the decision logic.
///
/// When `state != Online`, no field beyond `vin`, `state`, `observed_at`
/// is populated or consumed by decision logic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehicleObservation {
    pub vin: String,
    pub state: VehicleState,
    #[serde(default)]
    pub battery_percent: Option<u32>,
    #[serde(default)]
    pub charging_state: Option<String>,
    #[serde(default)]
    pub conn_cable: Option<String>,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lon: Option<f64>,
    pub observed_at: DateTime<Utc>,
}

impl VehicleObservation {
    pub fn minimal(vin: impl Into<String>, state: VehicleState, observed_at: DateTime<Utc>) -> Self {
        VehicleObservation {
            vin: vin.into(),
            state,
            battery_percent: None,
            charging_state: None,
            conn_cable: None,
            lat: None,
            lon: None,
            observed_at,
        }
    }

    /// `at_home ≡ sqrt((lat−home_lat)² + (lon−home_lon)²) ≤ home_radius`.
    /// Returns `None` when location is unknown (no GPS fix).
    pub fn at_home(&self, home_lat: f64, home_lon: f64, home_radius: f64) -> Option<bool> {
        let (lat, lon) = (self.lat?, self.lon?);
        let dist = ((lat - home_lat).powi(2) + (lon - home_lon).powi(2)).sqrt();
        Some(dist <= home_radius)
    }

    /// `charging_ready ≡ charging_state ∈ {Charging, Complete} OR
    /// conn_cable ∉ {null, "", "Unknown", "<invalid>"}`.
    pub fn charging_ready(&self) -> bool {
        let state_ready = matches!(
            self.charging_state.as_deref(),
            Some("Charging") | Some("Complete")
        );
        let cable_connected = match self.conn_cable.as_deref() {
            None | Some("") | Some("Unknown") | Some("<invalid>") => false,
            Some(_) => true,
        };
        state_ready || cable_connected
    }
}

/// Keyed by VIN in the state store. Tracks the previous value of each
/// derived predicate so the condition evaluator can detect transitions
/// without re-deriving history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastKnownState {
    pub observation: VehicleObservation,
    /// `None` when location was unknown at the time of this observation.
    /// "Unknown while previously home" is folded into `true` by the
    /// condition evaluator, not here — deliberate, since GPS access is
    /// privacy-restricted while driving.
    pub at_home: Option<bool>,
    pub charging_ready: bool,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitoringCaseState {
    Idle,
    WaitingForOffline,
    VehicleAwoken,
}

/// At most one `MonitoringCase` exists per VIN at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringCase {
    pub case_id: String,
    pub vin: String,
    pub start_time: DateTime<Utc>,
    pub state: MonitoringCaseState,
    #[serde(default)]
    pub last_battery_percent: Option<u32>,
    #[serde(default)]
    pub last_check_time: Option<DateTime<Utc>>,
}

impl MonitoringCase {
    pub fn new_waiting(vin: impl Into<String>, now: DateTime<Utc>) -> Self {
        let vin = vin.into();
        MonitoringCase {
            case_id: format!("case_{}_{}", vin, now.format("%Y%m%d_%H%M%S")),
            vin,
            start_time: now,
            state: MonitoringCaseState::WaitingForOffline,
            last_battery_percent: None,
            last_check_time: Some(now),
        }
    }
}

/// Day-of-week selector for a `ChargeSchedule`, matching the vehicle's
/// `"All" | "Weekdays" | comma-list` representation and the wire bitmask
/// (bit i <-> weekday i, Sunday = 0).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DaysOfWeek {
    Label(String),
    List(Vec<Weekday>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Weekday {
    Sunday,
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
}

impl Weekday {
    pub const ALL: [Weekday; 7] = [
        Weekday::Sunday,
        Weekday::Monday,
        Weekday::Tuesday,
        Weekday::Wednesday,
        Weekday::Thursday,
        Weekday::Friday,
        Weekday::Saturday,
    ];

    pub fn bit(self) -> u8 {
        self as u8
    }
}

impl DaysOfWeek {
    pub fn all() -> Self {
        DaysOfWeek::Label("All".to_string())
    }

    /// Bitmask where bit `i` corresponds to `Weekday` variant `i`
    /// (Sunday = bit 0).
    pub fn to_bitmask(&self) -> u8 {
        match self {
            DaysOfWeek::Label(l) if l == "All" => 0b0111_1111,
            DaysOfWeek::Label(l) if l == "Weekdays" => 0b0011_1110,
            DaysOfWeek::Label(_other) => 0,
            DaysOfWeek::List(days) => days.iter().fold(0u8, |acc, d| acc | (1 << d.bit())),
        }
    }
}

/// A single vehicle charge schedule entry, as the gateway understands it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeSchedule {
    #[serde(default)]
    pub id: Option<u64>,
    pub enabled: bool,
    #[serde(default)]
    pub start_minutes_of_day: Option<MinuteOfDay>,
    #[serde(default)]
    pub end_minutes_of_day: Option<MinuteOfDay>,
    pub start_enabled: bool,
    pub end_enabled: bool,
    pub days_of_week: DaysOfWeek,
    pub lat: f64,
    pub lon: f64,
    pub one_time: bool,
}

/// A computed charging plan. Ordering is authoritative: earlier entries
/// dominate later entries when slots overlap.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OffPeakPlan {
    pub slots: Vec<PlanSlot>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanSlot {
    pub start_local_time: DateTime<Utc>,
    pub end_local_time: DateTime<Utc>,
    pub energy_kwh: f64,
    pub cost: f64,
    #[serde(default = "default_day")]
    pub day: String,
}

fn default_day() -> String {
    "all".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Scheduled,
    Active,
    Completed,
}

/// A user-declared "reach X% by time T" request, keyed by `session_id`.
///
/// At most one `Active` session exists per VIN with
/// `now in [charging_start - wake_lead, charging_end + cleanup_lead]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecialChargingSession {
    pub session_id: String,
    pub vin: String,
    pub status: SessionStatus,
    pub target_percent: u32,
    pub target_datetime: DateTime<Utc>,
    pub charging_start: DateTime<Utc>,
    pub charging_end: DateTime<Utc>,
    pub send_schedule_at: DateTime<Utc>,
    pub sheets_row: u32,
    #[serde(default)]
    pub original_charge_limit: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub charging_plan: Vec<ChargeSchedule>,
}

impl SpecialChargingSession {
    /// `session_id = "special_{row}_{YYYYMMDD_HHMM}"`.
    pub fn make_id(row: u32, target_datetime: DateTime<Utc>) -> String {
        format!("special_{}_{}", row, target_datetime.format("%Y%m%d_%H%M"))
    }

    /// Status transitions are monotone: Scheduled -> Active -> Completed.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self.status, next),
            (Scheduled, Active) | (Active, Completed) | (Scheduled, Completed)
        )
    }
}

/// A named, single-fire future invocation registered with the external
/// cron invoker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneShotJob {
    pub name: String,
    pub trigger_time_local: DateTime<Utc>,
    pub endpoint: String,
    pub payload: serde_json::Value,
    pub auth: JobAuth,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAuth {
    pub identity_token_audience: String,
}

impl OneShotJob {
    pub fn dispatch_name(session_id: &str) -> String {
        format!("special-charging-{}", session_id)
    }

    pub fn cleanup_name(session_id: &str) -> String {
        format!("special-cleanup-{}", session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn charging_ready_from_state() {
        let mut obs = VehicleObservation::minimal("VIN1", VehicleState::Online, Utc::now());
        obs.charging_state = Some("Charging".to_string());
        assert!(obs.charging_ready());
    }

    #[test]
    fn charging_ready_from_cable() {
        let mut obs = VehicleObservation::minimal("VIN1", VehicleState::Online, Utc::now());
        obs.conn_cable = Some("SAE".to_string());
        assert!(obs.charging_ready());
    }

    #[test]
    fn charging_ready_false_for_invalid_sentinels() {
        for sentinel in ["", "Unknown", "<invalid>"] {
            let mut obs = VehicleObservation::minimal("VIN1", VehicleState::Online, Utc::now());
            obs.conn_cable = Some(sentinel.to_string());
            assert!(!obs.charging_ready(), "sentinel {:?} should not be ready", sentinel);
        }
    }

    #[test]
    fn days_of_week_bitmask() {
        assert_eq!(DaysOfWeek::all().to_bitmask(), 0b0111_1111);
        assert_eq!(
            DaysOfWeek::Label("Weekdays".to_string()).to_bitmask(),
            0b0011_1110
        );
    }

    #[test]
    fn session_transitions_are_monotone() {
        let now = Utc::now();
        let mut session = SpecialChargingSession {
            session_id: "special_3_20250314_0100".to_string(),
            vin: "VIN1".to_string(),
            status: SessionStatus::Scheduled,
            target_percent: 85,
            target_datetime: now,
            charging_start: now,
            charging_end: now,
            send_schedule_at: now,
            sheets_row: 3,
            original_charge_limit: None,
            created_at: now,
            charging_plan: vec![],
        };
        assert!(session.can_transition_to(SessionStatus::Active));
        assert!(!session.can_transition_to(SessionStatus::Scheduled));
        session.status = SessionStatus::Active;
        assert!(session.can_transition_to(SessionStatus::Completed));
        session.status = SessionStatus::Completed;
        assert!(!session.can_transition_to(SessionStatus::Active));
    }

    #[test]
    fn session_id_format() {
        use chrono::TimeZone;
        let dt = Utc.with_ymd_and_hms(2025, 3, 14, 8, 0, 0).unwrap();
        assert_eq!(SpecialChargingSession::make_id(3, dt), "special_3_20250314_0800");
    }
}

//! Queries the pricing/plan API, diff-checks the returned plan against the
//! last applied one, resolves schedule overlaps, and applies the result to
//! the vehicle through the signing proxy.
//!
//! Follows a fetch -> decide -> act cycle shape, with all overlap math
//! centralized through `time_ext::Window`.

use std::sync::Arc;

use chrono::{NaiveTime, Timelike, Utc};
use sha2::{Digest, Sha256};

use crate::config::{Charging, Home, Proxy};
use crate::error::{GatewayError, PlannerError, ProxyError};
use crate::model::{ChargeSchedule, DaysOfWeek, OffPeakPlan, PlanSlot};
use crate::pricing::PlanClient;
use crate::proxy::ProxySupervisor;
use crate::state_store::StateStore;
use crate::time_ext::{self, MinuteOfDay, Window};
use crate::vehicle::VehicleGateway;

/// Errors specific to a reconciliation attempt; everything else is folded
/// through the gateway/proxy error kinds.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// What happened on a single `reconcile` call, for logging/diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// The new plan's hash matched the cached one; no vehicle writes.
    Unchanged,
    Applied {
        accepted_slots: usize,
        removed_old_schedules: usize,
        charge_now_issued: bool,
    },
}

/// Content hash of a plan's slots, sorted by `(start, end, energy)` so two
/// plans with the same slots in different orders still hash equal.
pub fn plan_hash(plan: &OffPeakPlan) -> String {
    let mut triples: Vec<(i64, i64, u64)> = plan
        .slots
        .iter()
        .map(|s| {
            (
                s.start_local_time.timestamp(),
                s.end_local_time.timestamp(),
                s.energy_kwh.to_bits(),
            )
        })
        .collect();
    triples.sort();

    let mut hasher = Sha256::new();
    for (start, end, energy_bits) in triples {
        hasher.update(start.to_le_bytes());
        hasher.update(end.to_le_bytes());
        hasher.update(energy_bits.to_le_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Synthetic fallback plan: a single `13:00-15:00` local slot of `~22 kWh`,
/// used whenever the planner call fails outright. The constants are a
/// product decision rather than a technical one, so `Charging` allows a
/// config override.
pub fn fallback_plan(charging: &Charging, today: chrono::DateTime<chrono_tz::Tz>) -> OffPeakPlan {
    let date = today.date_naive();
    let start = combine_local(date, charging.fallback_plan_start, today.timezone());
    let end = combine_local(date, charging.fallback_plan_end, today.timezone());
    OffPeakPlan {
        slots: vec![PlanSlot {
            start_local_time: start,
            end_local_time: end,
            energy_kwh: charging.fallback_plan_energy_kwh,
            cost: 0.0,
            day: "all".to_string(),
        }],
    }
}

fn combine_local(
    date: chrono::NaiveDate,
    time: NaiveTime,
    tz: chrono_tz::Tz,
) -> chrono::DateTime<Utc> {
    use chrono::TimeZone;
    tz.from_local_datetime(&date.and_time(time))
        .single()
        .expect("fallback plan times are not near a DST transition")
        .with_timezone(&Utc)
}

/// Zero-slot or zero-energy plans get a 1-minute "presence" schedule so
/// HOME stays non-empty rather than fully cleared.
fn is_empty_plan(plan: &OffPeakPlan) -> bool {
    plan.slots.is_empty() || plan.slots.iter().all(|s| s.energy_kwh <= 0.0)
}

fn presence_schedule(home: &Home) -> ChargeSchedule {
    ChargeSchedule {
        id: None,
        enabled: true,
        start_minutes_of_day: Some(1439),
        end_minutes_of_day: Some(time_ext::MINUTES_PER_DAY),
        start_enabled: true,
        end_enabled: true,
        days_of_week: DaysOfWeek::all(),
        lat: home.latitude,
        lon: home.longitude,
        one_time: false,
    }
}

/// Convert a plan slot to a `ChargeSchedule` at home coordinates, parsing
/// its UTC instants into the home timezone's minutes-of-day and letting
/// [`Window::new`] apply midnight-unwrap.
fn slot_to_schedule(slot: &PlanSlot, home: &Home, tz: chrono_tz::Tz) -> ChargeSchedule {
    let start_local = slot.start_local_time.with_timezone(&tz);
    let end_local = slot.end_local_time.with_timezone(&tz);
    let start = time_ext::minutes_of_day(start_local.time());
    let raw_end = time_ext::minutes_of_day(end_local.time());
    let window = Window::new(start, raw_end);

    ChargeSchedule {
        id: None,
        enabled: true,
        start_minutes_of_day: Some(window.start),
        // Emitted on the wire as `start + duration`, allowing `end > 1440`
        // for a wrapped window; the gateway normalizes back to `end mod
        // 1440`.
        end_minutes_of_day: Some(window.end),
        start_enabled: true,
        end_enabled: true,
        days_of_week: DaysOfWeek::all(),
        lat: home.latitude,
        lon: home.longitude,
        one_time: false,
    }
}

fn schedule_window(schedule: &ChargeSchedule) -> Option<Window> {
    let start = schedule.start_minutes_of_day?;
    let end = schedule.end_minutes_of_day?;
    Some(Window::new(start, end.min(time_ext::MINUTES_PER_DAY * 2)))
}

/// Iterate slots in authoritative plan order, accepting a slot iff it
/// doesn't overlap any already-accepted slot.
pub fn resolve_overlaps(schedules: Vec<ChargeSchedule>) -> Vec<ChargeSchedule> {
    let mut accepted: Vec<(Window, ChargeSchedule)> = Vec::new();
    for schedule in schedules {
        let Some(window) = schedule_window(&schedule) else {
            continue;
        };
        let conflicts = accepted.iter().any(|(w, _)| w.overlaps(&window));
        if !conflicts {
            accepted.push((window, schedule));
        }
    }
    accepted.into_iter().map(|(_, s)| s).collect()
}

pub(crate) fn is_home_schedule(schedule: &ChargeSchedule, home: &Home) -> bool {
    let dist = ((schedule.lat - home.latitude).powi(2) + (schedule.lon - home.longitude).powi(2))
        .sqrt();
    dist <= home.radius
}

/// The reconciler itself. Holds the vehicle gateway, the proxy supervisor,
/// a `PlanClient`, and the state store (for the plan-hash gate).
pub struct OffPeakReconciler<S: StateStore> {
    pub gateway: Arc<VehicleGateway>,
    pub proxy: Arc<ProxySupervisor>,
    pub plan_client: Arc<dyn PlanClient>,
    pub state_store: Arc<S>,
    pub home: Home,
    pub charging: Charging,
    pub proxy_config: Proxy,
}

impl<S: StateStore> OffPeakReconciler<S> {
    /// Run one reconciliation cycle, triggered by condition A.
    #[tracing::instrument(skip(self, token))]
    pub async fn reconcile(
        &self,
        token: &str,
        vin: &str,
        battery_percent: Option<u32>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let tz: chrono_tz::Tz = self.home.timezone.parse().unwrap_or(chrono_tz::UTC);
        let now_local = Utc::now().with_timezone(&tz);

        // Step 1: query the planner, falling back to the synthetic plan on
        // any failure so the vehicle always ends up with *some* schedule.
        let plan = match self
            .plan_client
            .fetch_plan(vin, now_local.date_naive(), &tz)
            .await
        {
            Ok(Some(plan)) if !plan.slots.is_empty() => plan,
            Ok(_) => fallback_plan(&self.charging, now_local),
            Err(PlannerError::Unavailable(reason)) => {
                tracing::warn!(vin, reason, "planner unavailable, using fallback plan");
                fallback_plan(&self.charging, now_local)
            }
            Err(PlannerError::Timeout) => {
                tracing::warn!(vin, "planner timed out, using fallback plan");
                fallback_plan(&self.charging, now_local)
            }
        };

        // Diff against the cached hash; commit only after a successful apply.
        let new_hash = plan_hash(&plan);
        if self.state_store.get_plan_hash(vin).await.as_deref() == Some(new_hash.as_str()) {
            return Ok(ReconcileOutcome::Unchanged);
        }

        // Step 3: convert slots, or synthesize a presence schedule if the
        // plan is empty (or all-zero-energy).
        let mut schedules: Vec<ChargeSchedule> = if is_empty_plan(&plan) {
            vec![presence_schedule(&self.home)]
        } else {
            plan.slots.iter().map(|s| slot_to_schedule(s, &self.home, tz)).collect()
        };

        // Step 4: resolve overlaps, plan order authoritative.
        schedules = resolve_overlaps(std::mem::take(&mut schedules));

        // Step 5: acquire signed-command capability.
        self.proxy.ensure_up().await?;
        let proxy_base_url = self.proxy.base_url();

        // Step 6: apply new schedules, 3s inter-add pacing.
        for schedule in &schedules {
            self.gateway
                .add_schedule(token, vin, schedule, Some(&proxy_base_url), false)
                .await?;
            tokio::time::sleep(std::time::Duration::from_secs(3)).await;
        }

        // Verify: re-list HOME schedules after all adds complete.
        let after_add = self.gateway.list_schedules(token, vin).await?;
        let new_home_count = after_add.iter().filter(|s| is_home_schedule(s, &self.home)).count();
        if new_home_count < schedules.len() {
            tracing::warn!(
                vin,
                expected = schedules.len(),
                observed = new_home_count,
                "fewer HOME schedules observed after add than were submitted"
            );
        }

        // Reconcile existing — remove old HOME schedules only after all new
        // ones have been accepted.
        let mut removed = 0usize;
        if !schedules.is_empty() || is_empty_plan(&plan) {
            let stale: Vec<u64> = after_add
                .iter()
                .filter(|s| is_home_schedule(s, &self.home))
                .filter(|s| !schedules.iter().any(|new| same_schedule(new, s)))
                .filter_map(|s| s.id)
                .collect();
            for id in stale {
                self.gateway
                    .remove_schedule(token, vin, id, Some(&proxy_base_url), false)
                    .await?;
                removed += 1;
            }
        }

        // Step 9: optional "charge-now" optimisation, gated by config.
        let mut charge_now_issued = false;
        if self.charging.enable_charge_now_optimisation {
            let current_minute = time_ext::minutes_of_day(now_local.time());
            let now_covered = schedules
                .iter()
                .filter_map(schedule_window)
                .any(|w| time_ext::contains_now(w, current_minute));
            if now_covered {
                self.gateway
                    .charge_start(token, vin, Some(&proxy_base_url), false)
                    .await?;
                charge_now_issued = true;
            }
        }

        // Step 8: commit hash only after the plan was successfully applied.
        self.state_store.put_plan_hash(vin, new_hash).await;

        // Step 10: release the proxy.
        self.proxy.stop().await;

        if let Some(battery) = battery_percent {
            metrics::gauge!("offpeak_battery_percent_at_reconcile", battery as f64);
        }
        metrics::gauge!("offpeak_accepted_slots", schedules.len() as f64);
        metrics::gauge!("offpeak_removed_schedules", removed as f64);
        metrics::gauge!("offpeak_charge_now_issued", charge_now_issued as u8 as f64);

        Ok(ReconcileOutcome::Applied {
            accepted_slots: schedules.len(),
            removed_old_schedules: removed,
            charge_now_issued,
        })
    }
}

fn same_schedule(new: &ChargeSchedule, existing: &ChargeSchedule) -> bool {
    new.start_minutes_of_day == existing.start_minutes_of_day
        && new.end_minutes_of_day.map(|e| e % time_ext::MINUTES_PER_DAY)
            == existing.end_minutes_of_day.map(|e| e % time_ext::MINUTES_PER_DAY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn slot(start_h: u32, start_m: u32, end_h: u32, end_m: u32, kwh: f64) -> PlanSlot {
        let today = Utc::now().date_naive();
        PlanSlot {
            start_local_time: Utc
                .from_utc_datetime(&today.and_hms_opt(start_h, start_m, 0).unwrap()),
            end_local_time: Utc.from_utc_datetime(&today.and_hms_opt(end_h, end_m, 0).unwrap()),
            energy_kwh: kwh,
            cost: 1.0,
            day: "all".to_string(),
        }
    }

    #[test]
    fn plan_hash_is_order_independent() {
        let p1 = OffPeakPlan {
            slots: vec![slot(12, 0, 13, 0, 10.0), slot(20, 0, 21, 0, 5.0)],
        };
        let p2 = OffPeakPlan {
            slots: vec![slot(20, 0, 21, 0, 5.0), slot(12, 0, 13, 0, 10.0)],
        };
        assert_eq!(plan_hash(&p1), plan_hash(&p2));
    }

    #[test]
    fn plan_hash_changes_on_content_change() {
        let p1 = OffPeakPlan { slots: vec![slot(12, 0, 13, 0, 10.0)] };
        let p2 = OffPeakPlan { slots: vec![slot(12, 0, 13, 0, 11.0)] };
        assert_ne!(plan_hash(&p1), plan_hash(&p2));
    }

    fn home_schedule(start: u32, end: u32) -> ChargeSchedule {
        ChargeSchedule {
            id: None,
            enabled: true,
            start_minutes_of_day: Some(start),
            end_minutes_of_day: Some(end),
            start_enabled: true,
            end_enabled: true,
            days_of_week: DaysOfWeek::all(),
            lat: 37.0,
            lon: -122.0,
            one_time: false,
        }
    }

    #[test]
    fn overlap_resolution_accepts_first_of_each_conflicting_group() {
        // planner order [12:00-13:14, 11:00-15:00, 20:00-21:00, 12:00-14:00,
        // 18:00-18:30] -> accept {[12:00-13:14], [20:00-21:00], [18:00-18:30]}.
        let schedules = vec![
            home_schedule(720, 794),
            home_schedule(660, 900),
            home_schedule(1200, 1260),
            home_schedule(720, 840),
            home_schedule(1080, 1110),
        ];
        let accepted = resolve_overlaps(schedules);
        let windows: Vec<(u32, u32)> = accepted
            .iter()
            .map(|s| (s.start_minutes_of_day.unwrap(), s.end_minutes_of_day.unwrap()))
            .collect();
        assert_eq!(windows, vec![(720, 794), (1200, 1260), (1080, 1110)]);
    }

    #[test]
    fn midnight_wrap_slot_persists_as_1410_90() {
        let today = Utc::now().date_naive();
        let slot = PlanSlot {
            start_local_time: Utc.from_utc_datetime(&today.and_hms_opt(23, 30, 0).unwrap()),
            end_local_time: Utc
                .from_utc_datetime(&(today + chrono::Duration::days(1)).and_hms_opt(1, 30, 0).unwrap()),
            energy_kwh: 5.0,
            cost: 1.0,
            day: "all".to_string(),
        };
        let home = Home {
            latitude: 0.0,
            longitude: 0.0,
            radius: 0.01,
            timezone: "UTC".to_string(),
        };
        let schedule = slot_to_schedule(&slot, &home, chrono_tz::UTC);
        assert_eq!(schedule.start_minutes_of_day, Some(1410));
        let window = schedule_window(&schedule).unwrap();
        assert_eq!((window.start, window.end), (1410, 1530));
    }

    #[test]
    fn empty_plan_emits_presence_schedule() {
        let plan = OffPeakPlan::default();
        assert!(is_empty_plan(&plan));
    }
}

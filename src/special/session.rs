//! Applying and cleaning up a `SpecialChargingSession` on the vehicle.
//!
//! Shares the off-peak reconciler's apply/pacing/overlap pipeline — the same
//! "convert to `ChargeSchedule`, resolve overlaps, add with 3s pacing"
//! sequence, via `offpeak::resolve_overlaps`.

use std::sync::Arc;

use chrono::Utc;

use crate::config::Home;
use crate::error::{GatewayError, ProxyError};
use crate::model::{ChargeSchedule, DaysOfWeek, SessionStatus, SpecialChargingSession};
use crate::offpeak;
use crate::proxy::ProxySupervisor;
use crate::state_store::StateStore;
use crate::time_ext::{self, Window};
use crate::vehicle::VehicleGateway;

use super::window::ChargingWindow;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// Converts a charging window into one (or more, if it wraps midnight in a
/// way that needs splitting — in practice always one) `ChargeSchedule` at
/// home coordinates, using the same wire rules as the off-peak reconciler.
pub fn window_to_schedules(window: &ChargingWindow, home: &Home, tz: chrono_tz::Tz) -> Vec<ChargeSchedule> {
    let start_local = window.charging_start.with_timezone(&tz);
    let end_local = window.charging_end.with_timezone(&tz);
    let start = time_ext::minutes_of_day(start_local.time());
    let raw_end = time_ext::minutes_of_day(end_local.time());
    let unwrapped = Window::new(start, raw_end);

    vec![ChargeSchedule {
        id: None,
        enabled: true,
        start_minutes_of_day: Some(unwrapped.start),
        end_minutes_of_day: Some(unwrapped.end),
        start_enabled: true,
        end_enabled: true,
        days_of_week: DaysOfWeek::all(),
        lat: home.latitude,
        lon: home.longitude,
        one_time: false,
    }]
}

pub struct SessionApplier<S: StateStore> {
    pub gateway: Arc<VehicleGateway>,
    pub proxy: Arc<ProxySupervisor>,
    pub state_store: Arc<S>,
    pub home: Home,
}

impl<S: StateStore> SessionApplier<S> {
    /// Wakes the vehicle, raises the charge limit if needed, convert/resolve
    /// the plan, apply it, and mark the session `Active`.
    #[tracing::instrument(skip(self, token, session))]
    pub async fn apply(
        &self,
        token: &str,
        mut session: SpecialChargingSession,
    ) -> Result<SpecialChargingSession, SessionError> {
        // Step 1: wake, via the signed path if the proxy is available.
        self.proxy.ensure_up().await?;
        let proxy_base_url = self.proxy.base_url();
        self.gateway
            .wake(token, &session.vin, true, Some(&proxy_base_url))
            .await?;

        // Step 3: raise the charge limit if it's below the session target.
        let charge_state = self.gateway.read_charge_state(token, &session.vin).await?;
        let current_limit = charge_state.charge_limit_soc.unwrap_or(100);
        if current_limit < session.target_percent {
            self.gateway
                .set_charge_limit(token, &session.vin, session.target_percent, Some(&proxy_base_url), false)
                .await?;
            tokio::time::sleep(std::time::Duration::from_secs(3)).await;
            session.original_charge_limit = Some(current_limit);
        }

        // Convert + resolve overlaps (reusing the off-peak reconciler's rules).
        let schedules = offpeak::resolve_overlaps(session.charging_plan.clone());

        // Step 6: apply, 3s inter-add pacing.
        for schedule in &schedules {
            self.gateway
                .add_schedule(token, &session.vin, schedule, Some(&proxy_base_url), false)
                .await?;
            tokio::time::sleep(std::time::Duration::from_secs(3)).await;
        }

        // Step 7: mark Active.
        session.status = SessionStatus::Active;
        self.state_store.put_session(session.clone()).await;

        // Step 8: release the proxy.
        self.proxy.stop().await;

        Ok(session)
    }

    /// `/cleanup-single-session`. Returns whether the session was
    /// actually cleaned (vs. already absent/not-Active, in which case only
    /// the cleanup job itself needs deleting by the caller).
    #[tracing::instrument(skip(self, token))]
    pub async fn cleanup(&self, token: &str, session_id: &str) -> Result<CleanupOutcome, SessionError> {
        let Some(mut session) = self.state_store.get_session(session_id).await else {
            return Ok(CleanupOutcome::NotFound);
        };
        if session.status != SessionStatus::Active {
            return Ok(CleanupOutcome::NotActive);
        }

        // Step 2: restore the original charge limit, if it changed.
        if let Some(original) = session.original_charge_limit {
            let current = self
                .gateway
                .read_charge_state(token, &session.vin)
                .await
                .ok()
                .and_then(|c| c.charge_limit_soc);
            if current != Some(original) {
                self.proxy.ensure_up().await?;
                let proxy_base_url = self.proxy.base_url();
                self.gateway
                    .set_charge_limit(token, &session.vin, original, Some(&proxy_base_url), false)
                    .await?;
                self.proxy.stop().await;
            }
        }

        // Step 3: transition to Completed, with final_battery_level if the
        // vehicle is reachable.
        let final_battery = self
            .gateway
            .read_charge_state(token, &session.vin)
            .await
            .ok()
            .and_then(|c| c.battery_level);

        session.status = SessionStatus::Completed;
        self.state_store.put_session(session.clone()).await;

        Ok(CleanupOutcome::Cleaned {
            final_battery_level: final_battery,
        })
    }

    /// Zombie cleanup — force-complete any `Active` session
    /// whose `charging_end + 2h < now`.
    pub async fn zombie_cleanup(&self, vin: &str) -> Vec<SpecialChargingSession> {
        let now = Utc::now();
        let mut expired = Vec::new();
        for mut session in self.state_store.sessions_for_vin(vin).await {
            if session.status == SessionStatus::Active
                && session.charging_end + chrono::Duration::hours(2) < now
            {
                let overrun = now - session.charging_end;
                tracing::warn!(
                    session_id = %session.session_id,
                    overrun_hours = overrun.num_seconds() as f64 / 3600.0,
                    "auto-expiring zombie special-charging session"
                );
                session.status = SessionStatus::Completed;
                self.state_store.put_session(session.clone()).await;
                expired.push(session);
            }
        }
        expired
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CleanupOutcome {
    NotFound,
    NotActive,
    Cleaned { final_battery_level: Option<u32> },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::special::window::{ChargingWindow, Strategy};

    fn home() -> Home {
        Home {
            latitude: 37.0,
            longitude: -122.0,
            radius: 0.01,
            timezone: "UTC".to_string(),
        }
    }

    #[test]
    fn window_to_schedule_uses_home_coordinates() {
        let now = Utc::now();
        let window = ChargingWindow {
            charging_start: now,
            charging_end: now + chrono::Duration::hours(2),
            send_schedule_at: now - chrono::Duration::hours(1),
            strategy: Strategy::AvoidPeakStandardLead,
        };
        let schedules = window_to_schedules(&window, &home(), chrono_tz::UTC);
        assert_eq!(schedules.len(), 1);
        assert_eq!(schedules[0].lat, 37.0);
        assert_eq!(schedules[0].one_time, false);
    }
}

//! The special-charging planner: daily check, charging-window search,
//! session application, and cleanup.

pub mod session;
pub mod window;

use std::sync::Arc;

use chrono::Utc;

use crate::config::{Charging, Home, Special};
use crate::model::{JobAuth, OneShotJob, SessionStatus, SpecialChargingSession};
use crate::sheet::SpreadsheetClient;
use crate::state_store::StateStore;

use self::session::SessionApplier;
use self::window::{find_window, ChargingWindow};

pub use self::session::CleanupOutcome;

/// Aggregate result of one `/daily-special-charging-check` run.
#[derive(Debug, Clone, Default)]
pub struct DailyCheckReport {
    pub active_needs: usize,
    pub processed_needs: usize,
    pub sent_schedules: usize,
    pub created_sessions: usize,
    pub cleaned_zombie_sessions: usize,
    pub errors: Vec<String>,
}

pub struct SpecialChargingPlanner<S: StateStore> {
    pub sheet: Arc<dyn SpreadsheetClient>,
    pub jobs: Arc<dyn crate::jobs::JobRegistrar>,
    pub state_store: Arc<S>,
    pub applier: SessionApplier<S>,
    pub home: Home,
    pub charging: Charging,
    pub special: Special,
    pub worker_service_url: String,
}

impl<S: StateStore> SpecialChargingPlanner<S> {
    fn tz(&self) -> chrono_tz::Tz {
        self.home.timezone.parse().unwrap_or(chrono_tz::UTC)
    }

    /// `/daily-special-charging-check`.
    #[tracing::instrument(skip(self, token))]
    pub async fn daily_check(&self, token: &str, vin: &str) -> DailyCheckReport {
        let mut report = DailyCheckReport::default();

        // Step 1: zombie cleanup.
        let expired = self.applier.zombie_cleanup(vin).await;
        report.cleaned_zombie_sessions = expired.len();

        // Step 2: fetch needs from the spreadsheet.
        let now = Utc::now();
        let (needs, malformed) = match self.sheet.fetch_needs(&self.tz(), now).await {
            Ok(result) => result,
            Err(e) => {
                report.errors.push(format!("sheet fetch failed: {}", e));
                return report;
            }
        };
        report.active_needs = needs.len();
        for row in malformed {
            report.errors.push(row.to_string());
        }

        for need in needs {
            report.processed_needs += 1;
            let current_percent = match self.current_battery_percent(token, vin).await {
                Ok(p) => p,
                Err(e) => {
                    report.errors.push(format!("row {}: failed to read battery: {}", need.row, e));
                    continue;
                }
            };

            let Some(window) = find_window(
                &self.charging,
                &self.special,
                self.tz(),
                now,
                need.target_datetime,
                current_percent,
                need.target_percent,
            ) else {
                // target <= current: no plan needed.
                continue;
            };

            let session_id = SpecialChargingSession::make_id(need.row, need.target_datetime);
            let charging_plan = session::window_to_schedules(&window, &self.home, self.tz());
            let mut session = SpecialChargingSession {
                session_id: session_id.clone(),
                vin: vin.to_string(),
                status: SessionStatus::Scheduled,
                target_percent: need.target_percent,
                target_datetime: need.target_datetime,
                charging_start: window.charging_start,
                charging_end: window.charging_end,
                send_schedule_at: window.send_schedule_at,
                sheets_row: need.row,
                original_charge_limit: None,
                created_at: now,
                charging_plan,
            };

            if now >= window.send_schedule_at {
                // Deadline already within the send window: apply immediately.
                match self.applier.apply(token, session).await {
                    Ok(applied) => {
                        self.register_cleanup_job(&applied).await;
                        report.sent_schedules += 1;
                    }
                    Err(e) => report.errors.push(format!("row {}: apply failed: {}", need.row, e)),
                }
            } else {
                self.state_store.put_session(session.clone()).await;
                if let Err(e) = self.register_dispatch_and_cleanup_jobs(&mut session, &window).await {
                    report.errors.push(format!("row {}: job registration failed: {}", need.row, e));
                    continue;
                }
                report.created_sessions += 1;
            }
        }

        metrics::gauge!("special_active_needs", report.active_needs as f64);
        metrics::gauge!("special_sent_schedules", report.sent_schedules as f64);
        metrics::gauge!("special_created_sessions", report.created_sessions as f64);
        metrics::gauge!("special_cleaned_zombie_sessions", report.cleaned_zombie_sessions as f64);

        report
    }

    async fn current_battery_percent(&self, token: &str, vin: &str) -> anyhow::Result<u32> {
        let state = self.applier.gateway.read_charge_state(token, vin).await?;
        state
            .battery_level
            .ok_or_else(|| anyhow::anyhow!("vehicle did not report a battery level"))
    }

    async fn register_dispatch_and_cleanup_jobs(
        &self,
        session: &mut SpecialChargingSession,
        window: &ChargingWindow,
    ) -> anyhow::Result<()> {
        let auth = JobAuth {
            identity_token_audience: self.worker_service_url.clone(),
        };
        self.jobs
            .register(
                &OneShotJob::dispatch_name(&session.session_id),
                window.send_schedule_at,
                "/send-special-schedule",
                serde_json::json!({"session_id": session.session_id}),
                auth.clone(),
            )
            .await?;
        self.jobs
            .register(
                &OneShotJob::cleanup_name(&session.session_id),
                window.charging_end + chrono::Duration::minutes(30),
                "/cleanup-single-session",
                serde_json::json!({"session_id": session.session_id}),
                auth,
            )
            .await?;
        Ok(())
    }

    async fn register_cleanup_job(&self, session: &SpecialChargingSession) {
        let auth = JobAuth {
            identity_token_audience: self.worker_service_url.clone(),
        };
        if let Err(e) = self
            .jobs
            .register(
                &OneShotJob::cleanup_name(&session.session_id),
                session.charging_end + chrono::Duration::minutes(30),
                "/cleanup-single-session",
                serde_json::json!({"session_id": session.session_id}),
                auth,
            )
            .await
        {
            tracing::warn!(session_id = %session.session_id, error = %e, "failed to register cleanup job");
        }
    }

    /// `/send-special-schedule`: one-shot dispatch of a `Scheduled` session.
    #[tracing::instrument(skip(self, token))]
    pub async fn send_scheduled(&self, token: &str, session_id: &str) -> anyhow::Result<SpecialChargingSession> {
        let session = self
            .state_store
            .get_session(session_id)
            .await
            .ok_or_else(|| anyhow::anyhow!("unknown session {}", session_id))?;
        let applied = self.applier.apply(token, session).await?;
        self.register_cleanup_job(&applied).await;
        let _ = self.jobs.delete(&OneShotJob::dispatch_name(session_id)).await;
        Ok(applied)
    }

    /// `/send-special-schedule-immediate`: test hook, synthesizes a plan
    /// for `target_percent` against the current battery and applies now.
    #[tracing::instrument(skip(self, token))]
    pub async fn send_immediate(
        &self,
        token: &str,
        vin: &str,
        target_percent: u32,
    ) -> anyhow::Result<SpecialChargingSession> {
        let now = Utc::now();
        let current_percent = self.current_battery_percent(token, vin).await?;
        let deadline = now + chrono::Duration::hours(self.special.min_advance_hours.ceil() as i64);
        let window = find_window(
            &self.charging,
            &self.special,
            self.tz(),
            now - chrono::Duration::hours(24),
            deadline,
            current_percent,
            target_percent,
        )
        .ok_or_else(|| anyhow::anyhow!("target {} not above current {}", target_percent, current_percent))?;

        let charging_plan = session::window_to_schedules(&window, &self.home, self.tz());
        let session = SpecialChargingSession {
            session_id: SpecialChargingSession::make_id(0, deadline),
            vin: vin.to_string(),
            status: SessionStatus::Scheduled,
            target_percent,
            target_datetime: deadline,
            charging_start: window.charging_start,
            charging_end: window.charging_end,
            send_schedule_at: window.send_schedule_at,
            sheets_row: 0,
            original_charge_limit: None,
            created_at: now,
            charging_plan,
        };
        let applied = self.applier.apply(token, session).await?;
        self.register_cleanup_job(&applied).await;
        Ok(applied)
    }

    /// `/cleanup-single-session`.
    #[tracing::instrument(skip(self, token))]
    pub async fn cleanup_session(&self, token: &str, session_id: &str) -> anyhow::Result<(CleanupOutcome, bool)> {
        let outcome = self.applier.cleanup(token, session_id).await?;
        let cleanup_job_deleted = self
            .jobs
            .delete(&OneShotJob::cleanup_name(session_id))
            .await
            .is_ok();
        Ok((outcome, cleanup_job_deleted))
    }
}

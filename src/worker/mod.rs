//! The worker dispatcher: the axum HTTP surface, the pre-cycle readiness
//! gate and per-VIN cycle serialization, and the continuous/waiting
//! scheduling mode.
//!
//! The router/handler shape generalizes `core-server-rs/src/api.rs`'s
//! `Router::new().route(...)` pattern and `core-server-rs/src/error.rs`'s
//! `AppError`/`IntoResponse` envelope (already mirrored in `error.rs`).

mod handlers;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};

use crate::config::{Config, Home};
use crate::error::{CycleError, GatewayError};
use crate::model::{
    LastKnownState, MonitoringCase, MonitoringCaseState, SessionStatus, VehicleObservation,
};
use crate::offpeak::{self, OffPeakReconciler};
use crate::proxy::ProxySupervisor;
use crate::scout::{evaluate, should_persist, CaseAction};
use crate::special::SpecialChargingPlanner;
use crate::state_store::StateStore;
use crate::tokens::{SecretStore, TokenWriter};
use crate::vehicle::VehicleGateway;

pub use handlers::router;

const PER_READ_TIMEOUT: Duration = Duration::from_secs(90);
const OVERALL_CYCLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Scheduling mode: either an external scheduler drives `/run-cycle`
/// (the default), or the worker drives itself via a background ticker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WorkerMode {
    Running,
    Waiting { since: DateTime<Utc> },
}

/// Normal poll cadence while continuous mode is healthy; matches the
/// interval a scheduler-driven deployment would configure externally.
const CONTINUOUS_POLL_INTERVAL: Duration = Duration::from_secs(300);
/// Backoff after a failed cycle: retry at most once per hour.
const CONTINUOUS_RETRY_INTERVAL: Duration = Duration::from_secs(3600);

/// Drives `run_cycle` on a loop instead of waiting for an external
/// scheduler. On failure, moves to `Waiting { since }` and retries no more
/// than once per hour; a successful cycle returns to `Running` and resumes
/// the normal poll cadence. Runs until `shutdown` resolves.
pub async fn run_continuous_scheduler<S, T>(
    state: AppState<S, T>,
    mode: Arc<RwLock<WorkerMode>>,
    shutdown: tokio_util::sync::CancellationToken,
) where
    S: StateStore + 'static,
    T: SecretStore + 'static,
{
    loop {
        if shutdown.is_cancelled() {
            return;
        }
        let result = state.run_cycle(Some("continuous_mode".to_string())).await;
        let sleep_for = match result {
            Ok(report) => {
                tracing::debug!(?report, "continuous-mode cycle completed");
                *mode.write().await = WorkerMode::Running;
                CONTINUOUS_POLL_INTERVAL
            }
            Err(e) => {
                tracing::warn!(error = %e, "continuous-mode cycle failed, backing off");
                *mode.write().await = WorkerMode::Waiting { since: Utc::now() };
                CONTINUOUS_RETRY_INTERVAL
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            _ = shutdown.cancelled() => return,
        }
    }
}

/// A completed cycle's timestamp and wall-clock duration, surfaced by
/// `/worker-status`.
#[derive(Debug, Clone, Copy)]
pub struct LastCycle {
    pub at: DateTime<Utc>,
    pub duration_seconds: f64,
}

/// Result of any of the cycle-shaped endpoints (`/run-cycle`,
/// `/run-midnight-wake`, `/scout-trigger`).
#[derive(Debug, Clone, serde::Serialize)]
pub struct CycleReport {
    pub status: String,
    pub execution_time_seconds: f64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkerStatusReport {
    pub status: String,
    pub proxy_state: String,
    pub token_remaining_minutes: Option<i64>,
    pub private_key_ready: bool,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_cycle_duration_seconds: Option<f64>,
    pub active_sessions: usize,
    pub uptime_seconds: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct GetTokenReport {
    pub access_token: String,
    pub remaining_minutes: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RefreshTokensReport {
    pub status: String,
    pub remaining_minutes: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SyncTokensReport {
    pub migrated: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ResetReport {
    pub reset: bool,
    pub collections_cleared: Vec<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ResetSchedulesReport {
    pub schedules_found: usize,
    pub schedules_removed: usize,
    pub schedules_failed: usize,
    pub remaining_schedules: usize,
}

/// Everything a handler needs: the vehicle gateway, the token manager's
/// write capability, the signed-command proxy supervisor, the state store,
/// the off-peak reconciler and the special-charging planner, plus a per-VIN
/// cycle lock. Cloned per-request by axum's `State` extractor — every field
/// is an `Arc`, so cloning is cheap regardless of whether `S`/`T` themselves
/// are `Clone`.
pub struct AppState<S: StateStore + 'static, T: SecretStore + 'static> {
    pub config: Config,
    pub vin: String,
    pub gateway: Arc<VehicleGateway>,
    pub token_writer: Arc<TokenWriter<T>>,
    pub proxy: Arc<ProxySupervisor>,
    pub state_store: Arc<S>,
    pub offpeak: Arc<OffPeakReconciler<S>>,
    pub special: Arc<SpecialChargingPlanner<S>>,
    pub started_at: DateTime<Utc>,
    pub last_cycle: Arc<RwLock<Option<LastCycle>>>,
    cycle_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl<S: StateStore, T: SecretStore> Clone for AppState<S, T> {
    fn clone(&self) -> Self {
        AppState {
            config: self.config.clone(),
            vin: self.vin.clone(),
            gateway: self.gateway.clone(),
            token_writer: self.token_writer.clone(),
            proxy: self.proxy.clone(),
            state_store: self.state_store.clone(),
            offpeak: self.offpeak.clone(),
            special: self.special.clone(),
            started_at: self.started_at,
            last_cycle: self.last_cycle.clone(),
            cycle_locks: self.cycle_locks.clone(),
        }
    }
}

impl<S: StateStore, T: SecretStore> AppState<S, T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        vin: String,
        gateway: Arc<VehicleGateway>,
        token_writer: Arc<TokenWriter<T>>,
        proxy: Arc<ProxySupervisor>,
        state_store: Arc<S>,
        offpeak: Arc<OffPeakReconciler<S>>,
        special: Arc<SpecialChargingPlanner<S>>,
    ) -> Self {
        AppState {
            config,
            vin,
            gateway,
            token_writer,
            proxy,
            state_store,
            offpeak,
            special,
            started_at: Utc::now(),
            last_cycle: Arc::new(RwLock::new(None)),
            cycle_locks: Arc::new(DashMap::new()),
        }
    }

    fn home(&self) -> Home {
        self.config.home.clone()
    }

    async fn vin_lock(&self, vin: &str) -> Arc<Mutex<()>> {
        self.cycle_locks
            .entry(vin.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Pre-cycle readiness gate: token, private key, and (when the call
    /// needs signed commands) the proxy.
    #[tracing::instrument(skip(self))]
    async fn ensure_ready(&self, needs_signed: bool) -> Result<String, CycleError> {
        let material = self.token_writer.ensure_valid(Utc::now()).await?;

        let key_meta = tokio::fs::metadata(&self.config.proxy.private_key_path)
            .await
            .map_err(|_| CycleError::PrivateKeyNotReady)?;
        if key_meta.len() == 0 {
            return Err(CycleError::PrivateKeyNotReady);
        }

        if needs_signed {
            self.proxy.ensure_up().await?;
        }

        Ok(material.access_token)
    }

    async fn timed_read<F, O>(fut: F) -> Result<O, CycleError>
    where
        F: std::future::Future<Output = Result<O, GatewayError>>,
    {
        match tokio::time::timeout(PER_READ_TIMEOUT, fut).await {
            Ok(inner) => inner.map_err(CycleError::from),
            Err(_) => Err(CycleError::Timeout),
        }
    }

    /// Command retry bound to one attempt: if `op` fails with
    /// `AuthExpired`, force a token refresh and run it once more with the
    /// new access token. Any other outcome, including a second
    /// `AuthExpired`, is returned as-is.
    async fn retry_once_on_auth_expired<F, Fut, O>(&self, token: String, op: F) -> Result<O, CycleError>
    where
        F: Fn(String) -> Fut,
        Fut: std::future::Future<Output = Result<O, CycleError>>,
    {
        match op(token).await {
            Err(CycleError::Gateway(GatewayError::AuthExpired)) => {
                tracing::warn!("command failed with AuthExpired, forcing token refresh and retrying once");
                let material = self.token_writer.force_refresh(Utc::now()).await?;
                op(material.access_token).await
            }
            other => other,
        }
    }

    async fn record_cycle(&self, started: DateTime<Utc>) -> f64 {
        let duration = (Utc::now() - started).num_milliseconds() as f64 / 1000.0;
        *self.last_cycle.write().await = Some(LastCycle {
            at: started,
            duration_seconds: duration,
        });
        duration
    }

    /// `/run-cycle`: read the vehicle fresh and run it through the same
    /// decide/persist/dispatch pipeline Scout's sample would have used,
    /// waking once if the vehicle reports offline.
    #[tracing::instrument(skip(self))]
    pub async fn run_cycle(&self, trigger: Option<String>) -> Result<CycleReport, CycleError> {
        let vin = self.vin.clone();
        let lock = self.vin_lock(&vin).await;
        let _guard = lock.lock().await;
        let started = Utc::now();

        let outcome = tokio::time::timeout(OVERALL_CYCLE_TIMEOUT, async {
            let token = self.ensure_ready(false).await?;
            let obs = match self
                .retry_once_on_auth_expired(token, |tok| async move {
                    Self::timed_read(self.gateway.read_full(&tok, &vin)).await
                })
                .await
            {
                Ok(obs) => obs,
                Err(CycleError::Gateway(GatewayError::VehicleOffline(_))) => {
                    let token = self.ensure_ready(true).await?;
                    self.gateway
                        .wake(&token, &vin, true, Some(&self.proxy.base_url()))
                        .await?;
                    Self::timed_read(self.gateway.read_full(&token, &vin)).await?
                }
                Err(e) => return Err(e),
            };
            self.ingest_observation(&vin, &obs, trigger.as_deref()).await?;
            Ok::<(), CycleError>(())
        })
        .await;

        let duration = self.record_cycle(started).await;
        match outcome {
            Ok(Ok(())) => Ok(CycleReport {
                status: "completed".to_string(),
                execution_time_seconds: duration,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(CycleError::Timeout),
        }
    }

    /// `/run-midnight-wake`: unconditional wake + full read + persist,
    /// independent of whether the decision table would trigger a worker
    /// invocation on its own.
    #[tracing::instrument(skip(self))]
    pub async fn run_midnight_wake(&self) -> Result<CycleReport, CycleError> {
        let vin = self.vin.clone();
        let lock = self.vin_lock(&vin).await;
        let _guard = lock.lock().await;
        let started = Utc::now();

        let outcome = tokio::time::timeout(OVERALL_CYCLE_TIMEOUT, async {
            let token = self.ensure_ready(true).await?;
            self.gateway
                .wake(&token, &vin, true, Some(&self.proxy.base_url()))
                .await?;
            let obs = self
                .retry_once_on_auth_expired(token, |tok| async move {
                    Self::timed_read(self.gateway.read_full(&tok, &vin)).await
                })
                .await?;
            self.ingest_observation(&vin, &obs, Some("midnight_wake")).await?;
            Ok::<(), CycleError>(())
        })
        .await;

        let duration = self.record_cycle(started).await;
        match outcome {
            Ok(Ok(())) => Ok(CycleReport {
                status: "completed".to_string(),
                execution_time_seconds: duration,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(CycleError::Timeout),
        }
    }

    /// `/scout-trigger`: Scout already decided an invocation was warranted
    /// and forwarded its observation; re-read (waking, if the reason is
    /// `condition_b_wake`) only when Scout's own cheap/full read isn't
    /// sufficient.
    #[tracing::instrument(skip(self, obs))]
    pub async fn scout_trigger(
        &self,
        reason: &str,
        obs: VehicleObservation,
    ) -> Result<CycleReport, CycleError> {
        let vin = obs.vin.clone();
        let lock = self.vin_lock(&vin).await;
        let _guard = lock.lock().await;
        let started = Utc::now();

        let outcome = tokio::time::timeout(OVERALL_CYCLE_TIMEOUT, async {
            if reason == "condition_b_wake" {
                let token = self.ensure_ready(true).await?;
                self.gateway
                    .wake(&token, &vin, true, Some(&self.proxy.base_url()))
                    .await?;
                let full = self
                    .retry_once_on_auth_expired(token, |tok| async move {
                        Self::timed_read(self.gateway.read_full(&tok, &vin)).await
                    })
                    .await?;
                self.ingest_observation(&vin, &full, Some(reason)).await?;
            } else {
                self.ingest_observation(&vin, &obs, Some(reason)).await?;
            }
            Ok::<(), CycleError>(())
        })
        .await;

        let duration = self.record_cycle(started).await;
        match outcome {
            Ok(Ok(())) => Ok(CycleReport {
                status: "completed".to_string(),
                execution_time_seconds: duration,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(CycleError::Timeout),
        }
    }

    /// Shared by `run_cycle`/`run_midnight_wake`/`scout_trigger`: the
    /// evaluate -> persist -> (maybe) dispatch pipeline, run server-side
    /// against a freshly read observation.
    async fn ingest_observation(
        &self,
        vin: &str,
        obs: &VehicleObservation,
        reason: Option<&str>,
    ) -> Result<(), CycleError> {
        let last = self.state_store.get_last_known(vin).await;
        let case = self.state_store.get_monitoring_case(vin).await;
        let home = self.home();
        let at_home_now = obs.at_home(home.latitude, home.longitude, home.radius);
        let charging_ready_now = obs.charging_ready();
        let has_active_session = self
            .state_store
            .sessions_for_vin(vin)
            .await
            .iter()
            .any(|s| s.status == SessionStatus::Active);

        let (decision, case_action, _) = evaluate(
            last.as_ref(),
            obs,
            at_home_now,
            charging_ready_now,
            case.as_ref(),
            has_active_session,
        );

        match case_action {
            CaseAction::None => {}
            CaseAction::Clear => self.state_store.clear_monitoring_case(vin).await,
            CaseAction::OpenOrExtendWaiting => {
                let now = Utc::now();
                let updated = match case {
                    Some(mut c) => {
                        c.last_battery_percent = obs.battery_percent;
                        c.last_check_time = Some(now);
                        c
                    }
                    None => MonitoringCase::new_waiting(vin, now),
                };
                self.state_store.put_monitoring_case(vin, updated).await;
            }
            CaseAction::MarkAwoken => {
                if let Some(mut c) = self.state_store.get_monitoring_case(vin).await {
                    c.state = MonitoringCaseState::VehicleAwoken;
                    c.last_check_time = Some(Utc::now());
                    self.state_store.put_monitoring_case(vin, c).await;
                }
            }
        }

        if should_persist(last.as_ref(), obs) {
            self.state_store
                .put_last_known(
                    vin,
                    LastKnownState {
                        observation: obs.clone(),
                        at_home: at_home_now.or(last.as_ref().and_then(|l| l.at_home)),
                        charging_ready: charging_ready_now,
                        recorded_at: Utc::now(),
                    },
                )
                .await;
        }

        if decision.triggers_worker() {
            tracing::info!(vin, reason = reason.unwrap_or("run-cycle"), ?decision, "dispatching off-peak reconciliation");
            let token = self.ensure_ready(true).await?;
            self.retry_once_on_auth_expired(token, |tok| async move {
                self.offpeak
                    .reconcile(&tok, vin, obs.battery_percent)
                    .await
                    .map_err(|e| match e {
                        offpeak::ReconcileError::Proxy(p) => CycleError::Proxy(p),
                        offpeak::ReconcileError::Gateway(g) => CycleError::Gateway(g),
                    })
            })
            .await?;
        }

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_token(&self) -> Result<GetTokenReport, CycleError> {
        let material = self.token_writer.ensure_valid(Utc::now()).await?;
        Ok(GetTokenReport {
            access_token: material.access_token.clone(),
            remaining_minutes: material.remaining_minutes(Utc::now()),
        })
    }

    #[tracing::instrument(skip(self))]
    pub async fn refresh_tokens(&self) -> Result<RefreshTokensReport, CycleError> {
        let material = self.token_writer.force_refresh(Utc::now()).await?;
        Ok(RefreshTokensReport {
            status: "refreshed".to_string(),
            remaining_minutes: material.remaining_minutes(Utc::now()),
        })
    }

    #[tracing::instrument(skip(self))]
    pub async fn sync_tokens(&self) -> Result<SyncTokensReport, CycleError> {
        let migrated = self.token_writer.migrate_from_legacy(Utc::now()).await?;
        Ok(SyncTokensReport {
            migrated: migrated.is_some(),
        })
    }

    pub async fn worker_status(&self) -> WorkerStatusReport {
        let token_minutes = self
            .token_writer
            .load()
            .await
            .ok()
            .map(|m| m.remaining_minutes(Utc::now()));
        let private_key_ready = tokio::fs::metadata(&self.config.proxy.private_key_path)
            .await
            .map(|m| m.len() > 0)
            .unwrap_or(false);
        let last = *self.last_cycle.read().await;
        let active_sessions = self
            .state_store
            .all_sessions()
            .await
            .iter()
            .filter(|s| s.status == SessionStatus::Active)
            .count();

        WorkerStatusReport {
            status: "ok".to_string(),
            proxy_state: format!("{:?}", self.proxy.state().await),
            token_remaining_minutes: token_minutes,
            private_key_ready,
            last_cycle_at: last.map(|c| c.at),
            last_cycle_duration_seconds: last.map(|c| c.duration_seconds),
            active_sessions,
            uptime_seconds: (Utc::now() - self.started_at).num_seconds(),
        }
    }

    pub async fn reset(&self) -> ResetReport {
        self.state_store.reset_monitoring_state().await;
        ResetReport {
            reset: true,
            collections_cleared: vec!["last_known_state".to_string(), "monitoring_cases".to_string()],
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn reset_tesla_schedules(&self) -> Result<ResetSchedulesReport, CycleError> {
        let token = self.ensure_ready(true).await?;
        let home = self.home();
        let proxy_base = self.proxy.base_url();

        let schedules = self.gateway.list_schedules(&token, &self.vin).await?;
        let home_ids: Vec<u64> = schedules
            .iter()
            .filter(|s| offpeak::is_home_schedule(s, &home))
            .filter_map(|s| s.id)
            .collect();
        let found = home_ids.len();

        let mut removed = 0usize;
        let mut failed = 0usize;
        for id in home_ids {
            match self
                .gateway
                .remove_schedule(&token, &self.vin, id, Some(&proxy_base), false)
                .await
            {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::warn!(schedule_id = id, error = %e, "failed to remove HOME schedule");
                    failed += 1;
                }
            }
        }
        self.proxy.stop().await;

        let remaining = self
            .gateway
            .list_schedules(&token, &self.vin)
            .await
            .map(|s| s.iter().filter(|s| offpeak::is_home_schedule(s, &home)).count())
            .unwrap_or(found.saturating_sub(removed));

        Ok(ResetSchedulesReport {
            schedules_found: found,
            schedules_removed: removed,
            schedules_failed: failed,
            remaining_schedules: remaining,
        })
    }
}

//! Last-known vehicle state, active monitoring cases, active
//! special-charging sessions, and the cached off-peak plan hash — three
//! document collections plus one hash-per-vin.
//!
//! A small async document store behind a trait, so a managed-document-store
//! implementation could be dropped in later without touching call sites.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::model::{LastKnownState, MonitoringCase, SpecialChargingSession};

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get_last_known(&self, vin: &str) -> Option<LastKnownState>;
    async fn put_last_known(&self, vin: &str, state: LastKnownState);

    async fn get_monitoring_case(&self, vin: &str) -> Option<MonitoringCase>;
    async fn put_monitoring_case(&self, vin: &str, case: MonitoringCase);
    async fn clear_monitoring_case(&self, vin: &str);

    async fn get_session(&self, session_id: &str) -> Option<SpecialChargingSession>;
    async fn put_session(&self, session: SpecialChargingSession);
    async fn sessions_for_vin(&self, vin: &str) -> Vec<SpecialChargingSession>;
    async fn all_sessions(&self) -> Vec<SpecialChargingSession>;

    async fn get_plan_hash(&self, vin: &str) -> Option<String>;
    async fn put_plan_hash(&self, vin: &str, hash: String);

    /// `/reset`: purge monitoring state (last-known-state + monitoring
    /// cases) for every VIN. Sessions and the plan hash are untouched —
    /// this is a monitoring-state reset, not a full wipe.
    async fn reset_monitoring_state(&self);
}

#[derive(Default, Serialize, Deserialize, Clone)]
struct Document {
    last_known: HashMap<String, LastKnownState>,
    monitoring_cases: HashMap<String, MonitoringCase>,
    sessions: HashMap<String, SpecialChargingSession>,
    plan_hashes: HashMap<String, String>,
}

/// In-process store; the default for tests and for Scout/Worker processes
/// that share a single JSON file on disk via [`JsonFileStateStore`].
pub struct InMemoryStateStore {
    doc: RwLock<Document>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        InMemoryStateStore {
            doc: RwLock::new(Document::default()),
        }
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get_last_known(&self, vin: &str) -> Option<LastKnownState> {
        self.doc.read().await.last_known.get(vin).cloned()
    }

    async fn put_last_known(&self, vin: &str, state: LastKnownState) {
        self.doc.write().await.last_known.insert(vin.to_string(), state);
    }

    async fn get_monitoring_case(&self, vin: &str) -> Option<MonitoringCase> {
        self.doc.read().await.monitoring_cases.get(vin).cloned()
    }

    async fn put_monitoring_case(&self, vin: &str, case: MonitoringCase) {
        self.doc
            .write()
            .await
            .monitoring_cases
            .insert(vin.to_string(), case);
    }

    async fn clear_monitoring_case(&self, vin: &str) {
        self.doc.write().await.monitoring_cases.remove(vin);
    }

    async fn get_session(&self, session_id: &str) -> Option<SpecialChargingSession> {
        self.doc.read().await.sessions.get(session_id).cloned()
    }

    async fn put_session(&self, session: SpecialChargingSession) {
        self.doc
            .write()
            .await
            .sessions
            .insert(session.session_id.clone(), session);
    }

    async fn sessions_for_vin(&self, vin: &str) -> Vec<SpecialChargingSession> {
        self.doc
            .read()
            .await
            .sessions
            .values()
            .filter(|s| s.vin == vin)
            .cloned()
            .collect()
    }

    async fn all_sessions(&self) -> Vec<SpecialChargingSession> {
        self.doc.read().await.sessions.values().cloned().collect()
    }

    async fn get_plan_hash(&self, vin: &str) -> Option<String> {
        self.doc.read().await.plan_hashes.get(vin).cloned()
    }

    async fn put_plan_hash(&self, vin: &str, hash: String) {
        self.doc.write().await.plan_hashes.insert(vin.to_string(), hash);
    }

    async fn reset_monitoring_state(&self) {
        let mut doc = self.doc.write().await;
        doc.last_known.clear();
        doc.monitoring_cases.clear();
    }
}

/// Same document shape, persisted to a single JSON file after every write.
/// This is the Worker-side default: cheap, file-based durability without a
/// real document-store dependency.
pub struct JsonFileStateStore {
    path: PathBuf,
    doc: RwLock<Document>,
}

impl JsonFileStateStore {
    pub async fn open(path: PathBuf) -> anyhow::Result<Self> {
        let doc = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => Document::default(),
        };
        Ok(JsonFileStateStore {
            path,
            doc: RwLock::new(doc),
        })
    }

    async fn persist(&self) {
        let doc = self.doc.read().await.clone();
        if let Ok(bytes) = serde_json::to_vec_pretty(&doc) {
            if let Err(e) = tokio::fs::write(&self.path, bytes).await {
                tracing::warn!(error = %e, "failed to persist state store");
            }
        }
    }
}

#[async_trait]
impl StateStore for JsonFileStateStore {
    async fn get_last_known(&self, vin: &str) -> Option<LastKnownState> {
        self.doc.read().await.last_known.get(vin).cloned()
    }

    async fn put_last_known(&self, vin: &str, state: LastKnownState) {
        self.doc.write().await.last_known.insert(vin.to_string(), state);
        self.persist().await;
    }

    async fn get_monitoring_case(&self, vin: &str) -> Option<MonitoringCase> {
        self.doc.read().await.monitoring_cases.get(vin).cloned()
    }

    async fn put_monitoring_case(&self, vin: &str, case: MonitoringCase) {
        self.doc
            .write()
            .await
            .monitoring_cases
            .insert(vin.to_string(), case);
        self.persist().await;
    }

    async fn clear_monitoring_case(&self, vin: &str) {
        self.doc.write().await.monitoring_cases.remove(vin);
        self.persist().await;
    }

    async fn get_session(&self, session_id: &str) -> Option<SpecialChargingSession> {
        self.doc.read().await.sessions.get(session_id).cloned()
    }

    async fn put_session(&self, session: SpecialChargingSession) {
        self.doc
            .write()
            .await
            .sessions
            .insert(session.session_id.clone(), session);
        self.persist().await;
    }

    async fn sessions_for_vin(&self, vin: &str) -> Vec<SpecialChargingSession> {
        self.doc
            .read()
            .await
            .sessions
            .values()
            .filter(|s| s.vin == vin)
            .cloned()
            .collect()
    }

    async fn all_sessions(&self) -> Vec<SpecialChargingSession> {
        self.doc.read().await.sessions.values().cloned().collect()
    }

    async fn get_plan_hash(&self, vin: &str) -> Option<String> {
        self.doc.read().await.plan_hashes.get(vin).cloned()
    }

    async fn put_plan_hash(&self, vin: &str, hash: String) {
        self.doc.write().await.plan_hashes.insert(vin.to_string(), hash);
        self.persist().await;
    }

    async fn reset_monitoring_state(&self) {
        {
            let mut doc = self.doc.write().await;
            doc.last_known.clear();
            doc.monitoring_cases.clear();
        }
        self.persist().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MonitoringCaseState, VehicleObservation, VehicleState};
    use chrono::Utc;

    fn sample_state() -> LastKnownState {
        LastKnownState {
            observation: VehicleObservation::minimal("VIN1", VehicleState::Online, Utc::now()),
            at_home: Some(true),
            charging_ready: true,
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn last_known_state_round_trips() {
        let store = InMemoryStateStore::new();
        assert!(store.get_last_known("VIN1").await.is_none());
        store.put_last_known("VIN1", sample_state()).await;
        assert!(store.get_last_known("VIN1").await.is_some());
    }

    #[tokio::test]
    async fn reset_clears_monitoring_but_not_sessions() {
        let store = InMemoryStateStore::new();
        store.put_last_known("VIN1", sample_state()).await;
        store
            .put_monitoring_case(
                "VIN1",
                MonitoringCase {
                    case_id: "case_1".to_string(),
                    vin: "VIN1".to_string(),
                    start_time: Utc::now(),
                    state: MonitoringCaseState::WaitingForOffline,
                    last_battery_percent: None,
                    last_check_time: None,
                },
            )
            .await;
        store.put_plan_hash("VIN1", "deadbeef".to_string()).await;

        store.reset_monitoring_state().await;

        assert!(store.get_last_known("VIN1").await.is_none());
        assert!(store.get_monitoring_case("VIN1").await.is_none());
        assert!(store.get_plan_hash("VIN1").await.is_some());
    }
}

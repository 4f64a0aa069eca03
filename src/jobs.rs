//! Creates, looks up, and deletes single-fire future jobs in the external
//! cron invoker, with idempotent replace semantics keyed by deterministic
//! job name. The concrete cron invoker is abstracted behind a trait; the
//! HTTP implementation hits a generic cron-invoker REST shape.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::model::{JobAuth, OneShotJob};

#[async_trait]
pub trait JobRegistrar: Send + Sync {
    /// Create or replace a named one-shot job. Replace semantics: if a job
    /// with this `name` exists, delete it first, wait ~1s, then create —
    /// re-registration produces exactly one job with the latest parameters.
    async fn register(
        &self,
        name: &str,
        trigger_time_local: DateTime<Utc>,
        endpoint: &str,
        payload: Value,
        auth: JobAuth,
    ) -> anyhow::Result<()>;

    /// Best-effort delete; absence of the job is not an error.
    async fn delete(&self, name: &str) -> anyhow::Result<()>;

    async fn exists(&self, name: &str) -> anyhow::Result<bool>;
}

pub struct HttpJobRegistrar {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpJobRegistrar {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        HttpJobRegistrar {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl JobRegistrar for HttpJobRegistrar {
    #[tracing::instrument(skip(self, payload, auth))]
    async fn register(
        &self,
        name: &str,
        trigger_time_local: DateTime<Utc>,
        endpoint: &str,
        payload: Value,
        auth: JobAuth,
    ) -> anyhow::Result<()> {
        if self.exists(name).await? {
            self.delete(name).await?;
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }

        let job = OneShotJob {
            name: name.to_string(),
            trigger_time_local,
            endpoint: endpoint.to_string(),
            payload,
            auth,
        };

        self.client
            .post(format!("{}/jobs", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&job)
            .timeout(std::time::Duration::from_secs(20))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn delete(&self, name: &str) -> anyhow::Result<()> {
        let resp = self
            .client
            .delete(format!("{}/jobs/{}", self.base_url, name))
            .bearer_auth(&self.api_key)
            .timeout(std::time::Duration::from_secs(20))
            .send()
            .await?;
        // Best-effort: a 404 is not an error, the job is simply already gone.
        if !resp.status().is_success() && resp.status() != reqwest::StatusCode::NOT_FOUND {
            resp.error_for_status()?;
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn exists(&self, name: &str) -> anyhow::Result<bool> {
        let resp = self
            .client
            .get(format!("{}/jobs/{}", self.base_url, name))
            .bearer_auth(&self.api_key)
            .timeout(std::time::Duration::from_secs(20))
            .send()
            .await?;
        Ok(resp.status().is_success())
    }
}

/// In-memory registrar used by tests and by the `special` module's unit
/// tests, so the planner logic can be exercised without a real cron
/// invoker.
#[derive(Default)]
pub struct InMemoryJobRegistrar {
    jobs: tokio::sync::RwLock<std::collections::HashMap<String, OneShotJob>>,
}

impl InMemoryJobRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn registered(&self) -> Vec<OneShotJob> {
        self.jobs.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl JobRegistrar for InMemoryJobRegistrar {
    async fn register(
        &self,
        name: &str,
        trigger_time_local: DateTime<Utc>,
        endpoint: &str,
        payload: Value,
        auth: JobAuth,
    ) -> anyhow::Result<()> {
        let job = OneShotJob {
            name: name.to_string(),
            trigger_time_local,
            endpoint: endpoint.to_string(),
            payload,
            auth,
        };
        self.jobs.write().await.insert(name.to_string(), job);
        Ok(())
    }

    async fn delete(&self, name: &str) -> anyhow::Result<()> {
        self.jobs.write().await.remove(name);
        Ok(())
    }

    async fn exists(&self, name: &str) -> anyhow::Result<bool> {
        Ok(self.jobs.read().await.contains_key(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth() -> JobAuth {
        JobAuth {
            identity_token_audience: "worker-dispatcher".to_string(),
        }
    }

    #[tokio::test]
    async fn register_replaces_in_place() {
        let registrar = InMemoryJobRegistrar::new();
        let t1 = Utc::now();
        let t2 = t1 + chrono::Duration::hours(1);

        registrar
            .register("special-charging-s1", t1, "/send-special-schedule", serde_json::json!({}), auth())
            .await
            .unwrap();
        registrar
            .register("special-charging-s1", t2, "/send-special-schedule", serde_json::json!({}), auth())
            .await
            .unwrap();

        let jobs = registrar.registered().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].trigger_time_local, t2);
    }

    #[tokio::test]
    async fn delete_is_best_effort_on_missing_job() {
        let registrar = InMemoryJobRegistrar::new();
        assert!(registrar.delete("does-not-exist").await.is_ok());
    }
}

//! Off-peak pricing/plan client used by the off-peak reconciler. Speaks a
//! `{success, data:{summary, chargingSchedule:[{start_time, end_time, charge_amount}]}}`
//! wire shape, with slot boundaries as ISO-8601 instants.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::Deserialize;

use crate::error::PlannerError;
use crate::model::{OffPeakPlan, PlanSlot};

#[async_trait]
pub trait PlanClient: Send + Sync {
    /// Requests the next off-peak charging plan for `vin`, local to
    /// `timezone`. Returns `Ok(None)` when the planner explicitly reports no
    /// plan is available today (distinct from a transport/HTTP failure).
    async fn fetch_plan(
        &self,
        vin: &str,
        date: NaiveDate,
        timezone: &Tz,
    ) -> Result<Option<OffPeakPlan>, PlannerError>;
}

#[derive(Deserialize, Debug)]
struct PlanResponseWire {
    success: bool,
    #[serde(default)]
    data: Option<PlanDataWire>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize, Debug)]
struct PlanDataWire {
    #[serde(default)]
    summary: Option<PlanSummaryWire>,
    #[serde(rename = "chargingSchedule", default)]
    charging_schedule: Vec<ScheduleEntryWire>,
}

#[derive(Deserialize, Debug)]
struct PlanSummaryWire {
    #[serde(rename = "scheduledSlots", default)]
    scheduled_slots: Option<u32>,
    #[serde(rename = "totalEnergy", default)]
    total_energy: Option<f64>,
    #[serde(rename = "totalCost", default)]
    total_cost: Option<f64>,
    #[serde(rename = "averagePrice", default)]
    average_price: Option<f64>,
}

#[derive(Deserialize, Debug)]
struct ScheduleEntryWire {
    start_time: String,
    end_time: String,
    charge_amount: f64,
    #[serde(default)]
    cost: f64,
    #[serde(default = "default_day")]
    day: String,
}

fn default_day() -> String {
    "all".to_string()
}

pub struct HttpPlanClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpPlanClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        HttpPlanClient {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn parse_instant(&self, s: &str) -> Result<DateTime<Utc>, PlannerError> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| PlannerError::Unavailable(format!("bad ISO-8601 instant {:?}: {}", s, e)))
    }
}

#[async_trait]
impl PlanClient for HttpPlanClient {
    #[tracing::instrument(skip(self))]
    async fn fetch_plan(
        &self,
        vin: &str,
        date: NaiveDate,
        _timezone: &Tz,
    ) -> Result<Option<OffPeakPlan>, PlannerError> {
        let resp = self
            .client
            .get(format!("{}/plan", self.base_url))
            .bearer_auth(&self.api_key)
            .query(&[("vin", vin), ("date", &date.format("%Y-%m-%d").to_string())])
            .timeout(std::time::Duration::from_secs(20))
            .send()
            .await
            .map_err(|e| PlannerError::Unavailable(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::GATEWAY_TIMEOUT {
            return Err(PlannerError::Timeout);
        }

        let wire: PlanResponseWire = resp
            .json()
            .await
            .map_err(|e| PlannerError::Unavailable(e.to_string()))?;

        if !wire.success {
            return Err(PlannerError::Unavailable(
                wire.message.unwrap_or_else(|| "planner reported failure".to_string()),
            ));
        }

        let Some(data) = wire.data else {
            return Ok(None);
        };
        if data.charging_schedule.is_empty() {
            return Ok(None);
        }

        let mut slots = Vec::with_capacity(data.charging_schedule.len());
        for entry in &data.charging_schedule {
            slots.push(PlanSlot {
                start_local_time: self.parse_instant(&entry.start_time)?,
                end_local_time: self.parse_instant(&entry.end_time)?,
                energy_kwh: entry.charge_amount,
                cost: entry.cost,
                day: entry.day.clone(),
            });
        }

        Ok(Some(OffPeakPlan { slots }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_entry_parses_iso8601_instant() {
        let client = HttpPlanClient::new("https://example.invalid", "key");
        let tz: Tz = "America/Los_Angeles".parse().unwrap();
        let parsed = client.parse_instant("2026-07-28T13:00:00-07:00").unwrap();
        assert_eq!(parsed.with_timezone(&tz).format("%H:%M").to_string(), "13:00");
    }

    #[test]
    fn plan_response_with_full_summary_object_deserializes() {
        let body = r#"{
            "success": true,
            "data": {
                "summary": {
                    "scheduledSlots": 2,
                    "totalEnergy": 22.0,
                    "totalCost": 3.5,
                    "averagePrice": 0.16
                },
                "chargingSchedule": [
                    {
                        "start_time": "2026-07-28T13:00:00-07:00",
                        "end_time": "2026-07-28T15:00:00-07:00",
                        "charge_amount": 22.0,
                        "cost": 3.5
                    }
                ]
            }
        }"#;
        let wire: PlanResponseWire = serde_json::from_str(body).unwrap();
        assert!(wire.success);
        let data = wire.data.unwrap();
        let summary = data.summary.unwrap();
        assert_eq!(summary.scheduled_slots, Some(2));
        assert_eq!(data.charging_schedule.len(), 1);
        assert_eq!(data.charging_schedule[0].charge_amount, 22.0);
    }
}

//! Spreadsheet collaborator client for the special-charging planner. The
//! row wire contract is consumed behind a trait — the concrete vendor API
//! (e.g. Google Sheets) sits behind it in production; the HTTP
//! implementation here hits a generic JSON endpoint.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone};
use chrono_tz::Tz;
use serde::Deserialize;

use crate::error::SheetRowMalformed;

/// A parsed, validated "special charging need" read from row `row`.
#[derive(Debug, Clone, PartialEq)]
pub struct SpecialChargingNeed {
    pub row: u32,
    pub target_datetime: DateTime<chrono::Utc>,
    pub target_percent: u32,
    pub description: Option<String>,
}

#[async_trait]
pub trait SpreadsheetClient: Send + Sync {
    /// Rows with `Status = "ACTIVE"`, a parseable future `date + time`, and
    /// `target% in [50,100]`. Malformed rows are reported individually
    /// rather than aborting the whole fetch.
    async fn fetch_needs(
        &self,
        tz: &Tz,
        now: DateTime<chrono::Utc>,
    ) -> anyhow::Result<(Vec<SpecialChargingNeed>, Vec<SheetRowMalformed>)>;
}

#[derive(Deserialize, Debug)]
struct RowWire {
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "Data")]
    date: String,
    #[serde(rename = "Godzina")]
    time: String,
    #[serde(rename = "Docelowy %")]
    target_percent: i64,
    #[serde(rename = "Description", default)]
    description: Option<String>,
    /// 1-based row index (header = row 1), carried by the sheet API
    /// alongside the cell values.
    #[serde(rename = "_row")]
    row: u32,
}

pub struct HttpSheetClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpSheetClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        HttpSheetClient {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn parse_row(
        &self,
        row: RowWire,
        tz: &Tz,
        now: DateTime<chrono::Utc>,
    ) -> Result<Option<SpecialChargingNeed>, SheetRowMalformed> {
        if row.status != "ACTIVE" {
            return Ok(None);
        }

        let date = NaiveDate::parse_from_str(&row.date, "%Y-%m-%d").map_err(|e| SheetRowMalformed {
            row: row.row,
            reason: format!("unparseable date {:?}: {}", row.date, e),
        })?;
        let time = NaiveTime::parse_from_str(&row.time, "%H:%M").map_err(|e| SheetRowMalformed {
            row: row.row,
            reason: format!("unparseable time {:?}: {}", row.time, e),
        })?;
        let local = tz
            .from_local_datetime(&date.and_time(time))
            .single()
            .ok_or_else(|| SheetRowMalformed {
                row: row.row,
                reason: format!("ambiguous or nonexistent local time {} {}", row.date, row.time),
            })?;
        let target_dt = local.with_timezone(&chrono::Utc);

        if target_dt <= now {
            return Ok(None);
        }

        if !(50..=100).contains(&row.target_percent) {
            return Err(SheetRowMalformed {
                row: row.row,
                reason: format!("target percent {} out of range [50,100]", row.target_percent),
            });
        }

        Ok(Some(SpecialChargingNeed {
            row: row.row,
            target_datetime: target_dt,
            target_percent: row.target_percent as u32,
            description: row.description,
        }))
    }
}

#[async_trait]
impl SpreadsheetClient for HttpSheetClient {
    #[tracing::instrument(skip(self))]
    async fn fetch_needs(
        &self,
        tz: &Tz,
        now: DateTime<chrono::Utc>,
    ) -> anyhow::Result<(Vec<SpecialChargingNeed>, Vec<SheetRowMalformed>)> {
        let rows: Vec<RowWire> = self
            .client
            .get(format!("{}/rows", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(std::time::Duration::from_secs(20))
            .send()
            .await?
            .json()
            .await?;

        let mut needs = Vec::new();
        let mut malformed = Vec::new();
        for row in rows {
            match self.parse_row(row, tz, now) {
                Ok(Some(need)) => needs.push(need),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(row = e.row, reason = %e.reason, "skipping malformed special-charging row");
                    malformed.push(e);
                }
            }
        }
        Ok((needs, malformed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> HttpSheetClient {
        HttpSheetClient::new("https://example.invalid", "key")
    }

    fn tz() -> Tz {
        "America/Los_Angeles".parse().unwrap()
    }

    #[test]
    fn parses_valid_future_row() {
        let now = chrono::Utc::now();
        let future = (now + chrono::Duration::days(1)).with_timezone(&tz());
        let row = RowWire {
            status: "ACTIVE".to_string(),
            date: future.format("%Y-%m-%d").to_string(),
            time: future.format("%H:%M").to_string(),
            target_percent: 85,
            description: None,
            row: 3,
        };
        let need = client().parse_row(row, &tz(), now).unwrap().unwrap();
        assert_eq!(need.target_percent, 85);
        assert_eq!(need.row, 3);
    }

    #[test]
    fn rejects_out_of_range_target() {
        let now = chrono::Utc::now();
        let future = (now + chrono::Duration::days(1)).with_timezone(&tz());
        let row = RowWire {
            status: "ACTIVE".to_string(),
            date: future.format("%Y-%m-%d").to_string(),
            time: future.format("%H:%M").to_string(),
            target_percent: 30,
            description: None,
            row: 5,
        };
        let err = client().parse_row(row, &tz(), now).unwrap_err();
        assert_eq!(err.row, 5);
    }

    #[test]
    fn skips_inactive_rows() {
        let now = chrono::Utc::now();
        let row = RowWire {
            status: "DONE".to_string(),
            date: "2020-01-01".to_string(),
            time: "08:00".to_string(),
            target_percent: 80,
            description: None,
            row: 2,
        };
        assert!(client().parse_row(row, &tz(), now).unwrap().is_none());
    }

    #[test]
    fn rejects_malformed_date() {
        let now = chrono::Utc::now();
        let row = RowWire {
            status: "ACTIVE".to_string(),
            date: "not-a-date".to_string(),
            time: "08:00".to_string(),
            target_percent: 80,
            description: None,
            row: 7,
        };
        assert!(client().parse_row(row, &tz(), now).is_err());
    }
}

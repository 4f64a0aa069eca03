//! Thin capability wrapper over the vehicle cloud API: list vehicles, read
//! state, wake, and issue charge commands.
//!
//! Unlike a single-vehicle handle built once from a login, every call here
//! takes the current access token explicitly — the token manager owns the
//! credential lifecycle, this gateway is stateless with respect to auth.

use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::Deserialize;

use crate::error::GatewayError;
use crate::model::{ChargeSchedule, VehicleObservation, VehicleState};

use super::auth::TokenExchange;
use super::schedule::ChargeScheduleWire;
use super::BASE_URL;

#[derive(Deserialize, Debug, Clone)]
pub struct VehicleDataWire {
    pub id: u64,
    pub vehicle_id: u64,
    pub vin: String,
    pub state: String,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct ChargeStateWire {
    pub battery_level: Option<u32>,
    pub charging_state: Option<String>,
    pub conn_charge_cable: Option<String>,
    pub charge_limit_soc: Option<u32>,
}

#[derive(Deserialize, Debug, Clone, Default)]
struct DriveStateWire {
    latitude: Option<f64>,
    longitude: Option<f64>,
}

#[derive(Deserialize, Debug, Clone, Default)]
struct ChargeScheduleDataWire {
    #[serde(default)]
    charge_schedules: Vec<ChargeScheduleWire>,
}

#[derive(Deserialize, Debug, Clone, Default)]
struct VehicleDataFullWire {
    state: String,
    #[serde(default)]
    charge_state: ChargeStateWire,
    #[serde(default)]
    drive_state: DriveStateWire,
    #[serde(default)]
    charge_schedule_data: ChargeScheduleDataWire,
}

fn parse_state(s: &str) -> VehicleState {
    match s {
        "online" => VehicleState::Online,
        "asleep" => VehicleState::Asleep,
        _ => VehicleState::Offline,
    }
}

#[derive(Deserialize, Debug)]
struct CommandResponse {
    result: bool,
    #[serde(default)]
    reason: String,
}

#[derive(Deserialize)]
struct Envelope<T> {
    response: T,
}

/// Maps the vehicle-cloud API's HTTP status onto the named error kinds so
/// callers can `match` on `AuthExpired`/`AuthForbidden` and retry
/// accordingly, rather than surfacing a generic JSON-decode failure.
async fn envelope<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T, GatewayError> {
    match resp.status().as_u16() {
        401 => Err(GatewayError::AuthExpired),
        403 => {
            let body = resp.text().await.unwrap_or_default();
            Err(GatewayError::AuthForbidden(body))
        }
        200..=299 => Ok(resp.json::<Envelope<T>>().await?.response),
        other => {
            let body = resp.text().await.unwrap_or_default();
            Err(GatewayError::CommandRejected(format!("http {}: {}", other, body)))
        }
    }
}

/// The thin wrapper itself. Holds no token state; caches the vin ->
/// numeric-id mapping learned from `list_vehicles` the same way a
/// long-lived Worker process would, since every vehicle-cloud command is
/// addressed by numeric id on the wire but by VIN at this surface.
pub struct VehicleGateway {
    user_agent: String,
    vehicle_ids: DashMap<String, u64>,
}

impl VehicleGateway {
    pub fn new(user_agent: impl Into<String>) -> Self {
        VehicleGateway {
            user_agent: user_agent.into(),
            vehicle_ids: DashMap::new(),
        }
    }

    fn client(&self, token: &str) -> reqwest::Client {
        TokenExchange::authenticated_client(token, &self.user_agent)
    }

    /// A client routed through the local signing proxy: TLS trust is
    /// disabled since the proxy's certificate is self-signed.
    fn signed_client(&self, token: &str) -> reqwest::Client {
        use reqwest::header;
        let mut headers = header::HeaderMap::new();
        let mut auth_value =
            header::HeaderValue::from_str(&format!("Bearer {}", token)).unwrap();
        auth_value.set_sensitive(true);
        headers.insert(header::AUTHORIZATION, auth_value);

        reqwest::Client::builder()
            .user_agent(&self.user_agent)
            .default_headers(headers)
            .danger_accept_invalid_certs(true)
            .build()
            .unwrap()
    }

    #[tracing::instrument(skip(self, token))]
    pub async fn list_vehicles(&self, token: &str) -> Result<Vec<VehicleDataWire>, GatewayError> {
        let body: Vec<VehicleDataWire> = envelope(
            self.client(token)
                .get(format!("{}/api/1/vehicles", BASE_URL))
                .send()
                .await?,
        )
        .await?;

        for v in &body {
            self.vehicle_ids.insert(v.vin.clone(), v.id);
        }
        Ok(body)
    }

    async fn resolve_id(&self, token: &str, vin: &str) -> Result<u64, GatewayError> {
        if let Some(id) = self.vehicle_ids.get(vin) {
            return Ok(*id);
        }
        self.list_vehicles(token).await?;
        self.vehicle_ids
            .get(vin)
            .map(|r| *r)
            .ok_or_else(|| GatewayError::CommandRejected(format!("unknown vin {}", vin)))
    }

    /// Cheap read: only `{vin, state, observed_at}`. Never wakes the
    /// vehicle — this is the call Scout uses for every sample.
    #[tracing::instrument(skip(self, token))]
    pub async fn read_state(&self, token: &str, vin: &str) -> Result<VehicleObservation, GatewayError> {
        let id = self.resolve_id(token, vin).await?;
        let data: VehicleDataWire = envelope(
            self.client(token)
                .get(format!("{}/api/1/vehicles/{}", BASE_URL, id))
                .send()
                .await?,
        )
        .await?;

        Ok(VehicleObservation::minimal(
            vin.to_string(),
            parse_state(&data.state),
            Utc::now(),
        ))
    }

    /// Battery, location and charge fields. Fails with `VehicleOffline`
    /// instead of waking when the vehicle isn't already online.
    #[tracing::instrument(skip(self, token))]
    pub async fn read_full(&self, token: &str, vin: &str) -> Result<VehicleObservation, GatewayError> {
        let cheap = self.read_state(token, vin).await?;
        if cheap.state != VehicleState::Online {
            return Err(GatewayError::VehicleOffline(vin.to_string()));
        }

        let id = self.resolve_id(token, vin).await?;
        let data: VehicleDataFullWire = envelope(
            self.client(token)
                .get(format!("{}/api/1/vehicles/{}/vehicle_data", BASE_URL, id))
                .send()
                .await?,
        )
        .await?;

        Ok(VehicleObservation {
            vin: vin.to_string(),
            state: parse_state(&data.state),
            battery_percent: data.charge_state.battery_level,
            charging_state: data.charge_state.charging_state,
            conn_cable: data.charge_state.conn_charge_cable,
            lat: data.drive_state.latitude,
            lon: data.drive_state.longitude,
            observed_at: Utc::now(),
        })
    }

    /// Reads the vehicle's current charge state, including the active
    /// charge limit — used by the special-charging planner to decide
    /// whether the charge limit needs raising before a session, and to
    /// read back `final_battery_level` during cleanup. Fails with
    /// `VehicleOffline` rather than waking, same guarantee as `read_full`.
    #[tracing::instrument(skip(self, token))]
    pub async fn read_charge_state(&self, token: &str, vin: &str) -> Result<ChargeStateWire, GatewayError> {
        let cheap = self.read_state(token, vin).await?;
        if cheap.state != VehicleState::Online {
            return Err(GatewayError::VehicleOffline(vin.to_string()));
        }

        let id = self.resolve_id(token, vin).await?;
        let data: VehicleDataFullWire = envelope(
            self.client(token)
                .get(format!("{}/api/1/vehicles/{}/vehicle_data", BASE_URL, id))
                .send()
                .await?,
        )
        .await?;

        Ok(data.charge_state)
    }

    /// Explicitly wakes the vehicle, polling readiness once per second for
    /// up to 30s. Routes the wake command through the signing proxy when
    /// `use_signed` is set and a proxy base URL is supplied; Scout never
    /// calls this.
    #[tracing::instrument(skip(self, token))]
    pub async fn wake(
        &self,
        token: &str,
        vin: &str,
        use_signed: bool,
        proxy_base_url: Option<&str>,
    ) -> Result<(), GatewayError> {
        let id = self.resolve_id(token, vin).await?;
        let (client, base) = self.route(token, use_signed, proxy_base_url)?;

        let waker = async {
            loop {
                let data: VehicleDataWire = envelope(
                    client
                        .post(format!("{}/api/1/vehicles/{}/wake_up", base, id))
                        .send()
                        .await?,
                )
                .await?;
                if data.state == "online" {
                    return Ok::<(), GatewayError>(());
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        };

        tokio::time::timeout(Duration::from_secs(30), waker)
            .await
            .map_err(|_| GatewayError::VehicleAsleep(vin.to_string()))??;
        Ok(())
    }

    fn route(
        &self,
        token: &str,
        use_signed: bool,
        proxy_base_url: Option<&str>,
    ) -> Result<(reqwest::Client, String), GatewayError> {
        if use_signed {
            let base = proxy_base_url.ok_or(GatewayError::ProxyRequired)?;
            Ok((self.signed_client(token), base.to_string()))
        } else {
            Ok((self.client(token), BASE_URL.to_string()))
        }
    }

    /// Every *signed* command shares this guard: refuse unless a proxy base
    /// URL was supplied, or the caller explicitly opts into unsigned
    /// degradation.
    fn signed_route(
        &self,
        token: &str,
        proxy_base_url: Option<&str>,
        allow_unsigned: bool,
    ) -> Result<(reqwest::Client, String), GatewayError> {
        match proxy_base_url {
            Some(base) => Ok((self.signed_client(token), base.to_string())),
            None if allow_unsigned => Ok((self.client(token), BASE_URL.to_string())),
            None => Err(GatewayError::ProxyRequired),
        }
    }

    #[tracing::instrument(skip(self, token))]
    pub async fn set_charge_limit(
        &self,
        token: &str,
        vin: &str,
        percent: u32,
        proxy_base_url: Option<&str>,
        allow_unsigned: bool,
    ) -> Result<(), GatewayError> {
        let id = self.resolve_id(token, vin).await?;
        let (client, base) = self.signed_route(token, proxy_base_url, allow_unsigned)?;

        let body = serde_json::json!({ "percent": percent });
        let response: CommandResponse = envelope(
            client
                .post(format!("{}/api/1/vehicles/{}/command/set_charge_limit", base, id))
                .json(&body)
                .send()
                .await?,
        )
        .await?;

        if response.result {
            Ok(())
        } else {
            Err(GatewayError::CommandRejected(response.reason))
        }
    }

    #[tracing::instrument(skip(self, token, schedule))]
    pub async fn add_schedule(
        &self,
        token: &str,
        vin: &str,
        schedule: &ChargeSchedule,
        proxy_base_url: Option<&str>,
        allow_unsigned: bool,
    ) -> Result<(), GatewayError> {
        let id = self.resolve_id(token, vin).await?;
        let (client, base) = self.signed_route(token, proxy_base_url, allow_unsigned)?;

        let wire = ChargeScheduleWire::from_domain(schedule);
        let response: CommandResponse = envelope(
            client
                .post(format!(
                    "{}/api/1/vehicles/{}/command/add_charge_schedule",
                    base, id
                ))
                .json(&wire)
                .send()
                .await?,
        )
        .await?;

        if response.result {
            Ok(())
        } else {
            Err(GatewayError::CommandRejected(response.reason))
        }
    }

    #[tracing::instrument(skip(self, token))]
    pub async fn remove_schedule(
        &self,
        token: &str,
        vin: &str,
        id_to_remove: u64,
        proxy_base_url: Option<&str>,
        allow_unsigned: bool,
    ) -> Result<(), GatewayError> {
        let id = self.resolve_id(token, vin).await?;
        let (client, base) = self.signed_route(token, proxy_base_url, allow_unsigned)?;

        let body = serde_json::json!({ "id": id_to_remove });
        let response: CommandResponse = envelope(
            client
                .post(format!(
                    "{}/api/1/vehicles/{}/command/remove_charge_schedule",
                    base, id
                ))
                .json(&body)
                .send()
                .await?,
        )
        .await?;

        if response.result {
            Ok(())
        } else {
            Err(GatewayError::CommandRejected(response.reason))
        }
    }

    #[tracing::instrument(skip(self, token))]
    pub async fn list_schedules(
        &self,
        token: &str,
        vin: &str,
    ) -> Result<Vec<ChargeSchedule>, GatewayError> {
        let id = self.resolve_id(token, vin).await?;
        let data: VehicleDataFullWire = envelope(
            self.client(token)
                .get(format!("{}/api/1/vehicles/{}/vehicle_data", BASE_URL, id))
                .send()
                .await?,
        )
        .await?;

        Ok(data
            .charge_schedule_data
            .charge_schedules
            .iter()
            .map(ChargeScheduleWire::to_domain)
            .collect())
    }

    /// "Charge-now" optimisation. Signed; used only when the accepted
    /// off-peak plan already covers the current minute.
    #[tracing::instrument(skip(self, token))]
    pub async fn charge_start(
        &self,
        token: &str,
        vin: &str,
        proxy_base_url: Option<&str>,
        allow_unsigned: bool,
    ) -> Result<(), GatewayError> {
        let id = self.resolve_id(token, vin).await?;
        let (client, base) = self.signed_route(token, proxy_base_url, allow_unsigned)?;

        let response: CommandResponse = envelope(
            client
                .post(format!("{}/api/1/vehicles/{}/command/charge_start", base, id))
                .send()
                .await?,
        )
        .await?;

        if response.result {
            Ok(())
        } else {
            Err(GatewayError::CommandRejected(response.reason))
        }
    }
}

//! Typed configuration, loaded from TOML.
//!
//! A `Validate` trait implemented per-section, `Default` impls so
//! `generate-config` can emit a usable starting point, and a round-trip
//! test.

use anyhow::{anyhow, Error};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

pub trait Validate: Sized {
    fn validate(self) -> Result<Self, Error>;
}

#[derive(Default, Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Config {
    pub home: Home,
    pub vehicle_credentials: VehicleCredentials,
    pub worker: Worker,
    pub charging: Charging,
    pub special: Special,
    pub proxy: Proxy,
    pub pricing: Pricing,
    pub sheet: Sheet,
    pub jobs: Jobs,
    pub storage: Storage,
}

/// Local-filesystem substitutes for the managed collaborators this control
/// plane leaves out of scope (document store, shared secret store). Keeps
/// local file paths in config rather than hard-coding them.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Storage {
    pub state_store_path: String,
    pub token_store_path: String,
    pub scout_rate_limit_path: String,
    pub proxy_tls_dir: String,
    pub proxy_binary_path: String,
}

impl Default for Storage {
    fn default() -> Self {
        Storage {
            state_store_path: "./var/state.json".to_string(),
            token_store_path: "./var/tokens.json".to_string(),
            scout_rate_limit_path: "./var/scout-refresh-requested-at".to_string(),
            proxy_tls_dir: "./var/proxy-tls".to_string(),
            proxy_binary_path: "./signed-command-proxy".to_string(),
        }
    }
}

/// "at home" predicate inputs, and the IANA timezone all local-time and
/// daylight-saving arithmetic is performed in.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Home {
    pub latitude: f64,
    pub longitude: f64,
    pub radius: f64,
    pub timezone: String,
}

impl Default for Home {
    fn default() -> Self {
        Home {
            latitude: 37.7749,
            longitude: -122.4194,
            radius: 0.0015,
            timezone: "America/Los_Angeles".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub struct VehicleCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    /// This is a single-vehicle control plane; the VIN it manages is
    /// pinned in config rather than re-discovered via `list_vehicles` on
    /// every cycle.
    pub vin: String,
}

impl Default for VehicleCredentials {
    fn default() -> Self {
        VehicleCredentials {
            client_id: "your_vehicle_api_client_id".to_string(),
            client_secret: "your_vehicle_api_client_secret".to_string(),
            refresh_token: "your_vehicle_api_refresh_token".to_string(),
            vin: "5YJ30000000000000".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Worker {
    /// Scout -> worker base URL.
    pub worker_service_url: String,
    /// Scheduler-driven (default) or continuous.
    pub continuous_mode: bool,
}

impl Default for Worker {
    fn default() -> Self {
        Worker {
            worker_service_url: "https://worker.example.internal".to_string(),
            continuous_mode: false,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Charging {
    pub battery_capacity_kwh: f64,
    pub charging_rate_kw: f64,
    /// Gated, best-effort, off by default.
    pub enable_charge_now_optimisation: bool,
    /// Fallback plan business decision, overridable.
    pub fallback_plan_start: NaiveTime,
    pub fallback_plan_end: NaiveTime,
    pub fallback_plan_energy_kwh: f64,
}

impl Default for Charging {
    fn default() -> Self {
        Charging {
            battery_capacity_kwh: 75.0,
            charging_rate_kw: 11.0,
            enable_charge_now_optimisation: false,
            fallback_plan_start: NaiveTime::from_hms_opt(13, 0, 0).unwrap(),
            fallback_plan_end: NaiveTime::from_hms_opt(15, 0, 0).unwrap(),
            fallback_plan_energy_kwh: 22.0,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Special {
    /// Peak windows avoided by the charging-window search.
    pub peak_hours: Vec<(NaiveTime, NaiveTime)>,
    pub min_advance_hours: f64,
    pub max_advance_hours: f64,
    pub safety_buffer_hours: f64,
}

impl Default for Special {
    fn default() -> Self {
        Special {
            peak_hours: vec![
                (
                    NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
                    NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
                ),
                (
                    NaiveTime::from_hms_opt(19, 0, 0).unwrap(),
                    NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
                ),
            ],
            min_advance_hours: 6.0,
            max_advance_hours: 24.0,
            safety_buffer_hours: 1.5,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Proxy {
    pub smart_proxy_mode: bool,
    pub proxy_available: bool,
    pub proxy_host: String,
    pub proxy_port: u16,
    pub private_key_ready: bool,
    pub private_key_path: String,
}

impl Default for Proxy {
    fn default() -> Self {
        Proxy {
            smart_proxy_mode: true,
            proxy_available: true,
            proxy_host: "127.0.0.1".to_string(),
            proxy_port: 4443,
            private_key_ready: false,
            private_key_path: "./proxy-private-key.pem".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Pricing {
    pub base_url: String,
    pub api_key: String,
}

impl Default for Pricing {
    fn default() -> Self {
        Pricing {
            base_url: "https://pricing.example.internal".to_string(),
            api_key: "your_pricing_api_key".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Sheet {
    pub base_url: String,
    pub api_key: String,
}

impl Default for Sheet {
    fn default() -> Self {
        Sheet {
            base_url: "https://sheet.example.internal".to_string(),
            api_key: "your_sheet_api_key".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Jobs {
    pub base_url: String,
    pub api_key: String,
    pub identity_token_audience: String,
}

impl Default for Jobs {
    fn default() -> Self {
        Jobs {
            base_url: "https://jobs.example.internal".to_string(),
            api_key: "your_job_registrar_api_key".to_string(),
            identity_token_audience: "worker-dispatcher".to_string(),
        }
    }
}

impl Validate for Config {
    fn validate(self) -> Result<Self, Error> {
        Ok(Config {
            home: self.home.validate()?,
            vehicle_credentials: self.vehicle_credentials.validate()?,
            worker: self.worker,
            charging: self.charging.validate()?,
            special: self.special.validate()?,
            proxy: self.proxy,
            pricing: self.pricing,
            sheet: self.sheet,
            jobs: self.jobs,
            storage: self.storage,
        })
    }
}

impl Validate for Home {
    fn validate(self) -> Result<Self, Error> {
        if self.radius <= 0.0 {
            return Err(anyhow!("home radius must be positive, got {}", self.radius));
        }
        Ok(self)
    }
}

impl Validate for VehicleCredentials {
    fn validate(self) -> Result<Self, Error> {
        if self == Self::default() {
            return Err(anyhow!(
                "vehicle credentials must be changed from default values"
            ));
        }
        Ok(self)
    }
}

impl Validate for Charging {
    fn validate(self) -> Result<Self, Error> {
        if self.battery_capacity_kwh <= 0.0 {
            return Err(anyhow!("battery_capacity_kwh must be positive"));
        }
        if self.charging_rate_kw <= 0.0 {
            return Err(anyhow!("charging_rate_kw must be positive"));
        }
        Ok(self)
    }
}

impl Validate for Special {
    fn validate(self) -> Result<Self, Error> {
        if self.min_advance_hours <= 0.0 || self.max_advance_hours <= self.min_advance_hours {
            return Err(anyhow!(
                "min_advance_hours must be positive and less than max_advance_hours"
            ));
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_round_trip() {
        let config = Config::default();

        let tomled = toml::to_string_pretty(&config).unwrap();

        let config2: Config = toml::from_str(&tomled).unwrap();

        assert_eq!(config, config2);
    }

    #[test]
    fn default_credentials_fail_validation() {
        assert!(Config::default().validate().is_err());
    }
}

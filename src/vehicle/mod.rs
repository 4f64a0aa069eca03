//! The thin capability wrapper over the vehicle cloud API, split into
//! `auth` (token exchange), `gateway` (the command surface) and `schedule`
//! (the wire/domain split for charge schedules).

mod auth;
mod gateway;
pub mod schedule;

pub use auth::{expires_at, RefreshResponse, TokenExchange};
pub use gateway::{ChargeStateWire, VehicleDataWire, VehicleGateway};
pub use schedule::ChargeScheduleWire;

pub(crate) static BASE_URL: &str = "https://owner-api.example-vehicle-cloud.com";

//! EV charge control plane: a cheap scout sampler and a full-capability
//! worker dispatcher cooperating over the vehicle gateway, token manager,
//! signed-command proxy, state store, off-peak reconciler, and
//! special-charging planner.
//!
//! See each module for its owning component; `worker` ties them all
//! together behind the axum `AppState` that both binaries' HTTP surfaces
//! are built on (the scout's surface is a thin façade over
//! [`scout::Scout`] directly).

pub mod config;
pub mod error;
pub mod jobs;
pub mod model;
pub mod offpeak;
pub mod pricing;
pub mod proxy;
pub mod scout;
pub mod sheet;
pub mod special;
pub mod state_store;
pub mod time_ext;
pub mod tokens;
pub mod vehicle;
pub mod worker;

pub use config::{Config, Validate};

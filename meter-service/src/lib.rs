pub mod config;
pub mod confirm;
pub mod entry;
pub mod http_api;
pub mod import;
pub mod metrics_server;
pub mod observability;
pub mod projection;
pub mod repository;
pub mod store;
pub mod validation;

pub use store::{MeterState, MeterStore};

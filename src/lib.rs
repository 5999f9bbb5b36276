pub mod client;
pub mod config;
pub mod errors;
pub mod telemetry;
pub mod warehouse;

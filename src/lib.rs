pub mod cache;
pub mod config;
pub mod errors;
pub mod events;
pub mod filter;
pub mod service;
pub mod store;
pub mod telemetry;

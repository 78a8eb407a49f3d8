pub mod config;
pub mod context;
pub mod errors;
pub mod metrics;
pub mod redis;
pub mod shutdown;
pub mod state;
pub mod telemetry;
pub mod time;

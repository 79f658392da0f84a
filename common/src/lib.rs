// Common library for the jobs service: scheduling core, stores, executors
// and the command feed

pub mod bootstrap;
pub mod clock;
pub mod config;
pub mod db;
pub mod errors;
pub mod executor;
pub mod lease;
pub mod models;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod telemetry;
pub mod trigger;

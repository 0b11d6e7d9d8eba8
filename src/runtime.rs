//! Runtime glue: validated configuration, the run table and external
//! surface, and telemetry.

pub mod config;
pub mod manager;
pub mod telemetry;

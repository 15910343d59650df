//! Telemetry data model

pub mod signals;

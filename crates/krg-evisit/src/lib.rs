//! Visitor e-permit core: application lifecycle, security screening, and signed
//! checkpoint permits.

pub mod config;
pub mod error;
pub mod telemetry;
pub mod workflows;

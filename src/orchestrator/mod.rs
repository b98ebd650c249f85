//! Session orchestration: lifecycle, registry, result aggregation, and
//! crash detection.

pub mod aggregator;
pub mod child_monitor;
pub mod registry;
pub mod session;

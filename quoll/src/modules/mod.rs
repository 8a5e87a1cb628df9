//! Collector modules.
//!
//! Each module is a swappable data source behind the core's `Module`
//! contract: a typed config section, one or more polled sensors, and a
//! refresh callback that owns the module's measured state.

pub mod cmd;
pub mod cpu;
pub mod fs;
pub mod mem;
pub mod net;
pub mod sys_info;
pub mod wan;

use quoll_core::ModuleRegistry;
use serde_json::Value;

/// The registry of all collector factories, built before configuration
/// is processed.
pub fn registry() -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    registry.register("cpu", cpu::new);
    registry.register("mem", mem::new);
    registry.register("fs", fs::new);
    registry.register("net", net::new);
    registry.register("wan", wan::new);
    registry.register("sys_info", sys_info::new);
    registry.register("cmd", cmd::new);
    registry
}

/// Entity config maps are written as `json!` object literals.
pub(crate) fn entity_map(value: Value) -> serde_json::Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    }
}

/// Round to two decimals for percent and rate payload fields.
pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

//! Quoll host-monitoring daemon.
//!
//! Polls local system metrics (CPU, memory, filesystems, network
//! interfaces, WAN reachability, system identity, user commands) and
//! publishes them over Zenoh, with discovery announcements for an
//! auto-discovery consumer.

pub mod config;
pub mod daemon;
pub mod modules;

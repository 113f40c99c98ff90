//! Corral - live-stream capture supervisor.
//!
//! Library exposing the supervisor's modules for testing and reuse. The
//! `corral` binary wires them together.

pub mod capture;
pub mod convert;
pub mod resolver;
pub mod roster;
pub mod scheduler;
pub mod store;
pub mod supervisor;
pub mod telemetry;
pub mod watchdog;
pub mod web;

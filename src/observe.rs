//! Per-attempt observability records.
//!
//! The engine emits one [`Observation`] after every attempt; a sink is a
//! write-only collaborator (statistics, dashboards, debugging) and is never
//! consulted for control flow.

use crate::data::Status;
use crate::engine::Phase;
use std::collections::BTreeMap;
use std::time::Duration;

/// What happened during one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub status: Status,
    /// Human-readable rendering of the drawn choices.
    pub representation: String,
    pub runtime: Duration,
    pub draw_time: Duration,
    pub events: Vec<String>,
    pub targets: BTreeMap<String, f64>,
    pub phase: Phase,
}

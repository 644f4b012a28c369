//! The applier's health surface. The applier never surfaces errors to
//! clients directly; its sole user-visible signal is this status.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const HEALTHY: u8 = 0;
const DEGRADED: u8 = 1;
const UNHEALTHY: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl From<u8> for HealthStatus {
    fn from(v: u8) -> Self {
        match v {
            DEGRADED => HealthStatus::Degraded,
            UNHEALTHY => HealthStatus::Unhealthy,
            _ => HealthStatus::Healthy,
        }
    }
}

/// A cheaply cloneable, shared health flag. The applier writes, operators
/// (CLI, RPC health endpoint) read.
#[derive(Clone)]
pub struct Health {
    state: Arc<AtomicU8>,
}

impl Health {
    pub fn new() -> Self {
        Self { state: Arc::new(AtomicU8::new(HEALTHY)) }
    }

    pub fn status(&self) -> HealthStatus {
        HealthStatus::from(self.state.load(Ordering::Relaxed))
    }

    pub fn mark_healthy(&self) {
        self.state.store(HEALTHY, Ordering::Relaxed);
    }

    pub fn mark_degraded(&self) {
        self.state.store(DEGRADED, Ordering::Relaxed);
    }

    pub fn mark_unhealthy(&self) {
        self.state.store(UNHEALTHY, Ordering::Relaxed);
    }
}

impl Default for Health {
    fn default() -> Self {
        Self::new()
    }
}

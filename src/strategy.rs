//! Per-service capacity policy.
//!
//! A strategy is derived from a service's declared concurrency and answers
//! the policy questions the launcher and activator ask: how many instances a
//! fresh pool starts with, whether idle sandboxes may be retired, and how
//! slot accounting works on each sandbox.

use std::time::Duration;

use crate::model::{ConcurrencyMode, ServiceConcurrency};

/// Slots per sandbox when an auto service does not declare
/// `requestsPerInstance`.
pub const DEFAULT_MAX_SLOTS: u32 = 10;

/// Idle window before retirement when an auto service does not declare a
/// scale-down delay.
pub const DEFAULT_SCALE_DOWN_DELAY: Duration = Duration::from_secs(60);

/// Mode-specific capacity policy for one service.
#[derive(Debug, Clone, PartialEq)]
pub enum Strategy {
    /// Always-on: a constant instance count, no scale-down.
    Fixed { num_instances: u32 },
    /// Scale-from-zero: slot-based leases and idle retirement.
    Auto {
        max_slots: u32,
        scale_down_delay: Duration,
    },
}

impl Strategy {
    pub fn for_service(concurrency: &ServiceConcurrency) -> Self {
        match concurrency.mode {
            ConcurrencyMode::Fixed => Strategy::Fixed {
                num_instances: concurrency.num_instances,
            },
            ConcurrencyMode::Auto => Strategy::Auto {
                max_slots: if concurrency.requests_per_instance > 0 {
                    concurrency.requests_per_instance
                } else {
                    DEFAULT_MAX_SLOTS
                },
                scale_down_delay: if concurrency.scale_down_delay.is_zero() {
                    DEFAULT_SCALE_DOWN_DELAY
                } else {
                    concurrency.scale_down_delay
                },
            },
        }
    }

    pub fn is_fixed(&self) -> bool {
        matches!(self, Strategy::Fixed { .. })
    }

    /// Desired instance count for a freshly created pool.
    pub fn initial_instances(&self) -> i64 {
        match self {
            Strategy::Fixed { num_instances } => *num_instances as i64,
            Strategy::Auto { .. } => 0,
        }
    }

    /// Instance count the fixed-instance loop keeps topped up. Zero for auto.
    pub fn fixed_instances(&self) -> u32 {
        match self {
            Strategy::Fixed { num_instances } => *num_instances,
            Strategy::Auto { .. } => 0,
        }
    }

    /// Idle window before a sandbox is retired. Fixed-mode sandboxes are
    /// never retired.
    pub fn scale_down_delay(&self) -> Option<Duration> {
        match self {
            Strategy::Fixed { .. } => None,
            Strategy::Auto { scale_down_delay, .. } => Some(*scale_down_delay),
        }
    }

    /// Slots one sandbox exposes.
    pub fn max_slots(&self) -> u32 {
        match self {
            Strategy::Fixed { .. } => 1,
            Strategy::Auto { max_slots, .. } => *max_slots,
        }
    }

    /// Slots one lease consumes: 20% of the sandbox's slots, at least one.
    pub fn lease_size(&self) -> u32 {
        match self {
            Strategy::Fixed { .. } => 1,
            Strategy::Auto { max_slots, .. } => (max_slots / 5).max(1),
        }
    }

    pub fn new_tracker(&self) -> SlotTracker {
        SlotTracker {
            fixed: self.is_fixed(),
            max: self.max_slots(),
            lease_size: self.lease_size(),
            used: 0,
        }
    }
}

/// Per-sandbox slot accounting.
#[derive(Debug, Clone)]
pub struct SlotTracker {
    fixed: bool,
    max: u32,
    lease_size: u32,
    used: u32,
}

impl SlotTracker {
    /// Whether one more lease fits.
    ///
    /// Fixed-mode sandboxes do their own queuing, so they always have
    /// capacity; scaling is driven by instance count, not slots.
    pub fn has_capacity(&self) -> bool {
        self.fixed || self.used + self.lease_size <= self.max
    }

    /// Consume one lease worth of slots and return its size. For fixed mode
    /// the used counter is advisory and may exceed `max`.
    pub fn acquire_lease(&mut self) -> u32 {
        self.used = self.used.saturating_add(self.lease_size);
        self.lease_size
    }

    pub fn release_lease(&mut self, size: u32) {
        self.used = self.used.saturating_sub(size);
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn is_idle(&self) -> bool {
        self.used == 0
    }
}

//! Capability gate
//!
//! When the platform refuses an operation for lack of permission, retrying it
//! every batch only produces noise. The gate remembers the denial, warns once,
//! and lets a single attempt through every `recheck` interval until a call
//! succeeds again.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::PlatformError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    MoveMembers,
    ManageChannels,
    MuteDeafen,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::MoveMembers => "move_members",
            Capability::ManageChannels => "manage_channels",
            Capability::MuteDeafen => "mute_deafen",
        }
    }
}

#[derive(Debug, Clone)]
struct Denial {
    since: Instant,
    last_try: Instant,
}

pub struct CapabilityGate {
    recheck: Duration,
    denied: HashMap<Capability, Denial>,
}

impl CapabilityGate {
    pub fn new(recheck: Duration) -> Self {
        Self {
            recheck,
            denied: HashMap::new(),
        }
    }

    pub fn is_denied(&self, capability: Capability) -> bool {
        self.denied.contains_key(&capability)
    }

    /// Whether an attempt should be made now. While denied, this returns true
    /// once per recheck interval.
    pub fn allows(&mut self, capability: Capability, now: Instant) -> bool {
        match self.denied.get_mut(&capability) {
            None => true,
            Some(denial) => {
                if now.saturating_duration_since(denial.last_try) >= self.recheck {
                    denial.last_try = now;
                    debug!(capability = capability.as_str(), "Probing denied capability");
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Feed the outcome of a platform call back into the gate.
    pub fn record<T>(&mut self, capability: Capability, result: &Result<T, PlatformError>, now: Instant) {
        match result {
            Ok(_) => self.confirm(capability),
            Err(e) if e.is_permission() => self.deny(capability, e, now),
            Err(_) => {}
        }
    }

    pub fn deny(&mut self, capability: Capability, error: &PlatformError, now: Instant) {
        match self.denied.get_mut(&capability) {
            Some(denial) => denial.last_try = now,
            None => {
                warn!(
                    capability = capability.as_str(),
                    error = %error,
                    recheck_secs = self.recheck.as_secs(),
                    "Capability missing, suppressing attempts until recheck"
                );
                self.denied.insert(
                    capability,
                    Denial {
                        since: now,
                        last_try: now,
                    },
                );
            }
        }
    }

    pub fn confirm(&mut self, capability: Capability) {
        if let Some(denial) = self.denied.remove(&capability) {
            info!(
                capability = capability.as_str(),
                denied_secs = denial.since.elapsed().as_secs(),
                "Capability restored"
            );
        }
    }
}

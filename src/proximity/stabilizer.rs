//! Assignment stabilizer - hysteresis and throttling for member moves
//!
//! Raw cluster membership flickers near group boundaries. A move is only
//! authorized when the entity has been seen in the same cluster for
//! `stability_threshold` consecutive batches, its own last move is at least
//! `min_move_interval` ago, and nobody was moved into that slot within
//! `cluster_cooldown`.
//!
//! Decisions never advance timestamps. The caller reports a move with
//! [`Stabilizer::commit`] once the remote platform accepted it, so a move that
//! failed is simply retried on a later batch.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Stabilizer tuning
#[derive(Debug, Clone)]
pub struct StabilizerConfig {
    /// Consecutive batches in the same cluster before a move is allowed
    pub stability_threshold: u32,
    /// Minimum time between two moves of the same entity
    pub min_move_interval: Duration,
    /// Minimum time between two moves into the same slot
    pub cluster_cooldown: Duration,
    /// Drop records not seen for this long (disabled when `None`)
    pub idle_eviction: Option<Duration>,
}

impl Default for StabilizerConfig {
    fn default() -> Self {
        Self {
            stability_threshold: 3,
            min_move_interval: Duration::from_secs(5),
            cluster_cooldown: Duration::from_secs(5),
            idle_eviction: None,
        }
    }
}

impl StabilizerConfig {
    /// Move on the first batch that shows a new cluster.
    ///
    /// Meant for pre-provisioned channel layouts where slots already exist.
    pub fn fast(mut self) -> Self {
        self.stability_threshold = 1;
        self
    }
}

/// Per-entity hysteresis state
#[derive(Debug, Clone, PartialEq)]
pub struct StabilityRecord {
    pub last_cluster: usize,
    pub stable_count: u32,
    pub last_move: Option<Instant>,
    pub last_seen: Instant,
}

/// Why a move was held back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldReason {
    Unstable { count: u32, needed: u32 },
    EntityCooldown { remaining: Duration },
    SlotCooldown { remaining: Duration },
    /// Another entity already claimed this slot earlier in the same batch
    SlotClaimed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveDecision {
    Allow,
    Hold(HoldReason),
}

impl MoveDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, MoveDecision::Allow)
    }
}

/// One entity's cluster for the current batch
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment<K> {
    pub entity: K,
    pub slot: usize,
    /// False when there is no destination this batch, or the entity is
    /// already there. The observation still counts toward stability.
    pub movable: bool,
}

/// A move the stabilizer authorized for this batch
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedMove<K> {
    pub entity: K,
    pub slot: usize,
}

pub struct Stabilizer<K> {
    config: StabilizerConfig,
    records: HashMap<K, StabilityRecord>,
    /// Last committed move into each slot
    slot_moves: HashMap<usize, Instant>,
}

impl<K: Eq + Hash + Clone + std::fmt::Debug> Stabilizer<K> {
    pub fn new(config: StabilizerConfig) -> Self {
        Self {
            config,
            records: HashMap::new(),
            slot_moves: HashMap::new(),
        }
    }

    pub fn record(&self, entity: &K) -> Option<&StabilityRecord> {
        self.records.get(entity)
    }

    pub fn tracked(&self) -> usize {
        self.records.len()
    }

    /// Observe `entity` in `slot` and decide whether it may move there now.
    pub fn evaluate(&mut self, entity: &K, slot: usize, now: Instant) -> MoveDecision {
        let needed = self.config.stability_threshold;

        let record = self
            .records
            .entry(entity.clone())
            .or_insert(StabilityRecord {
                last_cluster: slot,
                stable_count: 0,
                last_move: None,
                last_seen: now,
            });

        if record.last_cluster == slot {
            record.stable_count = record.stable_count.saturating_add(1);
        } else {
            record.last_cluster = slot;
            record.stable_count = 1;
        }
        record.last_seen = now;

        if record.stable_count < needed {
            return MoveDecision::Hold(HoldReason::Unstable {
                count: record.stable_count,
                needed,
            });
        }

        if let Some(last) = record.last_move {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < self.config.min_move_interval {
                return MoveDecision::Hold(HoldReason::EntityCooldown {
                    remaining: self.config.min_move_interval - elapsed,
                });
            }
        }

        if let Some(last) = self.slot_moves.get(&slot) {
            let elapsed = now.saturating_duration_since(*last);
            if elapsed < self.config.cluster_cooldown {
                return MoveDecision::Hold(HoldReason::SlotCooldown {
                    remaining: self.config.cluster_cooldown - elapsed,
                });
            }
        }

        MoveDecision::Allow
    }

    /// Evaluate a whole batch in order.
    ///
    /// Every assignment is observed. Only movable, allowed assignments are
    /// returned. With a non-zero slot cooldown at most one move per slot is
    /// returned: moves within a batch run concurrently, so the cooldown has
    /// to be enforced here.
    pub fn plan(&mut self, assignments: &[Assignment<K>], now: Instant) -> Vec<PlannedMove<K>> {
        if let Some(max_idle) = self.config.idle_eviction {
            self.evict_idle(now, max_idle);
        }

        let claim_slots = self.config.cluster_cooldown > Duration::ZERO;
        let mut claimed: HashSet<usize> = HashSet::new();
        let mut planned = Vec::new();

        for assignment in assignments {
            let decision = self.evaluate(&assignment.entity, assignment.slot, now);
            if !assignment.movable {
                continue;
            }
            match decision {
                MoveDecision::Allow if !claim_slots || claimed.insert(assignment.slot) => {
                    planned.push(PlannedMove {
                        entity: assignment.entity.clone(),
                        slot: assignment.slot,
                    });
                }
                MoveDecision::Allow => {
                    debug!(entity = ?assignment.entity, slot = assignment.slot, reason = ?HoldReason::SlotClaimed, "Move held");
                }
                MoveDecision::Hold(reason) => {
                    debug!(entity = ?assignment.entity, slot = assignment.slot, ?reason, "Move held");
                }
            }
        }

        planned
    }

    /// Record a move the remote platform accepted.
    pub fn commit(&mut self, entity: &K, slot: usize, now: Instant) {
        if let Some(record) = self.records.get_mut(entity) {
            record.last_move = Some(now);
        }
        self.slot_moves.insert(slot, now);
    }

    /// Drop an entity's run so it starts fresh next time it is seen.
    pub fn forget(&mut self, entity: &K) {
        self.records.remove(entity);
    }

    /// Remove records not seen within `max_idle`. Returns how many were dropped.
    pub fn evict_idle(&mut self, now: Instant, max_idle: Duration) -> usize {
        let before = self.records.len();
        self.records
            .retain(|_, r| now.saturating_duration_since(r.last_seen) < max_idle);
        let evicted = before - self.records.len();
        if evicted > 0 {
            debug!(evicted, "Evicted idle stability records");
        }
        evicted
    }
}

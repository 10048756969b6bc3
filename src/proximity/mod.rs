//! Proximity engine: clustering, channel topology, and move stabilization

pub mod cluster;
pub mod stabilizer;
pub mod topology;

pub use cluster::{cluster, Position};
pub use stabilizer::{
    Assignment, HoldReason, MoveDecision, PlannedMove, StabilityRecord, Stabilizer,
    StabilizerConfig,
};
pub use topology::{ChannelTopology, CleanupScope, SlotHandle, TopologyConfig, TopologyError};

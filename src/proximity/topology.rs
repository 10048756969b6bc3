//! Channel topology manager
//!
//! Maps cluster slots to voice channels named `{prefix}-{index}` (1-based).
//! The platform's channel list is the only source of truth: it is re-read on
//! every call, nothing about channel existence is cached across calls.
//!
//! Missing channels are created in background tasks so a batch never waits
//! on remote creation latency. The task registry is keyed by channel name:
//! at most one creation per name is in flight, finished tasks are collected
//! (and their errors inspected) on the next pass, and a name that failed is
//! not retried before `create_retry` has elapsed.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::platform::{Capability, CapabilityGate, PlatformError, SharedPlatform, VoicePlatform};
use crate::types::ChannelId;

#[derive(Debug, Clone)]
pub struct TopologyConfig {
    /// Channel name prefix, slots are `{prefix}-1`, `{prefix}-2`, ...
    pub prefix: String,
    /// Category new channels should live under
    pub parent: Option<ChannelId>,
    /// Minimum delay before retrying a failed creation of the same name
    pub create_retry: Duration,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            prefix: "Cluster".to_string(),
            parent: None,
            create_retry: Duration::from_secs(30),
        }
    }
}

/// A slot backed by an existing voice channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotHandle {
    /// 1-based slot index
    pub index: usize,
    pub channel: ChannelId,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TopologyError {
    #[error("Failed to list voice channels: {0}")]
    List(#[source] PlatformError),

    #[error("Failed to read voice occupancy: {0}")]
    Occupancy(#[source] PlatformError),

    #[error("Failed to create channel {name}: {source}")]
    Create {
        name: String,
        #[source]
        source: PlatformError,
    },

    #[error("Creation task for {name} aborted: {reason}")]
    TaskFailed { name: String, reason: String },
}

impl TopologyError {
    pub fn platform_error(&self) -> Option<&PlatformError> {
        match self {
            TopologyError::List(e) | TopologyError::Occupancy(e) => Some(e),
            TopologyError::Create { source, .. } => Some(source),
            TopologyError::TaskFailed { .. } => None,
        }
    }
}

/// Which channels a cleanup pass may touch
#[derive(Debug, Clone, Default)]
pub struct CleanupScope {
    /// Only delete channels under this category
    pub parent: Option<ChannelId>,
    /// Never delete these
    pub protected: HashSet<ChannelId>,
}

pub struct ChannelTopology {
    config: TopologyConfig,
    platform: SharedPlatform,
    in_flight: HashMap<String, JoinHandle<Result<ChannelId, TopologyError>>>,
    last_attempt: HashMap<String, Instant>,
}

impl ChannelTopology {
    pub fn new(config: TopologyConfig, platform: SharedPlatform) -> Self {
        Self {
            config,
            platform,
            in_flight: HashMap::new(),
            last_attempt: HashMap::new(),
        }
    }

    pub fn slot_name(&self, index: usize) -> String {
        format!("{}-{}", self.config.prefix, index)
    }

    /// Slot index for a channel name of the form `{prefix}-{n}`, n >= 1
    pub fn slot_index(&self, name: &str) -> Option<usize> {
        let rest = name.strip_prefix(&self.config.prefix)?.strip_prefix('-')?;
        if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        rest.parse().ok().filter(|&n| n >= 1)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_creating(&self, name: &str) -> bool {
        self.in_flight.contains_key(name)
    }

    /// Collect creation tasks that have finished since the last pass.
    pub async fn reap(&mut self, gate: &mut CapabilityGate, now: Instant) {
        let finished: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(name, _)| name.clone())
            .collect();

        for name in finished {
            let Some(handle) = self.in_flight.remove(&name) else {
                continue;
            };
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(TopologyError::TaskFailed {
                    name: name.clone(),
                    reason: e.to_string(),
                }),
            };

            match result {
                Ok(channel) => {
                    info!(name = %name, channel = %channel, "Voice channel created");
                    gate.confirm(Capability::ManageChannels);
                }
                Err(e) => {
                    error!(name = %name, error = %e, "Voice channel unavailable this cycle");
                    if let Some(platform_error) = e.platform_error() {
                        if platform_error.is_permission() {
                            gate.deny(Capability::ManageChannels, platform_error, now);
                        }
                    }
                }
            }
        }
    }

    /// Make sure slots `1..=desired` exist and return the ones usable now.
    ///
    /// Missing slots get a background creation scheduled and are simply
    /// absent from the result until a later call sees the new channel.
    pub async fn ensure_slots(
        &mut self,
        desired: usize,
        gate: &mut CapabilityGate,
        now: Instant,
    ) -> Result<Vec<SlotHandle>, TopologyError> {
        self.reap(gate, now).await;

        let channels = self
            .platform
            .list_voice_channels(Some(&self.config.prefix))
            .await
            .map_err(TopologyError::List)?;

        let mut by_index: BTreeMap<usize, ChannelId> = BTreeMap::new();
        for channel in &channels {
            if let Some(index) = self.slot_index(&channel.name) {
                // Duplicate names: the first one listed wins.
                by_index.entry(index).or_insert(channel.id);
            }
        }
        let reference = by_index.get(&1).copied();

        let mut slots = Vec::with_capacity(desired);
        for index in 1..=desired {
            match by_index.get(&index) {
                Some(&channel) => slots.push(SlotHandle { index, channel }),
                None => self.schedule_create(index, reference, gate, now),
            }
        }

        debug!(desired, available = slots.len(), in_flight = self.in_flight.len(), "Slots ensured");
        Ok(slots)
    }

    fn schedule_create(
        &mut self,
        index: usize,
        reference: Option<ChannelId>,
        gate: &mut CapabilityGate,
        now: Instant,
    ) {
        let name = self.slot_name(index);

        if self.in_flight.contains_key(&name) {
            debug!(name = %name, "Creation already in flight");
            return;
        }
        if let Some(last) = self.last_attempt.get(&name) {
            if now.saturating_duration_since(*last) < self.config.create_retry {
                debug!(name = %name, "Creation retry interval not elapsed");
                return;
            }
        }
        if !gate.allows(Capability::ManageChannels, now) {
            return;
        }

        self.last_attempt.insert(name.clone(), now);
        info!(name = %name, parent = ?self.config.parent, "Scheduling voice channel creation");

        let handle = tokio::spawn(create_with_fallback(
            self.platform.clone(),
            name.clone(),
            self.config.parent,
            reference,
        ));
        self.in_flight.insert(name, handle);
    }

    /// Delete empty slot channels. Returns how many were deleted.
    ///
    /// A channel is deleted only if its name starts with the prefix, it is not
    /// protected, it sits under the scoped category (when one is given), and
    /// nobody is connected to it. A channel that is already gone counts as a
    /// no-op. When occupancy cannot be read, nothing is deleted.
    pub async fn cleanup(
        &self,
        scope: &CleanupScope,
        gate: &mut CapabilityGate,
        now: Instant,
    ) -> Result<usize, TopologyError> {
        let channels = self
            .platform
            .list_voice_channels(Some(&self.config.prefix))
            .await
            .map_err(TopologyError::List)?;
        let occupancy = self
            .platform
            .occupancy()
            .await
            .map_err(TopologyError::Occupancy)?;

        let mut deleted = 0;
        for channel in channels {
            if !channel.name.starts_with(&self.config.prefix)
                || scope.protected.contains(&channel.id)
            {
                continue;
            }
            if let Some(parent) = scope.parent {
                if channel.parent != Some(parent) {
                    continue;
                }
            }
            let occupants = occupancy.get(&channel.id).copied().unwrap_or(0);
            if occupants > 0 {
                debug!(name = %channel.name, occupants, "Keeping occupied channel");
                continue;
            }

            let result = self.platform.delete_channel(channel.id).await;
            gate.record(Capability::ManageChannels, &result, now);
            match result {
                Ok(()) => {
                    info!(name = %channel.name, channel = %channel.id, "Deleted empty cluster channel");
                    deleted += 1;
                }
                Err(PlatformError::NotFound(_)) => {
                    debug!(name = %channel.name, channel = %channel.id, "Channel already deleted");
                }
                Err(e) => {
                    warn!(name = %channel.name, channel = %channel.id, error = %e, "Failed to delete cluster channel");
                    if e.is_permission() {
                        break;
                    }
                }
            }
        }

        Ok(deleted)
    }
}

/// Create `name`, falling back step by step:
/// 1. under the configured category,
/// 2. at guild root, then move it under the category (best effort),
/// 3. as a clone of the reference channel, then move it (best effort).
async fn create_with_fallback(
    platform: SharedPlatform,
    name: String,
    parent: Option<ChannelId>,
    reference: Option<ChannelId>,
) -> Result<ChannelId, TopologyError> {
    if let Some(parent) = parent {
        match platform.create_voice_channel(&name, Some(parent)).await {
            Ok(channel) => return Ok(channel),
            Err(e) => {
                warn!(name = %name, parent = %parent, error = %e, "Create under category failed, trying guild root");
            }
        }
    }

    let mut last_error = match platform.create_voice_channel(&name, None).await {
        Ok(channel) => {
            place(platform.as_ref(), &name, channel, parent).await;
            return Ok(channel);
        }
        Err(e) => e,
    };

    if let Some(source) = reference {
        warn!(name = %name, source = %source, error = %last_error, "Create failed, cloning reference channel");
        match platform.clone_channel(source, &name).await {
            Ok(channel) => {
                place(platform.as_ref(), &name, channel, parent).await;
                return Ok(channel);
            }
            Err(e) => last_error = e,
        }
    }

    Err(TopologyError::Create {
        name,
        source: last_error,
    })
}

async fn place(platform: &dyn VoicePlatform, name: &str, channel: ChannelId, parent: Option<ChannelId>) {
    let Some(parent) = parent else {
        return;
    };
    if let Err(e) = platform.set_channel_parent(channel, parent).await {
        warn!(name, channel = %channel, parent = %parent, error = %e, "Could not move channel into category");
    }
}

//! Event router
//!
//! Owns every piece of mutable bridge state (stabilizer records, topology
//! task registry, capability gate) and handles one event at a time. Callers
//! never share it: [`queue::spawn_router`] moves it into a single task fed by
//! an mpsc queue.

pub mod queue;

use futures::future::join_all;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::events::{is_link_payload, Event, EventError};
use crate::link::{IdentityMap, LinkCodes, LinkFailure, LinkResponse};
use crate::platform::{Capability, CapabilityGate, PlatformError, SharedPlatform, VoicePolicy};
use crate::proximity::{
    cluster, Assignment, ChannelTopology, CleanupScope, Position, Stabilizer, StabilizerConfig,
    TopologyConfig,
};
use crate::types::{ChannelId, MemberId};

pub use queue::{spawn_router, RouterClosed, RouterCommand, RouterHandle};

#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub living_channel: ChannelId,
    pub dead_channel: ChannelId,
    /// Policy applied when a member is moved to the dead channel
    pub dead_policy: VoicePolicy,
    pub clustering_enabled: bool,
    pub radius: f64,
    pub max_clusters: usize,
    pub cleanup_on_round_end: bool,
    pub normalize_on_round_start: bool,
    pub topology: TopologyConfig,
    pub stabilizer: StabilizerConfig,
    pub capability_recheck: Duration,
}

impl RouterSettings {
    pub fn new(living_channel: ChannelId, dead_channel: ChannelId) -> Self {
        Self {
            living_channel,
            dead_channel,
            dead_policy: VoicePolicy::default(),
            clustering_enabled: true,
            radius: 800.0,
            max_clusters: 10,
            cleanup_on_round_end: true,
            normalize_on_round_start: false,
            topology: TopologyConfig::default(),
            stabilizer: StabilizerConfig::default(),
            capability_recheck: Duration::from_secs(60),
        }
    }
}

/// Counters for the remote actions one event caused
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActionReport {
    pub moved: usize,
    pub failed: usize,
    /// Members left alone: not in voice, already in place, or held back
    pub skipped: usize,
    pub deleted: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    Handled(ActionReport),
    Ignored { kind: String },
    Rejected(EventError),
    Link(LinkResponse),
}

pub struct EventRouter {
    settings: RouterSettings,
    platform: SharedPlatform,
    identities: Arc<IdentityMap>,
    codes: Arc<LinkCodes>,
    topology: ChannelTopology,
    stabilizer: Stabilizer<MemberId>,
    capabilities: CapabilityGate,
}

impl EventRouter {
    pub fn new(
        settings: RouterSettings,
        platform: SharedPlatform,
        identities: Arc<IdentityMap>,
        codes: Arc<LinkCodes>,
    ) -> Self {
        let topology = ChannelTopology::new(settings.topology.clone(), platform.clone());
        let stabilizer = Stabilizer::new(settings.stabilizer.clone());
        let capabilities = CapabilityGate::new(settings.capability_recheck);

        Self {
            settings,
            platform,
            identities,
            codes,
            topology,
            stabilizer,
            capabilities,
        }
    }

    pub fn stabilizer(&self) -> &Stabilizer<MemberId> {
        &self.stabilizer
    }

    pub fn capabilities(&self) -> &CapabilityGate {
        &self.capabilities
    }

    pub async fn handle(&mut self, payload: &Value) -> EventOutcome {
        self.handle_at(payload, Instant::now()).await
    }

    /// Handle one raw payload as if received at `now`.
    pub async fn handle_at(&mut self, payload: &Value, now: Instant) -> EventOutcome {
        let event = match Event::decode(payload) {
            Ok(event) => event,
            Err(e) if is_link_payload(payload) => {
                info!(error = %e, "Rejected link attempt");
                return EventOutcome::Link(LinkResponse::failed(LinkFailure::InvalidPayload));
            }
            Err(e) => {
                warn!(error = %e, "Rejected malformed event");
                return EventOutcome::Rejected(e);
            }
        };

        debug!(kind = event.kind(), "Handling event");
        match event {
            Event::PlayerDeath { steamid } => EventOutcome::Handled(self.on_death(&steamid, now).await),
            Event::RoundEnd => EventOutcome::Handled(self.on_round_end(now).await),
            Event::RoundStart => EventOutcome::Handled(self.on_round_start(now).await),
            Event::PositionBatch { samples } => {
                EventOutcome::Handled(self.on_position_batch(&samples, now).await)
            }
            Event::LinkAttempt { steamid, code } => EventOutcome::Link(self.on_link_attempt(&steamid, &code, now)),
            Event::Unknown { kind } => {
                debug!(kind = %kind, "Ignoring unknown event type");
                EventOutcome::Ignored { kind }
            }
        }
    }

    /// Periodic housekeeping between events.
    pub async fn tick(&mut self, now: Instant) {
        self.codes.purge_expired(now);
        self.topology.reap(&mut self.capabilities, now).await;
        if let Some(max_idle) = self.settings.stabilizer.idle_eviction {
            self.stabilizer.evict_idle(now, max_idle);
        }
    }

    async fn on_death(&mut self, steamid: &str, now: Instant) -> ActionReport {
        let Some(member) = self.identities.get(steamid) else {
            debug!(steamid, "Death of unlinked player");
            return ActionReport {
                skipped: 1,
                ..ActionReport::default()
            };
        };

        // A respawned player starts a fresh stability run.
        self.stabilizer.forget(&member);
        let (dead, policy) = (self.settings.dead_channel, self.settings.dead_policy);
        self.relocate_all(&[member], dead, policy, now).await
    }

    async fn on_round_end(&mut self, now: Instant) -> ActionReport {
        let members = self.identities.members();
        let living = self.settings.living_channel;
        let mut report = self.relocate_all(&members, living, VoicePolicy::CLEAR, now).await;

        if self.settings.cleanup_on_round_end {
            report.deleted = self.cleanup(now).await;
        }
        info!(
            members = members.len(),
            moved = report.moved,
            failed = report.failed,
            deleted = report.deleted,
            "Round ended"
        );
        report
    }

    async fn on_round_start(&mut self, now: Instant) -> ActionReport {
        if !self.settings.normalize_on_round_start {
            return ActionReport::default();
        }
        let members = self.identities.members();
        let living = self.settings.living_channel;
        self.relocate_all(&members, living, VoicePolicy::default(), now).await
    }

    async fn cleanup(&mut self, now: Instant) -> usize {
        if !self.capabilities.allows(Capability::ManageChannels, now) {
            return 0;
        }
        let scope = CleanupScope {
            parent: self.settings.topology.parent,
            protected: HashSet::from([self.settings.living_channel, self.settings.dead_channel]),
        };
        match self.topology.cleanup(&scope, &mut self.capabilities, now).await {
            Ok(deleted) => deleted,
            Err(e) => {
                warn!(error = %e, "Cluster channel cleanup failed");
                0
            }
        }
    }

    async fn on_position_batch(&mut self, samples: &[(String, Position)], now: Instant) -> ActionReport {
        let mut report = ActionReport::default();
        if !self.settings.clustering_enabled {
            return report;
        }

        // Linked players only; a repeated player keeps its first slot in the
        // order and its latest position.
        let mut points: Vec<(MemberId, Position)> = Vec::with_capacity(samples.len());
        let mut index: HashMap<MemberId, usize> = HashMap::new();
        for (steamid, position) in samples {
            let Some(member) = self.identities.get(steamid) else {
                continue;
            };
            match index.get(&member) {
                Some(&i) => points[i].1 = *position,
                None => {
                    index.insert(member, points.len());
                    points.push((member, *position));
                }
            }
        }
        if points.is_empty() {
            return report;
        }

        // Members out of voice leave the partition. A member whose lookup
        // failed stays in it, so the other slots do not shift, but is not moved.
        let current = self.voice_channels(points.iter().map(|(m, _)| *m)).await;
        points.retain(|(member, _)| !matches!(current.get(member), Some(None)));
        report.skipped = index.len() - points.len();
        if points.is_empty() {
            return report;
        }

        let clusters = cluster(&points, self.settings.radius, self.settings.max_clusters);
        let slots = match self
            .topology
            .ensure_slots(clusters.len(), &mut self.capabilities, now)
            .await
        {
            Ok(slots) => slots,
            Err(e) => {
                warn!(error = %e, "Cluster channels unavailable");
                Vec::new()
            }
        };
        let destinations: HashMap<usize, ChannelId> =
            slots.iter().map(|slot| (slot.index, slot.channel)).collect();

        let mut assignments = Vec::with_capacity(points.len());
        for (i, members) in clusters.iter().enumerate() {
            let slot = i + 1;
            let destination = destinations.get(&slot).copied();
            for member in members {
                let Some(&channel) = current.get(member) else {
                    report.skipped += 1;
                    continue;
                };
                let in_place = channel == destination;
                assignments.push(Assignment {
                    entity: *member,
                    slot,
                    movable: destination.is_some() && !in_place,
                });
            }
        }

        let planned = self.stabilizer.plan(&assignments, now);
        report.skipped += assignments.len() - planned.len();
        debug!(
            members = assignments.len(),
            clusters = clusters.len(),
            slots = destinations.len(),
            planned = planned.len(),
            "Position batch evaluated"
        );
        if planned.is_empty() {
            return report;
        }
        if !self.capabilities.allows(Capability::MoveMembers, now) {
            report.skipped += planned.len();
            return report;
        }

        let platform = self.platform.clone();
        let results = join_all(planned.iter().filter_map(|mv| {
            let channel = destinations.get(&mv.slot).copied()?;
            let platform = platform.clone();
            let member = mv.entity;
            Some(async move { (member, platform.move_member(member, channel).await) })
        }))
        .await;

        let slot_of: HashMap<MemberId, usize> = planned.iter().map(|mv| (mv.entity, mv.slot)).collect();
        for (member, result) in results {
            self.capabilities.record(Capability::MoveMembers, &result, now);
            match result {
                Ok(()) => {
                    if let Some(&slot) = slot_of.get(&member) {
                        self.stabilizer.commit(&member, slot, now);
                        info!(member = %member, slot, "Moved member to cluster channel");
                    }
                    report.moved += 1;
                }
                Err(e) => {
                    log_failure(member, "move", &e);
                    report.failed += 1;
                }
            }
        }
        report
    }

    fn on_link_attempt(&mut self, steamid: &str, code: &str, now: Instant) -> LinkResponse {
        let member = match self.codes.redeem(code, now) {
            Ok(member) => member,
            Err(e) => {
                info!(steamid, error = %e, "Link attempt failed");
                return LinkResponse::failed(e.into());
            }
        };

        let previous = self.identities.insert(steamid, member);
        if let Err(e) = self.identities.save() {
            error!(steamid, member = %member, error = %e, "Failed to persist identity link");
            match previous {
                Some(previous) => {
                    self.identities.insert(steamid, previous);
                }
                None => {
                    self.identities.remove(steamid);
                }
            }
            return LinkResponse::failed(LinkFailure::Exception);
        }

        info!(steamid, member = %member, "Linked player");
        LinkResponse::linked()
    }

    /// Current voice channel per member. Members whose lookup failed are absent.
    async fn voice_channels(
        &self,
        members: impl Iterator<Item = MemberId>,
    ) -> HashMap<MemberId, Option<ChannelId>> {
        let platform = &self.platform;
        let lookups = join_all(members.map(move |member| async move {
            (member, platform.member_voice_channel(member).await)
        }))
        .await;

        lookups
            .into_iter()
            .filter_map(|(member, result)| match result {
                Ok(channel) => Some((member, channel)),
                Err(e) => {
                    log_failure(member, "voice state lookup", &e);
                    None
                }
            })
            .collect()
    }

    /// Apply `policy` and move every voice-connected member of `members` to
    /// `target`. Members not in voice are skipped, members already there are
    /// not moved.
    async fn relocate_all(
        &mut self,
        members: &[MemberId],
        target: ChannelId,
        policy: VoicePolicy,
        now: Instant,
    ) -> ActionReport {
        let mut report = ActionReport::default();
        let current = self.voice_channels(members.iter().copied()).await;

        let connected: Vec<(MemberId, ChannelId)> = members
            .iter()
            .filter_map(|m| current.get(m).copied().flatten().map(|c| (*m, c)))
            .collect();
        report.skipped = members.len() - connected.len();
        if connected.is_empty() {
            return report;
        }

        let platform = self.platform.clone();

        if !policy.is_empty() && self.capabilities.allows(Capability::MuteDeafen, now) {
            let results = join_all(connected.iter().map(|(member, _)| {
                let platform = platform.clone();
                let member = *member;
                async move { (member, platform.set_voice_policy(member, policy).await) }
            }))
            .await;
            for (member, result) in results {
                self.capabilities.record(Capability::MuteDeafen, &result, now);
                if let Err(e) = result {
                    log_failure(member, "mute/deafen", &e);
                }
            }
        }

        let to_move: Vec<MemberId> = connected
            .iter()
            .filter(|(_, channel)| *channel != target)
            .map(|(member, _)| *member)
            .collect();
        report.skipped += connected.len() - to_move.len();
        if to_move.is_empty() {
            return report;
        }
        if !self.capabilities.allows(Capability::MoveMembers, now) {
            report.skipped += to_move.len();
            return report;
        }

        let results = join_all(to_move.iter().map(|member| {
            let platform = platform.clone();
            let member = *member;
            async move { (member, platform.move_member(member, target).await) }
        }))
        .await;
        for (member, result) in results {
            self.capabilities.record(Capability::MoveMembers, &result, now);
            match result {
                Ok(()) => {
                    debug!(member = %member, channel = %target, "Moved member");
                    report.moved += 1;
                }
                Err(e) => {
                    log_failure(member, "move", &e);
                    report.failed += 1;
                }
            }
        }
        report
    }
}

fn log_failure(member: MemberId, action: &'static str, error: &PlatformError) {
    if error.is_permission() {
        // The capability gate reports these once.
        debug!(member = %member, action, error = %error, "Platform refused action");
    } else {
        warn!(member = %member, action, error = %error, "Platform action failed");
    }
}

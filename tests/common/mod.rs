//! In-memory chat platform for router and topology tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use proximity_bridge::link::{IdentityMap, LinkCodes};
use proximity_bridge::platform::{PlatformError, SharedPlatform, VoiceChannel, VoicePlatform, VoicePolicy};
use proximity_bridge::types::{ChannelId, MemberId};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Move(MemberId, ChannelId),
    Policy(MemberId, VoicePolicy),
    Create { name: String, parent: Option<ChannelId> },
    Clone { source: ChannelId, name: String },
    SetParent(ChannelId, ChannelId),
    Delete(ChannelId),
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub channels: Vec<VoiceChannel>,
    pub voice: HashMap<MemberId, ChannelId>,
    pub policies: HashMap<MemberId, VoicePolicy>,
    pub calls: Vec<Call>,
    pub deny_moves: bool,
    pub deny_create: bool,
    pub deny_create_with_parent: bool,
    /// Members whose voice-state lookup is rate limited
    pub failing_lookups: HashSet<MemberId>,
    /// Occupancy cannot be observed (for example before a gateway sync)
    pub occupancy_unknown: bool,
    next_id: u64,
}

#[derive(Default)]
pub struct FakePlatform {
    state: Mutex<FakeState>,
}

fn denied(what: &str) -> PlatformError {
    PlatformError::PermissionDenied(format!("Missing Permissions ({})", what))
}

impl FakePlatform {
    pub fn new() -> Arc<Self> {
        let platform = Self::default();
        platform.state.lock().unwrap().next_id = 1000;
        Arc::new(platform)
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn add_channel(&self, id: u64, name: &str, parent: Option<u64>) {
        self.with(|s| {
            s.channels.push(VoiceChannel {
                id: ChannelId(id),
                name: name.to_string(),
                parent: parent.map(ChannelId),
            })
        });
    }

    pub fn connect(&self, member: u64, channel: u64) {
        self.with(|s| s.voice.insert(MemberId(member), ChannelId(channel)));
    }

    pub fn channel_of(&self, member: u64) -> Option<ChannelId> {
        self.with(|s| s.voice.get(&MemberId(member)).copied())
    }

    pub fn channel_named(&self, name: &str) -> Option<VoiceChannel> {
        self.with(|s| s.channels.iter().find(|c| c.name == name).cloned())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.with(|s| s.calls.clone())
    }

    pub fn clear_calls(&self) {
        self.with(|s| s.calls.clear());
    }

    pub fn moves(&self) -> Vec<(MemberId, ChannelId)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Move(m, ch) => Some((m, ch)),
                _ => None,
            })
            .collect()
    }

    pub fn creates(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Create { name, .. } => Some(name),
                _ => None,
            })
            .collect()
    }

    pub fn deletes(&self) -> Vec<ChannelId> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Delete(ch) => Some(ch),
                _ => None,
            })
            .collect()
    }

    fn allocate(state: &mut FakeState, name: &str, parent: Option<ChannelId>) -> ChannelId {
        state.next_id += 1;
        let id = ChannelId(state.next_id);
        state.channels.push(VoiceChannel {
            id,
            name: name.to_string(),
            parent,
        });
        id
    }
}

#[async_trait]
impl VoicePlatform for FakePlatform {
    async fn move_member(&self, member: MemberId, channel: ChannelId) -> Result<(), PlatformError> {
        self.with(|s| {
            s.calls.push(Call::Move(member, channel));
            if s.deny_moves {
                return Err(denied("move"));
            }
            if !s.channels.iter().any(|c| c.id == channel) {
                return Err(PlatformError::NotFound(format!("channel {}", channel)));
            }
            match s.voice.get_mut(&member) {
                Some(current) => {
                    *current = channel;
                    Ok(())
                }
                None => Err(PlatformError::Transport("Target user is not connected to voice".to_string())),
            }
        })
    }

    async fn set_voice_policy(&self, member: MemberId, policy: VoicePolicy) -> Result<(), PlatformError> {
        self.with(|s| {
            s.calls.push(Call::Policy(member, policy));
            s.policies.insert(member, policy);
            Ok(())
        })
    }

    async fn create_voice_channel(&self, name: &str, parent: Option<ChannelId>) -> Result<ChannelId, PlatformError> {
        self.with(|s| {
            s.calls.push(Call::Create {
                name: name.to_string(),
                parent,
            });
            if s.deny_create || (parent.is_some() && s.deny_create_with_parent) {
                return Err(denied("create"));
            }
            Ok(Self::allocate(s, name, parent))
        })
    }

    async fn clone_channel(&self, source: ChannelId, name: &str) -> Result<ChannelId, PlatformError> {
        self.with(|s| {
            s.calls.push(Call::Clone {
                source,
                name: name.to_string(),
            });
            let parent = s
                .channels
                .iter()
                .find(|c| c.id == source)
                .map(|c| c.parent)
                .ok_or_else(|| PlatformError::NotFound(format!("channel {}", source)))?;
            Ok(Self::allocate(s, name, parent))
        })
    }

    async fn set_channel_parent(&self, channel: ChannelId, parent: ChannelId) -> Result<(), PlatformError> {
        self.with(|s| {
            s.calls.push(Call::SetParent(channel, parent));
            match s.channels.iter_mut().find(|c| c.id == channel) {
                Some(c) => {
                    c.parent = Some(parent);
                    Ok(())
                }
                None => Err(PlatformError::NotFound(format!("channel {}", channel))),
            }
        })
    }

    async fn delete_channel(&self, channel: ChannelId) -> Result<(), PlatformError> {
        self.with(|s| {
            s.calls.push(Call::Delete(channel));
            let before = s.channels.len();
            s.channels.retain(|c| c.id != channel);
            if s.channels.len() == before {
                Err(PlatformError::NotFound(format!("channel {}", channel)))
            } else {
                Ok(())
            }
        })
    }

    async fn list_voice_channels(&self, prefix: Option<&str>) -> Result<Vec<VoiceChannel>, PlatformError> {
        self.with(|s| {
            Ok(s.channels
                .iter()
                .filter(|c| prefix.map_or(true, |p| c.name.starts_with(p)))
                .cloned()
                .collect())
        })
    }

    async fn occupancy(&self) -> Result<HashMap<ChannelId, usize>, PlatformError> {
        self.with(|s| {
            if s.occupancy_unknown {
                return Err(PlatformError::Unavailable("voice states not synced".to_string()));
            }
            let mut counts = HashMap::new();
            for channel in s.voice.values() {
                *counts.entry(*channel).or_insert(0) += 1;
            }
            Ok(counts)
        })
    }

    async fn member_voice_channel(&self, member: MemberId) -> Result<Option<ChannelId>, PlatformError> {
        self.with(|s| {
            if s.failing_lookups.contains(&member) {
                return Err(PlatformError::RateLimited { retry_after_ms: Some(500) });
            }
            Ok(s.voice.get(&member).copied())
        })
    }
}

pub const LIVING: u64 = 1;
pub const DEAD: u64 = 2;

/// Identity map linking `steamid -> member` for each pair
pub fn identities(links: &[(&str, u64)]) -> Arc<IdentityMap> {
    let map = IdentityMap::in_memory();
    for (steamid, member) in links {
        map.insert(*steamid, MemberId(*member));
    }
    Arc::new(map)
}

pub fn codes() -> Arc<LinkCodes> {
    Arc::new(LinkCodes::new(std::time::Duration::from_secs(600)))
}

pub fn shared(platform: &Arc<FakePlatform>) -> SharedPlatform {
    platform.clone()
}

/// Let background channel-creation tasks run to completion.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// `player_pos_batch` payload from `(steamid, x, y, z)` tuples
pub fn positions(samples: &[(&str, f64, f64, f64)]) -> serde_json::Value {
    let positions: Vec<serde_json::Value> = samples
        .iter()
        .map(|(steamid, x, y, z)| {
            serde_json::json!({
                "player": { "steamid64": steamid },
                "pos": { "x": x, "y": y, "z": z }
            })
        })
        .collect();
    serde_json::json!({ "type": "player_pos_batch", "positions": positions })
}

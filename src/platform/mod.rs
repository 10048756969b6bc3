//! Chat-platform boundary
//!
//! The bridge core only needs a small command set from the voice platform:
//! moving members, muting/deafening them, and managing voice channels. Every
//! call is fallible and treated as best-effort by the callers; errors carry
//! enough shape to tell a transient failure from a missing permission.

pub mod capability;
pub mod discord;
pub mod gateway;

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::types::{ChannelId, MemberId};

pub use capability::{Capability, CapabilityGate};
pub use discord::{DiscordClient, DiscordConfig};
pub use gateway::{spawn_gateway, GatewayConfig, VoiceStateCache};

/// Errors returned by platform calls
#[derive(Debug, Clone, thiserror::Error)]
pub enum PlatformError {
    /// The bot lacks the permission for this operation
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Rate limited by the platform
    #[error("Rate limited, retry after {retry_after_ms:?}ms")]
    RateLimited { retry_after_ms: Option<u64> },

    /// Target member or channel does not exist (anymore)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Network error or unexpected status
    #[error("Network error: {0}")]
    Transport(String),

    /// The platform answered with something we could not read
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// The local view needed to answer is not available right now
    #[error("Unavailable: {0}")]
    Unavailable(String),
}

impl PlatformError {
    pub fn is_permission(&self) -> bool {
        matches!(self, PlatformError::PermissionDenied(_))
    }

    /// Worth retrying on the next cycle without any change on our side
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PlatformError::RateLimited { .. }
                | PlatformError::Transport(_)
                | PlatformError::Unavailable(_)
        )
    }
}

/// A voice channel as currently visible on the platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VoiceChannel {
    pub id: ChannelId,
    pub name: String,
    pub parent: Option<ChannelId>,
}

/// Server-side mute/deafen to apply; `None` leaves the flag untouched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VoicePolicy {
    pub mute: Option<bool>,
    pub deafen: Option<bool>,
}

impl VoicePolicy {
    /// Lift both server mute and server deafen
    pub const CLEAR: VoicePolicy = VoicePolicy {
        mute: Some(false),
        deafen: Some(false),
    };

    pub fn is_empty(&self) -> bool {
        self.mute.is_none() && self.deafen.is_none()
    }
}

/// Command surface the bridge requires from the chat platform
#[async_trait]
pub trait VoicePlatform: Send + Sync {
    /// Move a member who is connected to voice into `channel`.
    async fn move_member(&self, member: MemberId, channel: ChannelId) -> Result<(), PlatformError>;

    /// Apply server mute/deafen.
    async fn set_voice_policy(&self, member: MemberId, policy: VoicePolicy) -> Result<(), PlatformError>;

    /// Create a voice channel, optionally under a category.
    async fn create_voice_channel(
        &self,
        name: &str,
        parent: Option<ChannelId>,
    ) -> Result<ChannelId, PlatformError>;

    /// Create a voice channel by copying the settings of `source`.
    async fn clone_channel(&self, source: ChannelId, name: &str) -> Result<ChannelId, PlatformError>;

    /// Move a channel under a category.
    async fn set_channel_parent(&self, channel: ChannelId, parent: ChannelId) -> Result<(), PlatformError>;

    async fn delete_channel(&self, channel: ChannelId) -> Result<(), PlatformError>;

    /// Voice channels visible to the bot, filtered by name prefix.
    async fn list_voice_channels(&self, prefix: Option<&str>) -> Result<Vec<VoiceChannel>, PlatformError>;

    /// Number of connected members per voice channel, counting everyone in
    /// the guild. Channels with nobody connected may be absent. Fails with
    /// `Unavailable` when the platform cannot see every occupant.
    async fn occupancy(&self) -> Result<HashMap<ChannelId, usize>, PlatformError>;

    /// The voice channel a member is connected to, if any.
    async fn member_voice_channel(&self, member: MemberId) -> Result<Option<ChannelId>, PlatformError>;
}

pub type SharedPlatform = Arc<dyn VoicePlatform>;

//! Discord REST implementation of [`VoicePlatform`]
//!
//! Commands go over the bot HTTP API. REST exposes voice state per member
//! only, so occupancy and (when available) member lookups are answered from
//! the gateway-fed [`VoiceStateCache`]. Until that cache is synced occupancy
//! is reported as unavailable rather than guessed.

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{PlatformError, VoiceChannel, VoicePlatform, VoicePolicy, VoiceStateCache};
use crate::types::{ChannelId, GuildId, MemberId};

const GUILD_VOICE: u8 = 2;
const AUDIT_REASON: &str = "proximity-bridge";

#[derive(Debug, Clone)]
pub struct DiscordConfig {
    pub api_base: String,
    pub token: String,
    pub guild: GuildId,
    pub request_timeout: Duration,
}

pub struct DiscordClient {
    http: reqwest::Client,
    config: DiscordConfig,
    voice: Arc<VoiceStateCache>,
}

#[derive(Debug, Deserialize)]
struct ChannelObject {
    id: ChannelId,
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    parent_id: Option<ChannelId>,
    #[serde(default)]
    bitrate: Option<u64>,
    #[serde(default)]
    user_limit: Option<u64>,
    #[serde(default)]
    permission_overwrites: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct VoiceStateObject {
    #[serde(default)]
    channel_id: Option<ChannelId>,
}

#[derive(Debug, Serialize)]
struct CreateChannel<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    kind: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_id: Option<ChannelId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bitrate: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    permission_overwrites: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RateLimitBody {
    retry_after: Option<f64>,
}

impl DiscordClient {
    pub fn new(config: DiscordConfig, voice: Arc<VoiceStateCache>) -> Result<Self, PlatformError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("DiscordBot (proximity-bridge, ", env!("CARGO_PKG_VERSION"), ")"))
            .build()
            .map_err(|e| PlatformError::Transport(e.to_string()))?;

        Ok(Self { http, config, voice })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base.trim_end_matches('/'), path)
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, self.url(path))
            .header("Authorization", format!("Bot {}", self.config.token))
            .header("X-Audit-Log-Reason", AUDIT_REASON)
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, PlatformError> {
        let response = builder
            .send()
            .await
            .map_err(|e| PlatformError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::FORBIDDEN => PlatformError::PermissionDenied(body),
            StatusCode::NOT_FOUND => PlatformError::NotFound(body),
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after_ms = serde_json::from_str::<RateLimitBody>(&body)
                    .ok()
                    .and_then(|b| b.retry_after)
                    .map(|secs| (secs * 1000.0) as u64);
                PlatformError::RateLimited { retry_after_ms }
            }
            other => PlatformError::Transport(format!("HTTP {}: {}", other, body)),
        })
    }

    async fn json<T: for<'de> Deserialize<'de>>(response: reqwest::Response) -> Result<T, PlatformError> {
        response
            .json()
            .await
            .map_err(|e| PlatformError::InvalidResponse(e.to_string()))
    }

    async fn modify_member(&self, member: MemberId, body: serde_json::Value) -> Result<(), PlatformError> {
        let path = format!("/guilds/{}/members/{}", self.config.guild, member);
        self.send(self.request(Method::PATCH, &path).json(&body)).await?;
        Ok(())
    }

    async fn create(&self, body: &CreateChannel<'_>) -> Result<ChannelId, PlatformError> {
        let path = format!("/guilds/{}/channels", self.config.guild);
        let response = self.send(self.request(Method::POST, &path).json(body)).await?;
        let channel: ChannelObject = Self::json(response).await?;
        Ok(channel.id)
    }
}

#[async_trait]
impl VoicePlatform for DiscordClient {
    async fn move_member(&self, member: MemberId, channel: ChannelId) -> Result<(), PlatformError> {
        debug!(member = %member, channel = %channel, "Moving member");
        self.modify_member(member, json!({ "channel_id": channel })).await
    }

    async fn set_voice_policy(&self, member: MemberId, policy: VoicePolicy) -> Result<(), PlatformError> {
        let mut body = serde_json::Map::new();
        if let Some(mute) = policy.mute {
            body.insert("mute".to_string(), json!(mute));
        }
        if let Some(deafen) = policy.deafen {
            body.insert("deaf".to_string(), json!(deafen));
        }
        if body.is_empty() {
            return Ok(());
        }
        self.modify_member(member, serde_json::Value::Object(body)).await
    }

    async fn create_voice_channel(
        &self,
        name: &str,
        parent: Option<ChannelId>,
    ) -> Result<ChannelId, PlatformError> {
        self.create(&CreateChannel {
            name,
            kind: GUILD_VOICE,
            parent_id: parent,
            bitrate: None,
            user_limit: None,
            permission_overwrites: None,
        })
        .await
    }

    async fn clone_channel(&self, source: ChannelId, name: &str) -> Result<ChannelId, PlatformError> {
        let response = self
            .send(self.request(Method::GET, &format!("/channels/{}", source)))
            .await?;
        let template: ChannelObject = Self::json(response).await?;

        self.create(&CreateChannel {
            name,
            kind: GUILD_VOICE,
            parent_id: template.parent_id,
            bitrate: template.bitrate,
            user_limit: template.user_limit,
            permission_overwrites: template.permission_overwrites,
        })
        .await
    }

    async fn set_channel_parent(&self, channel: ChannelId, parent: ChannelId) -> Result<(), PlatformError> {
        let path = format!("/channels/{}", channel);
        self.send(
            self.request(Method::PATCH, &path)
                .json(&json!({ "parent_id": parent })),
        )
        .await?;
        Ok(())
    }

    async fn delete_channel(&self, channel: ChannelId) -> Result<(), PlatformError> {
        let path = format!("/channels/{}", channel);
        self.send(self.request(Method::DELETE, &path)).await?;
        Ok(())
    }

    async fn list_voice_channels(&self, prefix: Option<&str>) -> Result<Vec<VoiceChannel>, PlatformError> {
        let path = format!("/guilds/{}/channels", self.config.guild);
        let response = self.send(self.request(Method::GET, &path)).await?;
        let channels: Vec<ChannelObject> = Self::json(response).await?;

        Ok(channels
            .into_iter()
            .filter(|c| c.kind == GUILD_VOICE)
            .filter_map(|c| {
                let name = c.name?;
                match prefix {
                    Some(p) if !name.starts_with(p) => None,
                    _ => Some(VoiceChannel {
                        id: c.id,
                        name,
                        parent: c.parent_id,
                    }),
                }
            })
            .collect())
    }

    async fn occupancy(&self) -> Result<HashMap<ChannelId, usize>, PlatformError> {
        self.voice
            .occupancy()
            .ok_or_else(|| PlatformError::Unavailable("gateway voice states not synced".to_string()))
    }

    async fn member_voice_channel(&self, member: MemberId) -> Result<Option<ChannelId>, PlatformError> {
        if let Some(channel) = self.voice.channel_of(member) {
            return Ok(channel);
        }

        let path = format!("/guilds/{}/voice-states/{}", self.config.guild, member);
        match self.send(self.request(Method::GET, &path)).await {
            Ok(response) => {
                let state: VoiceStateObject = Self::json(response).await?;
                Ok(state.channel_id)
            }
            // Discord answers 404 "Unknown Voice State" for members not in voice
            Err(PlatformError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

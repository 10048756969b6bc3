//! Configuration for the proximity bridge
//!
//! CLI arguments and environment variable handling using clap. Every option
//! can come from the environment (or a `.env` file loaded by `main`).

use clap::{ArgAction, Parser};
use std::path::PathBuf;
use std::time::Duration;

use crate::platform::gateway::GATEWAY_INTENTS;
use crate::platform::{DiscordConfig, GatewayConfig, VoicePolicy};
use crate::proximity::{StabilizerConfig, TopologyConfig};
use crate::router::RouterSettings;
use crate::types::{ChannelId, GuildId};

/// Proximity voice bridge
///
/// Regroups players into voice channels by in-game proximity.
#[derive(Parser, Debug, Clone)]
#[command(name = "proximity-bridge")]
#[command(about = "Bridges game-server events into proximity voice channels")]
pub struct Args {
    /// Bot token used for the chat-platform REST API
    #[arg(long, env = "DISCORD_TOKEN", hide_env_values = true)]
    pub discord_token: String,

    /// Guild the bridge manages
    #[arg(long, env = "GUILD_ID")]
    pub guild_id: GuildId,

    /// Where living players go at round end
    #[arg(long, env = "LIVING_CHANNEL_ID")]
    pub living_channel_id: ChannelId,

    /// Where players go when they die
    #[arg(long, env = "DEAD_CHANNEL_ID")]
    pub dead_channel_id: ChannelId,

    /// Host for the webhook listener
    #[arg(long, env = "BRIDGE_HOST", default_value = "0.0.0.0")]
    pub bridge_host: String,

    /// Port for the webhook listener
    #[arg(long, env = "BRIDGE_PORT", default_value = "8080")]
    pub bridge_port: u16,

    /// Shared secret expected in the x-bridge-secret header
    #[arg(long, env = "BRIDGE_SECRET", hide_env_values = true)]
    pub bridge_secret: String,

    /// JSON file with steamid64 -> member id links (memory only when unset)
    #[arg(long, env = "MAPPING_FILE")]
    pub mapping_file: Option<PathBuf>,

    /// Regroup players by proximity on position batches
    #[arg(long, env = "PROX_ENABLE_CLUSTERING", default_value = "true", action = ArgAction::Set)]
    pub prox_enable_clustering: bool,

    /// Cluster radius in game units
    #[arg(long, env = "PROX_RADIUS", default_value = "800.0")]
    pub prox_radius: f64,

    /// Maximum number of cluster channels
    #[arg(long, env = "PROX_MAX_CLUSTERS", default_value = "10")]
    pub prox_max_clusters: usize,

    /// Name prefix of cluster channels
    #[arg(long, env = "PROX_CHANNEL_PREFIX", default_value = "Cluster")]
    pub prox_channel_prefix: String,

    /// Category cluster channels are created under
    #[arg(long, env = "PROX_CATEGORY_ID")]
    pub prox_category_id: Option<ChannelId>,

    /// Consecutive batches in the same cluster before a move
    #[arg(long, env = "PROX_STABILITY_BATCHES", default_value = "3")]
    pub prox_stability_batches: u32,

    /// Minimum seconds between two moves of the same player
    #[arg(long, env = "PROX_MIN_MOVE_INTERVAL_SEC", default_value = "5.0")]
    pub prox_min_move_interval_sec: f64,

    /// Minimum seconds between two moves into the same cluster channel
    #[arg(long, env = "PROX_CLUSTER_COOLDOWN_SEC", default_value = "5.0")]
    pub prox_cluster_cooldown_sec: f64,

    /// Move on the first batch that shows a new cluster
    #[arg(long, env = "PROX_FAST_MODE", default_value = "false", action = ArgAction::Set)]
    pub prox_fast_mode: bool,

    /// Seconds before a failed channel creation is retried
    #[arg(long, env = "PROX_CREATE_RETRY_SEC", default_value = "30.0")]
    pub prox_create_retry_sec: f64,

    /// Delete empty cluster channels at round end
    #[arg(long, env = "PROX_CLEANUP_ON_ROUND_END", default_value = "true", action = ArgAction::Set)]
    pub prox_cleanup_on_round_end: bool,

    /// Move everyone to the living channel at round start
    #[arg(long, env = "PROX_NORMALIZE_ON_ROUND_START", default_value = "false", action = ArgAction::Set)]
    pub prox_normalize_on_round_start: bool,

    /// Forget players not seen for this many seconds (0 = never)
    #[arg(long, env = "PROX_IDLE_EVICT_SEC", default_value = "0")]
    pub prox_idle_evict_sec: u64,

    /// Server-mute players moved to the dead channel
    #[arg(long, env = "DEAD_MUTE")]
    pub dead_mute: Option<bool>,

    /// Server-deafen players moved to the dead channel
    #[arg(long, env = "DEAD_DEAFEN")]
    pub dead_deafen: Option<bool>,

    /// Lifetime of a link code in seconds
    #[arg(long, env = "LINK_CODE_TTL_SEC", default_value = "600")]
    pub link_code_ttl_sec: u64,

    /// Seconds between retries of a capability the bot was refused
    #[arg(long, env = "CAPABILITY_RECHECK_SEC", default_value = "60")]
    pub capability_recheck_sec: u64,

    /// Chat-platform REST base URL
    #[arg(long, env = "DISCORD_API_BASE", default_value = "https://discord.com/api/v10")]
    pub discord_api_base: String,

    /// Chat-platform gateway URL, used to track who is in which voice channel
    #[arg(long, env = "DISCORD_GATEWAY_URL", default_value = "wss://gateway.discord.gg/?v=10&encoding=json")]
    pub discord_gateway_url: String,

    /// REST request timeout in milliseconds
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value = "10000")]
    pub request_timeout_ms: u64,

    /// Depth of the event queue in front of the router
    #[arg(long, env = "EVENT_QUEUE_CAPACITY", default_value = "256")]
    pub event_queue_capacity: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or_default()
}

impl Args {
    /// Reject configurations the bridge cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        let token = self.discord_token.trim();
        if token.is_empty() {
            return Err("DISCORD_TOKEN is required".to_string());
        }
        if token.chars().any(char::is_whitespace)
            || token.split('.').count() != 3
            || token.split('.').any(str::is_empty)
        {
            return Err("DISCORD_TOKEN is malformed (expected three dot-separated segments)".to_string());
        }

        if self.bridge_secret.trim().is_empty() {
            return Err("BRIDGE_SECRET must not be empty".to_string());
        }

        if self.living_channel_id == self.dead_channel_id {
            return Err("LIVING_CHANNEL_ID and DEAD_CHANNEL_ID must differ".to_string());
        }

        if !(self.prox_radius.is_finite() && self.prox_radius > 0.0) {
            return Err("PROX_RADIUS must be a positive number".to_string());
        }

        if self.prox_max_clusters == 0 {
            return Err("PROX_MAX_CLUSTERS must be at least 1".to_string());
        }

        if self.prox_stability_batches == 0 {
            return Err("PROX_STABILITY_BATCHES must be at least 1".to_string());
        }

        if self.prox_channel_prefix.trim().is_empty() {
            return Err("PROX_CHANNEL_PREFIX must not be empty".to_string());
        }

        for (name, value) in [
            ("PROX_MIN_MOVE_INTERVAL_SEC", self.prox_min_move_interval_sec),
            ("PROX_CLUSTER_COOLDOWN_SEC", self.prox_cluster_cooldown_sec),
            ("PROX_CREATE_RETRY_SEC", self.prox_create_retry_sec),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(format!("{} must be a non-negative number", name));
            }
        }

        Ok(())
    }

    pub fn dead_policy(&self) -> VoicePolicy {
        VoicePolicy {
            mute: self.dead_mute,
            deafen: self.dead_deafen,
        }
    }

    pub fn topology_config(&self) -> TopologyConfig {
        TopologyConfig {
            prefix: self.prox_channel_prefix.clone(),
            parent: self.prox_category_id,
            create_retry: secs(self.prox_create_retry_sec),
        }
    }

    pub fn stabilizer_config(&self) -> StabilizerConfig {
        let config = StabilizerConfig {
            stability_threshold: self.prox_stability_batches,
            min_move_interval: secs(self.prox_min_move_interval_sec),
            cluster_cooldown: secs(self.prox_cluster_cooldown_sec),
            idle_eviction: (self.prox_idle_evict_sec > 0)
                .then(|| Duration::from_secs(self.prox_idle_evict_sec)),
        };
        if self.prox_fast_mode {
            config.fast()
        } else {
            config
        }
    }

    pub fn router_settings(&self) -> RouterSettings {
        RouterSettings {
            living_channel: self.living_channel_id,
            dead_channel: self.dead_channel_id,
            dead_policy: self.dead_policy(),
            clustering_enabled: self.prox_enable_clustering,
            radius: self.prox_radius,
            max_clusters: self.prox_max_clusters,
            cleanup_on_round_end: self.prox_cleanup_on_round_end,
            normalize_on_round_start: self.prox_normalize_on_round_start,
            topology: self.topology_config(),
            stabilizer: self.stabilizer_config(),
            capability_recheck: Duration::from_secs(self.capability_recheck_sec),
        }
    }

    pub fn discord_config(&self) -> DiscordConfig {
        DiscordConfig {
            api_base: self.discord_api_base.clone(),
            token: self.discord_token.trim().to_string(),
            guild: self.guild_id,
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            url: self.discord_gateway_url.clone(),
            token: self.discord_token.trim().to_string(),
            intents: GATEWAY_INTENTS,
        }
    }

    pub fn link_code_ttl(&self) -> Duration {
        Duration::from_secs(self.link_code_ttl_sec)
    }
}

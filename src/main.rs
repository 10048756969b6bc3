//! Proximity bridge - game events to proximity voice channels

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use proximity_bridge::{
    config::Args,
    link::{IdentityMap, LinkCodes},
    platform::{spawn_gateway, DiscordClient, SharedPlatform, VoiceStateCache},
    server::{self, AppState},
    spawn_router, EventRouter,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("proximity_bridge={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  Proximity Bridge v{}", env!("CARGO_PKG_VERSION"));
    info!("======================================");
    info!("Listen: {}:{}", args.bridge_host, args.bridge_port);
    info!("Guild: {}", args.guild_id);
    info!("Living / dead: {} / {}", args.living_channel_id, args.dead_channel_id);
    info!(
        "Clustering: {} (radius {}, max {}, prefix {:?})",
        if args.prox_enable_clustering { "on" } else { "off" },
        args.prox_radius,
        args.prox_max_clusters,
        args.prox_channel_prefix
    );
    info!(
        "Stability: {} batches{}",
        args.prox_stability_batches,
        if args.prox_fast_mode { " (fast mode)" } else { "" }
    );
    match &args.mapping_file {
        Some(path) => info!("Mapping file: {}", path.display()),
        None => info!("Mapping file: none (links kept in memory)"),
    }
    info!("======================================");

    let identities = match &args.mapping_file {
        Some(path) => match IdentityMap::load(path) {
            Ok(map) => map,
            Err(e) => {
                error!("Failed to load mapping file: {}", e);
                std::process::exit(1);
            }
        },
        None => IdentityMap::in_memory(),
    };
    let identities = Arc::new(identities);
    let codes = Arc::new(LinkCodes::new(args.link_code_ttl()));

    let voice = Arc::new(VoiceStateCache::new(args.guild_id));
    let gateway_task = spawn_gateway(args.gateway_config(), voice.clone());

    let discord = DiscordClient::new(args.discord_config(), voice)?;
    let platform: SharedPlatform = Arc::new(discord);

    let router = EventRouter::new(args.router_settings(), platform, identities, codes.clone());
    let (handle, router_task) = spawn_router(router, args.event_queue_capacity);

    let app = server::create_router(AppState::new(args.bridge_secret.as_str(), handle, codes));
    let listener = tokio::net::TcpListener::bind((args.bridge_host.as_str(), args.bridge_port)).await?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;

    router_task.abort();
    gateway_task.abort();
    Ok(())
}

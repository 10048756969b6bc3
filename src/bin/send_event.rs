//! send-event - post a sample game event to a running bridge
//!
//! Usage:
//!   send-event [TYPE] [--steamid ID] [--code CODE]
//!
//! Environment variables:
//!   BRIDGE_URL - bridge base URL (default: http://127.0.0.1:8080)
//!   BRIDGE_SECRET - shared secret sent as x-bridge-secret

use clap::Parser;
use serde_json::{json, Value};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "send-event")]
#[command(about = "Post a sample event to the proximity bridge")]
#[command(version)]
struct Args {
    /// Event type to send
    #[arg(default_value = "player_death")]
    kind: String,

    /// Bridge base URL
    #[arg(long, env = "BRIDGE_URL", default_value = "http://127.0.0.1:8080")]
    url: String,

    /// Shared secret
    #[arg(long, env = "BRIDGE_SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// Player the event is about
    #[arg(long, default_value = "76561198000000000")]
    steamid: String,

    /// Link code for link_attempt events
    #[arg(long)]
    code: Option<String>,

    /// Request timeout in seconds
    #[arg(long, default_value = "3")]
    timeout_secs: u64,
}

fn sample_event(args: &Args) -> Value {
    let player = json!({ "steamid64": args.steamid });
    match args.kind.as_str() {
        "player_pos_batch" => json!({
            "type": "player_pos_batch",
            "ts": 1.0,
            "positions": [
                { "player": player, "pos": { "x": 0.0, "y": 0.0, "z": 0.0 }, "ts": 1.0 }
            ]
        }),
        "link_attempt" => json!({
            "type": "link_attempt",
            "player": player,
            "code": args.code.clone().unwrap_or_default()
        }),
        kind => json!({ "type": kind, "ts": 1.0, "player": player }),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(args.timeout_secs))
        .build()?;

    let url = format!("{}/events", args.url.trim_end_matches('/'));
    let mut request = client.post(&url).json(&sample_event(&args));
    if let Some(secret) = args.secret.as_deref().filter(|s| !s.is_empty()) {
        request = request.header("x-bridge-secret", secret);
    }

    let response = request.send().await?;
    let status = response.status();
    let body = response.text().await?;
    println!("{} {}", status.as_u16(), body);

    Ok(())
}

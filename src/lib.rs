//! Proximity bridge - game events to proximity voice channels
//!
//! Receives webhook events from a game server and regroups linked players
//! into voice channels by in-game distance.
//!
//! ## Components
//!
//! - **Proximity**: spatial clustering, channel topology, move stabilization
//! - **Router**: single-task orchestrator handling one event at a time
//! - **Platform**: chat-platform command surface and its Discord REST client
//! - **Link**: one-time link codes and the persisted identity map
//! - **Server**: axum webhook ingress

pub mod config;
pub mod events;
pub mod link;
pub mod platform;
pub mod proximity;
pub mod router;
pub mod server;
pub mod types;

pub use config::Args;
pub use events::{Event, EventError};
pub use router::{spawn_router, ActionReport, EventOutcome, EventRouter, RouterHandle, RouterSettings};
pub use server::{create_router, AppState};

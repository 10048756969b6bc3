//! Single-consumer event queue in front of the [`EventRouter`]
//!
//! The HTTP layer accepts requests concurrently; every event still reaches the
//! router in arrival order, one at a time.

use serde_json::Value;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{EventOutcome, EventRouter};

/// Housekeeping cadence for code expiry and creation-task collection
const TICK_INTERVAL: Duration = Duration::from_secs(15);

pub enum RouterCommand {
    /// Handle one raw event payload and report the outcome.
    Event {
        payload: Value,
        reply: oneshot::Sender<EventOutcome>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("event router is not running")]
pub struct RouterClosed;

#[derive(Clone)]
pub struct RouterHandle {
    commands: mpsc::Sender<RouterCommand>,
}

impl RouterHandle {
    /// Queue an event and wait until the router has handled it.
    pub async fn submit(&self, payload: Value) -> Result<EventOutcome, RouterClosed> {
        let (reply, outcome) = oneshot::channel();
        self.commands
            .send(RouterCommand::Event { payload, reply })
            .await
            .map_err(|_| RouterClosed)?;
        outcome.await.map_err(|_| RouterClosed)
    }
}

/// Move `router` into its own task. The task ends once every handle is dropped.
pub fn spawn_router(router: EventRouter, capacity: usize) -> (RouterHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let task = tokio::spawn(run(router, rx));
    (RouterHandle { commands: tx }, task)
}

async fn run(mut router: EventRouter, mut commands: mpsc::Receiver<RouterCommand>) {
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!("Event router started");

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    break;
                };
                match command {
                    RouterCommand::Event { payload, reply } => {
                        let outcome = router.handle(&payload).await;
                        if reply.send(outcome).is_err() {
                            debug!("Event submitter went away before the outcome");
                        }
                    }
                }
            }
            _ = ticker.tick() => {
                router.tick(Instant::now()).await;
            }
        }
    }

    info!("Event router stopped");
}

//! Inbound game-server events
//!
//! Payloads are loosely shaped JSON objects keyed by `"type"`. Decoding is
//! lenient where the game plugin is known to be sloppy (numeric steam ids,
//! missing coordinates) and strict only on fields an event cannot be handled
//! without.

use serde_json::Value;

use crate::proximity::Position;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    PlayerDeath { steamid: String },
    RoundEnd,
    RoundStart,
    /// Samples in payload order; entries without a steam id are dropped
    PositionBatch { samples: Vec<(String, Position)> },
    LinkAttempt { steamid: String, code: String },
    /// Forward compatibility: anything else is accepted and ignored
    Unknown { kind: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventError {
    #[error("event has no \"type\"")]
    MissingType,

    #[error("{kind} event is missing {field}")]
    MissingField { kind: &'static str, field: &'static str },

    #[error("{kind} event has an invalid {field}")]
    InvalidField { kind: &'static str, field: &'static str },
}

impl EventError {
    pub fn kind(&self) -> Option<&'static str> {
        match self {
            EventError::MissingType => None,
            EventError::MissingField { kind, .. } | EventError::InvalidField { kind, .. } => Some(kind),
        }
    }

    pub fn is_link(&self) -> bool {
        self.kind() == Some(LINK_ATTEMPT)
    }
}

const PLAYER_DEATH: &str = "player_death";
const ROUND_END: &str = "round_end";
const ROUND_START: &str = "round_start";
const POSITION_BATCH: &str = "player_pos_batch";
const LINK_ATTEMPT: &str = "link_attempt";

impl Event {
    pub fn decode(payload: &Value) -> Result<Event, EventError> {
        let kind = payload
            .get("type")
            .and_then(Value::as_str)
            .ok_or(EventError::MissingType)?;

        match kind {
            PLAYER_DEATH => {
                // Older plugin builds report the dead player as "victim".
                let steamid = steamid_of(payload.get("player"))
                    .or_else(|| steamid_of(payload.get("victim")))
                    .ok_or(EventError::MissingField {
                        kind: PLAYER_DEATH,
                        field: "player.steamid64",
                    })?;
                Ok(Event::PlayerDeath { steamid })
            }
            ROUND_END => Ok(Event::RoundEnd),
            ROUND_START => Ok(Event::RoundStart),
            POSITION_BATCH => {
                let samples = match payload.get("positions") {
                    None | Some(Value::Null) => Vec::new(),
                    Some(Value::Array(items)) => items.iter().filter_map(decode_sample).collect(),
                    Some(_) => {
                        return Err(EventError::InvalidField {
                            kind: POSITION_BATCH,
                            field: "positions",
                        })
                    }
                };
                Ok(Event::PositionBatch { samples })
            }
            LINK_ATTEMPT => {
                let steamid = steamid_of(payload.get("player")).ok_or(EventError::MissingField {
                    kind: LINK_ATTEMPT,
                    field: "player.steamid64",
                })?;
                let code = payload
                    .get("code")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .ok_or(EventError::MissingField {
                        kind: LINK_ATTEMPT,
                        field: "code",
                    })?;
                Ok(Event::LinkAttempt {
                    steamid,
                    code: code.to_string(),
                })
            }
            other => Ok(Event::Unknown {
                kind: other.to_string(),
            }),
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            Event::PlayerDeath { .. } => PLAYER_DEATH,
            Event::RoundEnd => ROUND_END,
            Event::RoundStart => ROUND_START,
            Event::PositionBatch { .. } => POSITION_BATCH,
            Event::LinkAttempt { .. } => LINK_ATTEMPT,
            Event::Unknown { kind } => kind,
        }
    }
}

/// Whether a raw payload claims to be a link attempt, used to shape the
/// response even when decoding fails.
pub fn is_link_payload(payload: &Value) -> bool {
    payload.get("type").and_then(Value::as_str) == Some(LINK_ATTEMPT)
}

fn steamid_of(player: Option<&Value>) -> Option<String> {
    match player?.get("steamid64")? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => n.as_u64().map(|n| n.to_string()),
        _ => None,
    }
}

fn decode_sample(item: &Value) -> Option<(String, Position)> {
    let steamid = steamid_of(item.get("player"))?;
    let pos = item.get("pos");
    let coord = |axis: &str| pos.and_then(|p| p.get(axis)).and_then(Value::as_f64).unwrap_or(0.0);
    Some((steamid, Position::new(coord("x"), coord("y"), coord("z"))))
}

//! Pending link codes
//!
//! A chat member asks for a code, then types it in game; the game server sends
//! it back with the player's steam id in a `link_attempt` event. Codes are
//! single-use and expire after a TTL.

use dashmap::DashMap;
use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::types::MemberId;

/// No 0/O or 1/I, codes get typed by hand in a game console
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const CODE_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RedeemError {
    #[error("link code not found")]
    NotFound,
    #[error("link code expired")]
    Expired,
}

#[derive(Debug, Clone)]
struct PendingLink {
    member: MemberId,
    expires_at: Instant,
}

pub struct LinkCodes {
    ttl: Duration,
    pending: DashMap<String, PendingLink>,
}

impl LinkCodes {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            pending: DashMap::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Issue a fresh code for `member`, replacing any code it already had.
    pub fn issue(&self, member: MemberId, now: Instant) -> String {
        self.purge_expired(now);
        self.pending.retain(|_, p| p.member != member);

        let mut rng = rand::thread_rng();
        let code = loop {
            let candidate: String = (0..CODE_LEN)
                .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
                .collect();
            if !self.pending.contains_key(&candidate) {
                break candidate;
            }
        };

        self.pending.insert(
            code.clone(),
            PendingLink {
                member,
                expires_at: now + self.ttl,
            },
        );
        info!(member = %member, ttl_secs = self.ttl.as_secs(), "Issued link code");
        code
    }

    /// Consume a code. The code is removed whether it was valid or expired.
    pub fn redeem(&self, code: &str, now: Instant) -> Result<MemberId, RedeemError> {
        let code = code.trim().to_ascii_uppercase();
        match self.pending.remove(&code) {
            None => Err(RedeemError::NotFound),
            Some((_, pending)) if now >= pending.expires_at => Err(RedeemError::Expired),
            Some((_, pending)) => Ok(pending.member),
        }
    }

    pub fn purge_expired(&self, now: Instant) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, p| now < p.expires_at);
        let purged = before - self.pending.len();
        if purged > 0 {
            debug!(purged, "Purged expired link codes");
        }
        purged
    }
}

//! Identity linking between game players and chat members

pub mod codes;
pub mod identity;

use serde::{Deserialize, Serialize};

pub use codes::{LinkCodes, RedeemError};
pub use identity::{IdentityMap, LinkStoreError};

/// Why a link attempt failed, as reported back to the game server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkFailure {
    InvalidPayload,
    CodeNotFound,
    CodeExpired,
    Exception,
}

impl From<RedeemError> for LinkFailure {
    fn from(e: RedeemError) -> Self {
        match e {
            RedeemError::NotFound => LinkFailure::CodeNotFound,
            RedeemError::Expired => LinkFailure::CodeExpired,
        }
    }
}

/// Response body for `link_attempt`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkResponse {
    pub linked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<LinkFailure>,
}

impl LinkResponse {
    pub fn linked() -> Self {
        Self {
            linked: true,
            reason: None,
        }
    }

    pub fn failed(reason: LinkFailure) -> Self {
        Self {
            linked: false,
            reason: Some(reason),
        }
    }
}

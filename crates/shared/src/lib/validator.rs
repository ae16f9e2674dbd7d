use serde::{Deserialize, Serialize};

use crate::beacon_api::ValidatorStatus;

pub const ACTIVE_STATUSES: &[ValidatorStatus] = &[
    ValidatorStatus::ActiveOngoing,
    ValidatorStatus::ActiveExiting,
];

pub const PENDING_STATUSES: &[ValidatorStatus] = &[
    ValidatorStatus::PendingInitialized,
    ValidatorStatus::PendingQueued,
];

pub const SLASHED_STATUSES: &[ValidatorStatus] = &[ValidatorStatus::ActiveSlashed];

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidatorIndexPubkey {
    pub index: u64,
    pub pubkey: String,
    pub status: ValidatorStatus,
}

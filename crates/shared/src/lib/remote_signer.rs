//! Typed request bodies for the
//! [Remote Signing API](https://github.com/ethereum/remote-signing-api).
//!
//! One tagged union covers every signing request kind; the `type` field on
//! the wire is the serde tag.

use serde::{Deserialize, Serialize};

use crate::eth_consensus_layer::{
    AggregateAndProofElectra, BeaconBlockHeader, ContributionAndProof, Epoch, Slot,
    SyncAggregatorSelectionData, VoluntaryExit,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignerFork {
    pub previous_version: String,
    pub current_version: String,
    #[serde(with = "serde_utils::quoted_u64")]
    pub epoch: Epoch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkInfo {
    pub fork: SignerFork,
    pub genesis_validators_root: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BeaconBlockVersion {
    Electra,
    Fulu,
    Gloas,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BeaconBlockSigningData {
    pub version: BeaconBlockVersion,
    pub block_header: BeaconBlockHeader,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregationSlot {
    #[serde(with = "serde_utils::quoted_u64")]
    pub slot: Slot,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RandaoReveal {
    #[serde(with = "serde_utils::quoted_u64")]
    pub epoch: Epoch,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncCommitteeMessageData {
    pub beacon_block_root: String,
    #[serde(with = "serde_utils::quoted_u64")]
    pub slot: Slot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatorRegistration {
    pub fee_recipient: String,
    pub gas_limit: String,
    pub timestamp: String,
    pub pubkey: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum SignableMessage {
    #[serde(rename = "ATTESTATION")]
    Attestation {
        fork_info: ForkInfo,
        attestation: crate::eth_consensus_layer::AttestationData,
    },
    #[serde(rename = "AGGREGATION_SLOT")]
    AggregationSlot {
        fork_info: ForkInfo,
        aggregation_slot: AggregationSlot,
    },
    #[serde(rename = "AGGREGATE_AND_PROOF_V2")]
    AggregateAndProofV2 {
        fork_info: ForkInfo,
        aggregate_and_proof: AggregateAndProofElectra,
    },
    #[serde(rename = "BLOCK_V2")]
    BeaconBlockV2 {
        fork_info: ForkInfo,
        beacon_block: BeaconBlockSigningData,
    },
    #[serde(rename = "RANDAO_REVEAL")]
    RandaoReveal {
        fork_info: ForkInfo,
        randao_reveal: RandaoReveal,
    },
    #[serde(rename = "SYNC_COMMITTEE_MESSAGE")]
    SyncCommitteeMessage {
        fork_info: ForkInfo,
        sync_committee_message: SyncCommitteeMessageData,
    },
    #[serde(rename = "SYNC_COMMITTEE_SELECTION_PROOF")]
    SyncCommitteeSelectionProof {
        fork_info: ForkInfo,
        sync_aggregator_selection_data: SyncAggregatorSelectionData,
    },
    #[serde(rename = "SYNC_COMMITTEE_CONTRIBUTION_AND_PROOF")]
    SyncCommitteeContributionAndProof {
        fork_info: ForkInfo,
        contribution_and_proof: ContributionAndProof,
    },
    #[serde(rename = "VALIDATOR_REGISTRATION")]
    ValidatorRegistration {
        validator_registration: ValidatorRegistration,
    },
    #[serde(rename = "VOLUNTARY_EXIT")]
    VoluntaryExit {
        fork_info: ForkInfo,
        voluntary_exit: VoluntaryExit,
    },
}

impl SignableMessage {
    /// Wire name of the request type, also used as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            SignableMessage::Attestation { .. } => "ATTESTATION",
            SignableMessage::AggregationSlot { .. } => "AGGREGATION_SLOT",
            SignableMessage::AggregateAndProofV2 { .. } => "AGGREGATE_AND_PROOF_V2",
            SignableMessage::BeaconBlockV2 { .. } => "BLOCK_V2",
            SignableMessage::RandaoReveal { .. } => "RANDAO_REVEAL",
            SignableMessage::SyncCommitteeMessage { .. } => "SYNC_COMMITTEE_MESSAGE",
            SignableMessage::SyncCommitteeSelectionProof { .. } => "SYNC_COMMITTEE_SELECTION_PROOF",
            SignableMessage::SyncCommitteeContributionAndProof { .. } => {
                "SYNC_COMMITTEE_CONTRIBUTION_AND_PROOF"
            }
            SignableMessage::ValidatorRegistration { .. } => "VALIDATOR_REGISTRATION",
            SignableMessage::VoluntaryExit { .. } => "VOLUNTARY_EXIT",
        }
    }

    /// Time-critical messages go through the signer's high-priority lane.
    pub fn is_high_priority(&self) -> bool {
        matches!(
            self,
            SignableMessage::Attestation { .. }
                | SignableMessage::BeaconBlockV2 { .. }
                | SignableMessage::RandaoReveal { .. }
                | SignableMessage::SyncCommitteeMessage { .. }
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignResponse {
    pub signature: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fork_info() -> ForkInfo {
        ForkInfo {
            fork: SignerFork {
                previous_version: "0x04000000".into(),
                current_version: "0x05000000".into(),
                epoch: 364032,
            },
            genesis_validators_root: format!("0x{}", "00".repeat(32)),
        }
    }

    #[test]
    fn aggregation_slot_wire_shape() {
        let message = SignableMessage::AggregationSlot {
            fork_info: fork_info(),
            aggregation_slot: AggregationSlot { slot: 123 },
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "AGGREGATION_SLOT");
        assert_eq!(value["aggregation_slot"]["slot"], "123");
        assert_eq!(value["fork_info"]["fork"]["epoch"], "364032");
        assert!(!message.is_high_priority());
    }

    #[test]
    fn validator_registration_has_no_fork_info() {
        let message = SignableMessage::ValidatorRegistration {
            validator_registration: ValidatorRegistration {
                fee_recipient: "0x0000000000000000000000000000000000000000".into(),
                gas_limit: "30000000".into(),
                timestamp: "1700000000".into(),
                pubkey: format!("0x{}", "aa".repeat(48)),
            },
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "VALIDATOR_REGISTRATION");
        assert!(value.get("fork_info").is_none());
    }

    #[test]
    fn priority_lane_routing() {
        let message = SignableMessage::RandaoReveal {
            fork_info: fork_info(),
            randao_reveal: RandaoReveal { epoch: 1 },
        };
        assert!(message.is_high_priority());
        assert_eq!(message.kind(), "RANDAO_REVEAL");
    }
}

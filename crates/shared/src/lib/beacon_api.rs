//! Request and response models for the [Beacon Node API](https://ethereum.github.io/beacon-APIs/).
//!
//! Hex-encoded fields (roots, pubkeys, signatures) stay `String`s here;
//! typed SSZ containers live in [`crate::eth_consensus_layer`].

use serde::{Deserialize, Serialize};

use crate::eth_consensus_layer::{
    AttestationData, BeaconBlockElectra, Blob, BlindedBeaconBlockElectra, Epoch, KzgProof, Slot,
    VariableList,
};
use crate::eth_spec::MaxBlobCommitmentsPerBlock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForkVersion {
    Electra,
    Fulu,
    Gloas,
}

impl ForkVersion {
    /// Wire name, as used in the `Eth-Consensus-Version` header.
    pub fn as_str(&self) -> &'static str {
        match self {
            ForkVersion::Electra => "electra",
            ForkVersion::Fulu => "fulu",
            ForkVersion::Gloas => "gloas",
        }
    }
}

impl std::fmt::Display for ForkVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidatorStatus {
    PendingInitialized,
    PendingQueued,
    ActiveOngoing,
    ActiveExiting,
    ActiveSlashed,
    ExitedUnslashed,
    ExitedSlashed,
    WithdrawalPossible,
    WithdrawalDone,
}

impl ValidatorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidatorStatus::PendingInitialized => "pending_initialized",
            ValidatorStatus::PendingQueued => "pending_queued",
            ValidatorStatus::ActiveOngoing => "active_ongoing",
            ValidatorStatus::ActiveExiting => "active_exiting",
            ValidatorStatus::ActiveSlashed => "active_slashed",
            ValidatorStatus::ExitedUnslashed => "exited_unslashed",
            ValidatorStatus::ExitedSlashed => "exited_slashed",
            ValidatorStatus::WithdrawalPossible => "withdrawal_possible",
            ValidatorStatus::WithdrawalDone => "withdrawal_done",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenesisData {
    #[serde(with = "serde_utils::quoted_u64")]
    pub genesis_time: u64,
    pub genesis_validators_root: String,
    pub genesis_fork_version: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetGenesisResponse {
    pub data: GenesisData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetNodeVersionData {
    pub version: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetNodeVersionResponse {
    pub data: GetNodeVersionData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetSpecResponse {
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ValidatorPubkey {
    pub pubkey: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ValidatorInfo {
    #[serde(with = "serde_utils::quoted_u64")]
    pub index: u64,
    pub status: ValidatorStatus,
    pub validator: ValidatorPubkey,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetStateValidatorsResponse {
    #[serde(default)]
    pub execution_optimistic: bool,
    pub data: Vec<ValidatorInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GetValidatorsRequestBody {
    pub ids: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub statuses: Vec<ValidatorStatus>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockRoot {
    pub root: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetBlockRootResponse {
    #[serde(default)]
    pub execution_optimistic: bool,
    pub data: BlockRoot,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProduceAttestationDataResponse {
    pub data: AttestationData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingleAttestation {
    #[serde(with = "serde_utils::quoted_u64")]
    pub committee_index: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub attester_index: u64,
    pub data: AttestationData,
    pub signature: String,
}

/// Generic `{message, signature}` wrapper used by the publish endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedEnvelope<T> {
    pub message: T,
    pub signature: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetAggregateAttestationV2Response {
    pub version: ForkVersion,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetSyncCommitteeContributionResponse {
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCommitteeMessageBody {
    #[serde(with = "serde_utils::quoted_u64")]
    pub slot: Slot,
    pub beacon_block_root: String,
    #[serde(with = "serde_utils::quoted_u64")]
    pub validator_index: u64,
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeaconCommitteeSubscription {
    #[serde(with = "serde_utils::quoted_u64")]
    pub validator_index: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub committee_index: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub committees_at_slot: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub slot: Slot,
    pub is_aggregator: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCommitteeSubscription {
    #[serde(with = "serde_utils::quoted_u64")]
    pub validator_index: u64,
    #[serde(with = "serde_utils::quoted_u64_vec")]
    pub sync_committee_indices: Vec<u64>,
    #[serde(with = "serde_utils::quoted_u64")]
    pub until_epoch: Epoch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposerPreparation {
    #[serde(with = "serde_utils::quoted_u64")]
    pub validator_index: u64,
    pub fee_recipient: String,
}

// Duty endpoints

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProposerDuty {
    pub pubkey: String,
    #[serde(with = "serde_utils::quoted_u64")]
    pub validator_index: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub slot: Slot,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetProposerDutiesResponse {
    #[serde(default)]
    pub execution_optimistic: bool,
    pub dependent_root: String,
    pub data: Vec<ProposerDuty>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttesterDuty {
    pub pubkey: String,
    #[serde(with = "serde_utils::quoted_u64")]
    pub validator_index: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub committee_index: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub committee_length: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub committees_at_slot: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub validator_committee_index: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub slot: Slot,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttesterDutyWithSelectionProof {
    #[serde(flatten)]
    pub duty: AttesterDuty,
    pub is_aggregator: bool,
    /// 0x-prefixed hex encoding of the 96-byte selection proof signature.
    pub selection_proof: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetAttesterDutiesResponse {
    #[serde(default)]
    pub execution_optimistic: bool,
    pub dependent_root: String,
    pub data: Vec<AttesterDuty>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncDuty {
    pub pubkey: String,
    #[serde(with = "serde_utils::quoted_u64")]
    pub validator_index: u64,
    #[serde(with = "serde_utils::quoted_u64_vec")]
    pub validator_sync_committee_indices: Vec<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetSyncDutiesResponse {
    #[serde(default)]
    pub execution_optimistic: bool,
    pub data: Vec<SyncDuty>,
}

// Liveness (doppelganger detection)

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ValidatorLiveness {
    #[serde(with = "serde_utils::quoted_u64")]
    pub index: u64,
    pub is_live: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetLivenessResponse {
    pub data: Vec<ValidatorLiveness>,
}

// Block production

#[derive(Debug, Clone, Deserialize)]
pub struct ProduceBlockV3Response {
    pub version: ForkVersion,
    pub execution_payload_blinded: bool,
    pub execution_payload_value: String,
    pub consensus_block_value: String,
    pub data: serde_json::Value,
}

impl ProduceBlockV3Response {
    pub fn consensus_block_value(&self) -> u128 {
        self.consensus_block_value.parse().unwrap_or(0)
    }

    pub fn execution_payload_value(&self) -> u128 {
        self.execution_payload_value.parse().unwrap_or(0)
    }

    pub fn total_block_value(&self) -> u128 {
        self.consensus_block_value()
            .saturating_add(self.execution_payload_value())
    }
}

/// Body of `POST /eth/v2/beacon/blocks` for an unblinded Electra block.
#[derive(Debug, Clone, Serialize)]
pub struct SignedBlockContentsElectra {
    pub signed_block: SignedEnvelope<BeaconBlockElectra>,
    pub kzg_proofs: VariableList<KzgProof, MaxBlobCommitmentsPerBlock>,
    pub blobs: VariableList<Blob, MaxBlobCommitmentsPerBlock>,
}

/// Body of `POST /eth/v2/beacon/blinded_blocks`.
pub type SignedBlindedBlockElectra = SignedEnvelope<BlindedBeaconBlockElectra>;

// Events

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HeadEvent {
    #[serde(with = "serde_utils::quoted_u64")]
    pub slot: Slot,
    pub block: String,
    pub previous_duty_dependent_root: String,
    pub current_duty_dependent_root: String,
    #[serde(default)]
    pub execution_optimistic: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChainReorgEvent {
    #[serde(with = "serde_utils::quoted_u64")]
    pub slot: Slot,
    #[serde(with = "serde_utils::quoted_u64")]
    pub depth: u64,
    pub old_head_block: String,
    pub new_head_block: String,
    #[serde(default)]
    pub execution_optimistic: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SlashingEventAttestation {
    #[serde(with = "serde_utils::quoted_u64_vec")]
    pub attesting_indices: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AttesterSlashingEvent {
    pub attestation_1: SlashingEventAttestation,
    pub attestation_2: SlashingEventAttestation,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProposerSlashingHeaderMessage {
    #[serde(with = "serde_utils::quoted_u64")]
    pub proposer_index: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProposerSlashingHeader {
    pub message: ProposerSlashingHeaderMessage,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProposerSlashingEvent {
    pub signed_header_1: ProposerSlashingHeader,
    pub signed_header_2: ProposerSlashingHeader,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BeaconNodeEvent {
    Head(HeadEvent),
    ChainReorg(ChainReorgEvent),
    AttesterSlashing(AttesterSlashingEvent),
    ProposerSlashing(ProposerSlashingEvent),
}

impl BeaconNodeEvent {
    pub fn name(&self) -> &'static str {
        match self {
            BeaconNodeEvent::Head(_) => "head",
            BeaconNodeEvent::ChainReorg(_) => "chain_reorg",
            BeaconNodeEvent::AttesterSlashing(_) => "attester_slashing",
            BeaconNodeEvent::ProposerSlashing(_) => "proposer_slashing",
        }
    }

    /// Slot the event refers to, where the event carries one.
    pub fn slot(&self) -> Option<Slot> {
        match self {
            BeaconNodeEvent::Head(e) => Some(e.slot),
            BeaconNodeEvent::ChainReorg(e) => Some(e.slot),
            _ => None,
        }
    }

    pub fn execution_optimistic(&self) -> bool {
        match self {
            BeaconNodeEvent::Head(e) => e.execution_optimistic,
            BeaconNodeEvent::ChainReorg(e) => e.execution_optimistic,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_head_event() {
        let json = r#"{
            "slot": "10",
            "block": "0x9a2fefd2fdb57f74993c7780ea5b9030d2897b615b89f808011ca5aebed54eaf",
            "state": "0x600e852a08c1200654ddf11025f1ceacb3c2e74bdd5c630cde0838b2591b69f9",
            "epoch_transition": false,
            "previous_duty_dependent_root": "0x5e0043f107cb57913498fbf2f99ff55e730bf1e151f02f221e977c91a90a0e91",
            "current_duty_dependent_root": "0x5e0043f107cb57913498fbf2f99ff55e730bf1e151f02f221e977c91a90a0e91",
            "execution_optimistic": false
        }"#;
        let event: HeadEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.slot, 10);
        assert!(event.block.starts_with("0x9a2fefd2"));
        assert!(!event.execution_optimistic);
    }

    #[test]
    fn parses_attester_duties_response() {
        let json = r#"{
            "dependent_root": "0x2f18d2f4d14bbca45ed4d4b0cd29d03fef4c4a7a0b52a1ba1bb7b20f6b43e4b0",
            "execution_optimistic": false,
            "data": [{
                "pubkey": "0x93247f2209abcacf57b75a51dafae777f9dd38bc7053d1af526f220a7489a6d3a2753e5f3e8b1cfe39b56f43611df74a",
                "validator_index": "1",
                "committee_index": "2",
                "committee_length": "130",
                "committees_at_slot": "4",
                "validator_committee_index": "6",
                "slot": "320"
            }]
        }"#;
        let response: GetAttesterDutiesResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.data.len(), 1);
        let duty = &response.data[0];
        assert_eq!(duty.validator_index, 1);
        assert_eq!(duty.committee_length, 130);
        assert_eq!(duty.slot, 320);
    }

    #[test]
    fn duty_with_selection_proof_flattens_on_the_wire() {
        let duty = AttesterDuty {
            pubkey: "0xaa".into(),
            validator_index: 5,
            committee_index: 1,
            committee_length: 128,
            committees_at_slot: 2,
            validator_committee_index: 9,
            slot: 100,
        };
        let with_proof = AttesterDutyWithSelectionProof {
            duty,
            is_aggregator: true,
            selection_proof: format!("0x{}", "01".repeat(96)),
        };
        let value = serde_json::to_value(&with_proof).unwrap();
        assert_eq!(value["slot"], "100");
        assert_eq!(value["is_aggregator"], true);
        let back: AttesterDutyWithSelectionProof = serde_json::from_value(value).unwrap();
        assert_eq!(back, with_proof);
    }

    #[test]
    fn block_value_totals_saturate_and_parse() {
        let response = ProduceBlockV3Response {
            version: ForkVersion::Electra,
            execution_payload_blinded: false,
            execution_payload_value: "150".into(),
            consensus_block_value: "50".into(),
            data: serde_json::Value::Null,
        };
        assert_eq!(response.total_block_value(), 200);
    }
}

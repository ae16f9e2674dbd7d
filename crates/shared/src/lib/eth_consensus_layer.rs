use alloy_primitives::U256;
use serde::{Deserialize, Serialize};
use ssz_derive::{Decode, Encode};
pub use ssz_types::{typenum, typenum::Unsigned, BitList, BitVector, FixedVector, VariableList};
use tree_hash_derive::TreeHash;

use crate::eth_spec;

/// Serde for lists of fixed-size byte vectors (KZG commitments, proofs,
/// blobs), which appear on the wire as arrays of 0x-prefixed hex strings.
/// `ssz_types::serde_utils` covers the list-of-variable-length case only.
pub mod list_of_hex_fixed_vec {
    use serde::de::Error as DeError;
    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serializer};
    use ssz_types::typenum::Unsigned;
    use ssz_types::{FixedVector, VariableList};

    pub fn serialize<S, N, M>(
        list: &VariableList<FixedVector<u8, N>, M>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        N: Unsigned,
        M: Unsigned,
    {
        let mut seq = serializer.serialize_seq(Some(list.len()))?;
        for item in list.iter() {
            seq.serialize_element(&format!("0x{}", hex::encode(&item[..])))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D, N, M>(
        deserializer: D,
    ) -> Result<VariableList<FixedVector<u8, N>, M>, D::Error>
    where
        D: Deserializer<'de>,
        N: Unsigned,
        M: Unsigned,
    {
        let raw: Vec<String> = Vec::deserialize(deserializer)?;
        let mut items = Vec::with_capacity(raw.len());
        for entry in raw {
            let stripped = entry
                .strip_prefix("0x")
                .ok_or_else(|| D::Error::custom(format!("missing 0x prefix: {entry}")))?;
            let bytes = hex::decode(stripped).map_err(D::Error::custom)?;
            if bytes.len() != N::to_usize() {
                return Err(D::Error::custom(format!(
                    "invalid byte length {}, expected {}",
                    bytes.len(),
                    N::to_usize()
                )));
            }
            items.push(FixedVector::from(bytes));
        }
        VariableList::new(items).map_err(|e| D::Error::custom(format!("{e:?}")))
    }
}

pub type Address = alloy_primitives::Address;
pub type Hash256 = alloy_primitives::B256;
pub type Root = Hash256;

pub type Slot = u64;
pub type Epoch = u64;
pub type CommitteeIndex = u64;
pub type SubcommitteeIndex = u64;
pub type ValidatorIndex = u64;
pub type Gwei = u64;
pub type SyncCommitteePeriod = u64;

pub type BlsPublicKey = FixedVector<u8, typenum::U48>;
pub type BlsSignature = FixedVector<u8, typenum::U96>;
pub type Version = FixedVector<u8, typenum::U4>;
pub type KzgCommitment = FixedVector<u8, typenum::U48>;
pub type KzgProof = FixedVector<u8, typenum::U48>;
pub type Graffiti = Hash256;
pub type Transaction = VariableList<u8, eth_spec::MaxBytesPerTransaction>;
pub type Blob = FixedVector<u8, eth_spec::BytesPerBlob>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct Fork {
    #[serde(with = "ssz_types::serde_utils::hex_fixed_vec")]
    pub previous_version: Version,
    #[serde(with = "ssz_types::serde_utils::hex_fixed_vec")]
    pub current_version: Version,
    #[serde(with = "serde_utils::quoted_u64")]
    pub epoch: Epoch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct Checkpoint {
    #[serde(with = "serde_utils::quoted_u64")]
    pub epoch: Epoch,
    pub root: Root,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct AttestationData {
    #[serde(with = "serde_utils::quoted_u64")]
    pub slot: Slot,
    #[serde(with = "serde_utils::quoted_u64")]
    pub index: CommitteeIndex,
    pub beacon_block_root: Root,
    pub source: Checkpoint,
    pub target: Checkpoint,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct BeaconBlockHeader {
    #[serde(with = "serde_utils::quoted_u64")]
    pub slot: Slot,
    #[serde(with = "serde_utils::quoted_u64")]
    pub proposer_index: ValidatorIndex,
    pub parent_root: Root,
    pub state_root: Root,
    pub body_root: Root,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct SignedBeaconBlockHeader {
    pub message: BeaconBlockHeader,
    #[serde(with = "ssz_types::serde_utils::hex_fixed_vec")]
    pub signature: BlsSignature,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct Eth1Data {
    pub deposit_root: Root,
    #[serde(with = "serde_utils::quoted_u64")]
    pub deposit_count: u64,
    pub block_hash: Hash256,
}

// Attestation containers use the Electra shapes; Fulu reuses them unchanged.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct AttestationElectra {
    pub aggregation_bits: BitList<eth_spec::MaxAggregationBits>,
    pub data: AttestationData,
    #[serde(with = "ssz_types::serde_utils::hex_fixed_vec")]
    pub signature: BlsSignature,
    pub committee_bits: BitVector<eth_spec::MaxCommitteesPerSlot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct AggregateAndProofElectra {
    #[serde(with = "serde_utils::quoted_u64")]
    pub aggregator_index: ValidatorIndex,
    pub aggregate: AttestationElectra,
    #[serde(with = "ssz_types::serde_utils::hex_fixed_vec")]
    pub selection_proof: BlsSignature,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct IndexedAttestationElectra {
    #[serde(with = "ssz_types::serde_utils::quoted_u64_var_list")]
    pub attesting_indices: VariableList<u64, eth_spec::MaxAggregationBits>,
    pub data: AttestationData,
    #[serde(with = "ssz_types::serde_utils::hex_fixed_vec")]
    pub signature: BlsSignature,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct AttesterSlashingElectra {
    pub attestation_1: IndexedAttestationElectra,
    pub attestation_2: IndexedAttestationElectra,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct ProposerSlashing {
    pub signed_header_1: SignedBeaconBlockHeader,
    pub signed_header_2: SignedBeaconBlockHeader,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct DepositData {
    #[serde(with = "ssz_types::serde_utils::hex_fixed_vec")]
    pub pubkey: BlsPublicKey,
    pub withdrawal_credentials: Hash256,
    #[serde(with = "serde_utils::quoted_u64")]
    pub amount: Gwei,
    #[serde(with = "ssz_types::serde_utils::hex_fixed_vec")]
    pub signature: BlsSignature,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct Deposit {
    pub proof: FixedVector<Hash256, eth_spec::DepositContractTreeDepthPlusOne>,
    pub data: DepositData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct VoluntaryExit {
    #[serde(with = "serde_utils::quoted_u64")]
    pub epoch: Epoch,
    #[serde(with = "serde_utils::quoted_u64")]
    pub validator_index: ValidatorIndex,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct SignedVoluntaryExit {
    pub message: VoluntaryExit,
    #[serde(with = "ssz_types::serde_utils::hex_fixed_vec")]
    pub signature: BlsSignature,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct BlsToExecutionChange {
    #[serde(with = "serde_utils::quoted_u64")]
    pub validator_index: ValidatorIndex,
    #[serde(with = "ssz_types::serde_utils::hex_fixed_vec")]
    pub from_bls_pubkey: BlsPublicKey,
    pub to_execution_address: Address,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct SignedBlsToExecutionChange {
    pub message: BlsToExecutionChange,
    #[serde(with = "ssz_types::serde_utils::hex_fixed_vec")]
    pub signature: BlsSignature,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct SyncAggregate {
    pub sync_committee_bits: BitVector<eth_spec::SyncCommitteeSize>,
    #[serde(with = "ssz_types::serde_utils::hex_fixed_vec")]
    pub sync_committee_signature: BlsSignature,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct SyncCommitteeContribution {
    #[serde(with = "serde_utils::quoted_u64")]
    pub slot: Slot,
    pub beacon_block_root: Root,
    #[serde(with = "serde_utils::quoted_u64")]
    pub subcommittee_index: SubcommitteeIndex,
    pub aggregation_bits: BitVector<eth_spec::SyncSubcommitteeSize>,
    #[serde(with = "ssz_types::serde_utils::hex_fixed_vec")]
    pub signature: BlsSignature,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct ContributionAndProof {
    #[serde(with = "serde_utils::quoted_u64")]
    pub aggregator_index: ValidatorIndex,
    pub contribution: SyncCommitteeContribution,
    #[serde(with = "ssz_types::serde_utils::hex_fixed_vec")]
    pub selection_proof: BlsSignature,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct SyncAggregatorSelectionData {
    #[serde(with = "serde_utils::quoted_u64")]
    pub slot: Slot,
    #[serde(with = "serde_utils::quoted_u64")]
    pub subcommittee_index: SubcommitteeIndex,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct Withdrawal {
    #[serde(with = "serde_utils::quoted_u64")]
    pub index: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub validator_index: ValidatorIndex,
    pub address: Address,
    #[serde(with = "serde_utils::quoted_u64")]
    pub amount: Gwei,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct DepositRequest {
    #[serde(with = "ssz_types::serde_utils::hex_fixed_vec")]
    pub pubkey: BlsPublicKey,
    pub withdrawal_credentials: Hash256,
    #[serde(with = "serde_utils::quoted_u64")]
    pub amount: Gwei,
    #[serde(with = "ssz_types::serde_utils::hex_fixed_vec")]
    pub signature: BlsSignature,
    #[serde(with = "serde_utils::quoted_u64")]
    pub index: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct WithdrawalRequest {
    pub source_address: Address,
    #[serde(with = "ssz_types::serde_utils::hex_fixed_vec")]
    pub validator_pubkey: BlsPublicKey,
    #[serde(with = "serde_utils::quoted_u64")]
    pub amount: Gwei,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct ConsolidationRequest {
    pub source_address: Address,
    #[serde(with = "ssz_types::serde_utils::hex_fixed_vec")]
    pub source_pubkey: BlsPublicKey,
    #[serde(with = "ssz_types::serde_utils::hex_fixed_vec")]
    pub target_pubkey: BlsPublicKey,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct ExecutionRequests {
    pub deposits: VariableList<DepositRequest, eth_spec::MaxDepositRequestsPerPayload>,
    pub withdrawals: VariableList<WithdrawalRequest, eth_spec::MaxWithdrawalRequestsPerPayload>,
    pub consolidations: VariableList<ConsolidationRequest, eth_spec::MaxConsolidationRequestsPerPayload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct ExecutionPayloadElectra {
    pub parent_hash: Hash256,
    pub fee_recipient: Address,
    pub state_root: Root,
    pub receipts_root: Root,
    #[serde(with = "ssz_types::serde_utils::hex_fixed_vec")]
    pub logs_bloom: FixedVector<u8, eth_spec::BytesPerLogsBloom>,
    pub prev_randao: Hash256,
    #[serde(with = "serde_utils::quoted_u64")]
    pub block_number: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub gas_limit: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub gas_used: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub timestamp: u64,
    #[serde(with = "ssz_types::serde_utils::hex_var_list")]
    pub extra_data: VariableList<u8, eth_spec::MaxExtraDataBytes>,
    #[serde(with = "serde_utils::quoted_u256")]
    pub base_fee_per_gas: U256,
    pub block_hash: Hash256,
    #[serde(with = "ssz_types::serde_utils::list_of_hex_var_list")]
    pub transactions: VariableList<Transaction, eth_spec::MaxTransactionsPerPayload>,
    pub withdrawals: VariableList<Withdrawal, eth_spec::MaxWithdrawalsPerPayload>,
    #[serde(with = "serde_utils::quoted_u64")]
    pub blob_gas_used: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub excess_blob_gas: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct ExecutionPayloadHeaderElectra {
    pub parent_hash: Hash256,
    pub fee_recipient: Address,
    pub state_root: Root,
    pub receipts_root: Root,
    #[serde(with = "ssz_types::serde_utils::hex_fixed_vec")]
    pub logs_bloom: FixedVector<u8, eth_spec::BytesPerLogsBloom>,
    pub prev_randao: Hash256,
    #[serde(with = "serde_utils::quoted_u64")]
    pub block_number: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub gas_limit: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub gas_used: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub timestamp: u64,
    #[serde(with = "ssz_types::serde_utils::hex_var_list")]
    pub extra_data: VariableList<u8, eth_spec::MaxExtraDataBytes>,
    #[serde(with = "serde_utils::quoted_u256")]
    pub base_fee_per_gas: U256,
    pub block_hash: Hash256,
    pub transactions_root: Root,
    pub withdrawals_root: Root,
    #[serde(with = "serde_utils::quoted_u64")]
    pub blob_gas_used: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub excess_blob_gas: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct BeaconBlockBodyElectra {
    #[serde(with = "ssz_types::serde_utils::hex_fixed_vec")]
    pub randao_reveal: BlsSignature,
    pub eth1_data: Eth1Data,
    pub graffiti: Graffiti,
    pub proposer_slashings: VariableList<ProposerSlashing, eth_spec::MaxProposerSlashings>,
    pub attester_slashings: VariableList<AttesterSlashingElectra, eth_spec::MaxAttesterSlashingsElectra>,
    pub attestations: VariableList<AttestationElectra, eth_spec::MaxAttestationsElectra>,
    pub deposits: VariableList<Deposit, eth_spec::MaxDeposits>,
    pub voluntary_exits: VariableList<SignedVoluntaryExit, eth_spec::MaxVoluntaryExits>,
    pub sync_aggregate: SyncAggregate,
    pub execution_payload: ExecutionPayloadElectra,
    pub bls_to_execution_changes: VariableList<SignedBlsToExecutionChange, eth_spec::MaxBlsToExecutionChanges>,
    #[serde(with = "list_of_hex_fixed_vec")]
    pub blob_kzg_commitments: VariableList<KzgCommitment, eth_spec::MaxBlobCommitmentsPerBlock>,
    pub execution_requests: ExecutionRequests,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct BlindedBeaconBlockBodyElectra {
    #[serde(with = "ssz_types::serde_utils::hex_fixed_vec")]
    pub randao_reveal: BlsSignature,
    pub eth1_data: Eth1Data,
    pub graffiti: Graffiti,
    pub proposer_slashings: VariableList<ProposerSlashing, eth_spec::MaxProposerSlashings>,
    pub attester_slashings: VariableList<AttesterSlashingElectra, eth_spec::MaxAttesterSlashingsElectra>,
    pub attestations: VariableList<AttestationElectra, eth_spec::MaxAttestationsElectra>,
    pub deposits: VariableList<Deposit, eth_spec::MaxDeposits>,
    pub voluntary_exits: VariableList<SignedVoluntaryExit, eth_spec::MaxVoluntaryExits>,
    pub sync_aggregate: SyncAggregate,
    pub execution_payload_header: ExecutionPayloadHeaderElectra,
    pub bls_to_execution_changes: VariableList<SignedBlsToExecutionChange, eth_spec::MaxBlsToExecutionChanges>,
    #[serde(with = "list_of_hex_fixed_vec")]
    pub blob_kzg_commitments: VariableList<KzgCommitment, eth_spec::MaxBlobCommitmentsPerBlock>,
    pub execution_requests: ExecutionRequests,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct BeaconBlockElectra {
    #[serde(with = "serde_utils::quoted_u64")]
    pub slot: Slot,
    #[serde(with = "serde_utils::quoted_u64")]
    pub proposer_index: ValidatorIndex,
    pub parent_root: Root,
    pub state_root: Root,
    pub body: BeaconBlockBodyElectra,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct BlindedBeaconBlockElectra {
    #[serde(with = "serde_utils::quoted_u64")]
    pub slot: Slot,
    #[serde(with = "serde_utils::quoted_u64")]
    pub proposer_index: ValidatorIndex,
    pub parent_root: Root,
    pub state_root: Root,
    pub body: BlindedBeaconBlockBodyElectra,
}

/// The `data` of an unblinded `produce_block_v3` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockContentsElectra {
    pub block: BeaconBlockElectra,
    #[serde(with = "list_of_hex_fixed_vec")]
    pub kzg_proofs: VariableList<KzgProof, eth_spec::MaxBlobCommitmentsPerBlock>,
    #[serde(with = "list_of_hex_fixed_vec")]
    pub blobs: VariableList<Blob, eth_spec::MaxBlobCommitmentsPerBlock>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ssz::{Decode, Encode};
    use tree_hash::TreeHash;

    fn sample_attestation_data() -> AttestationData {
        AttestationData {
            slot: 12345,
            index: 3,
            beacon_block_root: Hash256::repeat_byte(0xaa),
            source: Checkpoint {
                epoch: 385,
                root: Hash256::repeat_byte(0x01),
            },
            target: Checkpoint {
                epoch: 386,
                root: Hash256::repeat_byte(0x02),
            },
        }
    }

    #[test]
    fn attestation_data_ssz_round_trip() {
        let data = sample_attestation_data();
        let bytes = data.as_ssz_bytes();
        let decoded = AttestationData::from_ssz_bytes(&bytes).unwrap();
        assert_eq!(data, decoded);
    }

    #[test]
    fn attestation_data_json_uses_quoted_integers() {
        let data = sample_attestation_data();
        let value = serde_json::to_value(&data).unwrap();
        assert_eq!(value["slot"], "12345");
        assert_eq!(value["index"], "3");
        assert_eq!(value["source"]["epoch"], "385");
        assert_eq!(
            value["beacon_block_root"],
            format!("0x{}", "aa".repeat(32))
        );
        let back: AttestationData = serde_json::from_value(value).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn attestation_data_root_is_stable() {
        let data = sample_attestation_data();
        assert_eq!(data.tree_hash_root(), data.tree_hash_root());
        let mut other = data.clone();
        other.slot += 1;
        assert_ne!(data.tree_hash_root(), other.tree_hash_root());
    }

    #[test]
    fn contribution_and_proof_round_trips() {
        let contribution = SyncCommitteeContribution {
            slot: 77,
            beacon_block_root: Hash256::repeat_byte(0xbb),
            subcommittee_index: 2,
            aggregation_bits: BitVector::new(),
            signature: BlsSignature::from(vec![0u8; 96]),
        };
        let message = ContributionAndProof {
            aggregator_index: 9,
            contribution,
            selection_proof: BlsSignature::from(vec![1u8; 96]),
        };
        let bytes = message.as_ssz_bytes();
        assert_eq!(message, ContributionAndProof::from_ssz_bytes(&bytes).unwrap());

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["aggregator_index"], "9");
        assert_eq!(json["contribution"]["subcommittee_index"], "2");
    }
}

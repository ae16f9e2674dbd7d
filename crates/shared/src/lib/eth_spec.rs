pub use typenum::*;

// Mainnet preset bounds. Container shapes are monomorphized against these;
// networks running a different preset need a different build.
pub type MaxValidatorsPerCommittee = U2048;
pub type MaxCommitteesPerSlot = U64;
// MaxValidatorsPerCommittee * MaxCommitteesPerSlot, the aggregation bitlist
// bound of on-chain aggregates since Electra.
pub type MaxAggregationBits = U131072;

pub type SyncCommitteeSize = U512;
pub type SyncCommitteeSubnetCount = U4;
// SyncCommitteeSize / SyncCommitteeSubnetCount
pub type SyncSubcommitteeSize = U128;

pub type MaxProposerSlashings = U16;
pub type MaxAttesterSlashingsElectra = U1;
pub type MaxAttestationsElectra = U8;
pub type MaxDeposits = U16;
pub type MaxVoluntaryExits = U16;
pub type MaxBlsToExecutionChanges = U16;
pub type MaxBlobCommitmentsPerBlock = U4096;
pub type MaxWithdrawalsPerPayload = U16;
pub type MaxExtraDataBytes = U32;
pub type BytesPerLogsBloom = U256;
pub type BytesPerBlob = U131072;
pub type MaxBytesPerTransaction = U1073741824;
pub type MaxTransactionsPerPayload = U1048576;
pub type DepositContractTreeDepthPlusOne = U33;

pub type MaxDepositRequestsPerPayload = U8192;
pub type MaxWithdrawalRequestsPerPayload = U16;
pub type MaxConsolidationRequestsPerPayload = U2;

pub const GRAFFITI_BYTES: usize = 32;

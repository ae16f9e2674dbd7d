use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use vigil_shared::beacon_api::ForkVersion;
use vigil_shared::eth_consensus_layer::{Epoch, Slot, SyncCommitteePeriod};

use crate::networks::Network;

pub const FAR_FUTURE_EPOCH: Epoch = u64::MAX;

#[derive(Debug, Error)]
pub enum SpecParseError {
    #[error("spec is missing required field {0}")]
    MissingField(&'static str),
    #[error("failed to parse spec field {field}: {value}")]
    InvalidField { field: &'static str, value: String },
}

/// Runtime chain parameters, the subset of `/eth/v1/config/spec` the client
/// needs. Known networks carry these values built in; they are cross-checked
/// against every connected beacon node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainSpec {
    pub seconds_per_slot: u64,
    pub slots_per_epoch: u64,
    pub intervals_per_slot: u64,
    pub epochs_per_sync_committee_period: u64,
    pub sync_committee_size: u64,
    pub sync_committee_subnet_count: u64,
    pub target_aggregators_per_committee: u64,
    pub target_aggregators_per_sync_subcommittee: u64,
    pub max_validators_per_committee: u64,
    pub max_blob_commitments_per_block: u64,
    pub deneb_fork_version: String,
    pub electra_fork_epoch: Epoch,
    pub electra_fork_version: String,
    pub fulu_fork_epoch: Epoch,
    pub fulu_fork_version: String,
    pub gloas_fork_epoch: Epoch,
    pub gloas_fork_version: String,
}

fn u64_field(data: &Value, field: &'static str) -> Result<u64, SpecParseError> {
    let value = data.get(field).ok_or(SpecParseError::MissingField(field))?;
    match value {
        Value::String(s) => s.parse().map_err(|_| SpecParseError::InvalidField {
            field,
            value: s.clone(),
        }),
        Value::Number(n) => n.as_u64().ok_or_else(|| SpecParseError::InvalidField {
            field,
            value: n.to_string(),
        }),
        other => Err(SpecParseError::InvalidField {
            field,
            value: other.to_string(),
        }),
    }
}

fn u64_field_or(data: &Value, field: &'static str, default: u64) -> u64 {
    match u64_field(data, field) {
        Ok(value) => value,
        Err(SpecParseError::MissingField(_)) => {
            tracing::warn!("Missing spec value for {field}, using default of {default}");
            default
        }
        Err(_) => {
            tracing::warn!("Unparseable spec value for {field}, using default of {default}");
            default
        }
    }
}

fn version_field(data: &Value, field: &'static str) -> Result<String, SpecParseError> {
    data.get(field)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or(SpecParseError::MissingField(field))
}

impl ChainSpec {
    /// Parses a spec map as returned by `/eth/v1/config/spec`.
    ///
    /// Two fields get defaults when absent, working around beacon node
    /// implementations that do not report them: `INTERVALS_PER_SLOT`
    /// (Prysm, Nimbus) and `MAX_BLOB_COMMITMENTS_PER_BLOCK` (Prysm).
    pub fn parse(data: &Value) -> Result<Self, SpecParseError> {
        Ok(ChainSpec {
            seconds_per_slot: u64_field(data, "SECONDS_PER_SLOT")?,
            slots_per_epoch: u64_field(data, "SLOTS_PER_EPOCH")?,
            intervals_per_slot: u64_field_or(data, "INTERVALS_PER_SLOT", 3),
            epochs_per_sync_committee_period: u64_field(data, "EPOCHS_PER_SYNC_COMMITTEE_PERIOD")?,
            sync_committee_size: u64_field(data, "SYNC_COMMITTEE_SIZE")?,
            sync_committee_subnet_count: u64_field_or(data, "SYNC_COMMITTEE_SUBNET_COUNT", 4),
            target_aggregators_per_committee: u64_field(data, "TARGET_AGGREGATORS_PER_COMMITTEE")?,
            target_aggregators_per_sync_subcommittee: u64_field_or(
                data,
                "TARGET_AGGREGATORS_PER_SYNC_SUBCOMMITTEE",
                16,
            ),
            max_validators_per_committee: u64_field(data, "MAX_VALIDATORS_PER_COMMITTEE")?,
            max_blob_commitments_per_block: u64_field_or(
                data,
                "MAX_BLOB_COMMITMENTS_PER_BLOCK",
                4096,
            ),
            deneb_fork_version: version_field(data, "DENEB_FORK_VERSION")?,
            electra_fork_epoch: u64_field(data, "ELECTRA_FORK_EPOCH")?,
            electra_fork_version: version_field(data, "ELECTRA_FORK_VERSION")?,
            fulu_fork_epoch: u64_field_or(data, "FULU_FORK_EPOCH", FAR_FUTURE_EPOCH),
            fulu_fork_version: version_field(data, "FULU_FORK_VERSION")
                .unwrap_or_else(|_| "0x00000000".to_string()),
            gloas_fork_epoch: u64_field_or(data, "GLOAS_FORK_EPOCH", FAR_FUTURE_EPOCH),
            gloas_fork_version: version_field(data, "GLOAS_FORK_VERSION")
                .unwrap_or_else(|_| "0x00000000".to_string()),
        })
    }

    /// Built-in parameters for a known network.
    pub fn for_network(network: Network) -> Option<Self> {
        let mainnet_preset = ChainSpec {
            seconds_per_slot: 12,
            slots_per_epoch: 32,
            intervals_per_slot: 3,
            epochs_per_sync_committee_period: 256,
            sync_committee_size: 512,
            sync_committee_subnet_count: 4,
            target_aggregators_per_committee: 16,
            target_aggregators_per_sync_subcommittee: 16,
            max_validators_per_committee: 2048,
            max_blob_commitments_per_block: 4096,
            deneb_fork_version: "0x04000000".into(),
            electra_fork_epoch: 364032,
            electra_fork_version: "0x05000000".into(),
            fulu_fork_epoch: 411392,
            fulu_fork_version: "0x06000000".into(),
            gloas_fork_epoch: FAR_FUTURE_EPOCH,
            gloas_fork_version: "0x07000000".into(),
        };

        match network {
            Network::Mainnet => Some(mainnet_preset),
            Network::Hoodi => Some(ChainSpec {
                deneb_fork_version: "0x50000910".into(),
                electra_fork_epoch: 2048,
                electra_fork_version: "0x60000910".into(),
                fulu_fork_epoch: 18688,
                fulu_fork_version: "0x70000910".into(),
                gloas_fork_epoch: FAR_FUTURE_EPOCH,
                gloas_fork_version: "0x80000910".into(),
                ..mainnet_preset
            }),
            Network::Gnosis => Some(ChainSpec {
                seconds_per_slot: 5,
                slots_per_epoch: 16,
                epochs_per_sync_committee_period: 512,
                deneb_fork_version: "0x04000064".into(),
                electra_fork_epoch: 1337856,
                electra_fork_version: "0x05000064".into(),
                fulu_fork_epoch: FAR_FUTURE_EPOCH,
                fulu_fork_version: "0x06000064".into(),
                gloas_fork_epoch: FAR_FUTURE_EPOCH,
                gloas_fork_version: "0x07000064".into(),
                ..mainnet_preset.clone()
            }),
            Network::Chiado => Some(ChainSpec {
                seconds_per_slot: 5,
                slots_per_epoch: 16,
                epochs_per_sync_committee_period: 512,
                deneb_fork_version: "0x0400006f".into(),
                electra_fork_epoch: 948224,
                electra_fork_version: "0x0500006f".into(),
                fulu_fork_epoch: FAR_FUTURE_EPOCH,
                fulu_fork_version: "0x0600006f".into(),
                gloas_fork_epoch: FAR_FUTURE_EPOCH,
                gloas_fork_version: "0x0700006f".into(),
                ..mainnet_preset.clone()
            }),
            Network::Custom => None,
        }
    }

    pub fn slot_duration_ms(&self) -> u64 {
        self.seconds_per_slot * 1_000
    }

    pub fn slot_duration(&self) -> Duration {
        Duration::from_millis(self.slot_duration_ms())
    }

    /// One interval, the granularity of intra-slot deadlines (1/3 of a slot
    /// on mainnet).
    pub fn interval_duration(&self) -> Duration {
        Duration::from_millis(self.slot_duration_ms() / self.intervals_per_slot)
    }

    pub fn epoch_of(&self, slot: Slot) -> Epoch {
        slot / self.slots_per_epoch
    }

    pub fn start_slot_of_epoch(&self, epoch: Epoch) -> Slot {
        epoch * self.slots_per_epoch
    }

    pub fn sync_period_of_epoch(&self, epoch: Epoch) -> SyncCommitteePeriod {
        epoch / self.epochs_per_sync_committee_period
    }

    pub fn sync_period_of_slot(&self, slot: Slot) -> SyncCommitteePeriod {
        self.sync_period_of_epoch(self.epoch_of(slot))
    }

    pub fn fork_version_at_epoch(&self, epoch: Epoch) -> Option<ForkVersion> {
        if epoch >= self.gloas_fork_epoch {
            Some(ForkVersion::Gloas)
        } else if epoch >= self.fulu_fork_epoch {
            Some(ForkVersion::Fulu)
        } else if epoch >= self.electra_fork_epoch {
            Some(ForkVersion::Electra)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec_json() -> Value {
        json!({
            "SECONDS_PER_SLOT": "12",
            "SLOTS_PER_EPOCH": "32",
            "INTERVALS_PER_SLOT": "3",
            "EPOCHS_PER_SYNC_COMMITTEE_PERIOD": "256",
            "SYNC_COMMITTEE_SIZE": "512",
            "SYNC_COMMITTEE_SUBNET_COUNT": "4",
            "TARGET_AGGREGATORS_PER_COMMITTEE": "16",
            "TARGET_AGGREGATORS_PER_SYNC_SUBCOMMITTEE": "16",
            "MAX_VALIDATORS_PER_COMMITTEE": "2048",
            "MAX_BLOB_COMMITMENTS_PER_BLOCK": "4096",
            "DENEB_FORK_VERSION": "0x04000000",
            "ELECTRA_FORK_EPOCH": "364032",
            "ELECTRA_FORK_VERSION": "0x05000000",
            "FULU_FORK_EPOCH": "411392",
            "FULU_FORK_VERSION": "0x06000000",
            "MIN_GENESIS_TIME": "1606824000"
        })
    }

    #[test]
    fn parses_full_spec() {
        let spec = ChainSpec::parse(&spec_json()).unwrap();
        assert_eq!(spec.seconds_per_slot, 12);
        assert_eq!(spec.electra_fork_epoch, 364032);
        assert_eq!(spec.gloas_fork_epoch, FAR_FUTURE_EPOCH);
        assert_eq!(spec.interval_duration(), Duration::from_secs(4));
    }

    #[test]
    fn defaults_intervals_per_slot_when_missing() {
        let mut data = spec_json();
        data.as_object_mut().unwrap().remove("INTERVALS_PER_SLOT");
        let spec = ChainSpec::parse(&data).unwrap();
        assert_eq!(spec.intervals_per_slot, 3);
    }

    #[test]
    fn defaults_max_blob_commitments_when_missing() {
        let mut data = spec_json();
        data.as_object_mut()
            .unwrap()
            .remove("MAX_BLOB_COMMITMENTS_PER_BLOCK");
        let spec = ChainSpec::parse(&data).unwrap();
        assert_eq!(spec.max_blob_commitments_per_block, 4096);
    }

    #[test]
    fn missing_required_field_is_an_error() {
        let mut data = spec_json();
        data.as_object_mut().unwrap().remove("SECONDS_PER_SLOT");
        assert!(ChainSpec::parse(&data).is_err());
    }

    #[test]
    fn parsed_spec_equals_builtin_mainnet() {
        let parsed = ChainSpec::parse(&spec_json()).unwrap();
        let builtin = ChainSpec::for_network(Network::Mainnet).unwrap();
        assert_eq!(parsed, builtin);
    }

    #[test]
    fn fork_lookup_picks_newest_applicable() {
        let spec = ChainSpec::for_network(Network::Mainnet).unwrap();
        assert_eq!(spec.fork_version_at_epoch(364031), None);
        assert_eq!(spec.fork_version_at_epoch(364032), Some(ForkVersion::Electra));
        assert_eq!(spec.fork_version_at_epoch(411392), Some(ForkVersion::Fulu));
    }
}

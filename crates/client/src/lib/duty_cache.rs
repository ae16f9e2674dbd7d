//! Best-effort persistence of fetched duties across restarts.
//!
//! Loaded at startup (stale or corrupt caches are tolerated - duties are
//! refreshed immediately anyway) and written on clean shutdown.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use vigil_shared::beacon_api::{AttesterDutyWithSelectionProof, ProposerDuty, SyncDuty};
use vigil_shared::eth_consensus_layer::{Epoch, SyncCommitteePeriod};

const ATTESTER_DUTIES_FILENAME: &str = "cache_attester_duties.json";
const ATTESTER_DEP_ROOTS_FILENAME: &str = "cache_attester_dependent_roots.json";
const PROPOSER_DUTIES_FILENAME: &str = "cache_proposer_duties.json";
const PROPOSER_DEP_ROOTS_FILENAME: &str = "cache_proposer_dependent_roots.json";
const SYNC_DUTIES_FILENAME: &str = "cache_sync_duties.json";

#[derive(Debug, Error)]
pub enum DutyCacheError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type AttesterDutyMap = HashMap<Epoch, HashSet<AttesterDutyWithSelectionProof>>;
pub type ProposerDutyMap = HashMap<Epoch, HashSet<ProposerDuty>>;
pub type SyncDutyMap = HashMap<SyncCommitteePeriod, Vec<SyncDuty>>;
pub type DependentRootMap = HashMap<Epoch, String>;

pub struct DutyCache {
    data_dir: PathBuf,
}

impl DutyCache {
    pub fn new(data_dir: PathBuf) -> Self {
        DutyCache { data_dir }
    }

    fn read<T: DeserializeOwned>(&self, filename: &str) -> Result<T, DutyCacheError> {
        let bytes = fs::read(self.data_dir.join(filename))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn write<T: Serialize>(&self, filename: &str, value: &T) -> Result<(), DutyCacheError> {
        let bytes = serde_json::to_vec(value)?;
        fs::write(self.data_dir.join(filename), bytes)?;
        Ok(())
    }

    pub fn load_attester_duties(
        &self,
    ) -> Result<(AttesterDutyMap, DependentRootMap), DutyCacheError> {
        Ok((
            self.read(ATTESTER_DUTIES_FILENAME)?,
            self.read(ATTESTER_DEP_ROOTS_FILENAME)?,
        ))
    }

    pub fn store_attester_duties(
        &self,
        duties: &AttesterDutyMap,
        dependent_roots: &DependentRootMap,
    ) -> Result<(), DutyCacheError> {
        self.write(ATTESTER_DUTIES_FILENAME, duties)?;
        self.write(ATTESTER_DEP_ROOTS_FILENAME, dependent_roots)
    }

    pub fn load_proposer_duties(
        &self,
    ) -> Result<(ProposerDutyMap, DependentRootMap), DutyCacheError> {
        Ok((
            self.read(PROPOSER_DUTIES_FILENAME)?,
            self.read(PROPOSER_DEP_ROOTS_FILENAME)?,
        ))
    }

    pub fn store_proposer_duties(
        &self,
        duties: &ProposerDutyMap,
        dependent_roots: &DependentRootMap,
    ) -> Result<(), DutyCacheError> {
        self.write(PROPOSER_DUTIES_FILENAME, duties)?;
        self.write(PROPOSER_DEP_ROOTS_FILENAME, dependent_roots)
    }

    pub fn load_sync_duties(&self) -> Result<SyncDutyMap, DutyCacheError> {
        self.read(SYNC_DUTIES_FILENAME)
    }

    pub fn store_sync_duties(&self, duties: &SyncDutyMap) -> Result<(), DutyCacheError> {
        self.write(SYNC_DUTIES_FILENAME, duties)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_shared::beacon_api::AttesterDuty;

    fn sample_duty(slot: u64) -> AttesterDutyWithSelectionProof {
        AttesterDutyWithSelectionProof {
            duty: AttesterDuty {
                pubkey: format!("0x{}", "aa".repeat(48)),
                validator_index: 7,
                committee_index: 2,
                committee_length: 128,
                committees_at_slot: 4,
                validator_committee_index: 1,
                slot,
            },
            is_aggregator: true,
            selection_proof: format!("0x{}", "01".repeat(96)),
        }
    }

    #[test]
    fn attester_duties_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DutyCache::new(dir.path().to_path_buf());

        let mut duties: AttesterDutyMap = HashMap::new();
        duties.insert(100, [sample_duty(3200), sample_duty(3201)].into());
        let mut roots: DependentRootMap = HashMap::new();
        roots.insert(100, format!("0x{}", "cd".repeat(32)));

        cache.store_attester_duties(&duties, &roots).unwrap();
        let (loaded_duties, loaded_roots) = cache.load_attester_duties().unwrap();
        assert_eq!(loaded_duties, duties);
        assert_eq!(loaded_roots, roots);
    }

    #[test]
    fn proposer_duties_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DutyCache::new(dir.path().to_path_buf());

        let mut duties: ProposerDutyMap = HashMap::new();
        duties.insert(
            5,
            [ProposerDuty {
                pubkey: format!("0x{}", "bb".repeat(48)),
                validator_index: 42,
                slot: 170,
            }]
            .into(),
        );
        let roots: DependentRootMap = HashMap::new();

        cache.store_proposer_duties(&duties, &roots).unwrap();
        let (loaded, _) = cache.load_proposer_duties().unwrap();
        assert_eq!(loaded, duties);
    }

    #[test]
    fn missing_cache_files_error_without_panicking() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DutyCache::new(dir.path().to_path_buf());
        assert!(cache.load_attester_duties().is_err());
        assert!(cache.load_sync_duties().is_err());
    }

    #[test]
    fn sync_duties_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DutyCache::new(dir.path().to_path_buf());

        let mut duties: SyncDutyMap = HashMap::new();
        duties.insert(
            12,
            vec![SyncDuty {
                pubkey: format!("0x{}", "cc".repeat(48)),
                validator_index: 9,
                validator_sync_committee_indices: vec![5, 133],
            }],
        );
        cache.store_sync_duties(&duties).unwrap();
        assert_eq!(cache.load_sync_duties().unwrap(), duties);
    }
}

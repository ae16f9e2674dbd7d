//! Tracks the status of every managed validator and owns the slashing
//! detection latch.
//!
//! The latch is monotonic: once any managed validator is observed slashed -
//! through an SSE slashing event or the per-refresh status scan - it stays
//! set for the lifetime of the process and every slashable duty refuses to
//! run.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::Result;

use vigil_shared::beacon_api::{AttesterSlashingEvent, ProposerSlashingEvent};
use vigil_shared::validator::{
    ValidatorIndexPubkey, ACTIVE_STATUSES, PENDING_STATUSES, SLASHED_STATUSES,
};

use crate::beacon_chain::BeaconChain;
use crate::metrics::Metrics;
use crate::multi_beacon_node::MultiBeaconNode;
use crate::signature_provider::SignatureProvider;

pub struct ValidatorStatusTracker {
    multi_beacon_node: Arc<MultiBeaconNode>,
    beacon_chain: Arc<BeaconChain>,
    signer: Arc<SignatureProvider>,
    metrics: Arc<Metrics>,
    slashing_detected: AtomicBool,
    active_validators: RwLock<Vec<ValidatorIndexPubkey>>,
    pending_validators: RwLock<Vec<ValidatorIndexPubkey>>,
}

impl ValidatorStatusTracker {
    pub fn new(
        multi_beacon_node: Arc<MultiBeaconNode>,
        beacon_chain: Arc<BeaconChain>,
        signer: Arc<SignatureProvider>,
        metrics: Arc<Metrics>,
    ) -> Self {
        metrics.slashing_detected.set(0);
        ValidatorStatusTracker {
            multi_beacon_node,
            beacon_chain,
            signer,
            metrics,
            slashing_detected: AtomicBool::new(false),
            active_validators: RwLock::new(Vec::new()),
            pending_validators: RwLock::new(Vec::new()),
        }
    }

    /// The first status refresh must succeed - without it there is nothing
    /// to fetch duties for.
    pub async fn initialize(&self) -> Result<()> {
        self.update_validator_statuses().await
    }

    pub fn slashing_detected(&self) -> bool {
        self.slashing_detected.load(Ordering::Relaxed)
    }

    fn set_slashing_detected(&self) {
        self.slashing_detected.store(true, Ordering::Relaxed);
        self.metrics.slashing_detected.set(1);
    }

    pub fn active_validators(&self) -> Vec<ValidatorIndexPubkey> {
        self.active_validators.read().expect("lock poisoned").clone()
    }

    pub fn pending_validators(&self) -> Vec<ValidatorIndexPubkey> {
        self.pending_validators.read().expect("lock poisoned").clone()
    }

    pub fn active_or_pending_validators(&self) -> Vec<ValidatorIndexPubkey> {
        let mut validators = self.active_validators();
        validators.extend(self.pending_validators());
        validators
    }

    pub fn active_or_pending_indices(&self) -> Vec<u64> {
        self.active_or_pending_validators()
            .iter()
            .map(|v| v.index)
            .collect()
    }

    pub fn any_active_or_pending_validators(&self) -> bool {
        !self.active_validators.read().expect("lock poisoned").is_empty()
            || !self.pending_validators.read().expect("lock poisoned").is_empty()
    }

    fn managed_indices(&self) -> HashSet<u64> {
        self.active_or_pending_validators()
            .iter()
            .map(|v| v.index)
            .collect()
    }

    pub fn handle_attester_slashing_event(&self, event: &AttesterSlashingEvent) {
        let indices_1: HashSet<u64> = event.attestation_1.attesting_indices.iter().copied().collect();
        let indices_2: HashSet<u64> = event.attestation_2.attesting_indices.iter().copied().collect();
        let slashed: HashSet<u64> = indices_1.intersection(&indices_2).copied().collect();

        let ours: Vec<u64> = slashed
            .intersection(&self.managed_indices())
            .copied()
            .collect();
        if !ours.is_empty() {
            self.set_slashing_detected();
            tracing::error!("Slashing detected for validator indices {ours:?}");
        }
        tracing::info!(
            "Processed attester slashing event affecting validator indices {slashed:?}"
        );
    }

    pub fn handle_proposer_slashing_event(&self, event: &ProposerSlashingEvent) {
        let slashed_index = event.signed_header_1.message.proposer_index;
        if self.managed_indices().contains(&slashed_index) {
            self.set_slashing_detected();
            tracing::error!("Slashing detected for validator index {slashed_index}");
        }
        tracing::info!(
            "Processed proposer slashing event affecting validator index {slashed_index}"
        );
    }

    async fn update_validator_statuses(&self) -> Result<()> {
        tracing::debug!("Updating validator statuses");

        let managed_pubkeys = self.signer.get_public_keys().await?;

        let slashed = self
            .multi_beacon_node
            .get_validators(managed_pubkeys.clone(), SLASHED_STATUSES.to_vec())
            .await?;
        if !slashed.is_empty() {
            self.set_slashing_detected();
            tracing::error!(
                "Slashed validators detected while updating validator statuses: {slashed:?}"
            );
        }

        let active = self
            .multi_beacon_node
            .get_validators(managed_pubkeys.clone(), ACTIVE_STATUSES.to_vec())
            .await?;
        let active_pubkeys: HashSet<String> = active.iter().map(|v| v.pubkey.clone()).collect();

        let remaining: Vec<String> = managed_pubkeys
            .iter()
            .filter(|pk| !active_pubkeys.contains(*pk))
            .cloned()
            .collect();
        let pending = self
            .multi_beacon_node
            .get_validators(remaining, PENDING_STATUSES.to_vec())
            .await?;
        let pending_pubkeys: HashSet<String> = pending.iter().map(|v| v.pubkey.clone()).collect();

        let other_count = managed_pubkeys
            .iter()
            .filter(|pk| !active_pubkeys.contains(*pk) && !pending_pubkeys.contains(*pk))
            .count();

        tracing::debug!(
            "Updated validator statuses. {} active, {} pending, {} others.",
            active_pubkeys.len(),
            pending_pubkeys.len(),
            other_count
        );
        self.metrics
            .validator_status_count
            .with_label_values(&["active"])
            .set(active_pubkeys.len() as i64);
        self.metrics
            .validator_status_count
            .with_label_values(&["pending"])
            .set(pending_pubkeys.len() as i64);
        self.metrics
            .validator_status_count
            .with_label_values(&["other"])
            .set(other_count as i64);

        let none_managed = active.is_empty() && pending.is_empty();
        *self.active_validators.write().expect("lock poisoned") = active;
        *self.pending_validators.write().expect("lock poisoned") = pending;

        if none_managed {
            tracing::warn!("No active or pending validators detected");
        }
        Ok(())
    }

    /// Refresh statuses one slot before each epoch's end so the duty update
    /// at the following epoch boundary sees fresh data.
    pub fn spawn_refresh_task(self: &Arc<Self>) {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let target_slot = tracker
                    .beacon_chain
                    .spec
                    .start_slot_of_epoch(tracker.beacon_chain.current_epoch() + 2)
                    - 1;
                let deadline = tracker.beacon_chain.instant_for_slot_offset(
                    target_slot,
                    std::time::Duration::ZERO,
                );
                tokio::time::sleep_until(deadline).await;

                if let Err(e) = tracker.update_validator_statuses().await {
                    tracing::warn!("Failed to update validator statuses: {e}");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain_spec::ChainSpec;
    use crate::config::ConfigBuilder;
    use crate::networks::Network;
    use vigil_shared::beacon_api::{
        GenesisData, ProposerSlashingHeader, ProposerSlashingHeaderMessage,
        SlashingEventAttestation, ValidatorStatus,
    };

    fn test_tracker() -> ValidatorStatusTracker {
        let spec = Arc::new(ChainSpec::for_network(Network::Mainnet).unwrap());
        let config = Arc::new(
            ConfigBuilder::new(
                Network::Mainnet,
                vec!["http://localhost:5052".into()],
                format!("0x{}", "ab".repeat(20)),
            )
            .build()
            .unwrap(),
        );
        let metrics = Arc::new(Metrics::new().unwrap());
        let multi = Arc::new(
            MultiBeaconNode::new(Arc::clone(&spec), Arc::clone(&config), Arc::clone(&metrics))
                .unwrap(),
        );
        let genesis = GenesisData {
            genesis_time: 1_606_824_023,
            genesis_validators_root: format!("0x{}", "00".repeat(32)),
            genesis_fork_version: "0x00000000".into(),
        };
        let chain = Arc::new(BeaconChain::new(Arc::clone(&spec), genesis));
        let signer = Arc::new(SignatureProvider::RemoteSigner(Arc::new(
            crate::remote_signer::RemoteSigner::new("http://localhost:9000", Arc::clone(&metrics))
                .unwrap(),
        )));
        ValidatorStatusTracker::new(multi, chain, signer, metrics)
    }

    fn managed_validator(index: u64) -> ValidatorIndexPubkey {
        ValidatorIndexPubkey {
            index,
            pubkey: format!("0x{index:096x}"),
            status: ValidatorStatus::ActiveOngoing,
        }
    }

    fn attester_slashing(indices_1: Vec<u64>, indices_2: Vec<u64>) -> AttesterSlashingEvent {
        AttesterSlashingEvent {
            attestation_1: SlashingEventAttestation {
                attesting_indices: indices_1,
            },
            attestation_2: SlashingEventAttestation {
                attesting_indices: indices_2,
            },
        }
    }

    #[test]
    fn attester_slashing_intersection_triggers_latch() {
        let tracker = test_tracker();
        *tracker.active_validators.write().unwrap() = vec![managed_validator(4)];

        // Validator 4 appears in both attestations and is managed.
        let event = attester_slashing(vec![1, 2, 3, 4, 5], vec![4, 8, 9, 10]);
        assert!(!tracker.slashing_detected());
        tracker.handle_attester_slashing_event(&event);
        assert!(tracker.slashing_detected());
    }

    #[test]
    fn attester_slashing_of_unmanaged_validators_is_ignored() {
        let tracker = test_tracker();
        *tracker.active_validators.write().unwrap() = vec![managed_validator(100)];

        let event = attester_slashing(vec![1, 2, 3], vec![2, 3, 4]);
        tracker.handle_attester_slashing_event(&event);
        assert!(!tracker.slashing_detected());
    }

    #[test]
    fn intersection_only_counts_common_indices() {
        let tracker = test_tracker();
        // Validator 5 is managed but only present in one attestation.
        *tracker.active_validators.write().unwrap() = vec![managed_validator(5)];

        let event = attester_slashing(vec![1, 2, 5], vec![1, 2, 3]);
        tracker.handle_attester_slashing_event(&event);
        assert!(!tracker.slashing_detected());
    }

    #[test]
    fn proposer_slashing_of_managed_index_triggers_latch() {
        let tracker = test_tracker();
        *tracker.pending_validators.write().unwrap() = vec![managed_validator(7)];

        let event = ProposerSlashingEvent {
            signed_header_1: ProposerSlashingHeader {
                message: ProposerSlashingHeaderMessage { proposer_index: 7 },
            },
            signed_header_2: ProposerSlashingHeader {
                message: ProposerSlashingHeaderMessage { proposer_index: 7 },
            },
        };
        tracker.handle_proposer_slashing_event(&event);
        assert!(tracker.slashing_detected());
    }

    #[test]
    fn latch_is_monotonic() {
        let tracker = test_tracker();
        *tracker.active_validators.write().unwrap() = vec![managed_validator(4)];
        tracker.handle_attester_slashing_event(&attester_slashing(vec![4], vec![4]));
        assert!(tracker.slashing_detected());

        // Later events for unmanaged validators never clear the latch.
        tracker.handle_attester_slashing_event(&attester_slashing(vec![1], vec![2]));
        assert!(tracker.slashing_detected());
    }
}

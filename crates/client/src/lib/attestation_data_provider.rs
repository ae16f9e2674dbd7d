//! Produces quorum-backed `AttestationData` for the attestation service.
//!
//! Two paths exist: without a head event, all nodes are polled until a
//! threshold of them agree on the full value; with a head event, the fastest
//! node backing the hinted block root wins, and the finality checkpoints it
//! names are then confirmed by a quorum (directly or through the cache of
//! recently confirmed checkpoints).

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;

use vigil_shared::eth_consensus_layer::{AttestationData, Checkpoint, Epoch, Hash256, Slot};

use crate::multi_beacon_node::MultiBeaconNode;

const TIMEOUT_HEAD_EVENT_ATT_DATA: Duration = Duration::from_millis(500);
const TIMEOUT_CHECKPOINT_CONFIRMATION: Duration = Duration::from_millis(1_000);
const PRUNE_INTERVAL: Duration = Duration::from_secs(600);
/// Entries kept per checkpoint cache after a prune.
const CHECKPOINT_CACHE_SIZE: usize = 3;

pub struct AttestationDataProvider {
    multi_beacon_node: Arc<MultiBeaconNode>,
    source_checkpoint_cache: Mutex<HashMap<Epoch, Checkpoint>>,
    target_checkpoint_cache: Mutex<HashMap<Epoch, Checkpoint>>,
    timeout_head_event_att_data: Duration,
    timeout_checkpoint_confirmation: Duration,
}

fn prune_cache(cache: &mut HashMap<Epoch, Checkpoint>, keep: usize) {
    if cache.len() <= keep {
        return;
    }
    let mut epochs: Vec<Epoch> = cache.keys().copied().collect();
    epochs.sort_unstable_by(|a, b| b.cmp(a));
    let cutoff: Vec<Epoch> = epochs.into_iter().skip(keep).collect();
    for epoch in cutoff {
        cache.remove(&epoch);
    }
}

impl AttestationDataProvider {
    pub fn new(multi_beacon_node: Arc<MultiBeaconNode>) -> Self {
        AttestationDataProvider {
            multi_beacon_node,
            source_checkpoint_cache: Mutex::new(HashMap::new()),
            target_checkpoint_cache: Mutex::new(HashMap::new()),
            timeout_head_event_att_data: TIMEOUT_HEAD_EVENT_ATT_DATA,
            timeout_checkpoint_confirmation: TIMEOUT_CHECKPOINT_CONFIRMATION,
        }
    }

    pub fn spawn_prune_task(self: &Arc<Self>) {
        let provider = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PRUNE_INTERVAL);
            loop {
                interval.tick().await;
                provider.prune();
            }
        });
    }

    pub fn prune(&self) {
        prune_cache(
            &mut self.source_checkpoint_cache.lock().expect("lock poisoned"),
            CHECKPOINT_CACHE_SIZE,
        );
        prune_cache(
            &mut self.target_checkpoint_cache.lock().expect("lock poisoned"),
            CHECKPOINT_CACHE_SIZE,
        );
    }

    fn cache_checkpoints(&self, source: Checkpoint, target: Checkpoint) {
        self.source_checkpoint_cache
            .lock()
            .expect("lock poisoned")
            .insert(source.epoch, source);
        self.target_checkpoint_cache
            .lock()
            .expect("lock poisoned")
            .insert(target.epoch, target);
    }

    fn checkpoints_confirmed_from_cache(&self, source: &Checkpoint, target: &Checkpoint) -> bool {
        let source_hit = self
            .source_checkpoint_cache
            .lock()
            .expect("lock poisoned")
            .get(&source.epoch)
            == Some(source);
        let target_hit = self
            .target_checkpoint_cache
            .lock()
            .expect("lock poisoned")
            .get(&target.epoch)
            == Some(target);
        source_hit && target_hit
    }

    async fn confirm_finality_checkpoints(
        &self,
        source: Checkpoint,
        target: Checkpoint,
        slot: Slot,
    ) -> Result<()> {
        if self.checkpoints_confirmed_from_cache(&source, &target) {
            tracing::debug!(
                "Finality checkpoints confirmed from cache (source={source:?}, target={target:?})"
            );
            return Ok(());
        }

        tracing::info!("Confirming finality checkpoints {source:?} => {target:?}");
        self.multi_beacon_node
            .wait_for_checkpoints(slot, source, target)
            .await?;
        self.cache_checkpoints(source, target);
        Ok(())
    }

    async fn produce_without_expected_head_block_root(
        &self,
        slot: Slot,
    ) -> Result<AttestationData> {
        // A full match among a threshold of nodes already covers the
        // checkpoints; no separate confirmation needed.
        let att_data = self
            .multi_beacon_node
            .produce_attestation_data_without_head_event(slot)
            .await?;
        self.cache_checkpoints(att_data.source, att_data.target);
        Ok(att_data)
    }

    /// Produce attestation data for `slot`, preferring the head-event fast
    /// path when a block root hint is available.
    pub async fn produce_attestation_data(
        &self,
        slot: Slot,
        head_event_block_root: Option<&str>,
    ) -> Result<AttestationData> {
        let Some(block_root) = head_event_block_root else {
            return self.produce_without_expected_head_block_root(slot).await;
        };
        let Ok(expected_root) = Hash256::from_str(block_root) else {
            tracing::warn!("Unparseable head event block root: {block_root}");
            return self.produce_without_expected_head_block_root(slot).await;
        };

        let att_data = match tokio::time::timeout(
            self.timeout_head_event_att_data,
            self.multi_beacon_node
                .wait_for_attestation_data(expected_root, slot),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                // Time in the slot is limited; fall back to attesting without
                // the expected head block root.
                tracing::warn!(
                    "Timed out waiting for AttestationData matching head block root: {block_root}"
                );
                return self.produce_without_expected_head_block_root(slot).await;
            }
        };

        tracing::debug!("AttestationData received, confirming finality checkpoints");

        if self.checkpoints_confirmed_from_cache(&att_data.source, &att_data.target) {
            return Ok(att_data);
        }

        match tokio::time::timeout(
            self.timeout_checkpoint_confirmation,
            self.confirm_finality_checkpoints(att_data.source, att_data.target, slot),
        )
        .await
        {
            Ok(result) => {
                result?;
                Ok(att_data)
            }
            Err(_) => {
                // The head event may be for a buggy chain; the fallback path
                // can still produce safe attestation data.
                tracing::warn!(
                    "Timed out confirming finality checkpoints source={:?}, target={:?}",
                    att_data.source,
                    att_data.target
                );
                self.produce_without_expected_head_block_root(slot).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint(epoch: Epoch, byte: u8) -> Checkpoint {
        Checkpoint {
            epoch,
            root: Hash256::repeat_byte(byte),
        }
    }

    #[test]
    fn prune_keeps_three_highest_epochs() {
        let mut cache = HashMap::new();
        for epoch in [1u64, 5, 3, 9, 7] {
            cache.insert(epoch, checkpoint(epoch, epoch as u8));
        }
        prune_cache(&mut cache, 3);
        let mut remaining: Vec<Epoch> = cache.keys().copied().collect();
        remaining.sort_unstable();
        assert_eq!(remaining, vec![5, 7, 9]);
    }

    #[test]
    fn prune_of_small_cache_is_a_no_op() {
        let mut cache = HashMap::new();
        cache.insert(1, checkpoint(1, 1));
        prune_cache(&mut cache, 3);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn cache_round_trip_and_bounds() {
        let multi = crate::multi_beacon_node::MultiBeaconNode::new(
            Arc::new(crate::chain_spec::ChainSpec::for_network(crate::networks::Network::Mainnet).unwrap()),
            Arc::new(
                crate::config::ConfigBuilder::new(
                    crate::networks::Network::Mainnet,
                    vec!["http://localhost:5052".into()],
                    format!("0x{}", "ab".repeat(20)),
                )
                .build()
                .unwrap(),
            ),
            Arc::new(crate::metrics::Metrics::new().unwrap()),
        )
        .unwrap();
        let provider = AttestationDataProvider::new(Arc::new(multi));

        let source = checkpoint(10, 0x01);
        let target = checkpoint(11, 0x02);
        assert!(!provider.checkpoints_confirmed_from_cache(&source, &target));
        provider.cache_checkpoints(source, target);
        assert!(provider.checkpoints_confirmed_from_cache(&source, &target));

        // A differing root for a cached epoch is not a confirmation.
        let other_target = checkpoint(11, 0xff);
        assert!(!provider.checkpoints_confirmed_from_cache(&source, &other_target));

        for epoch in 0..10u64 {
            provider.cache_checkpoints(checkpoint(epoch, 0xaa), checkpoint(epoch + 1, 0xbb));
        }
        provider.prune();
        assert!(provider.source_checkpoint_cache.lock().unwrap().len() <= 3);
        assert!(provider.target_checkpoint_cache.lock().unwrap().len() <= 3);
    }
}

//! Sync committee duty service.
//!
//! Sync committee messages go out on the head-event fast path or at 1/3 of
//! the slot; contributions from selected aggregators follow at 2/3. Duties
//! are keyed by sync committee period and refreshed once per epoch.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Notify;
use tokio::task::JoinSet;

use vigil_shared::beacon_api::{
    ChainReorgEvent, HeadEvent, SignedEnvelope, SyncCommitteeMessageBody,
    SyncCommitteeSubscription, SyncDuty,
};
use vigil_shared::eth_consensus_layer::{
    BlsSignature, ContributionAndProof, Slot, SyncAggregatorSelectionData, SyncCommitteePeriod,
};
use vigil_shared::remote_signer::{SignableMessage, SyncCommitteeMessageData};
use vigil_shared::util::{compute_sync_subnets, hex_to_bytes, is_sync_subcommittee_aggregator};

use crate::duty_cache::SyncDutyMap;
use crate::metrics::ErrorType;
use crate::services::{
    spawn_update_duties_loop, DutyContext, DutyRunState, ScheduledDutyTask, ValidatorDuty,
};

#[derive(Debug, Clone)]
struct SyncSubnetProof {
    subcommittee_index: u64,
    is_aggregator: bool,
    selection_proof: String,
}

#[derive(Debug, Clone)]
struct SyncDutyWithProofs {
    duty: SyncDuty,
    proofs: Vec<SyncSubnetProof>,
}

pub struct SyncCommitteeService {
    ctx: DutyContext,
    duties: std::sync::Mutex<SyncDutyMap>,
    run_state: DutyRunState,
    update_trigger: Arc<Notify>,
    scheduled_produce: ScheduledDutyTask,
}

impl SyncCommitteeService {
    pub fn new(ctx: DutyContext) -> Self {
        SyncCommitteeService {
            ctx,
            duties: std::sync::Mutex::new(HashMap::new()),
            run_state: DutyRunState::default(),
            update_trigger: Arc::new(Notify::new()),
            scheduled_produce: ScheduledDutyTask::default(),
        }
    }

    pub fn has_ongoing_duty(&self) -> bool {
        self.run_state.has_ongoing_duty()
    }

    pub fn has_upcoming_duty(&self) -> bool {
        let period = self
            .ctx
            .beacon_chain
            .spec
            .sync_period_of_slot(self.ctx.beacon_chain.current_slot() + 1);
        self.duties
            .lock()
            .expect("lock poisoned")
            .get(&period)
            .is_some_and(|duties| !duties.is_empty())
    }

    pub fn start(self: &Arc<Self>) {
        match self.ctx.duty_cache.load_sync_duties() {
            Ok(duties) => *self.duties.lock().expect("lock poisoned") = duties,
            Err(e) => tracing::debug!("Failed to load sync duties from cache: {e}"),
        }

        let service = Arc::clone(self);
        spawn_update_duties_loop(
            "sync committee",
            Arc::clone(&self.ctx.beacon_chain),
            Arc::clone(&self.ctx.metrics),
            Arc::clone(&self.update_trigger),
            move || {
                let service = Arc::clone(&service);
                async move { service.update_duties_once().await }
            },
        );

        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticks = service.ctx.beacon_chain.subscribe_ticks();
            loop {
                match ticks.recv().await {
                    Ok(tick) => service.on_new_slot(tick.slot, tick.is_new_epoch),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Sync committee service lagged {skipped} slot ticks");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    pub fn persist_duties(&self) {
        let duties = self.duties.lock().expect("lock poisoned").clone();
        if let Err(e) = self.ctx.duty_cache.store_sync_duties(&duties) {
            tracing::warn!("Failed to cache sync duties: {e}");
        }
    }

    fn on_new_slot(self: &Arc<Self>, slot: Slot, is_new_epoch: bool) {
        let service = Arc::clone(self);
        let deadline = self
            .ctx
            .beacon_chain
            .instant_for_slot_offset(slot, self.ctx.beacon_chain.spec.interval_duration());
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Err(e) = service
                .produce_sync_message_if_not_yet_produced(slot, None)
                .await
            {
                tracing::warn!("Sync committee duty for slot {slot} not performed: {e}");
            }
        });
        self.scheduled_produce.replace(slot, handle.abort_handle());

        if is_new_epoch {
            self.update_trigger.notify_one();
        }
    }

    pub async fn handle_head_event(self: &Arc<Self>, event: HeadEvent) {
        let slot = event.slot;
        if let Err(e) = self
            .produce_sync_message_if_not_yet_produced(slot, Some(event))
            .await
        {
            tracing::warn!("Sync committee duty for slot {slot} not performed: {e}");
        }
    }

    pub fn handle_reorg_event(&self, event: &ChainReorgEvent) {
        tracing::debug!(
            "Handling reorg event at slot {}, new head block {}",
            event.slot,
            event.new_head_block
        );
        self.update_trigger.notify_one();
    }

    fn members_for_period(&self, period: SyncCommitteePeriod) -> Vec<SyncDuty> {
        self.duties
            .lock()
            .expect("lock poisoned")
            .get(&period)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn produce_sync_message_if_not_yet_produced(
        self: &Arc<Self>,
        slot: Slot,
        head_event: Option<HeadEvent>,
    ) -> Result<()> {
        if head_event.is_some() {
            self.scheduled_produce.cancel(slot);
        }

        self.ctx
            .refuse_if_slashing_detected("producing sync committee message")?;

        if self.run_state.try_begin(slot).is_err() {
            tracing::warn!(
                "Not producing sync committee message during slot {slot} (already started during slot {})",
                self.run_state.last_started()
            );
            return Ok(());
        }

        let result = self.produce_sync_message(slot, head_event).await;
        self.run_state.mark_completed(slot);
        result
    }

    async fn produce_sync_message(
        self: &Arc<Self>,
        slot: Slot,
        head_event: Option<HeadEvent>,
    ) -> Result<()> {
        // Membership at a period boundary is determined by the next slot.
        let sync_period = self.ctx.beacon_chain.spec.sync_period_of_slot(slot + 1);
        let members = self.members_for_period(sync_period);
        if members.is_empty() {
            tracing::debug!("No remaining sync duties for slot {slot}");
            return Ok(());
        }

        tracing::debug!(
            "Producing sync message for slot {slot} for {} validators, from head: {}",
            members.len(),
            head_event.is_some()
        );
        self.ctx
            .observe_duty_start(ValidatorDuty::SyncCommitteeMessage, slot);

        let beacon_block_root = match &head_event {
            Some(event) => event.block.clone(),
            None => self
                .ctx
                .multi_beacon_node
                .get_block_root("head")
                .await
                .inspect_err(|_| {
                    self.ctx
                        .metrics
                        .inc_error(ErrorType::SyncCommitteeMessageProduce)
                })
                .context("failed to get beacon block root")?,
        };

        self.sign_and_publish_messages(slot, &beacon_block_root, &members)
            .await;

        let duties_with_proofs = self
            .collect_selection_proofs(slot, &members)
            .await?;
        self.spawn_aggregation(slot, duties_with_proofs, beacon_block_root);
        Ok(())
    }

    async fn sign_and_publish_messages(
        &self,
        slot: Slot,
        beacon_block_root: &str,
        members: &[SyncDuty],
    ) {
        let fork_info = match self.ctx.beacon_chain.fork_info(slot) {
            Ok(info) => info,
            Err(e) => {
                tracing::error!("Cannot sign sync committee messages: {e}");
                return;
            }
        };

        let index_by_pubkey: HashMap<String, u64> = members
            .iter()
            .map(|duty| (duty.pubkey.clone(), duty.validator_index))
            .collect();

        let mut set = JoinSet::new();
        for duty in members {
            let signer = Arc::clone(&self.ctx.signer);
            let message = SignableMessage::SyncCommitteeMessage {
                fork_info: fork_info.clone(),
                sync_committee_message: SyncCommitteeMessageData {
                    beacon_block_root: beacon_block_root.to_owned(),
                    slot,
                },
            };
            let pubkey = duty.pubkey.clone();
            set.spawn(async move { signer.sign(message, &pubkey).await });
        }

        let mut messages = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok((_, signature, pubkey))) => {
                    let Some(validator_index) = index_by_pubkey.get(&pubkey).copied() else {
                        tracing::warn!("Signature returned for unknown pubkey {pubkey}");
                        continue;
                    };
                    messages.push(SyncCommitteeMessageBody {
                        slot,
                        beacon_block_root: beacon_block_root.to_owned(),
                        validator_index,
                        signature,
                    });
                }
                Ok(Err(e)) => {
                    self.ctx.metrics.inc_error(ErrorType::Signature);
                    tracing::warn!(
                        "Failed to get signature for sync committee message for slot {slot}: {e}"
                    );
                }
                Err(e) => {
                    self.ctx.metrics.inc_error(ErrorType::Signature);
                    tracing::warn!("Sync committee signing task failed: {e}");
                }
            }
        }

        let count = messages.len();
        self.ctx
            .observe_duty_submission(ValidatorDuty::SyncCommitteeMessage, slot);
        match self
            .ctx
            .multi_beacon_node
            .publish_sync_committee_messages(messages)
            .await
        {
            Ok(()) => {
                tracing::info!(
                    "Published sync committee messages for slot {slot}, count: {count}"
                );
                self.ctx
                    .metrics
                    .duties
                    .published_sync_committee_messages
                    .inc_by(count as u64);
            }
            Err(e) => {
                self.ctx
                    .metrics
                    .inc_error(ErrorType::SyncCommitteeMessagePublish);
                tracing::warn!("Failed to publish sync committee messages for slot {slot}: {e}");
            }
        }
    }

    async fn collect_selection_proofs(
        &self,
        slot: Slot,
        members: &[SyncDuty],
    ) -> Result<Vec<SyncDutyWithProofs>> {
        let spec = &self.ctx.beacon_chain.spec;
        let fork_info = self.ctx.beacon_chain.fork_info(slot)?;

        let mut messages = Vec::new();
        let mut identifiers = Vec::new();
        for duty in members {
            let subnets = compute_sync_subnets(
                &duty.validator_sync_committee_indices,
                spec.sync_committee_size,
                spec.sync_committee_subnet_count,
            );
            for subcommittee_index in subnets {
                messages.push(SignableMessage::SyncCommitteeSelectionProof {
                    fork_info: fork_info.clone(),
                    sync_aggregator_selection_data: SyncAggregatorSelectionData {
                        slot,
                        subcommittee_index,
                    },
                });
                identifiers.push(duty.pubkey.clone());
            }
        }

        let signed = self
            .ctx
            .signer
            .sign_in_batches(messages, identifiers)
            .await
            .inspect_err(|_| self.ctx.metrics.inc_error(ErrorType::Signature))
            .context("failed to get signatures for sync selection proofs")?;

        let mut proofs_by_pubkey: HashMap<String, Vec<SyncSubnetProof>> = HashMap::new();
        for (message, signature, pubkey) in signed {
            let SignableMessage::SyncCommitteeSelectionProof {
                sync_aggregator_selection_data,
                ..
            } = message
            else {
                continue;
            };
            let Ok(proof_bytes) = hex_to_bytes(&signature) else {
                tracing::warn!("Invalid selection proof signature for {pubkey}");
                continue;
            };
            let is_aggregator = is_sync_subcommittee_aggregator(
                &proof_bytes,
                spec.sync_committee_size,
                spec.sync_committee_subnet_count,
                spec.target_aggregators_per_sync_subcommittee,
            );
            proofs_by_pubkey
                .entry(pubkey)
                .or_default()
                .push(SyncSubnetProof {
                    subcommittee_index: sync_aggregator_selection_data.subcommittee_index,
                    is_aggregator,
                    selection_proof: signature,
                });
        }

        Ok(members
            .iter()
            .map(|duty| SyncDutyWithProofs {
                duty: duty.clone(),
                proofs: proofs_by_pubkey.remove(&duty.pubkey).unwrap_or_default(),
            })
            .collect())
    }

    fn spawn_aggregation(
        self: &Arc<Self>,
        slot: Slot,
        duties_with_proofs: Vec<SyncDutyWithProofs>,
        beacon_block_root: String,
    ) {
        let service = Arc::clone(self);
        let deadline = self.ctx.beacon_chain.instant_for_slot_offset(
            slot,
            2 * self.ctx.beacon_chain.spec.interval_duration(),
        );
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            service
                .aggregate_sync_messages(slot, duties_with_proofs, beacon_block_root)
                .await;
        });
    }

    async fn aggregate_sync_messages(
        &self,
        slot: Slot,
        duties_with_proofs: Vec<SyncDutyWithProofs>,
        beacon_block_root: String,
    ) {
        let aggregator_duties: Vec<&SyncDutyWithProofs> = duties_with_proofs
            .iter()
            .filter(|duty| duty.proofs.iter().any(|proof| proof.is_aggregator))
            .collect();
        tracing::debug!(
            "Aggregating sync committee messages for slot {slot}, {} duties",
            aggregator_duties.len()
        );
        if aggregator_duties.is_empty() {
            return;
        }
        self.ctx
            .observe_duty_start(ValidatorDuty::SyncCommitteeContribution, slot);

        let subcommittee_indices: BTreeSet<u64> = aggregator_duties
            .iter()
            .flat_map(|duty| {
                duty.proofs
                    .iter()
                    .filter(|proof| proof.is_aggregator)
                    .map(|proof| proof.subcommittee_index)
            })
            .collect();

        let mut fetches = JoinSet::new();
        for subcommittee_index in subcommittee_indices {
            let multi = Arc::clone(&self.ctx.multi_beacon_node);
            let root = beacon_block_root.clone();
            fetches.spawn(async move {
                multi
                    .get_sync_committee_contribution(slot, subcommittee_index, root)
                    .await
                    .map(|contribution| (subcommittee_index, contribution))
            });
        }

        let mut contributions = HashMap::new();
        while let Some(joined) = fetches.join_next().await {
            match joined {
                Ok(Ok((subcommittee_index, contribution))) => {
                    contributions.insert(subcommittee_index, contribution);
                }
                Ok(Err(e)) => {
                    self.ctx
                        .metrics
                        .inc_error(ErrorType::SyncCommitteeContributionProduce);
                    tracing::warn!("Failed to produce sync committee contribution: {e}");
                }
                Err(e) => {
                    self.ctx
                        .metrics
                        .inc_error(ErrorType::SyncCommitteeContributionProduce);
                    tracing::warn!("Sync contribution fetch task failed: {e}");
                }
            }
        }
        if contributions.is_empty() {
            return;
        }

        let fork_info = match self.ctx.beacon_chain.fork_info(slot) {
            Ok(info) => info,
            Err(e) => {
                tracing::error!("Cannot sign sync contributions: {e}");
                return;
            }
        };

        let mut messages = Vec::new();
        let mut identifiers = Vec::new();
        for duty in aggregator_duties {
            for proof in duty.proofs.iter().filter(|proof| proof.is_aggregator) {
                let Some(contribution) = contributions.get(&proof.subcommittee_index) else {
                    continue;
                };
                let Ok(proof_bytes) = hex_to_bytes(&proof.selection_proof) else {
                    continue;
                };
                messages.push(SignableMessage::SyncCommitteeContributionAndProof {
                    fork_info: fork_info.clone(),
                    contribution_and_proof: ContributionAndProof {
                        aggregator_index: duty.duty.validator_index,
                        contribution: contribution.clone(),
                        selection_proof: BlsSignature::from(proof_bytes),
                    },
                });
                identifiers.push(duty.duty.pubkey.clone());
            }
        }

        let signed = match self.ctx.signer.sign_in_batches(messages, identifiers).await {
            Ok(signed) => signed,
            Err(e) => {
                self.ctx.metrics.inc_error(ErrorType::Signature);
                tracing::warn!(
                    "Failed to get signatures for sync contributions and proofs for slot {slot}: {e}"
                );
                return;
            }
        };

        let mut envelopes = Vec::with_capacity(signed.len());
        for (message, signature, _) in signed {
            if let SignableMessage::SyncCommitteeContributionAndProof {
                contribution_and_proof,
                ..
            } = message
            {
                envelopes.push(SignedEnvelope {
                    message: contribution_and_proof,
                    signature,
                });
            }
        }

        let count = envelopes.len();
        self.ctx
            .observe_duty_submission(ValidatorDuty::SyncCommitteeContribution, slot);
        match self
            .ctx
            .multi_beacon_node
            .publish_sync_committee_contribution_and_proofs(envelopes)
            .await
        {
            Ok(()) => {
                tracing::info!(
                    "Published sync committee contribution and proofs for slot {slot}, count: {count}"
                );
                self.ctx
                    .metrics
                    .duties
                    .published_sync_committee_contributions
                    .inc_by(count as u64);
            }
            Err(e) => {
                self.ctx
                    .metrics
                    .inc_error(ErrorType::SyncCommitteeContributionPublish);
                tracing::warn!(
                    "Failed to publish sync committee contribution and proofs for slot {slot}: {e}"
                );
            }
        }
    }

    // Duty updates

    async fn update_duties_once(self: &Arc<Self>) -> Result<()> {
        if !self.ctx.status_tracker.any_active_or_pending_validators() {
            tracing::warn!("Not updating sync committee duties - no active or pending validators");
            return Ok(());
        }
        let indices = self.ctx.status_tracker.active_or_pending_indices();

        let spec = &self.ctx.beacon_chain.spec;
        let epoch = self.ctx.beacon_chain.current_epoch();
        let sync_period = spec.sync_period_of_epoch(epoch);
        tracing::debug!("Updating sync duties for epoch {epoch} -> sync period {sync_period}");

        let response = self.ctx.multi_beacon_node.get_sync_duties(epoch, &indices).await?;
        let duty_count = response.data.len();

        let until_epoch = (sync_period + 1) * spec.epochs_per_sync_committee_period;
        let subscriptions: Vec<SyncCommitteeSubscription> = response
            .data
            .iter()
            .map(|duty| SyncCommitteeSubscription {
                validator_index: duty.validator_index,
                sync_committee_indices: duty.validator_sync_committee_indices.clone(),
                until_epoch,
            })
            .collect();

        self.duties
            .lock()
            .expect("lock poisoned")
            .insert(sync_period, response.data);

        if !subscriptions.is_empty() {
            let multi = Arc::clone(&self.ctx.multi_beacon_node);
            tokio::spawn(async move {
                if let Err(e) = multi.prepare_sync_committee_subscriptions(subscriptions).await {
                    tracing::warn!("Failed to prepare sync committee subscriptions: {e}");
                }
            });
        }

        tracing::debug!(
            "Updated duties for epoch {epoch} -> sync period {sync_period} -> {duty_count}"
        );
        self.prune_duties(sync_period);
        Ok(())
    }

    fn prune_duties(&self, current_period: SyncCommitteePeriod) {
        self.duties
            .lock()
            .expect("lock poisoned")
            .retain(|period, _| *period >= current_period);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beacon_chain::BeaconChain;
    use crate::chain_spec::ChainSpec;
    use crate::config::ConfigBuilder;
    use crate::duty_cache::DutyCache;
    use crate::metrics::Metrics;
    use crate::multi_beacon_node::MultiBeaconNode;
    use crate::networks::Network;
    use crate::remote_signer::RemoteSigner;
    use crate::signature_provider::SignatureProvider;
    use crate::validator_status_tracker::ValidatorStatusTracker;
    use vigil_shared::beacon_api::GenesisData;

    fn test_service() -> Arc<SyncCommitteeService> {
        let mut spec = ChainSpec::for_network(Network::Mainnet).unwrap();
        spec.electra_fork_epoch = 0;
        let spec = Arc::new(spec);
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
            genesis_time: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_secs()
                - 3600,
            genesis_validators_root: format!("0x{}", "00".repeat(32)),
            genesis_fork_version: "0x00000000".into(),
        };
        let chain = Arc::new(BeaconChain::new(Arc::clone(&spec), genesis));
        let signer = Arc::new(SignatureProvider::RemoteSigner(Arc::new(
            RemoteSigner::new("http://localhost:9000", Arc::clone(&metrics)).unwrap(),
        )));
        let tracker = Arc::new(ValidatorStatusTracker::new(
            Arc::clone(&multi),
            Arc::clone(&chain),
            Arc::clone(&signer),
            Arc::clone(&metrics),
        ));
        let ctx = DutyContext {
            multi_beacon_node: multi,
            beacon_chain: chain,
            signer,
            status_tracker: tracker,
            duty_cache: Arc::new(DutyCache::new(std::env::temp_dir())),
            config,
            metrics,
        };
        Arc::new(SyncCommitteeService::new(ctx))
    }

    fn sync_duty(validator_index: u64, committee_indices: Vec<u64>) -> SyncDuty {
        SyncDuty {
            pubkey: format!("0x{}", hex::encode([validator_index as u8; 48])),
            validator_index,
            validator_sync_committee_indices: committee_indices,
        }
    }

    #[tokio::test]
    async fn duplicate_slot_production_is_a_quiet_no_op() {
        let service = test_service();
        let slot = service.ctx.beacon_chain.current_slot();
        // No duties for the period: first call claims the slot and returns.
        service
            .produce_sync_message_if_not_yet_produced(slot, None)
            .await
            .unwrap();
        // Second call is refused by the guard but reports success.
        service
            .produce_sync_message_if_not_yet_produced(slot, None)
            .await
            .unwrap();
        assert_eq!(service.run_state.last_started(), slot as i64);
    }

    #[tokio::test]
    async fn members_are_selected_by_period() {
        let service = test_service();
        let slot = service.ctx.beacon_chain.current_slot();
        let period = service.ctx.beacon_chain.spec.sync_period_of_slot(slot + 1);
        service
            .duties
            .lock()
            .unwrap()
            .insert(period, vec![sync_duty(1, vec![0, 200])]);

        assert_eq!(service.members_for_period(period).len(), 1);
        assert!(service.members_for_period(period + 1).is_empty());
        assert!(service.has_upcoming_duty());
    }

    #[tokio::test]
    async fn prune_drops_past_periods() {
        let service = test_service();
        {
            let mut duties = service.duties.lock().unwrap();
            duties.insert(3, vec![sync_duty(1, vec![0])]);
            duties.insert(5, vec![sync_duty(2, vec![1])]);
        }
        service.prune_duties(5);
        let duties = service.duties.lock().unwrap();
        assert!(!duties.contains_key(&3));
        assert!(duties.contains_key(&5));
    }
}

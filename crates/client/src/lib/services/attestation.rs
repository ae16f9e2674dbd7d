//! Attestation duty service.
//!
//! Attests either as soon as a head event for the current slot arrives or,
//! failing that, at 1/3 into the slot. Aggregation follows at 2/3 of the
//! slot for duties selected as aggregators.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tree_hash::TreeHash;

use vigil_shared::beacon_api::{
    AttesterDuty, AttesterDutyWithSelectionProof, BeaconCommitteeSubscription, ChainReorgEvent,
    HeadEvent, SignedEnvelope, SingleAttestation,
};
use vigil_shared::eth_consensus_layer::{
    AggregateAndProofElectra, AttestationData, BlsSignature, Epoch, Slot,
};
use vigil_shared::remote_signer::{AggregationSlot, SignableMessage};
use vigil_shared::util::{hex_to_bytes, is_committee_aggregator};

use crate::attestation_data_provider::AttestationDataProvider;
use crate::duty_cache::{AttesterDutyMap, DependentRootMap};
use crate::metrics::ErrorType;
use crate::services::{
    spawn_update_duties_loop, DutyContext, DutyRunState, ScheduledDutyTask, ValidatorDuty,
};

pub struct AttestationService {
    ctx: DutyContext,
    attestation_data_provider: Arc<AttestationDataProvider>,
    duties: std::sync::Mutex<AttesterDutyMap>,
    dependent_roots: std::sync::Mutex<DependentRootMap>,
    run_state: DutyRunState,
    update_trigger: Arc<Notify>,
    scheduled_attest: ScheduledDutyTask,
}

impl AttestationService {
    pub fn new(ctx: DutyContext, attestation_data_provider: Arc<AttestationDataProvider>) -> Self {
        AttestationService {
            ctx,
            attestation_data_provider,
            duties: std::sync::Mutex::new(HashMap::new()),
            dependent_roots: std::sync::Mutex::new(HashMap::new()),
            run_state: DutyRunState::default(),
            update_trigger: Arc::new(Notify::new()),
            scheduled_attest: ScheduledDutyTask::default(),
        }
    }

    pub fn has_ongoing_duty(&self) -> bool {
        self.run_state.has_ongoing_duty()
    }

    pub fn has_upcoming_duty(&self) -> bool {
        let current_slot = self.ctx.beacon_chain.current_slot();
        let duties = self.duties.lock().expect("lock poisoned");
        duties.values().flatten().any(|duty| {
            duty.duty.slot >= current_slot && duty.duty.slot <= current_slot + 1
        })
    }

    pub fn start(self: &Arc<Self>) {
        match self.ctx.duty_cache.load_attester_duties() {
            Ok((duties, dependent_roots)) => {
                *self.duties.lock().expect("lock poisoned") = duties;
                *self.dependent_roots.lock().expect("lock poisoned") = dependent_roots;
            }
            Err(e) => tracing::debug!("Failed to load attester duties from cache: {e}"),
        }

        let service = Arc::clone(self);
        spawn_update_duties_loop(
            "attester",
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
                        tracing::warn!("Attestation service lagged {skipped} slot ticks");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    pub fn persist_duties(&self) {
        let duties = self.duties.lock().expect("lock poisoned").clone();
        let dependent_roots = self.dependent_roots.lock().expect("lock poisoned").clone();
        if let Err(e) = self.ctx.duty_cache.store_attester_duties(&duties, &dependent_roots) {
            tracing::warn!("Failed to cache attester duties: {e}");
        }
    }

    fn on_new_slot(self: &Arc<Self>, slot: Slot, is_new_epoch: bool) {
        // Attest at the deadline unless a head event triggers us earlier.
        let service = Arc::clone(self);
        let deadline = self
            .ctx
            .beacon_chain
            .instant_for_slot_offset(slot, self.ctx.beacon_chain.spec.interval_duration());
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Err(e) = service.attest_if_not_yet_attested(slot, None).await {
                tracing::warn!("Attestation duty for slot {slot} not performed: {e}");
            }
        });
        self.scheduled_attest.replace(slot, handle.abort_handle());

        if is_new_epoch {
            self.update_trigger.notify_one();
        }
    }

    pub async fn handle_head_event(self: &Arc<Self>, event: HeadEvent) {
        let known_roots: Vec<String> = self
            .dependent_roots
            .lock()
            .expect("lock poisoned")
            .values()
            .cloned()
            .collect();
        if !known_roots.contains(&event.previous_duty_dependent_root)
            || !known_roots.contains(&event.current_duty_dependent_root)
        {
            tracing::debug!("Head event duty dependent root mismatch -> updating duties");
            self.update_trigger.notify_one();
        }

        // A late head event means we already attested for this slot, either
        // at the deadline or from an earlier head event.
        if (event.slot as i64) <= self.run_state.last_started() {
            tracing::warn!("Ignoring late head event for slot {}", event.slot);
            return;
        }

        let slot = event.slot;
        if let Err(e) = self.attest_if_not_yet_attested(slot, Some(event)).await {
            tracing::warn!("Attestation duty for slot {slot} not performed: {e}");
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

    fn take_duties_for_slot(&self, slot: Slot) -> Vec<AttesterDutyWithSelectionProof> {
        let epoch = self.ctx.beacon_chain.spec.epoch_of(slot);
        let mut duties = self.duties.lock().expect("lock poisoned");
        let Some(epoch_duties) = duties.get_mut(&epoch) else {
            return Vec::new();
        };
        let taken: Vec<AttesterDutyWithSelectionProof> = epoch_duties
            .iter()
            .filter(|duty| duty.duty.slot == slot)
            .cloned()
            .collect();
        for duty in &taken {
            epoch_duties.remove(duty);
        }
        taken
    }

    fn epoch_has_remaining_duties(&self, epoch: Epoch) -> bool {
        self.duties
            .lock()
            .expect("lock poisoned")
            .get(&epoch)
            .is_some_and(|duties| !duties.is_empty())
    }

    /// Entry point for both the head-event path and the deadline fallback;
    /// only the first caller for a slot proceeds.
    pub async fn attest_if_not_yet_attested(
        self: &Arc<Self>,
        slot: Slot,
        head_event: Option<HeadEvent>,
    ) -> Result<()> {
        if head_event.is_some() {
            self.scheduled_attest.cancel(slot);
        }

        self.ctx.refuse_if_slashing_detected("attesting")?;

        let current_slot = self.ctx.beacon_chain.current_slot();
        if slot != current_slot {
            bail!("Invalid slot for attestation: {slot}. Current slot: {current_slot}");
        }
        self.run_state
            .try_begin(slot)
            .with_context(|| format!("not attesting to slot {slot}"))?;

        let duties = self.take_duties_for_slot(slot);
        let result = if duties.is_empty() {
            self.prime_checkpoint_cache(slot, head_event.as_ref()).await;
            Ok(())
        } else {
            self.attest(slot, head_event, duties).await
        };
        self.run_state.mark_completed(slot);
        result
    }

    /// With no duty this slot but more due later in the epoch, produce
    /// attestation data anyway so the checkpoint caches are primed early.
    async fn prime_checkpoint_cache(&self, slot: Slot, head_event: Option<&HeadEvent>) {
        let epoch = self.ctx.beacon_chain.spec.epoch_of(slot);
        if !self.epoch_has_remaining_duties(epoch) {
            return;
        }
        let head_root = head_event.map(|e| e.block.as_str());
        let _ = tokio::time::timeout(
            self.ctx.time_remaining_in_slot(slot),
            self.attestation_data_provider
                .produce_attestation_data(slot, head_root),
        )
        .await;
    }

    async fn produce_attestation_data(
        &self,
        slot: Slot,
        head_event: Option<&HeadEvent>,
    ) -> Result<AttestationData> {
        let consensus_start = tokio::time::Instant::now();
        let head_root = head_event.map(|e| e.block.as_str());

        let att_data = match tokio::time::timeout(
            self.ctx.time_remaining_in_slot(slot),
            self.attestation_data_provider
                .produce_attestation_data(slot, head_root),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                self.ctx.metrics.duties.attestation_consensus_failures.inc();
                self.ctx.metrics.inc_error(ErrorType::AttestationConsensus);
                bail!(
                    "Failed to reach consensus on attestation data for slot {slot} among connected beacon nodes"
                );
            }
        };

        let consensus_time = consensus_start.elapsed();
        tracing::debug!(
            "Reached consensus on attestation data in {:.3} seconds",
            consensus_time.as_secs_f64()
        );
        self.ctx
            .metrics
            .duties
            .attestation_consensus_time
            .observe(consensus_time.as_secs_f64());

        let current_epoch = self.ctx.beacon_chain.current_epoch();
        if att_data.source.epoch > current_epoch || att_data.target.epoch > current_epoch {
            bail!(
                "Checkpoint in returned attestation data is in the future: current epoch {current_epoch}, attestation data {att_data:?}"
            );
        }

        Ok(att_data)
    }

    async fn attest(
        self: &Arc<Self>,
        slot: Slot,
        head_event: Option<HeadEvent>,
        duties: Vec<AttesterDutyWithSelectionProof>,
    ) -> Result<()> {
        tracing::debug!(
            "Attesting for slot {slot}, from head event: {}, {} duties",
            head_event.is_some(),
            duties.len()
        );
        self.ctx.observe_duty_start(ValidatorDuty::Attestation, slot);

        let att_data = self.produce_attestation_data(slot, head_event.as_ref()).await?;

        // Aggregation runs later in the slot; schedule it now that the
        // attestation data is known.
        let aggregator_duties: Vec<AttesterDutyWithSelectionProof> = duties
            .iter()
            .filter(|duty| duty.is_aggregator)
            .cloned()
            .collect();
        self.spawn_aggregation(slot, att_data.clone(), aggregator_duties);

        let signed_attestations = self.sign_attestations(slot, &att_data, duties).await?;
        self.publish_attestations(slot, &att_data, signed_attestations)
            .await;
        Ok(())
    }

    async fn sign_attestations(
        &self,
        slot: Slot,
        att_data: &AttestationData,
        duties: Vec<AttesterDutyWithSelectionProof>,
    ) -> Result<Vec<SingleAttestation>> {
        let fork_info = self.ctx.beacon_chain.fork_info(slot)?;
        let duty_by_pubkey: HashMap<String, AttesterDutyWithSelectionProof> = duties
            .iter()
            .map(|duty| (duty.duty.pubkey.clone(), duty.clone()))
            .collect();

        let mut set = JoinSet::new();
        for duty in duties {
            let signer = Arc::clone(&self.ctx.signer);
            let message = SignableMessage::Attestation {
                fork_info: fork_info.clone(),
                attestation: att_data.clone(),
            };
            set.spawn(async move { signer.sign(message, &duty.duty.pubkey).await });
        }

        let mut signed_attestations = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok((_, signature, pubkey))) => {
                    let Some(duty) = duty_by_pubkey.get(&pubkey) else {
                        tracing::warn!("Signature returned for unknown pubkey {pubkey}");
                        continue;
                    };
                    signed_attestations.push(SingleAttestation {
                        committee_index: duty.duty.committee_index,
                        attester_index: duty.duty.validator_index,
                        data: att_data.clone(),
                        signature,
                    });
                }
                Ok(Err(e)) => {
                    self.ctx.metrics.inc_error(ErrorType::Signature);
                    tracing::warn!("Failed to get signature for attestation for slot {slot}: {e}");
                }
                Err(e) => {
                    self.ctx.metrics.inc_error(ErrorType::Signature);
                    tracing::warn!("Attestation signing task failed: {e}");
                }
            }
        }
        Ok(signed_attestations)
    }

    async fn publish_attestations(
        &self,
        slot: Slot,
        att_data: &AttestationData,
        signed_attestations: Vec<SingleAttestation>,
    ) {
        let count = signed_attestations.len();
        tracing::debug!(
            "Publishing attestations for slot {slot}, count: {count}, head root: {:?}",
            att_data.beacon_block_root
        );
        self.ctx
            .observe_duty_submission(ValidatorDuty::Attestation, slot);

        let fork_version = match self.ctx.beacon_chain.current_fork_version() {
            Ok(version) => version,
            Err(e) => {
                tracing::error!("Cannot publish attestations: {e}");
                return;
            }
        };

        match self
            .ctx
            .multi_beacon_node
            .publish_attestations(signed_attestations, fork_version)
            .await
        {
            Ok(()) => {
                tracing::info!(
                    "Published attestations for slot {slot}, count: {count}, head root: {:?}",
                    att_data.beacon_block_root
                );
                self.ctx
                    .metrics
                    .duties
                    .published_attestations
                    .inc_by(count as u64);
            }
            Err(e) => {
                self.ctx.metrics.inc_error(ErrorType::AttestationPublish);
                tracing::warn!("Failed to publish attestations for slot {slot}: {e}");
            }
        }
    }

    // Aggregation

    fn spawn_aggregation(
        self: &Arc<Self>,
        slot: Slot,
        att_data: AttestationData,
        aggregator_duties: Vec<AttesterDutyWithSelectionProof>,
    ) {
        if aggregator_duties.is_empty() {
            return;
        }
        let service = Arc::clone(self);
        let deadline = self.ctx.beacon_chain.instant_for_slot_offset(
            slot,
            2 * self.ctx.beacon_chain.spec.interval_duration(),
        );
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            service
                .aggregate_attestations(slot, att_data, aggregator_duties)
                .await;
        });
    }

    async fn aggregate_attestations(
        self: &Arc<Self>,
        slot: Slot,
        att_data: AttestationData,
        aggregator_duties: Vec<AttesterDutyWithSelectionProof>,
    ) {
        tracing::debug!(
            "Aggregating attestations for slot {slot}, {} duties",
            aggregator_duties.len()
        );
        self.ctx
            .observe_duty_start(ValidatorDuty::AttestationAggregation, slot);

        let attestation_data_root = att_data.tree_hash_root();
        let committee_indices: BTreeSet<u64> = aggregator_duties
            .iter()
            .map(|duty| duty.duty.committee_index)
            .collect();

        let fork_info = match self.ctx.beacon_chain.fork_info(slot) {
            Ok(info) => info,
            Err(e) => {
                tracing::error!("Cannot aggregate attestations: {e}");
                return;
            }
        };
        let fork_version = match self.ctx.beacon_chain.current_fork_version() {
            Ok(version) => version,
            Err(e) => {
                tracing::error!("Cannot aggregate attestations: {e}");
                return;
            }
        };

        let mut fetches = JoinSet::new();
        for committee_index in committee_indices {
            let multi = Arc::clone(&self.ctx.multi_beacon_node);
            fetches.spawn(async move {
                multi
                    .get_aggregate_attestation_v2(attestation_data_root, slot, committee_index)
                    .await
            });
        }

        let mut aggregate_count = 0usize;
        let mut publishes = JoinSet::new();
        while let Some(joined) = fetches.join_next().await {
            let aggregate = match joined {
                Ok(Ok(aggregate)) => aggregate,
                Ok(Err(e)) => {
                    self.ctx
                        .metrics
                        .inc_error(ErrorType::AggregateAttestationProduce);
                    tracing::warn!(
                        "Failed to produce aggregate attestation for slot {slot}, root {attestation_data_root:?}: {e}"
                    );
                    continue;
                }
                Err(e) => {
                    self.ctx
                        .metrics
                        .inc_error(ErrorType::AggregateAttestationProduce);
                    tracing::warn!("Aggregate fetch task failed: {e}");
                    continue;
                }
            };

            let mut messages = Vec::new();
            let mut identifiers = Vec::new();
            for duty in &aggregator_duties {
                let participates = aggregate
                    .committee_bits
                    .get(duty.duty.committee_index as usize)
                    .unwrap_or(false);
                if !participates {
                    continue;
                }
                let Ok(selection_proof) = hex_to_bytes(&duty.selection_proof) else {
                    tracing::warn!("Invalid selection proof for {}", duty.duty.pubkey);
                    continue;
                };
                aggregate_count += 1;
                messages.push(SignableMessage::AggregateAndProofV2 {
                    fork_info: fork_info.clone(),
                    aggregate_and_proof: AggregateAndProofElectra {
                        aggregator_index: duty.duty.validator_index,
                        aggregate: aggregate.clone(),
                        selection_proof: BlsSignature::from(selection_proof),
                    },
                });
                identifiers.push(duty.duty.pubkey.clone());
            }

            if messages.is_empty() {
                continue;
            }
            let service = Arc::clone(self);
            publishes.spawn(async move {
                service
                    .sign_and_publish_aggregates(slot, messages, identifiers, fork_version)
                    .await;
            });
        }

        while publishes.join_next().await.is_some() {}
        tracing::info!("Published aggregate and proofs for slot {slot}, count: {aggregate_count}");
    }

    async fn sign_and_publish_aggregates(
        &self,
        slot: Slot,
        messages: Vec<SignableMessage>,
        identifiers: Vec<String>,
        fork_version: vigil_shared::beacon_api::ForkVersion,
    ) {
        let signed = match self.ctx.signer.sign_in_batches(messages, identifiers).await {
            Ok(signed) => signed,
            Err(e) => {
                self.ctx.metrics.inc_error(ErrorType::Signature);
                tracing::warn!("Failed to sign aggregate and proofs for slot {slot}: {e}");
                return;
            }
        };

        let mut envelopes = Vec::with_capacity(signed.len());
        for (message, signature, _) in signed {
            if let SignableMessage::AggregateAndProofV2 {
                aggregate_and_proof,
                ..
            } = message
            {
                envelopes.push(SignedEnvelope {
                    message: aggregate_and_proof,
                    signature,
                });
            }
        }

        self.ctx
            .observe_duty_submission(ValidatorDuty::AttestationAggregation, slot);
        let count = envelopes.len();
        match self
            .ctx
            .multi_beacon_node
            .publish_aggregate_and_proofs(envelopes, fork_version)
            .await
        {
            Ok(()) => {
                self.ctx
                    .metrics
                    .duties
                    .published_aggregate_attestations
                    .inc_by(count as u64);
            }
            Err(e) => {
                self.ctx
                    .metrics
                    .inc_error(ErrorType::AggregateAttestationPublish);
                tracing::warn!("Failed to publish aggregate and proofs for slot {slot}: {e}");
            }
        }
    }

    // Duty updates

    async fn duties_with_selection_proofs(
        &self,
        duties: Vec<AttesterDuty>,
    ) -> Result<Vec<AttesterDutyWithSelectionProof>> {
        if duties.is_empty() {
            return Ok(Vec::new());
        }

        // All duties here belong to one epoch, so one fork info fits all.
        let fork_info = self.ctx.beacon_chain.fork_info(duties[0].slot)?;

        let mut messages = Vec::with_capacity(duties.len());
        let mut identifiers = Vec::with_capacity(duties.len());
        for duty in &duties {
            messages.push(SignableMessage::AggregationSlot {
                fork_info: fork_info.clone(),
                aggregation_slot: AggregationSlot { slot: duty.slot },
            });
            identifiers.push(duty.pubkey.clone());
        }

        let signed = self.ctx.signer.sign_in_batches(messages, identifiers).await?;
        let proof_by_pubkey: HashMap<String, String> = signed
            .into_iter()
            .map(|(_, signature, pubkey)| (pubkey, signature))
            .collect();

        let spec = &self.ctx.beacon_chain.spec;
        let mut duties_with_proofs = Vec::new();
        for duty in duties {
            let Some(selection_proof) = proof_by_pubkey.get(&duty.pubkey) else {
                // Missing proofs surface as a count mismatch upstream, which
                // keeps the dependent root unset and retries the update.
                continue;
            };
            let proof_bytes = hex_to_bytes(selection_proof)
                .with_context(|| format!("invalid selection proof for {}", duty.pubkey))?;
            let is_aggregator = is_committee_aggregator(
                &proof_bytes,
                duty.committee_length,
                spec.target_aggregators_per_committee,
            );
            duties_with_proofs.push(AttesterDutyWithSelectionProof {
                duty,
                is_aggregator,
                selection_proof: selection_proof.clone(),
            });
        }

        // Subnet subscriptions are best-effort; never hold up duty updates.
        let subscriptions: Vec<BeaconCommitteeSubscription> = duties_with_proofs
            .iter()
            .map(|duty| BeaconCommitteeSubscription {
                validator_index: duty.duty.validator_index,
                committee_index: duty.duty.committee_index,
                committees_at_slot: duty.duty.committees_at_slot,
                slot: duty.duty.slot,
                is_aggregator: duty.is_aggregator,
            })
            .collect();
        let multi = Arc::clone(&self.ctx.multi_beacon_node);
        tokio::spawn(async move {
            if let Err(e) = multi.prepare_beacon_committee_subscriptions(subscriptions).await {
                tracing::warn!("Failed to prepare beacon committee subscriptions: {e}");
            }
        });

        Ok(duties_with_proofs)
    }

    async fn update_duties_once(self: &Arc<Self>) -> Result<()> {
        let indices = self.ctx.status_tracker.active_or_pending_indices();
        if indices.is_empty() {
            tracing::warn!("Not updating attester duties - no active or pending validators");
            return Ok(());
        }

        let current_epoch = self.ctx.beacon_chain.current_epoch();
        for epoch in [current_epoch, current_epoch + 1] {
            tracing::debug!("Updating attester duties for epoch {epoch}");
            let response = self
                .ctx
                .multi_beacon_node
                .get_attester_duties(epoch, &indices)
                .await?;
            tracing::debug!(
                "Dependent root for attester duties for epoch {epoch} - {}",
                response.dependent_root
            );

            let known_root = self
                .dependent_roots
                .lock()
                .expect("lock poisoned")
                .get(&epoch)
                .cloned();
            if known_root.as_deref() == Some(response.dependent_root.as_str()) {
                tracing::debug!(
                    "Skipping further processing of retrieved attester duties for epoch {epoch}"
                );
                continue;
            }

            self.duties
                .lock()
                .expect("lock poisoned")
                .insert(epoch, Default::default());

            // Selection proofs can take a while for many validators; handle
            // imminent duties first so aggregation is never late.
            let current_slot = self.ctx.beacon_chain.current_slot();
            let mut due_soon = Vec::new();
            let mut due_later = Vec::new();
            for duty in response.data {
                if duty.slot < current_slot {
                    continue;
                }
                if duty.slot <= current_slot + 1 {
                    due_soon.push(duty);
                } else {
                    due_later.push(duty);
                }
            }
            let expected = due_soon.len() + due_later.len();

            let mut inserted = 0usize;
            for batch in [due_soon, due_later] {
                let with_proofs = self.duties_with_selection_proofs(batch).await?;
                inserted += with_proofs.len();
                let mut duties = self.duties.lock().expect("lock poisoned");
                duties.entry(epoch).or_default().extend(with_proofs);
            }
            tracing::debug!("Updated duties for epoch {epoch} -> {inserted} duties");

            // Only record the dependent root once every duty carries its
            // selection proof; otherwise the next update retries.
            if inserted != expected {
                bail!("selection proofs missing for {} duties", expected - inserted);
            }
            self.dependent_roots
                .lock()
                .expect("lock poisoned")
                .insert(epoch, response.dependent_root);
        }

        self.prune_duties(current_epoch);
        Ok(())
    }

    fn prune_duties(&self, current_epoch: Epoch) {
        self.duties
            .lock()
            .expect("lock poisoned")
            .retain(|epoch, _| *epoch >= current_epoch);
        self.dependent_roots
            .lock()
            .expect("lock poisoned")
            .retain(|epoch, _| *epoch >= current_epoch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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

    fn test_service() -> Arc<AttestationService> {
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
        let chain = Arc::new(crate::beacon_chain::BeaconChain::new(
            Arc::clone(&spec),
            genesis,
        ));
        let signer = Arc::new(SignatureProvider::RemoteSigner(Arc::new(
            RemoteSigner::new("http://localhost:9000", Arc::clone(&metrics)).unwrap(),
        )));
        let tracker = Arc::new(ValidatorStatusTracker::new(
            Arc::clone(&multi),
            Arc::clone(&chain),
            Arc::clone(&signer),
            Arc::clone(&metrics),
        ));
        let dir = std::env::temp_dir();
        let ctx = DutyContext {
            multi_beacon_node: Arc::clone(&multi),
            beacon_chain: chain,
            signer,
            status_tracker: tracker,
            duty_cache: Arc::new(DutyCache::new(dir)),
            config,
            metrics,
        };
        let provider = Arc::new(AttestationDataProvider::new(multi));
        Arc::new(AttestationService::new(ctx, provider))
    }

    fn duty_for_slot(slot: Slot, pubkey_byte: u8) -> AttesterDutyWithSelectionProof {
        AttesterDutyWithSelectionProof {
            duty: AttesterDuty {
                pubkey: format!("0x{}", hex::encode([pubkey_byte; 48])),
                validator_index: pubkey_byte as u64,
                committee_index: 1,
                committee_length: 128,
                committees_at_slot: 2,
                validator_committee_index: 3,
                slot,
            },
            is_aggregator: false,
            selection_proof: format!("0x{}", "01".repeat(96)),
        }
    }

    #[tokio::test]
    async fn take_duties_removes_them_eagerly() {
        let service = test_service();
        let slot = 320;
        let epoch = 10;
        service.duties.lock().unwrap().insert(
            epoch,
            [duty_for_slot(slot, 1), duty_for_slot(slot, 2), duty_for_slot(321, 3)].into(),
        );

        let taken = service.take_duties_for_slot(slot);
        assert_eq!(taken.len(), 2);
        // Second take finds nothing; the remaining duty is for another slot.
        assert!(service.take_duties_for_slot(slot).is_empty());
        assert!(service.epoch_has_remaining_duties(epoch));
    }

    #[tokio::test]
    async fn wrong_slot_is_refused() {
        let service = test_service();
        // The chain's current slot is ~300; slot 1 is long gone.
        let result = service.attest_if_not_yet_attested(1, None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn second_attempt_for_same_slot_is_refused() {
        let service = test_service();
        // No duties stored: the first call claims the slot and no-ops. Retry
        // in case the wall clock crosses a slot boundary mid-test.
        let mut slot = service.ctx.beacon_chain.current_slot();
        for _ in 0..3 {
            if service.attest_if_not_yet_attested(slot, None).await.is_ok() {
                break;
            }
            slot = service.ctx.beacon_chain.current_slot();
        }
        assert_eq!(service.run_state.last_started(), slot as i64);
        let second = service.attest_if_not_yet_attested(slot, None).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn prune_removes_stale_epochs() {
        let service = test_service();
        {
            let mut duties = service.duties.lock().unwrap();
            duties.insert(1, [duty_for_slot(32, 1)].into());
            duties.insert(5, [duty_for_slot(160, 2)].into());
            let mut roots = service.dependent_roots.lock().unwrap();
            roots.insert(1, "0xaa".into());
            roots.insert(5, "0xbb".into());
        }
        service.prune_duties(5);
        assert!(!service.duties.lock().unwrap().contains_key(&1));
        assert!(service.duties.lock().unwrap().contains_key(&5));
        assert!(!service.dependent_roots.lock().unwrap().contains_key(&1));
    }
}

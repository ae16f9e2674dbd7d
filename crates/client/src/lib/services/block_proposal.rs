//! Block proposal duty service.
//!
//! RANDAO reveals are pre-computed one slot ahead of a proposal, fee
//! recipient preparations are re-sent just before a proposal is due, and
//! external-builder registrations are staggered across the epoch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use tokio::sync::Notify;

use vigil_shared::beacon_api::{
    ChainReorgEvent, ForkVersion, HeadEvent, ProposerDuty, ProposerPreparation,
    SignedBlockContentsElectra, SignedEnvelope,
};
use vigil_shared::eth_consensus_layer::{BeaconBlockHeader, Epoch, Slot};
use vigil_shared::remote_signer::{
    BeaconBlockSigningData, BeaconBlockVersion, RandaoReveal, SignableMessage,
    ValidatorRegistration,
};
use vigil_shared::util::encode_graffiti;

use crate::duty_cache::{DependentRootMap, ProposerDutyMap};
use crate::metrics::ErrorType;
use crate::multi_beacon_node::BlockContents;
use crate::services::{spawn_update_duties_loop, DutyContext, DutyRunState, ValidatorDuty};

/// Validator registrations are published in batches of this size.
const REGISTRATION_BATCH_SIZE: usize = 512;

pub struct BlockProposalService {
    ctx: DutyContext,
    duties: std::sync::Mutex<ProposerDutyMap>,
    dependent_roots: std::sync::Mutex<DependentRootMap>,
    randao_reveal_cache: std::sync::Mutex<HashMap<Slot, String>>,
    run_state: DutyRunState,
    update_trigger: Arc<Notify>,
}

impl BlockProposalService {
    pub fn new(ctx: DutyContext) -> Self {
        BlockProposalService {
            ctx,
            duties: std::sync::Mutex::new(HashMap::new()),
            dependent_roots: std::sync::Mutex::new(HashMap::new()),
            randao_reveal_cache: std::sync::Mutex::new(HashMap::new()),
            run_state: DutyRunState::default(),
            update_trigger: Arc::new(Notify::new()),
        }
    }

    pub fn has_ongoing_duty(&self) -> bool {
        self.run_state.has_ongoing_duty()
    }

    /// The next slot this service will propose in, if any. A proposal still
    /// in flight counts as the next duty.
    pub fn next_duty_slot(&self) -> Option<Slot> {
        if self.run_state.has_ongoing_duty() {
            return Some(self.run_state.last_started() as Slot);
        }
        let current_slot = self.ctx.beacon_chain.current_slot();
        let last_started = self.run_state.last_started();
        self.duties
            .lock()
            .expect("lock poisoned")
            .values()
            .flatten()
            .map(|duty| duty.slot)
            .filter(|slot| (*slot as i64) > last_started && *slot > current_slot)
            .min()
    }

    pub fn has_upcoming_duty(&self) -> bool {
        self.next_duty_slot()
            .is_some_and(|slot| slot <= self.ctx.beacon_chain.current_slot() + 3)
    }

    pub fn start(self: &Arc<Self>) {
        match self.ctx.duty_cache.load_proposer_duties() {
            Ok((duties, dependent_roots)) => {
                *self.duties.lock().expect("lock poisoned") = duties;
                *self.dependent_roots.lock().expect("lock poisoned") = dependent_roots;
            }
            Err(e) => tracing::debug!("Failed to load proposer duties from cache: {e}"),
        }

        let service = Arc::clone(self);
        spawn_update_duties_loop(
            "proposer",
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
            if let Err(e) = service.prepare_beacon_proposer().await {
                tracing::warn!("Failed to prepare beacon proposer: {e}");
            }
        });

        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticks = service.ctx.beacon_chain.subscribe_ticks();
            loop {
                match ticks.recv().await {
                    Ok(tick) => service.on_new_slot(tick.slot, tick.is_new_epoch).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Block proposal service lagged {skipped} slot ticks");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    pub fn persist_duties(&self) {
        let duties = self.duties.lock().expect("lock poisoned").clone();
        let dependent_roots = self.dependent_roots.lock().expect("lock poisoned").clone();
        if let Err(e) = self.ctx.duty_cache.store_proposer_duties(&duties, &dependent_roots) {
            tracing::warn!("Failed to cache proposer duties: {e}");
        }
    }

    async fn on_new_slot(self: &Arc<Self>, slot: Slot, is_new_epoch: bool) {
        // Any proposal for this slot must finish before the lookahead work.
        if let Err(e) = self.propose_block(slot).await {
            tracing::warn!("Block proposal for slot {slot} not performed: {e}");
        }

        if let Some(duty) = self.duty_for_slot(slot + 1) {
            if let Err(e) = self.fetch_randao_reveal(&duty).await {
                tracing::warn!("Failed to pre-compute RANDAO reveal: {e}");
            }
            // One more preparation right before the proposal, in case a
            // beacon node restarted and lost the fee recipient mapping.
            if let Err(e) = self.prepare_beacon_proposer().await {
                tracing::warn!("Failed to prepare beacon proposer: {e}");
            }
        }

        if self.ctx.config.use_external_builder {
            let service = Arc::clone(self);
            tokio::spawn(async move { service.register_validators(slot).await });
        }

        if is_new_epoch {
            self.update_trigger.notify_one();
            let service = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = service.prepare_beacon_proposer().await {
                    tracing::warn!("Failed to prepare beacon proposer: {e}");
                }
            });
        }
    }

    pub fn handle_head_event(&self, event: &HeadEvent) {
        let known = self
            .dependent_roots
            .lock()
            .expect("lock poisoned")
            .values()
            .any(|root| *root == event.current_duty_dependent_root);
        if !known {
            tracing::info!("Head event duty dependent root mismatch -> updating duties");
            self.update_trigger.notify_one();
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

    fn duty_for_slot(&self, slot: Slot) -> Option<ProposerDuty> {
        let epoch = self.ctx.beacon_chain.spec.epoch_of(slot);
        self.duties
            .lock()
            .expect("lock poisoned")
            .get(&epoch)
            .and_then(|duties| duties.iter().find(|duty| duty.slot == slot).cloned())
    }

    pub async fn propose_block(self: &Arc<Self>, slot: Slot) -> Result<()> {
        self.ctx.refuse_if_slashing_detected("producing block")?;

        if (slot as i64) <= self.run_state.last_started() {
            bail!(
                "Not producing block for slot {slot} (already started producing a block for slot {})",
                self.run_state.last_started()
            );
        }
        let current_slot = self.ctx.beacon_chain.current_slot();
        if slot != current_slot {
            bail!("Invalid slot for block proposal: {slot}. Current slot: {current_slot}");
        }

        let Some(duty) = self.duty_for_slot(slot) else {
            tracing::debug!("No remaining proposer duties for slot {slot}");
            return Ok(());
        };

        // Drop the duty before doing anything else so a second entry for
        // this slot has nothing to propose.
        let epoch = self.ctx.beacon_chain.spec.epoch_of(slot);
        if let Some(duties) = self.duties.lock().expect("lock poisoned").get_mut(&epoch) {
            duties.remove(&duty);
        }
        self.run_state.try_begin(slot)?;

        let result = self.propose(slot, duty).await;
        self.run_state.mark_completed(slot);
        result
    }

    async fn propose(&self, slot: Slot, duty: ProposerDuty) -> Result<()> {
        tracing::info!("Proposing block for slot {slot}");
        self.ctx.observe_duty_start(ValidatorDuty::BlockProposal, slot);

        let randao_reveal = self.get_randao_reveal(slot, &duty).await?;

        let graffiti = match self.ctx.signer.graffiti_override(&duty.pubkey) {
            Some(override_value) => {
                tracing::info!("Using keymanager-provided graffiti: {override_value}");
                encode_graffiti(&override_value)?
            }
            None => self.ctx.config.graffiti,
        };

        // Collect better blocks until half an interval has passed; a single
        // very slow node must not consume the whole slot.
        let soft_timeout = self.ctx.beacon_chain.spec.interval_duration() / 2;
        let (contents, response) = self
            .ctx
            .multi_beacon_node
            .produce_block_v3(
                slot,
                graffiti,
                self.ctx.config.builder_boost_factor,
                randao_reveal,
                soft_timeout,
            )
            .await
            .inspect_err(|_| self.ctx.metrics.inc_error(ErrorType::BlockProduce))
            .context("failed to produce block")?;

        let block_header = BeaconBlockHeader {
            slot: contents.slot(),
            proposer_index: contents.proposer_index(),
            parent_root: contents.parent_root(),
            state_root: contents.state_root(),
            body_root: contents.body_root(),
        };
        let block_version = match response.version {
            ForkVersion::Electra => BeaconBlockVersion::Electra,
            ForkVersion::Fulu => BeaconBlockVersion::Fulu,
            ForkVersion::Gloas => BeaconBlockVersion::Gloas,
        };

        let (_, signature, _) = self
            .ctx
            .signer
            .sign(
                SignableMessage::BeaconBlockV2 {
                    fork_info: self.ctx.beacon_chain.fork_info(slot)?,
                    beacon_block: BeaconBlockSigningData {
                        version: block_version,
                        block_header,
                    },
                },
                &duty.pubkey,
            )
            .await
            .inspect_err(|_| self.ctx.metrics.inc_error(ErrorType::Signature))
            .context("failed to get signature for block")?;

        let block_root = contents.block_root();
        tracing::info!("Publishing block for slot {slot}");
        self.ctx
            .observe_duty_submission(ValidatorDuty::BlockProposal, slot);

        let publish_result = match contents {
            BlockContents::Blinded(block) => {
                self.ctx
                    .multi_beacon_node
                    .publish_blinded_block_v2(
                        SignedEnvelope {
                            message: *block,
                            signature,
                        },
                        response.version,
                    )
                    .await
            }
            BlockContents::Full(contents) => {
                self.ctx
                    .multi_beacon_node
                    .publish_block_v2(
                        SignedBlockContentsElectra {
                            signed_block: SignedEnvelope {
                                message: contents.block,
                                signature,
                            },
                            kzg_proofs: contents.kzg_proofs,
                            blobs: contents.blobs,
                        },
                        response.version,
                    )
                    .await
            }
        };
        publish_result
            .inspect_err(|_| self.ctx.metrics.inc_error(ErrorType::BlockPublish))
            .with_context(|| format!("failed to publish block for slot {slot}"))?;

        tracing::info!("Published block for slot {slot}, root {block_root:?}");
        self.ctx.metrics.duties.published_blocks.inc();
        Ok(())
    }

    // RANDAO reveals

    async fn fetch_randao_reveal(&self, duty: &ProposerDuty) -> Result<()> {
        tracing::debug!("Fetching RANDAO reveal for slot {}", duty.slot);
        let epoch = self.ctx.beacon_chain.spec.epoch_of(duty.slot);
        let (_, signature, _) = self
            .ctx
            .signer
            .sign(
                SignableMessage::RandaoReveal {
                    fork_info: self.ctx.beacon_chain.fork_info(duty.slot)?,
                    randao_reveal: RandaoReveal { epoch },
                },
                &duty.pubkey,
            )
            .await?;
        self.randao_reveal_cache
            .lock()
            .expect("lock poisoned")
            .insert(duty.slot, signature);
        Ok(())
    }

    /// The cached reveal is consumed by removal, so each one is used for at
    /// most one proposal.
    async fn get_randao_reveal(&self, slot: Slot, duty: &ProposerDuty) -> Result<String> {
        if let Some(reveal) = self
            .randao_reveal_cache
            .lock()
            .expect("lock poisoned")
            .remove(&slot)
        {
            return Ok(reveal);
        }

        tracing::warn!("Failed to get RANDAO reveal for slot {slot} from cache");
        self.fetch_randao_reveal(duty)
            .await
            .inspect_err(|_| self.ctx.metrics.inc_error(ErrorType::BlockProduce))?;
        self.randao_reveal_cache
            .lock()
            .expect("lock poisoned")
            .remove(&slot)
            .context("RANDAO reveal missing after fetch")
    }

    // Preparations and registrations

    pub async fn prepare_beacon_proposer(&self) -> Result<()> {
        tracing::debug!("Calling prepare_beacon_proposer");
        let validators = self.ctx.status_tracker.active_or_pending_validators();
        if validators.is_empty() {
            return Ok(());
        }

        let default_fee_recipient = self.ctx.config.fee_recipient.clone();
        let preparations: Vec<ProposerPreparation> = validators
            .iter()
            .map(|validator| ProposerPreparation {
                validator_index: validator.index,
                fee_recipient: self
                    .ctx
                    .signer
                    .fee_recipient_override(&validator.pubkey)
                    .unwrap_or_else(|| default_fee_recipient.clone()),
            })
            .collect();

        self.ctx
            .multi_beacon_node
            .prepare_beacon_proposer(preparations)
            .await
    }

    /// Register a slot-dependent subset of validators with external
    /// builders, spreading the registrations across the epoch.
    async fn register_validators(&self, current_slot: Slot) {
        let slots_per_epoch = self.ctx.beacon_chain.spec.slots_per_epoch;
        let validators: Vec<_> = self
            .ctx
            .status_tracker
            .active_or_pending_validators()
            .into_iter()
            .filter(|v| v.index % slots_per_epoch == current_slot % slots_per_epoch)
            .collect();
        if validators.is_empty() {
            return;
        }

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            .to_string();
        let default_fee_recipient = self.ctx.config.fee_recipient.clone();
        let default_gas_limit = self.ctx.config.gas_limit.to_string();

        for batch in validators.chunks(REGISTRATION_BATCH_SIZE) {
            let mut messages = Vec::with_capacity(batch.len());
            let mut identifiers = Vec::with_capacity(batch.len());
            for validator in batch {
                messages.push(SignableMessage::ValidatorRegistration {
                    validator_registration: ValidatorRegistration {
                        fee_recipient: self
                            .ctx
                            .signer
                            .fee_recipient_override(&validator.pubkey)
                            .unwrap_or_else(|| default_fee_recipient.clone()),
                        gas_limit: self
                            .ctx
                            .signer
                            .gas_limit_override(&validator.pubkey)
                            .unwrap_or_else(|| default_gas_limit.clone()),
                        timestamp: timestamp.clone(),
                        pubkey: validator.pubkey.clone(),
                    },
                });
                identifiers.push(validator.pubkey.clone());
            }

            let signed = match self.ctx.signer.sign_in_batches(messages, identifiers).await {
                Ok(signed) => signed,
                Err(e) => {
                    self.ctx.metrics.inc_error(ErrorType::Signature);
                    tracing::warn!("Failed to get signatures for validator registrations: {e}");
                    continue;
                }
            };

            let mut envelopes = Vec::with_capacity(signed.len());
            for (message, signature, _) in signed {
                if let SignableMessage::ValidatorRegistration {
                    validator_registration,
                } = message
                {
                    envelopes.push(SignedEnvelope {
                        message: validator_registration,
                        signature,
                    });
                }
            }

            let count = envelopes.len();
            match self.ctx.multi_beacon_node.register_validator(envelopes).await {
                Ok(()) => {
                    tracing::info!("Published validator registrations, count: {count}")
                }
                Err(e) => {
                    tracing::warn!("Failed to publish validator registrations: {e}")
                }
            }
        }
    }

    // Duty updates

    async fn update_duties_once(self: &Arc<Self>) -> Result<()> {
        let indices = self.ctx.status_tracker.active_or_pending_indices();
        if indices.is_empty() {
            tracing::warn!("Not updating proposer duties - no active or pending validators");
            return Ok(());
        }
        let index_set: std::collections::HashSet<u64> = indices.into_iter().collect();

        let current_epoch = self.ctx.beacon_chain.current_epoch();
        for epoch in [current_epoch, current_epoch + 1] {
            tracing::debug!("Updating proposer duties for epoch {epoch}");
            let response = self.ctx.multi_beacon_node.get_proposer_duties(epoch).await?;
            tracing::debug!(
                "Dependent root for proposer duties for epoch {epoch} - {}",
                response.dependent_root
            );
            self.dependent_roots
                .lock()
                .expect("lock poisoned")
                .insert(epoch, response.dependent_root);

            let current_slot = self.ctx.beacon_chain.current_slot();
            let our_duties: std::collections::HashSet<ProposerDuty> = response
                .data
                .into_iter()
                .filter(|duty| {
                    duty.slot >= current_slot && index_set.contains(&duty.validator_index)
                })
                .collect();

            let mut sorted: Vec<&ProposerDuty> = our_duties.iter().collect();
            sorted.sort_by_key(|duty| duty.slot);
            for duty in sorted {
                tracing::info!(
                    "Upcoming block proposal duty at slot {} for validator {}",
                    duty.slot,
                    duty.validator_index
                );
            }

            tracing::debug!(
                "Updated proposer duties for epoch {epoch} -> {}",
                our_duties.len()
            );
            self.duties
                .lock()
                .expect("lock poisoned")
                .insert(epoch, our_duties);
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
    use crate::attestation_data_provider::AttestationDataProvider;
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

    fn test_service() -> Arc<BlockProposalService> {
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
            genesis_time: SystemTime::now()
                .duration_since(UNIX_EPOCH)
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
            multi_beacon_node: Arc::clone(&multi),
            beacon_chain: chain,
            signer,
            status_tracker: tracker,
            duty_cache: Arc::new(DutyCache::new(std::env::temp_dir())),
            config,
            metrics,
        };
        let _provider = AttestationDataProvider::new(multi);
        Arc::new(BlockProposalService::new(ctx))
    }

    fn duty(slot: Slot) -> ProposerDuty {
        ProposerDuty {
            pubkey: format!("0x{}", "aa".repeat(48)),
            validator_index: 1,
            slot,
        }
    }

    #[tokio::test]
    async fn no_duty_means_no_proposal_attempt() {
        let service = test_service();
        let slot = service.ctx.beacon_chain.current_slot();
        // Without duties this claims nothing and succeeds quietly.
        service.propose_block(slot).await.unwrap();
        assert_eq!(service.run_state.last_started(), -1);
    }

    #[tokio::test]
    async fn duty_for_slot_finds_only_exact_slot() {
        let service = test_service();
        let slot = service.ctx.beacon_chain.current_slot();
        let epoch = service.ctx.beacon_chain.spec.epoch_of(slot);
        service
            .duties
            .lock()
            .unwrap()
            .insert(epoch, [duty(slot)].into());

        assert!(service.duty_for_slot(slot).is_some());
        assert!(service.duty_for_slot(slot + 1).is_none());
    }

    #[tokio::test]
    async fn next_duty_slot_skips_past_slots() {
        let service = test_service();
        let current = service.ctx.beacon_chain.current_slot();
        let epoch = service.ctx.beacon_chain.spec.epoch_of(current);
        service
            .duties
            .lock()
            .unwrap()
            .insert(epoch, [duty(current.saturating_sub(5)), duty(current + 2)].into());

        assert_eq!(service.next_duty_slot(), Some(current + 2));
        assert!(service.has_upcoming_duty());
    }

    #[tokio::test]
    async fn randao_reveal_is_consumed_once() {
        let service = test_service();
        service
            .randao_reveal_cache
            .lock()
            .unwrap()
            .insert(42, "0xsig".into());

        let first = service
            .randao_reveal_cache
            .lock()
            .unwrap()
            .remove(&42);
        assert_eq!(first.as_deref(), Some("0xsig"));
        let second = service.randao_reveal_cache.lock().unwrap().remove(&42);
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn old_slot_proposal_is_refused_after_duty_started() {
        let service = test_service();
        service.run_state.try_begin(1000).unwrap();
        let result = service.propose_block(999).await;
        assert!(result.is_err());
    }
}

//! Fan-out over multiple beacon node clients.
//!
//! Reads that benefit from redundancy go to every node; attestation data
//! additionally requires a threshold of nodes to agree before it is used.
//! Block production collects candidate blocks from all nodes and picks the
//! most valuable one. An optional disjoint pool of nodes can be dedicated to
//! block proposals.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::task::JoinSet;
use tree_hash::TreeHash;

use vigil_shared::beacon_api::{
    BeaconCommitteeSubscription, ForkVersion, GetAttesterDutiesResponse, GetProposerDutiesResponse,
    GetSyncDutiesResponse, ProduceBlockV3Response, ProposerPreparation, SignedBlindedBlockElectra,
    SignedBlockContentsElectra, SignedEnvelope, SingleAttestation, SyncCommitteeMessageBody,
    SyncCommitteeSubscription, ValidatorStatus,
};
use vigil_shared::eth_consensus_layer::{
    AggregateAndProofElectra, AttestationData, AttestationElectra, BlindedBeaconBlockElectra,
    BlockContentsElectra, Checkpoint, ContributionAndProof, Epoch, Hash256, Slot,
    SyncCommitteeContribution,
};
use vigil_shared::remote_signer::ValidatorRegistration;
use vigil_shared::validator::ValidatorIndexPubkey;

use crate::beacon_node::{BeaconNode, BeaconNodeError};
use crate::chain_spec::ChainSpec;
use crate::config::Config;
use crate::metrics::Metrics;

/// Outer deadline for the initial beacon node initialization.
const INIT_TIMEOUT: Duration = Duration::from_secs(300);
const INIT_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Minimum duration of one attestation data consensus round.
const CONSENSUS_ROUND_INTERVAL: Duration = Duration::from_millis(30);

/// A decoded `produce_block_v3` payload.
#[derive(Debug, Clone)]
pub enum BlockContents {
    Full(Box<BlockContentsElectra>),
    Blinded(Box<BlindedBeaconBlockElectra>),
}

impl BlockContents {
    pub fn slot(&self) -> Slot {
        match self {
            BlockContents::Full(contents) => contents.block.slot,
            BlockContents::Blinded(block) => block.slot,
        }
    }

    pub fn proposer_index(&self) -> u64 {
        match self {
            BlockContents::Full(contents) => contents.block.proposer_index,
            BlockContents::Blinded(block) => block.proposer_index,
        }
    }

    pub fn parent_root(&self) -> Hash256 {
        match self {
            BlockContents::Full(contents) => contents.block.parent_root,
            BlockContents::Blinded(block) => block.parent_root,
        }
    }

    pub fn state_root(&self) -> Hash256 {
        match self {
            BlockContents::Full(contents) => contents.block.state_root,
            BlockContents::Blinded(block) => block.state_root,
        }
    }

    pub fn body_root(&self) -> Hash256 {
        match self {
            BlockContents::Full(contents) => contents.block.body.tree_hash_root(),
            BlockContents::Blinded(block) => block.body.tree_hash_root(),
        }
    }

    pub fn block_root(&self) -> Hash256 {
        match self {
            BlockContents::Full(contents) => contents.block.tree_hash_root(),
            BlockContents::Blinded(block) => block.tree_hash_root(),
        }
    }
}

/// Decode the `data` of a block production response into the fork's
/// containers. Fulu reuses the Electra containers unchanged.
pub fn decode_block_contents(
    response: &ProduceBlockV3Response,
) -> Result<BlockContents, BeaconNodeError> {
    match response.version {
        ForkVersion::Electra | ForkVersion::Fulu => {
            if response.execution_payload_blinded {
                serde_json::from_value(response.data.clone())
                    .map(|block| BlockContents::Blinded(Box::new(block)))
                    .map_err(|e| BeaconNodeError::Parse("produce_block_v3".into(), e.to_string()))
            } else {
                serde_json::from_value(response.data.clone())
                    .map(|contents| BlockContents::Full(Box::new(contents)))
                    .map_err(|e| BeaconNodeError::Parse("produce_block_v3".into(), e.to_string()))
            }
        }
        other => Err(BeaconNodeError::UnsupportedBlockVersion(other)),
    }
}

/// Per-host accounting for the attestation data consensus rounds. A host may
/// change its answer between rounds; only its latest answer counts.
#[derive(Debug, Default)]
pub(crate) struct ConsensusTracker {
    by_host: HashMap<String, AttestationData>,
    counts: HashMap<AttestationData, usize>,
}

impl ConsensusTracker {
    pub(crate) fn record(&mut self, host: String, att_data: AttestationData) -> usize {
        if let Some(previous) = self.by_host.get(&host) {
            if *previous == att_data {
                return self.counts.get(&att_data).copied().unwrap_or(0);
            }
            if let Some(count) = self.counts.get_mut(previous) {
                *count = count.saturating_sub(1);
            }
        }
        self.by_host.insert(host, att_data.clone());
        let count = self.counts.entry(att_data).or_insert(0);
        *count += 1;
        *count
    }

    pub(crate) fn hosts_backing(&self, att_data: &AttestationData) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .by_host
            .iter()
            .filter(|entry| entry.1 == att_data)
            .map(|entry| entry.0.clone())
            .collect();
        hosts.sort();
        hosts
    }
}

pub(crate) fn best_aggregate(
    aggregates: Vec<AttestationElectra>,
) -> Option<AttestationElectra> {
    let mut best: Option<AttestationElectra> = None;
    let mut best_count = 0;
    for aggregate in aggregates {
        let count = aggregate.aggregation_bits.num_set_bits();
        if count > best_count || best.is_none() {
            best_count = count;
            let ideal = count == aggregate.aggregation_bits.len();
            best = Some(aggregate);
            if ideal {
                break;
            }
        }
    }
    best
}

pub(crate) fn best_contribution(
    contributions: Vec<SyncCommitteeContribution>,
) -> Option<SyncCommitteeContribution> {
    let mut best: Option<SyncCommitteeContribution> = None;
    let mut best_count = 0;
    for contribution in contributions {
        let count = contribution.aggregation_bits.num_set_bits();
        if count > best_count || best.is_none() {
            best_count = count;
            let ideal = count == contribution.aggregation_bits.len();
            best = Some(contribution);
            if ideal {
                break;
            }
        }
    }
    best
}

pub struct MultiBeaconNode {
    beacon_nodes: Vec<Arc<BeaconNode>>,
    beacon_nodes_proposal: Vec<Arc<BeaconNode>>,
    pub spec: Arc<ChainSpec>,
    config: Arc<Config>,
    attestation_consensus_threshold: usize,
}

impl MultiBeaconNode {
    pub fn new(
        spec: Arc<ChainSpec>,
        config: Arc<Config>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, BeaconNodeError> {
        let beacon_nodes = config
            .beacon_node_urls
            .iter()
            .map(|url| {
                BeaconNode::new(url, Arc::clone(&spec), Arc::clone(&metrics)).map(Arc::new)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let beacon_nodes_proposal = config
            .beacon_node_urls_proposal
            .iter()
            .map(|url| {
                BeaconNode::new(url, Arc::clone(&spec), Arc::clone(&metrics)).map(Arc::new)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let attestation_consensus_threshold = config.attestation_consensus_threshold;
        Ok(MultiBeaconNode {
            beacon_nodes,
            beacon_nodes_proposal,
            spec,
            config,
            attestation_consensus_threshold,
        })
    }

    pub fn beacon_nodes(&self) -> &[Arc<BeaconNode>] {
        &self.beacon_nodes
    }

    pub fn initialized_beacon_nodes(&self) -> Vec<Arc<BeaconNode>> {
        self.beacon_nodes
            .iter()
            .filter(|bn| bn.is_initialized())
            .cloned()
            .collect()
    }

    /// The first node in configured order; preferred for SSE subscriptions.
    pub fn primary_beacon_node(&self) -> Arc<BeaconNode> {
        Arc::clone(&self.beacon_nodes[0])
    }

    /// Highest-scoring initialized node; ties break in configured order.
    pub fn best_beacon_node(&self) -> Result<Arc<BeaconNode>> {
        let mut best: Option<Arc<BeaconNode>> = None;
        for bn in self.initialized_beacon_nodes() {
            match &best {
                Some(current) if bn.score() <= current.score() => {}
                _ => best = Some(bn),
            }
        }
        best.context("no initialized beacon nodes")
    }

    fn proposal_pool(&self) -> Vec<Arc<BeaconNode>> {
        if self.beacon_nodes_proposal.is_empty() {
            self.initialized_beacon_nodes()
        } else {
            self.beacon_nodes_proposal.to_vec()
        }
    }

    pub async fn initialize(&self) -> Result<()> {
        tracing::info!("Initializing beacon nodes");
        for bn in self.beacon_nodes.iter().chain(&self.beacon_nodes_proposal) {
            bn.spawn_initialize();
        }

        let deadline = tokio::time::Instant::now() + INIT_TIMEOUT;
        loop {
            let initialized = self.initialized_beacon_nodes().len();
            if initialized >= self.attestation_consensus_threshold {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                bail!(
                    "Failed to fully initialize a sufficient amount of beacon nodes - \
                     {initialized}/{} initialized (required: {})",
                    self.beacon_nodes.len(),
                    self.attestation_consensus_threshold
                );
            }
            tokio::time::sleep(INIT_POLL_INTERVAL).await;
        }

        for bn in self.initialized_beacon_nodes() {
            if let Some(reported) = bn.reported_spec() {
                if reported != *self.spec {
                    if self.config.ignore_spec_mismatch {
                        tracing::warn!(
                            "Beacon node {} reports a spec that differs from the configured one",
                            bn.host
                        );
                    } else {
                        bail!(
                            "Beacon node {} provided a spec that differs from the configured one",
                            bn.host
                        );
                    }
                }
            }
        }

        tracing::info!(
            "Successfully initialized {}/{} beacon nodes",
            self.initialized_beacon_nodes().len(),
            self.beacon_nodes.len()
        );
        Ok(())
    }

    /// Launch `f` on every node, return the first success, cancel the rest.
    async fn first_ok<T, F, Fut>(
        &self,
        op_name: &str,
        nodes: Vec<Arc<BeaconNode>>,
        f: F,
    ) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(Arc<BeaconNode>) -> Fut,
        Fut: Future<Output = Result<T, BeaconNodeError>> + Send + 'static,
    {
        let mut set = JoinSet::new();
        for bn in nodes {
            set.spawn(f(bn));
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(value)) => {
                    set.abort_all();
                    return Ok(value);
                }
                Ok(Err(e)) => {
                    tracing::warn!("Failed to get a response from beacon node: {e}");
                }
                Err(e) => {
                    if !e.is_cancelled() {
                        tracing::warn!("Beacon node request task failed: {e}");
                    }
                }
            }
        }
        Err(anyhow!(
            "Failed to get a response from all beacon nodes for {op_name}"
        ))
    }

    /// Launch `f` on every node and collect all successes; errors only if no
    /// node succeeded.
    async fn all_ok<T, F, Fut>(&self, op_name: &str, nodes: Vec<Arc<BeaconNode>>, f: F) -> Result<Vec<T>>
    where
        T: Send + 'static,
        F: Fn(Arc<BeaconNode>) -> Fut,
        Fut: Future<Output = Result<T, BeaconNodeError>> + Send + 'static,
    {
        let mut set = JoinSet::new();
        for bn in nodes {
            set.spawn(f(bn));
        }

        let mut responses = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(value)) => responses.push(value),
                Ok(Err(e)) => {
                    tracing::warn!("Failed to get a response from beacon node: {e}");
                }
                Err(e) => {
                    if !e.is_cancelled() {
                        tracing::warn!("Beacon node request task failed: {e}");
                    }
                }
            }
        }

        if responses.is_empty() {
            bail!("Failed to get a response from all beacon nodes for {op_name}");
        }
        Ok(responses)
    }

    // Validators and duties

    pub async fn get_validators(
        &self,
        ids: Vec<String>,
        statuses: Vec<ValidatorStatus>,
    ) -> Result<Vec<ValidatorIndexPubkey>> {
        self.first_ok("get_validators", self.initialized_beacon_nodes(), move |bn| {
            let ids = ids.clone();
            let statuses = statuses.clone();
            async move { bn.get_validators(&ids, &statuses, "head").await }
        })
        .await
    }

    pub async fn get_attester_duties(
        &self,
        epoch: Epoch,
        indices: &[u64],
    ) -> Result<GetAttesterDutiesResponse> {
        Ok(self
            .best_beacon_node()?
            .get_attester_duties(epoch, indices)
            .await?)
    }

    pub async fn get_proposer_duties(&self, epoch: Epoch) -> Result<GetProposerDutiesResponse> {
        Ok(self.best_beacon_node()?.get_proposer_duties(epoch).await?)
    }

    pub async fn get_sync_duties(
        &self,
        epoch: Epoch,
        indices: &[u64],
    ) -> Result<GetSyncDutiesResponse> {
        Ok(self
            .best_beacon_node()?
            .get_sync_duties(epoch, indices)
            .await?)
    }

    pub async fn get_block_root(&self, block_id: &str) -> Result<String> {
        Ok(self.best_beacon_node()?.get_block_root(block_id).await?)
    }

    // Attestation data consensus

    /// Poll every node until at least `attestation_consensus_threshold` of
    /// them return an identical `AttestationData`. The caller bounds the
    /// overall wait through cancellation.
    pub async fn produce_attestation_data_without_head_event(
        &self,
        slot: Slot,
    ) -> Result<AttestationData> {
        let mut tracker = ConsensusTracker::default();

        loop {
            let round_start = tokio::time::Instant::now();

            let mut set = JoinSet::new();
            for bn in self.initialized_beacon_nodes() {
                set.spawn(async move { bn.produce_attestation_data(slot).await });
            }

            while let Some(joined) = set.join_next().await {
                let (host, att_data) = match joined {
                    Ok(Ok(response)) => response,
                    Ok(Err(e)) => {
                        // Some production failures are tolerable; keep going.
                        tracing::warn!("Failed to produce attestation data: {e}");
                        continue;
                    }
                    Err(e) => {
                        if !e.is_cancelled() {
                            tracing::warn!("Attestation data task failed: {e}");
                        }
                        continue;
                    }
                };

                tracing::debug!("AttestationData received from {host}: {att_data:?}");
                let count = tracker.record(host, att_data.clone());
                if count >= self.attestation_consensus_threshold {
                    set.abort_all();
                    tracing::debug!(
                        "Produced AttestationData without head event using {:?}",
                        tracker.hosts_backing(&att_data)
                    );
                    return Ok(att_data);
                }
            }

            // No consensus this round; pace the polling.
            tokio::time::sleep_until(round_start + CONSENSUS_ROUND_INTERVAL).await;
        }
    }

    /// Returns the first attestation data whose block root matches the head
    /// event hint; every node polls its local endpoint until then.
    pub async fn wait_for_attestation_data(
        &self,
        expected_head_block_root: Hash256,
        slot: Slot,
    ) -> Result<AttestationData> {
        self.first_ok(
            "wait_for_attestation_data",
            self.initialized_beacon_nodes(),
            move |bn| async move {
                bn.wait_for_attestation_data(expected_head_block_root, slot)
                    .await
            },
        )
        .await
    }

    /// Resolves once a threshold of nodes confirm both checkpoints.
    pub async fn wait_for_checkpoints(
        &self,
        slot: Slot,
        expected_source: Checkpoint,
        expected_target: Checkpoint,
    ) -> Result<()> {
        let mut set = JoinSet::new();
        for bn in self.initialized_beacon_nodes() {
            set.spawn(async move {
                bn.wait_for_checkpoints(slot, expected_source, expected_target)
                    .await
            });
        }

        let mut confirmations = 0usize;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(())) => {
                    confirmations += 1;
                    if confirmations >= self.attestation_consensus_threshold {
                        set.abort_all();
                        return Ok(());
                    }
                }
                Ok(Err(e)) => tracing::warn!("Checkpoint confirmation failed: {e}"),
                Err(e) => {
                    if !e.is_cancelled() {
                        tracing::warn!("Checkpoint confirmation task failed: {e}");
                    }
                }
            }
        }
        bail!("Failed to confirm checkpoints on enough beacon nodes")
    }

    // Attestation publishing and aggregation

    pub async fn publish_attestations(
        &self,
        attestations: Vec<SingleAttestation>,
        fork_version: ForkVersion,
    ) -> Result<()> {
        self.all_ok(
            "publish_attestations",
            self.initialized_beacon_nodes(),
            move |bn| {
                let attestations = attestations.clone();
                async move { bn.publish_attestations(&attestations, fork_version).await }
            },
        )
        .await?;
        Ok(())
    }

    pub async fn get_aggregate_attestation_v2(
        &self,
        attestation_data_root: Hash256,
        slot: Slot,
        committee_index: u64,
    ) -> Result<AttestationElectra> {
        let aggregates = self
            .all_ok(
                "get_aggregate_attestation_v2",
                self.initialized_beacon_nodes(),
                move |bn| async move {
                    bn.get_aggregate_attestation_v2(attestation_data_root, slot, committee_index)
                        .await
                },
            )
            .await?;
        best_aggregate(aggregates).context("no usable aggregate attestation")
    }

    pub async fn publish_aggregate_and_proofs(
        &self,
        signed_aggregate_and_proofs: Vec<SignedEnvelope<AggregateAndProofElectra>>,
        fork_version: ForkVersion,
    ) -> Result<()> {
        self.all_ok(
            "publish_aggregate_and_proofs",
            self.initialized_beacon_nodes(),
            move |bn| {
                let messages = signed_aggregate_and_proofs.clone();
                async move { bn.publish_aggregate_and_proofs(&messages, fork_version).await }
            },
        )
        .await?;
        Ok(())
    }

    // Sync committees

    pub async fn publish_sync_committee_messages(
        &self,
        messages: Vec<SyncCommitteeMessageBody>,
    ) -> Result<()> {
        self.all_ok(
            "publish_sync_committee_messages",
            self.initialized_beacon_nodes(),
            move |bn| {
                let messages = messages.clone();
                async move { bn.publish_sync_committee_messages(&messages).await }
            },
        )
        .await?;
        Ok(())
    }

    pub async fn get_sync_committee_contribution(
        &self,
        slot: Slot,
        subcommittee_index: u64,
        beacon_block_root: String,
    ) -> Result<SyncCommitteeContribution> {
        let contributions = self
            .all_ok(
                "get_sync_committee_contribution",
                self.initialized_beacon_nodes(),
                move |bn| {
                    let root = beacon_block_root.clone();
                    async move {
                        bn.get_sync_committee_contribution(slot, subcommittee_index, &root)
                            .await
                    }
                },
            )
            .await?;
        best_contribution(contributions).context("no usable sync committee contribution")
    }

    pub async fn publish_sync_committee_contribution_and_proofs(
        &self,
        signed_contribution_and_proofs: Vec<SignedEnvelope<ContributionAndProof>>,
    ) -> Result<()> {
        self.all_ok(
            "publish_sync_committee_contribution_and_proofs",
            self.initialized_beacon_nodes(),
            move |bn| {
                let messages = signed_contribution_and_proofs.clone();
                async move {
                    bn.publish_sync_committee_contribution_and_proofs(&messages)
                        .await
                }
            },
        )
        .await?;
        Ok(())
    }

    // Subscriptions and preparations

    pub async fn prepare_beacon_committee_subscriptions(
        &self,
        subscriptions: Vec<BeaconCommitteeSubscription>,
    ) -> Result<()> {
        self.all_ok(
            "prepare_beacon_committee_subscriptions",
            self.initialized_beacon_nodes(),
            move |bn| {
                let subscriptions = subscriptions.clone();
                async move { bn.prepare_beacon_committee_subscriptions(&subscriptions).await }
            },
        )
        .await?;
        Ok(())
    }

    pub async fn prepare_sync_committee_subscriptions(
        &self,
        subscriptions: Vec<SyncCommitteeSubscription>,
    ) -> Result<()> {
        self.all_ok(
            "prepare_sync_committee_subscriptions",
            self.initialized_beacon_nodes(),
            move |bn| {
                let subscriptions = subscriptions.clone();
                async move { bn.prepare_sync_committee_subscriptions(&subscriptions).await }
            },
        )
        .await?;
        Ok(())
    }

    pub async fn prepare_beacon_proposer(
        &self,
        preparations: Vec<ProposerPreparation>,
    ) -> Result<()> {
        self.all_ok(
            "prepare_beacon_proposer",
            self.initialized_beacon_nodes(),
            move |bn| {
                let preparations = preparations.clone();
                async move { bn.prepare_beacon_proposer(&preparations).await }
            },
        )
        .await?;
        Ok(())
    }

    /// One node is enough for MEV relay registrations; no need to flood the
    /// relays with duplicates.
    pub async fn register_validator(
        &self,
        signed_registrations: Vec<SignedEnvelope<ValidatorRegistration>>,
    ) -> Result<()> {
        self.best_beacon_node()?
            .register_validator(&signed_registrations)
            .await?;
        Ok(())
    }

    // Block production

    fn block_value(&self, response: &ProduceBlockV3Response) -> u128 {
        if self.config.compare_consensus_block_value_only() {
            response.consensus_block_value()
        } else {
            response.total_block_value()
        }
    }

    async fn produce_best_block(
        &self,
        slot: Slot,
        graffiti: [u8; 32],
        builder_boost_factor: u64,
        randao_reveal: String,
        soft_timeout: Duration,
    ) -> Result<ProduceBlockV3Response> {
        let nodes = if self.beacon_nodes_proposal.is_empty() {
            self.initialized_beacon_nodes()
        } else {
            tracing::info!(
                "Overriding beacon nodes for block proposal, using {:?}",
                self.beacon_nodes_proposal
                    .iter()
                    .map(|bn| bn.host.clone())
                    .collect::<Vec<_>>()
            );
            self.beacon_nodes_proposal.to_vec()
        };

        let mut set = JoinSet::new();
        for bn in nodes {
            let randao_reveal = randao_reveal.clone();
            set.spawn(async move {
                bn.produce_block_v3(slot, &graffiti, builder_boost_factor, &randao_reveal)
                    .await
            });
        }

        let deadline = tokio::time::Instant::now() + soft_timeout;
        let mut best: Option<(u128, ProduceBlockV3Response)> = None;

        while !set.is_empty() {
            match tokio::time::timeout_at(deadline, set.join_next()).await {
                Err(_) => {
                    tracing::warn!("Block production timeout reached.");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Ok(Ok(response)))) => {
                    let value = self.block_value(&response);
                    if best.as_ref().is_none_or(|(best_value, _)| value > *best_value) {
                        best = Some((value, response));
                    }
                }
                Ok(Some(Ok(Err(e)))) => {
                    tracing::warn!("Failed to get a response from beacon node: {e}");
                }
                Ok(Some(Err(e))) => {
                    if !e.is_cancelled() {
                        tracing::warn!("Block production task failed: {e}");
                    }
                }
            }
        }

        // The soft timeout elapsed without any block; wait indefinitely for
        // the first one.
        if best.is_none() && !set.is_empty() {
            tracing::warn!("No blocks received yet but tasks are pending - waiting for first block");
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(Ok(response)) => {
                        let value = self.block_value(&response);
                        best = Some((value, response));
                        break;
                    }
                    Ok(Err(e)) => {
                        tracing::warn!("Failed to get a response from beacon node: {e}");
                    }
                    Err(e) => {
                        if !e.is_cancelled() {
                            tracing::warn!("Block production task failed: {e}");
                        }
                    }
                }
            }
        }

        set.abort_all();

        match best {
            Some((value, response)) => {
                tracing::info!("Proceeding with best block by value: {value}");
                Ok(response)
            }
            None => bail!("Failed to get a block from all beacon nodes"),
        }
    }

    pub async fn produce_block_v3(
        &self,
        slot: Slot,
        graffiti: [u8; 32],
        builder_boost_factor: u64,
        randao_reveal: String,
        soft_timeout: Duration,
    ) -> Result<(BlockContents, ProduceBlockV3Response)> {
        let response = self
            .produce_best_block(slot, graffiti, builder_boost_factor, randao_reveal, soft_timeout)
            .await?;
        let contents = decode_block_contents(&response)?;
        Ok((contents, response))
    }

    pub async fn publish_block_v2(
        &self,
        contents: SignedBlockContentsElectra,
        fork_version: ForkVersion,
    ) -> Result<()> {
        let contents = Arc::new(contents);
        self.all_ok("publish_block_v2", self.proposal_pool(), move |bn| {
            let contents = Arc::clone(&contents);
            async move { bn.publish_block_v2(&contents, fork_version).await }
        })
        .await?;
        Ok(())
    }

    pub async fn publish_blinded_block_v2(
        &self,
        block: SignedBlindedBlockElectra,
        fork_version: ForkVersion,
    ) -> Result<()> {
        let block = Arc::new(block);
        self.all_ok("publish_blinded_block_v2", self.proposal_pool(), move |bn| {
            let block = Arc::clone(&block);
            async move { bn.publish_blinded_block_v2(&block, fork_version).await }
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ssz_types::{BitList, BitVector};
    use vigil_shared::eth_consensus_layer::BlsSignature;

    fn att_data(block_root_byte: u8) -> AttestationData {
        AttestationData {
            slot: 100,
            index: 0,
            beacon_block_root: Hash256::repeat_byte(block_root_byte),
            source: Checkpoint {
                epoch: 2,
                root: Hash256::repeat_byte(0x01),
            },
            target: Checkpoint {
                epoch: 3,
                root: Hash256::repeat_byte(0x02),
            },
        }
    }

    #[test]
    fn consensus_reached_when_two_of_three_agree() {
        let mut tracker = ConsensusTracker::default();
        assert_eq!(tracker.record("beacon-node-a".into(), att_data(0xaa)), 1);
        assert_eq!(tracker.record("beacon-node-b".into(), att_data(0xbb)), 1);
        let count = tracker.record("beacon-node-c".into(), att_data(0xaa));
        assert_eq!(count, 2);
        assert_eq!(
            tracker.hosts_backing(&att_data(0xaa)),
            vec!["beacon-node-a".to_string(), "beacon-node-c".to_string()]
        );
    }

    #[test]
    fn three_distinct_answers_never_reach_two() {
        let mut tracker = ConsensusTracker::default();
        assert_eq!(tracker.record("a".into(), att_data(0xaa)), 1);
        assert_eq!(tracker.record("b".into(), att_data(0xbb)), 1);
        assert_eq!(tracker.record("c".into(), att_data(0xcc)), 1);
    }

    #[test]
    fn host_changing_its_answer_moves_its_vote() {
        let mut tracker = ConsensusTracker::default();
        tracker.record("a".into(), att_data(0xaa));
        tracker.record("b".into(), att_data(0xbb));
        // Host a revises its answer to b's value in a later round.
        let count = tracker.record("a".into(), att_data(0xbb));
        assert_eq!(count, 2);
        assert!(tracker.hosts_backing(&att_data(0xaa)).is_empty());
    }

    #[test]
    fn repeated_identical_answer_does_not_double_count() {
        let mut tracker = ConsensusTracker::default();
        assert_eq!(tracker.record("a".into(), att_data(0xaa)), 1);
        assert_eq!(tracker.record("a".into(), att_data(0xaa)), 1);
    }

    fn aggregate_with_bits(set_bits: &[usize], total: usize) -> AttestationElectra {
        let mut bits = BitList::with_capacity(total).unwrap();
        for bit in set_bits {
            bits.set(*bit, true).unwrap();
        }
        AttestationElectra {
            aggregation_bits: bits,
            data: att_data(0xaa),
            signature: BlsSignature::from(vec![0u8; 96]),
            committee_bits: BitVector::new(),
        }
    }

    #[test]
    fn best_aggregate_picks_most_set_bits() {
        let sparse = aggregate_with_bits(&[0], 8);
        let dense = aggregate_with_bits(&[0, 1, 2], 8);
        let best = best_aggregate(vec![sparse, dense.clone()]).unwrap();
        assert_eq!(best, dense);
    }

    #[test]
    fn best_aggregate_short_circuits_on_ideal() {
        let ideal = aggregate_with_bits(&[0, 1, 2, 3], 4);
        let other = aggregate_with_bits(&[0], 4);
        let best = best_aggregate(vec![ideal.clone(), other]).unwrap();
        assert_eq!(best, ideal);
    }

    #[test]
    fn best_aggregate_of_empty_input_is_none() {
        assert!(best_aggregate(Vec::new()).is_none());
    }

    fn block_response(consensus: &str, execution: &str) -> ProduceBlockV3Response {
        ProduceBlockV3Response {
            version: ForkVersion::Electra,
            execution_payload_blinded: false,
            execution_payload_value: execution.into(),
            consensus_block_value: consensus.into(),
            data: serde_json::Value::Null,
        }
    }

    #[test]
    fn total_block_value_selection() {
        let responses = [
            block_response("50", "100"),
            block_response("50", "150"),
            block_response("50", "120"),
        ];
        let best = responses
            .iter()
            .max_by_key(|r| r.total_block_value())
            .unwrap();
        assert_eq!(best.total_block_value(), 200);
    }

    #[test]
    fn consensus_only_block_value() {
        let a = block_response("60", "100");
        let b = block_response("50", "500");
        // With xDAI-denominated payloads only the consensus value counts.
        assert!(a.consensus_block_value() > b.consensus_block_value());
        assert!(b.total_block_value() > a.total_block_value());
    }
}

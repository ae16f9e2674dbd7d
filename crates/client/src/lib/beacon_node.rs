//! Typed client for a single beacon node's HTTP and SSE API.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use reqwest::{header, Client, Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use thiserror::Error;

use vigil_shared::beacon_api::{
    BeaconCommitteeSubscription, BeaconNodeEvent, ForkVersion, GenesisData,
    GetAggregateAttestationV2Response, GetAttesterDutiesResponse, GetBlockRootResponse,
    GetGenesisResponse, GetLivenessResponse, GetNodeVersionResponse, GetProposerDutiesResponse,
    GetSpecResponse, GetStateValidatorsResponse, GetSyncCommitteeContributionResponse,
    GetSyncDutiesResponse, GetValidatorsRequestBody, ProduceAttestationDataResponse,
    ProduceBlockV3Response, ProposerPreparation, SignedBlindedBlockElectra,
    SignedBlockContentsElectra, SignedEnvelope, SingleAttestation, SyncCommitteeMessageBody,
    SyncCommitteeSubscription, ValidatorLiveness, ValidatorStatus,
};
use vigil_shared::eth_consensus_layer::{
    AggregateAndProofElectra, AttestationData, AttestationElectra, Checkpoint, ContributionAndProof,
    Epoch, Hash256, Slot, SyncCommitteeContribution,
};
use vigil_shared::remote_signer::ValidatorRegistration;
use vigil_shared::validator::ValidatorIndexPubkey;

use crate::chain_spec::ChainSpec;
use crate::metrics::Metrics;
use crate::sse::{decode_event, RawSseEvent, SseError, SseParser};

pub const MAX_SCORE: i64 = 100;
pub const SCORE_DELTA_SUCCESS: i64 = 1;
pub const SCORE_DELTA_FAILURE: i64 = 5;

const TIMEOUT_DEFAULT_CONNECT: Duration = Duration::from_secs(1);
const TIMEOUT_DEFAULT_TOTAL: Duration = Duration::from_secs(10);
const TIMEOUT_ATTESTATION_DATA: Duration = Duration::from_millis(300);
const TIMEOUT_BLOCK_ROOT: Duration = Duration::from_secs(1);
// SSE streams stay open indefinitely; reqwest still wants a bound.
const TIMEOUT_EVENT_STREAM: Duration = Duration::from_secs(7 * 24 * 3600);
const INIT_RETRY_DELAY: Duration = Duration::from_secs(30);
const VERSION_REFRESH_INTERVAL: Duration = Duration::from_secs(600);
/// Minimum gap between requests when polling for matching attestation data.
const ATTESTATION_DATA_POLL_INTERVAL: Duration = Duration::from_millis(50);
const VALIDATORS_GET_BATCH_SIZE: usize = 64;

#[derive(Debug, Error)]
pub enum BeaconNodeError {
    #[error("beacon node not ready: {0}")]
    NotReady(String),
    #[error("unsupported endpoint: {0}")]
    UnsupportedEndpoint(String),
    #[error("execution optimistic on {0}")]
    ExecutionOptimistic(String),
    #[error("received status code {status} for request to {url}: {body}")]
    Status {
        status: u16,
        url: String,
        body: String,
    },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("failed to parse response from {0}: {1}")]
    Parse(String, String),
    #[error(transparent)]
    Sse(#[from] SseError),
    #[error("unsupported block version {0}")]
    UnsupportedBlockVersion(ForkVersion),
    #[error("{0}")]
    Other(String),
}

pub struct BeaconNode {
    base_url: String,
    pub host: String,
    client: Client,
    pub spec: Arc<ChainSpec>,
    metrics: Arc<Metrics>,
    score: AtomicI64,
    initialized: AtomicBool,
    node_version: RwLock<String>,
    genesis: RwLock<Option<GenesisData>>,
    reported_spec: RwLock<Option<ChainSpec>>,
}

impl BeaconNode {
    pub fn new(
        base_url: &str,
        spec: Arc<ChainSpec>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, BeaconNodeError> {
        let normalized = base_url.strip_suffix('/').unwrap_or(base_url).to_owned();
        let parsed = Url::parse(&normalized)
            .map_err(|e| BeaconNodeError::Other(format!("invalid beacon node url {base_url}: {e}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| {
                BeaconNodeError::Other(format!("failed to parse hostname from {base_url}"))
            })?
            .to_owned();

        let mut headers = header::HeaderMap::new();
        headers.insert(header::ACCEPT, "application/json".parse().expect("static header"));
        let client = Client::builder()
            .connect_timeout(TIMEOUT_DEFAULT_CONNECT)
            .timeout(TIMEOUT_DEFAULT_TOTAL)
            .default_headers(headers)
            .user_agent(concat!("vigil/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let node = BeaconNode {
            base_url: normalized,
            host,
            client,
            spec,
            metrics,
            score: AtomicI64::new(0),
            initialized: AtomicBool::new(false),
            node_version: RwLock::new(String::new()),
            genesis: RwLock::new(None),
            reported_spec: RwLock::new(None),
        };
        node.publish_score_metric();
        Ok(node)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn score(&self) -> i64 {
        self.score.load(Ordering::Relaxed)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Relaxed)
    }

    pub fn node_version(&self) -> String {
        self.node_version.read().expect("lock poisoned").clone()
    }

    pub fn genesis(&self) -> Option<GenesisData> {
        self.genesis.read().expect("lock poisoned").clone()
    }

    pub fn reported_spec(&self) -> Option<ChainSpec> {
        self.reported_spec.read().expect("lock poisoned").clone()
    }

    /// Grandine does not serve the slashing SSE topics.
    pub fn supports_slashing_events(&self) -> bool {
        !self.node_version().to_lowercase().contains("grandine")
    }

    fn publish_score_metric(&self) {
        self.metrics
            .beacon_node
            .score
            .with_label_values(&[&self.host])
            .set(self.score());
    }

    fn adjust_score(&self, delta: i64) {
        let _ = self
            .score
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some((current + delta).clamp(0, MAX_SCORE))
            });
        self.publish_score_metric();
    }

    /// Applied by the event consumer when the SSE stream fails.
    pub fn penalize(&self) {
        self.adjust_score(-SCORE_DELTA_FAILURE);
    }

    fn set_score_max(&self) {
        self.score.store(MAX_SCORE, Ordering::Relaxed);
        self.publish_score_metric();
    }

    async fn request_text(
        &self,
        method: Method,
        path: &str,
        build: impl FnOnce(reqwest::RequestBuilder) -> reqwest::RequestBuilder,
    ) -> Result<String, BeaconNodeError> {
        let url = format!("{}{}", self.base_url, path);
        tracing::debug!("Making {method} request to {url}");
        let request = build(self.client.request(method.clone(), &url));

        let outcome: Result<String, BeaconNodeError> = async {
            let response = request.send().await?;
            let status = response.status();
            if status == StatusCode::SERVICE_UNAVAILABLE {
                return Err(BeaconNodeError::NotReady(
                    response.text().await.unwrap_or_default(),
                ));
            }
            if status == StatusCode::METHOD_NOT_ALLOWED {
                return Err(BeaconNodeError::UnsupportedEndpoint(
                    response.text().await.unwrap_or_default(),
                ));
            }
            if !status.is_success() {
                return Err(BeaconNodeError::Status {
                    status: status.as_u16(),
                    url: url.clone(),
                    body: response.text().await.unwrap_or_default(),
                });
            }
            Ok(response.text().await?)
        }
        .await;

        match outcome {
            Ok(text) => {
                self.adjust_score(SCORE_DELTA_SUCCESS);
                Ok(text)
            }
            // Unsupported endpoints say nothing about the node's health.
            Err(e @ BeaconNodeError::UnsupportedEndpoint(_)) => Err(e),
            Err(e) => {
                tracing::warn!(
                    "Failed to get response from {} for {method} {path}: {e}",
                    self.host
                );
                self.adjust_score(-SCORE_DELTA_FAILURE);
                Err(e)
            }
        }
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        build: impl FnOnce(reqwest::RequestBuilder) -> reqwest::RequestBuilder,
    ) -> Result<T, BeaconNodeError> {
        let text = self.request_text(method, path, build).await?;
        serde_json::from_str(&text)
            .map_err(|e| BeaconNodeError::Parse(path.to_owned(), e.to_string()))
    }

    fn reject_if_optimistic(&self, execution_optimistic: bool) -> Result<(), BeaconNodeError> {
        if execution_optimistic {
            self.adjust_score(-SCORE_DELTA_FAILURE);
            return Err(BeaconNodeError::ExecutionOptimistic(self.host.clone()));
        }
        Ok(())
    }

    // Initialization

    async fn try_initialize(&self) -> Result<(), BeaconNodeError> {
        let genesis = self.get_genesis().await?;
        *self.genesis.write().expect("lock poisoned") = Some(genesis);

        match self.get_spec().await {
            Ok(reported) => {
                if reported != *self.spec {
                    tracing::warn!(
                        "Spec values returned by beacon node {} differ from the configured network spec",
                        self.host
                    );
                }
                *self.reported_spec.write().expect("lock poisoned") = Some(reported);
            }
            Err(e) => {
                // Some beacon node implementations omit spec fields; this is
                // not fatal for the node itself.
                tracing::warn!("Failed to verify beacon node spec for {}: {e}", self.host);
            }
        }

        let version = self.get_node_version().await?;
        *self.node_version.write().expect("lock poisoned") = version;

        self.set_score_max();
        self.initialized.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Initialize in the background, retrying forever, then keep the node
    /// version fresh.
    pub fn spawn_initialize(self: &Arc<Self>) {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match node.try_initialize().await {
                    Ok(()) => {
                        tracing::info!("Initialized beacon node at {}", node.base_url);
                        break;
                    }
                    Err(e) => {
                        tracing::error!(
                            "Failed to initialize beacon node at {}: {e}",
                            node.base_url
                        );
                        tokio::time::sleep(INIT_RETRY_DELAY).await;
                    }
                }
            }

            loop {
                tokio::time::sleep(VERSION_REFRESH_INTERVAL).await;
                match node.get_node_version().await {
                    Ok(version) => {
                        *node.node_version.write().expect("lock poisoned") = version;
                    }
                    Err(e) => tracing::warn!(
                        "Failed to refresh node version for {}: {e}",
                        node.host
                    ),
                }
            }
        });
    }

    // Simple endpoints

    pub async fn get_genesis(&self) -> Result<GenesisData, BeaconNodeError> {
        let response: GetGenesisResponse = self
            .request(Method::GET, "/eth/v1/beacon/genesis", |r| r)
            .await?;
        Ok(response.data)
    }

    pub async fn get_spec(&self) -> Result<ChainSpec, BeaconNodeError> {
        let response: GetSpecResponse = self
            .request(Method::GET, "/eth/v1/config/spec", |r| r)
            .await?;
        ChainSpec::parse(&response.data)
            .map_err(|e| BeaconNodeError::Parse("/eth/v1/config/spec".into(), e.to_string()))
    }

    pub async fn get_node_version(&self) -> Result<String, BeaconNodeError> {
        let response: GetNodeVersionResponse = self
            .request(Method::GET, "/eth/v1/node/version", |r| r)
            .await?;
        self.metrics
            .beacon_node
            .version
            .with_label_values(&[&self.host, &response.data.version])
            .set(1);
        Ok(response.data.version)
    }

    // Attestation data

    /// Returns the host along with the produced attestation data, so the
    /// multi-node consensus accounting can attribute it.
    pub async fn produce_attestation_data(
        &self,
        slot: Slot,
    ) -> Result<(String, AttestationData), BeaconNodeError> {
        let response: ProduceAttestationDataResponse = self
            .request(Method::GET, "/eth/v1/validator/attestation_data", |r| {
                r.query(&[("slot", slot.to_string()), ("committee_index", "0".into())])
                    .timeout(TIMEOUT_ATTESTATION_DATA)
            })
            .await?;
        Ok((self.host.clone(), response.data))
    }

    /// Polls the local attestation data endpoint until it returns the
    /// expected head block root.
    pub async fn wait_for_attestation_data(
        &self,
        expected_head_block_root: Hash256,
        slot: Slot,
    ) -> Result<AttestationData, BeaconNodeError> {
        loop {
            let request_start = tokio::time::Instant::now();
            match self.produce_attestation_data(slot).await {
                Ok((_, att_data)) => {
                    if att_data.beacon_block_root == expected_head_block_root {
                        return Ok(att_data);
                    }
                }
                Err(e) => {
                    tracing::debug!("Failed to produce attestation data on {}: {e}", self.host);
                }
            }
            tokio::time::sleep_until(request_start + ATTESTATION_DATA_POLL_INTERVAL).await;
        }
    }

    /// Polls until the node independently reports the expected finality
    /// checkpoints for `slot`.
    pub async fn wait_for_checkpoints(
        &self,
        slot: Slot,
        expected_source: Checkpoint,
        expected_target: Checkpoint,
    ) -> Result<(), BeaconNodeError> {
        loop {
            let request_start = tokio::time::Instant::now();
            match self.produce_attestation_data(slot).await {
                Ok((_, att_data)) => {
                    if att_data.source == expected_source && att_data.target == expected_target {
                        return Ok(());
                    }
                }
                Err(e) => {
                    tracing::debug!("Failed to produce attestation data on {}: {e}", self.host);
                }
            }
            tokio::time::sleep_until(request_start + ATTESTATION_DATA_POLL_INTERVAL).await;
        }
    }

    pub async fn get_block_root(&self, block_id: &str) -> Result<String, BeaconNodeError> {
        let path = format!("/eth/v1/beacon/blocks/{block_id}/root");
        let response: GetBlockRootResponse = self
            .request(Method::GET, &path, |r| r.timeout(TIMEOUT_BLOCK_ROOT))
            .await?;
        self.reject_if_optimistic(response.execution_optimistic)?;
        Ok(response.data.root)
    }

    // Validators

    async fn get_validators_fallback(
        &self,
        ids: &[String],
        statuses: &[ValidatorStatus],
        state_id: &str,
    ) -> Result<Vec<ValidatorIndexPubkey>, BeaconNodeError> {
        let path = format!("/eth/v1/beacon/states/{state_id}/validators");
        let status_params: Vec<(&str, String)> = statuses
            .iter()
            .map(|s| ("status", s.as_str().to_owned()))
            .collect();

        let mut results = Vec::new();
        for batch in ids.chunks(VALIDATORS_GET_BATCH_SIZE) {
            let mut params: Vec<(&str, String)> =
                batch.iter().map(|id| ("id", id.clone())).collect();
            params.extend(status_params.iter().cloned());

            let response: GetStateValidatorsResponse = self
                .request(Method::GET, &path, |r| r.query(&params))
                .await?;
            results.extend(response.data.into_iter().map(|v| ValidatorIndexPubkey {
                index: v.index,
                pubkey: v.validator.pubkey,
                status: v.status,
            }));
        }
        Ok(results)
    }

    pub async fn get_validators(
        &self,
        ids: &[String],
        statuses: &[ValidatorStatus],
        state_id: &str,
    ) -> Result<Vec<ValidatorIndexPubkey>, BeaconNodeError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let path = format!("/eth/v1/beacon/states/{state_id}/validators");
        let body = GetValidatorsRequestBody {
            ids: ids.to_vec(),
            statuses: statuses.to_vec(),
        };
        let result: Result<GetStateValidatorsResponse, _> = self
            .request(Method::POST, &path, |r| r.json(&body))
            .await;

        match result {
            Ok(response) => Ok(response
                .data
                .into_iter()
                .map(|v| ValidatorIndexPubkey {
                    index: v.index,
                    pubkey: v.validator.pubkey,
                    status: v.status,
                })
                .collect()),
            // Grandine does not support the POST variant yet.
            Err(BeaconNodeError::UnsupportedEndpoint(_)) => {
                self.get_validators_fallback(ids, statuses, state_id).await
            }
            Err(e) => Err(e),
        }
    }

    // Duties

    pub async fn get_attester_duties(
        &self,
        epoch: Epoch,
        indices: &[u64],
    ) -> Result<GetAttesterDutiesResponse, BeaconNodeError> {
        let body: Vec<String> = indices.iter().map(|i| i.to_string()).collect();
        let path = format!("/eth/v1/validator/duties/attester/{epoch}");
        let response: GetAttesterDutiesResponse =
            self.request(Method::POST, &path, |r| r.json(&body)).await?;
        self.reject_if_optimistic(response.execution_optimistic)?;
        Ok(response)
    }

    pub async fn get_proposer_duties(
        &self,
        epoch: Epoch,
    ) -> Result<GetProposerDutiesResponse, BeaconNodeError> {
        let path = format!("/eth/v1/validator/duties/proposer/{epoch}");
        let response: GetProposerDutiesResponse =
            self.request(Method::GET, &path, |r| r).await?;
        self.reject_if_optimistic(response.execution_optimistic)?;
        Ok(response)
    }

    pub async fn get_sync_duties(
        &self,
        epoch: Epoch,
        indices: &[u64],
    ) -> Result<GetSyncDutiesResponse, BeaconNodeError> {
        let body: Vec<String> = indices.iter().map(|i| i.to_string()).collect();
        let path = format!("/eth/v1/validator/duties/sync/{epoch}");
        let response: GetSyncDutiesResponse =
            self.request(Method::POST, &path, |r| r.json(&body)).await?;
        self.reject_if_optimistic(response.execution_optimistic)?;
        Ok(response)
    }

    pub async fn get_liveness(
        &self,
        epoch: Epoch,
        indices: &[u64],
    ) -> Result<Vec<ValidatorLiveness>, BeaconNodeError> {
        let body: Vec<String> = indices.iter().map(|i| i.to_string()).collect();
        let path = format!("/eth/v1/validator/liveness/{epoch}");
        let response: GetLivenessResponse =
            self.request(Method::POST, &path, |r| r.json(&body)).await?;
        Ok(response.data)
    }

    // Publishing

    pub async fn publish_attestations(
        &self,
        attestations: &[SingleAttestation],
        fork_version: ForkVersion,
    ) -> Result<(), BeaconNodeError> {
        self.request_text(Method::POST, "/eth/v2/beacon/pool/attestations", |r| {
            r.json(attestations)
                .header("Eth-Consensus-Version", fork_version.as_str())
        })
        .await?;
        Ok(())
    }

    pub async fn publish_sync_committee_messages(
        &self,
        messages: &[SyncCommitteeMessageBody],
    ) -> Result<(), BeaconNodeError> {
        self.request_text(Method::POST, "/eth/v1/beacon/pool/sync_committees", |r| {
            r.json(messages)
        })
        .await?;
        Ok(())
    }

    pub async fn prepare_beacon_committee_subscriptions(
        &self,
        subscriptions: &[BeaconCommitteeSubscription],
    ) -> Result<(), BeaconNodeError> {
        self.request_text(
            Method::POST,
            "/eth/v1/validator/beacon_committee_subscriptions",
            |r| r.json(subscriptions),
        )
        .await?;
        Ok(())
    }

    pub async fn prepare_sync_committee_subscriptions(
        &self,
        subscriptions: &[SyncCommitteeSubscription],
    ) -> Result<(), BeaconNodeError> {
        self.request_text(
            Method::POST,
            "/eth/v1/validator/sync_committee_subscriptions",
            |r| r.json(subscriptions),
        )
        .await?;
        Ok(())
    }

    pub async fn get_aggregate_attestation_v2(
        &self,
        attestation_data_root: Hash256,
        slot: Slot,
        committee_index: u64,
    ) -> Result<AttestationElectra, BeaconNodeError> {
        let interval = self.spec.interval_duration();
        let response: GetAggregateAttestationV2Response = self
            .request(Method::GET, "/eth/v2/validator/aggregate_attestation", |r| {
                r.query(&[
                    ("attestation_data_root", format!("{attestation_data_root:?}")),
                    ("slot", slot.to_string()),
                    ("committee_index", committee_index.to_string()),
                ])
                .timeout(interval)
            })
            .await?;

        match response.version {
            ForkVersion::Electra | ForkVersion::Fulu => {
                serde_json::from_value(response.data).map_err(|e| {
                    BeaconNodeError::Parse(
                        "/eth/v2/validator/aggregate_attestation".into(),
                        e.to_string(),
                    )
                })
            }
            other => Err(BeaconNodeError::UnsupportedBlockVersion(other)),
        }
    }

    pub async fn publish_aggregate_and_proofs(
        &self,
        signed_aggregate_and_proofs: &[SignedEnvelope<AggregateAndProofElectra>],
        fork_version: ForkVersion,
    ) -> Result<(), BeaconNodeError> {
        self.request_text(Method::POST, "/eth/v2/validator/aggregate_and_proofs", |r| {
            r.json(signed_aggregate_and_proofs)
                .header("Eth-Consensus-Version", fork_version.as_str())
        })
        .await?;
        Ok(())
    }

    pub async fn get_sync_committee_contribution(
        &self,
        slot: Slot,
        subcommittee_index: u64,
        beacon_block_root: &str,
    ) -> Result<SyncCommitteeContribution, BeaconNodeError> {
        let interval = self.spec.interval_duration();
        let response: GetSyncCommitteeContributionResponse = self
            .request(
                Method::GET,
                "/eth/v1/validator/sync_committee_contribution",
                |r| {
                    r.query(&[
                        ("slot", slot.to_string()),
                        ("subcommittee_index", subcommittee_index.to_string()),
                        ("beacon_block_root", beacon_block_root.to_owned()),
                    ])
                    .timeout(interval)
                },
            )
            .await?;
        serde_json::from_value(response.data).map_err(|e| {
            BeaconNodeError::Parse(
                "/eth/v1/validator/sync_committee_contribution".into(),
                e.to_string(),
            )
        })
    }

    pub async fn publish_sync_committee_contribution_and_proofs(
        &self,
        signed_contribution_and_proofs: &[SignedEnvelope<ContributionAndProof>],
    ) -> Result<(), BeaconNodeError> {
        self.request_text(
            Method::POST,
            "/eth/v1/validator/contribution_and_proofs",
            |r| r.json(signed_contribution_and_proofs),
        )
        .await?;
        Ok(())
    }

    pub async fn prepare_beacon_proposer(
        &self,
        preparations: &[ProposerPreparation],
    ) -> Result<(), BeaconNodeError> {
        self.request_text(Method::POST, "/eth/v1/validator/prepare_beacon_proposer", |r| {
            r.json(preparations)
        })
        .await?;
        Ok(())
    }

    pub async fn register_validator(
        &self,
        signed_registrations: &[SignedEnvelope<ValidatorRegistration>],
    ) -> Result<(), BeaconNodeError> {
        self.request_text(Method::POST, "/eth/v1/validator/register_validator", |r| {
            r.json(signed_registrations)
        })
        .await?;
        Ok(())
    }

    // Block production

    pub async fn produce_block_v3(
        &self,
        slot: Slot,
        graffiti: &[u8; 32],
        builder_boost_factor: u64,
        randao_reveal: &str,
    ) -> Result<ProduceBlockV3Response, BeaconNodeError> {
        let path = format!("/eth/v3/validator/blocks/{slot}");
        let slot_duration = self.spec.slot_duration();
        let response: ProduceBlockV3Response = self
            .request(Method::GET, &path, |r| {
                r.query(&[
                    ("randao_reveal", randao_reveal.to_owned()),
                    ("builder_boost_factor", builder_boost_factor.to_string()),
                    ("graffiti", format!("0x{}", hex::encode(graffiti))),
                ])
                .timeout(slot_duration)
            })
            .await?;

        let consensus_block_value = response.consensus_block_value();
        let execution_payload_value = response.execution_payload_value();
        tracing::info!(
            "{} returned block with consensus block value {consensus_block_value}, execution payload value {execution_payload_value}.",
            self.host
        );
        self.metrics
            .beacon_node
            .consensus_block_value
            .with_label_values(&[&self.host])
            .observe(consensus_block_value as f64);
        self.metrics
            .beacon_node
            .execution_payload_value
            .with_label_values(&[&self.host])
            .observe(execution_payload_value as f64);

        Ok(response)
    }

    pub async fn publish_block_v2(
        &self,
        contents: &SignedBlockContentsElectra,
        fork_version: ForkVersion,
    ) -> Result<(), BeaconNodeError> {
        tracing::debug!(
            "Publishing block for slot {}",
            contents.signed_block.message.slot
        );
        self.request_text(Method::POST, "/eth/v2/beacon/blocks", |r| {
            r.json(contents)
                .header("Eth-Consensus-Version", fork_version.as_str())
                .timeout(self.spec.slot_duration())
        })
        .await?;
        Ok(())
    }

    pub async fn publish_blinded_block_v2(
        &self,
        block: &SignedBlindedBlockElectra,
        fork_version: ForkVersion,
    ) -> Result<(), BeaconNodeError> {
        tracing::debug!("Publishing blinded block for slot {}", block.message.slot);
        self.request_text(Method::POST, "/eth/v2/beacon/blinded_blocks", |r| {
            r.json(block)
                .header("Eth-Consensus-Version", fork_version.as_str())
                .timeout(self.spec.slot_duration())
        })
        .await?;
        Ok(())
    }

    // Events

    pub async fn subscribe_to_events(
        &self,
        topics: &[&str],
    ) -> Result<EventStream, BeaconNodeError> {
        let url = format!("{}/eth/v1/events", self.base_url);
        let params: Vec<(&str, &str)> = topics.iter().map(|t| ("topics", *t)).collect();
        let response = self
            .client
            .get(&url)
            .query(&params)
            .header(header::ACCEPT, "text/event-stream")
            .timeout(TIMEOUT_EVENT_STREAM)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            self.adjust_score(-SCORE_DELTA_FAILURE);
            return Err(BeaconNodeError::Status {
                status: status.as_u16(),
                url,
                body: response.text().await.unwrap_or_default(),
            });
        }

        Ok(EventStream {
            response,
            parser: SseParser::new(),
            pending: VecDeque::new(),
        })
    }
}

/// A live SSE subscription. Events are decoded as they arrive; the stream
/// ends cleanly with `Ok(None)`.
pub struct EventStream {
    response: reqwest::Response,
    parser: SseParser,
    pending: VecDeque<RawSseEvent>,
}

impl EventStream {
    pub async fn next_event(&mut self) -> Result<Option<BeaconNodeEvent>, BeaconNodeError> {
        loop {
            if let Some(raw) = self.pending.pop_front() {
                let event = decode_event(&raw)?;
                if event.execution_optimistic() {
                    return Err(BeaconNodeError::ExecutionOptimistic(format!(
                        "event {}",
                        event.name()
                    )));
                }
                return Ok(Some(event));
            }

            match self.response.chunk().await? {
                Some(chunk) => {
                    let events = self.parser.push(&chunk)?;
                    self.pending.extend(events);
                }
                None => return Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networks::Network;

    fn test_node() -> BeaconNode {
        let spec = Arc::new(ChainSpec::for_network(Network::Mainnet).unwrap());
        let metrics = Arc::new(Metrics::new().unwrap());
        BeaconNode::new("http://beacon-node-a:5052/", spec, metrics).unwrap()
    }

    #[test]
    fn url_is_normalized_and_host_extracted() {
        let node = test_node();
        assert_eq!(node.base_url(), "http://beacon-node-a:5052");
        assert_eq!(node.host, "beacon-node-a");
        assert!(!node.is_initialized());
    }

    #[test]
    fn score_is_clamped_to_bounds() {
        let node = test_node();
        assert_eq!(node.score(), 0);

        // Failures cannot push the score below zero.
        node.adjust_score(-SCORE_DELTA_FAILURE);
        assert_eq!(node.score(), 0);

        node.set_score_max();
        assert_eq!(node.score(), MAX_SCORE);

        // Successes cannot push it above the maximum.
        node.adjust_score(SCORE_DELTA_SUCCESS);
        assert_eq!(node.score(), MAX_SCORE);

        node.adjust_score(-SCORE_DELTA_FAILURE);
        assert_eq!(node.score(), MAX_SCORE - SCORE_DELTA_FAILURE);
        node.adjust_score(SCORE_DELTA_SUCCESS);
        assert_eq!(node.score(), MAX_SCORE - SCORE_DELTA_FAILURE + SCORE_DELTA_SUCCESS);
    }

    #[test]
    fn invalid_url_is_rejected() {
        let spec = Arc::new(ChainSpec::for_network(Network::Mainnet).unwrap());
        let metrics = Arc::new(Metrics::new().unwrap());
        assert!(BeaconNode::new("not a url", spec, metrics).is_err());
    }

    #[test]
    fn grandine_versions_skip_slashing_topics() {
        let node = test_node();
        *node.node_version.write().unwrap() = "Grandine/1.1.0".into();
        assert!(!node.supports_slashing_events());
        *node.node_version.write().unwrap() = "Lighthouse/v5.3.0".into();
        assert!(node.supports_slashing_events());
    }
}

//! Consumes the beacon node SSE stream and routes events to the duty
//! services and the validator status tracker.

use std::sync::Arc;
use std::time::Duration;

use vigil_shared::beacon_api::BeaconNodeEvent;

use crate::beacon_chain::BeaconChain;
use crate::beacon_node::{BeaconNode, MAX_SCORE};
use crate::metrics::{ErrorType, Metrics};
use crate::multi_beacon_node::MultiBeaconNode;
use crate::services::attestation::AttestationService;
use crate::services::block_proposal::BlockProposalService;
use crate::services::sync_committee::SyncCommitteeService;
use crate::validator_status_tracker::ValidatorStatusTracker;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

pub struct EventConsumer {
    multi_beacon_node: Arc<MultiBeaconNode>,
    beacon_chain: Arc<BeaconChain>,
    attestation_service: Arc<AttestationService>,
    block_proposal_service: Arc<BlockProposalService>,
    sync_committee_service: Arc<SyncCommitteeService>,
    status_tracker: Arc<ValidatorStatusTracker>,
    metrics: Arc<Metrics>,
}

impl EventConsumer {
    pub fn new(
        multi_beacon_node: Arc<MultiBeaconNode>,
        beacon_chain: Arc<BeaconChain>,
        attestation_service: Arc<AttestationService>,
        block_proposal_service: Arc<BlockProposalService>,
        sync_committee_service: Arc<SyncCommitteeService>,
        status_tracker: Arc<ValidatorStatusTracker>,
        metrics: Arc<Metrics>,
    ) -> Self {
        EventConsumer {
            multi_beacon_node,
            beacon_chain,
            attestation_service,
            block_proposal_service,
            sync_committee_service,
            status_tracker,
            metrics,
        }
    }

    pub fn start(self: &Arc<Self>) {
        let consumer = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                consumer.consume_once().await;
            }
        });
    }

    /// One subscription lifetime: subscribe to the best node, consume until
    /// the stream ends, fails, or the primary node recovers.
    async fn consume_once(&self) {
        let beacon_node = match self.multi_beacon_node.best_beacon_node() {
            Ok(bn) => bn,
            Err(e) => {
                tracing::warn!("No beacon node available for event subscription: {e}");
                tokio::time::sleep(RECONNECT_DELAY).await;
                return;
            }
        };
        let primary = self.multi_beacon_node.primary_beacon_node();
        tracing::info!("Subscribing to events from {}", beacon_node.host);

        let mut topics = vec!["head", "chain_reorg"];
        if beacon_node.supports_slashing_events() {
            topics.push("attester_slashing");
            topics.push("proposer_slashing");
        }

        let mut stream = match beacon_node.subscribe_to_events(&topics).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(
                    "Failed to subscribe to events from {}: {e}. Reconnecting in 1 second...",
                    beacon_node.host
                );
                self.metrics.inc_error(ErrorType::EventConsumer);
                tokio::time::sleep(RECONNECT_DELAY).await;
                return;
            }
        };

        loop {
            match stream.next_event().await {
                Ok(Some(event)) => {
                    self.handle_event(event, &beacon_node).await;

                    // Switch back to the primary node's stream once it has
                    // fully recovered.
                    if !Arc::ptr_eq(&beacon_node, &primary) && primary.score() == MAX_SCORE {
                        tracing::info!(
                            "Switching SSE subscription from {} back to primary beacon node {}",
                            beacon_node.host,
                            primary.host
                        );
                        return;
                    }
                }
                Ok(None) => {
                    // Clean end of stream; resubscribe immediately.
                    return;
                }
                Err(e) => {
                    beacon_node.penalize();
                    self.metrics.inc_error(ErrorType::EventConsumer);
                    tracing::error!(
                        "Error occurred while processing beacon node events from {} ({e}). Reconnecting in 1 second...",
                        beacon_node.host
                    );
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    return;
                }
            }
        }
    }

    async fn handle_event(&self, event: BeaconNodeEvent, beacon_node: &Arc<BeaconNode>) {
        if let Some(event_slot) = event.slot() {
            let current_slot = self.beacon_chain.current_slot();
            if event_slot < current_slot {
                tracing::warn!(
                    "Ignoring event for old slot {event_slot} from {}. Current slot: {current_slot}.",
                    beacon_node.host
                );
                return;
            }
        }

        match &event {
            BeaconNodeEvent::Head(head) => {
                tracing::debug!("New head @ {} : {}", head.slot, head.block);
                let attestation = Arc::clone(&self.attestation_service);
                let head_for_attestation = head.clone();
                tokio::spawn(async move {
                    attestation.handle_head_event(head_for_attestation).await;
                });

                self.block_proposal_service.handle_head_event(head);

                let sync_committee = Arc::clone(&self.sync_committee_service);
                let head_for_sync = head.clone();
                tokio::spawn(async move {
                    sync_committee.handle_head_event(head_for_sync).await;
                });
            }
            BeaconNodeEvent::ChainReorg(reorg) => {
                tracing::info!(
                    "Chain reorg of depth {} at slot {}, old head {}, new head {}",
                    reorg.depth,
                    reorg.slot,
                    reorg.old_head_block,
                    reorg.new_head_block
                );
                self.attestation_service.handle_reorg_event(reorg);
                self.block_proposal_service.handle_reorg_event(reorg);
                self.sync_committee_service.handle_reorg_event(reorg);
            }
            BeaconNodeEvent::AttesterSlashing(slashing) => {
                tracing::debug!("AttesterSlashingEvent: {slashing:?}");
                self.status_tracker.handle_attester_slashing_event(slashing);
            }
            BeaconNodeEvent::ProposerSlashing(slashing) => {
                tracing::debug!("ProposerSlashingEvent: {slashing:?}");
                self.status_tracker.handle_proposer_slashing_event(slashing);
            }
        }

        self.metrics
            .processed_beacon_node_events
            .with_label_values(&[&beacon_node.host, event.name()])
            .inc();
    }
}

use anyhow::Result;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry,
};

/// Typed error counter labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    AttestationConsensus,
    AttestationPublish,
    AggregateAttestationProduce,
    AggregateAttestationPublish,
    BlockProduce,
    BlockPublish,
    SyncCommitteeMessageProduce,
    SyncCommitteeMessagePublish,
    SyncCommitteeContributionProduce,
    SyncCommitteeContributionPublish,
    Signature,
    DutiesUpdate,
    EventConsumer,
    Other,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::AttestationConsensus => "attestation-consensus",
            ErrorType::AttestationPublish => "attestation-publish",
            ErrorType::AggregateAttestationProduce => "aggregate-attestation-produce",
            ErrorType::AggregateAttestationPublish => "aggregate-attestation-publish",
            ErrorType::BlockProduce => "block-produce",
            ErrorType::BlockPublish => "block-publish",
            ErrorType::SyncCommitteeMessageProduce => "sync-committee-message-produce",
            ErrorType::SyncCommitteeMessagePublish => "sync-committee-message-publish",
            ErrorType::SyncCommitteeContributionProduce => "sync-committee-contribution-produce",
            ErrorType::SyncCommitteeContributionPublish => "sync-committee-contribution-publish",
            ErrorType::Signature => "signature",
            ErrorType::DutiesUpdate => "duties-update",
            ErrorType::EventConsumer => "event-consumer",
            ErrorType::Other => "other",
        }
    }
}

pub struct BeaconNodeMetrics {
    pub score: IntGaugeVec,
    pub version: IntGaugeVec,
    pub consensus_block_value: HistogramVec,
    pub execution_payload_value: HistogramVec,
}

impl BeaconNodeMetrics {
    fn new() -> Result<Self> {
        let block_value_buckets: Vec<f64> = [0.001e18, 0.01e18, 0.1e18, 1e18, 10e18].to_vec();
        Ok(BeaconNodeMetrics {
            score: IntGaugeVec::new(
                Opts::new("beacon_node_score", "Beacon node score"),
                &["host"],
            )?,
            version: IntGaugeVec::new(
                Opts::new("beacon_node_version", "Beacon node version"),
                &["host", "version"],
            )?,
            consensus_block_value: HistogramVec::new(
                HistogramOpts::new(
                    "beacon_node_consensus_block_value",
                    "Value of consensus layer rewards paid to the proposer in blocks produced by this beacon node",
                )
                .buckets(block_value_buckets.clone()),
                &["host"],
            )?,
            execution_payload_value: HistogramVec::new(
                HistogramOpts::new(
                    "beacon_node_execution_payload_value",
                    "Value of execution payloads in blocks produced by this beacon node",
                )
                .buckets(block_value_buckets),
                &["host"],
            )?,
        })
    }

    fn register_on(&self, registry: &Registry) -> Result<()> {
        registry.register(Box::new(self.score.clone()))?;
        registry.register(Box::new(self.version.clone()))?;
        registry.register(Box::new(self.consensus_block_value.clone()))?;
        registry.register(Box::new(self.execution_payload_value.clone()))?;
        Ok(())
    }
}

pub struct DutyMetrics {
    pub start_time: HistogramVec,
    pub submission_time: HistogramVec,
    pub published_attestations: IntCounter,
    pub published_aggregate_attestations: IntCounter,
    pub published_blocks: IntCounter,
    pub published_sync_committee_messages: IntCounter,
    pub published_sync_committee_contributions: IntCounter,
    pub attestation_consensus_time: Histogram,
    pub attestation_consensus_failures: IntCounter,
}

fn quarter_second_buckets() -> Vec<f64> {
    (0..12)
        .flat_map(|i| {
            let base = i as f64;
            [base, base + 0.25, base + 0.5, base + 0.75]
        })
        .collect()
}

impl DutyMetrics {
    fn new() -> Result<Self> {
        Ok(DutyMetrics {
            start_time: HistogramVec::new(
                HistogramOpts::new("duty_start_time", "Time into slot at which a duty starts")
                    .buckets(quarter_second_buckets()),
                &["duty"],
            )?,
            submission_time: HistogramVec::new(
                HistogramOpts::new(
                    "duty_submission_time",
                    "Time into slot at which data for a duty is about to be submitted",
                )
                .buckets(quarter_second_buckets()),
                &["duty"],
            )?,
            published_attestations: IntCounter::new(
                "vc_published_attestations",
                "Successfully published attestations",
            )?,
            published_aggregate_attestations: IntCounter::new(
                "vc_published_aggregate_attestations",
                "Successfully published aggregate attestations",
            )?,
            published_blocks: IntCounter::new(
                "vc_published_blocks",
                "Successfully published blocks",
            )?,
            published_sync_committee_messages: IntCounter::new(
                "vc_published_sync_committee_messages",
                "Successfully published sync committee messages",
            )?,
            published_sync_committee_contributions: IntCounter::new(
                "vc_published_sync_committee_contributions",
                "Successfully published sync committee contributions",
            )?,
            attestation_consensus_time: Histogram::with_opts(HistogramOpts::new(
                "vc_attestation_consensus_time",
                "Time taken to reach consensus on attestation data",
            ))?,
            attestation_consensus_failures: IntCounter::new(
                "vc_attestation_consensus_failures",
                "Failures to reach consensus on attestation data",
            )?,
        })
    }

    fn register_on(&self, registry: &Registry) -> Result<()> {
        registry.register(Box::new(self.start_time.clone()))?;
        registry.register(Box::new(self.submission_time.clone()))?;
        registry.register(Box::new(self.published_attestations.clone()))?;
        registry.register(Box::new(self.published_aggregate_attestations.clone()))?;
        registry.register(Box::new(self.published_blocks.clone()))?;
        registry.register(Box::new(self.published_sync_committee_messages.clone()))?;
        registry.register(Box::new(self.published_sync_committee_contributions.clone()))?;
        registry.register(Box::new(self.attestation_consensus_time.clone()))?;
        registry.register(Box::new(self.attestation_consensus_failures.clone()))?;
        Ok(())
    }
}

pub struct Metrics {
    pub beacon_node: BeaconNodeMetrics,
    pub duties: DutyMetrics,
    pub errors: IntCounterVec,
    pub signed_messages: IntCounterVec,
    pub validator_status_count: IntGaugeVec,
    pub slashing_detected: IntGauge,
    pub processed_beacon_node_events: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        Ok(Metrics {
            beacon_node: BeaconNodeMetrics::new()?,
            duties: DutyMetrics::new()?,
            errors: IntCounterVec::new(
                Opts::new("vc_errors", "Errors encountered, by type"),
                &["error_type"],
            )?,
            signed_messages: IntCounterVec::new(
                Opts::new("signed_messages", "Number of signed messages"),
                &["signable_message_type"],
            )?,
            validator_status_count: IntGaugeVec::new(
                Opts::new("validator_status", "Amount of validators per status"),
                &["status"],
            )?,
            slashing_detected: IntGauge::new(
                "slashing_detected",
                "1 if any of the connected validators have been slashed, 0 otherwise",
            )?,
            processed_beacon_node_events: IntCounterVec::new(
                Opts::new(
                    "vc_processed_beacon_node_events",
                    "Successfully processed beacon node events",
                ),
                &["host", "event_type"],
            )?,
        })
    }

    pub fn register_on(&self, registry: &Registry) -> Result<()> {
        self.beacon_node.register_on(registry)?;
        self.duties.register_on(registry)?;
        registry.register(Box::new(self.errors.clone()))?;
        registry.register(Box::new(self.signed_messages.clone()))?;
        registry.register(Box::new(self.validator_status_count.clone()))?;
        registry.register(Box::new(self.slashing_detected.clone()))?;
        registry.register(Box::new(self.processed_beacon_node_events.clone()))?;
        Ok(())
    }

    pub fn inc_error(&self, error_type: ErrorType) {
        self.errors.with_label_values(&[error_type.as_str()]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_cleanly() {
        let metrics = Metrics::new().unwrap();
        let registry = Registry::new();
        metrics.register_on(&registry).unwrap();
        metrics.inc_error(ErrorType::Signature);
        metrics
            .beacon_node
            .score
            .with_label_values(&["beacon-node-a"])
            .set(100);
        let families = registry.gather();
        assert!(families.iter().any(|f| f.get_name() == "vc_errors"));
        assert!(families.iter().any(|f| f.get_name() == "beacon_node_score"));
    }
}

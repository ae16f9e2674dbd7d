//! Doppelganger detection: before performing any slashable duty after
//! startup, watch the liveness endpoint across two epochs for signs of the
//! managed validators already being active elsewhere.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use vigil_shared::beacon_api::ValidatorLiveness;

use crate::beacon_chain::BeaconChain;
use crate::beacon_node::{BeaconNode, BeaconNodeError};
use crate::validator_status_tracker::ValidatorStatusTracker;

#[derive(Debug, Error)]
pub enum DoppelgangerError {
    #[error("doppelgangers detected for validator indices {0:?}")]
    DoppelgangersDetected(Vec<u64>),
    #[error(transparent)]
    BeaconNode(#[from] BeaconNodeError),
}

pub struct DoppelgangerDetector {
    beacon_chain: Arc<BeaconChain>,
    beacon_node: Arc<BeaconNode>,
    status_tracker: Arc<ValidatorStatusTracker>,
}

fn live_indices(liveness_data: &[ValidatorLiveness]) -> Vec<u64> {
    liveness_data
        .iter()
        .filter(|v| v.is_live)
        .map(|v| v.index)
        .collect()
}

impl DoppelgangerDetector {
    pub fn new(
        beacon_chain: Arc<BeaconChain>,
        beacon_node: Arc<BeaconNode>,
        status_tracker: Arc<ValidatorStatusTracker>,
    ) -> Self {
        DoppelgangerDetector {
            beacon_chain,
            beacon_node,
            status_tracker,
        }
    }

    async fn fetch_liveness(
        &self,
        epoch: u64,
        indices: &[u64],
    ) -> Result<Vec<ValidatorLiveness>, DoppelgangerError> {
        self.beacon_node.get_liveness(epoch, indices).await.map_err(|e| {
            tracing::error!(
                "Failed to query beacon node for liveness data for epoch {epoch} - did you enable liveness tracking?"
            );
            e.into()
        })
    }

    fn check_liveness(&self, liveness_data: &[ValidatorLiveness]) -> Result<(), DoppelgangerError> {
        let live = live_indices(liveness_data);
        if !live.is_empty() {
            tracing::error!("Doppelgangers detected, validator indices: {live:?}");
            return Err(DoppelgangerError::DoppelgangersDetected(live));
        }
        tracing::debug!("No doppelgangers detected");
        Ok(())
    }

    /// Blocks until the detection window has passed without any sign of a
    /// doppelganger; returns an error as soon as one is seen.
    pub async fn detect(&self) -> Result<(), DoppelgangerError> {
        let indices = self.status_tracker.active_or_pending_indices();
        tracing::info!(
            "Attempting to detect doppelgangers for {} validators",
            indices.len()
        );

        // Probe right away so a misconfigured liveness endpoint fails fast.
        let current_epoch = self.beacon_chain.current_epoch();
        self.fetch_liveness(current_epoch, &indices).await?;

        let monitored_epoch = current_epoch + 1;
        tracing::info!("Waiting for monitored epoch {monitored_epoch} to start");
        self.beacon_chain.wait_for_epoch(monitored_epoch).await;

        tracing::info!("Waiting for monitored epoch {monitored_epoch} to finish");
        self.beacon_chain.wait_for_epoch(monitored_epoch + 1).await;

        self.check_liveness(&self.fetch_liveness(monitored_epoch, &indices).await?)?;
        tracing::info!(
            "Attestations made during epoch {monitored_epoch} may be included in the next epoch too."
        );

        // With EIP-7045, attestations from epoch N can still land in the
        // last slot of epoch N+1; wait until halfway into that slot before
        // the final check.
        let last_slot_in_next_epoch = self
            .beacon_chain
            .spec
            .start_slot_of_epoch(monitored_epoch + 2)
            - 1;
        tracing::info!(
            "Waiting for last slot in epoch {}: {last_slot_in_next_epoch}",
            monitored_epoch + 1
        );
        let half_slot = Duration::from_millis(self.beacon_chain.spec.slot_duration_ms() / 2);
        tokio::time::sleep_until(
            self.beacon_chain
                .instant_for_slot_offset(last_slot_in_next_epoch, half_slot),
        )
        .await;

        self.check_liveness(&self.fetch_liveness(monitored_epoch, &indices).await?)?;
        tracing::info!("No doppelgangers detected!");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_indices_filters_only_live_validators() {
        let data = vec![
            ValidatorLiveness {
                index: 1,
                is_live: false,
            },
            ValidatorLiveness {
                index: 2,
                is_live: true,
            },
            ValidatorLiveness {
                index: 3,
                is_live: true,
            },
        ];
        assert_eq!(live_indices(&data), vec![2, 3]);
        assert!(live_indices(&[]).is_empty());
    }
}

pub mod attestation;
pub mod block_proposal;
pub mod event_consumer;
pub mod sync_committee;

use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::Notify;
use tokio::task::AbortHandle;

use vigil_shared::eth_consensus_layer::Slot;

use crate::beacon_chain::BeaconChain;
use crate::config::Config;
use crate::duty_cache::DutyCache;
use crate::metrics::{ErrorType, Metrics};
use crate::multi_beacon_node::MultiBeaconNode;
use crate::signature_provider::SignatureProvider;
use crate::validator_status_tracker::ValidatorStatusTracker;

const DUTIES_UPDATE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Metric label for each duty type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidatorDuty {
    Attestation,
    AttestationAggregation,
    BlockProposal,
    SyncCommitteeMessage,
    SyncCommitteeContribution,
}

impl ValidatorDuty {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidatorDuty::Attestation => "attestation",
            ValidatorDuty::AttestationAggregation => "attestation-aggregation",
            ValidatorDuty::BlockProposal => "block-proposal",
            ValidatorDuty::SyncCommitteeMessage => "sync-committee-message",
            ValidatorDuty::SyncCommitteeContribution => "sync-committee-contribution",
        }
    }
}

/// Shared handles every duty service needs.
#[derive(Clone)]
pub struct DutyContext {
    pub multi_beacon_node: Arc<MultiBeaconNode>,
    pub beacon_chain: Arc<BeaconChain>,
    pub signer: Arc<SignatureProvider>,
    pub status_tracker: Arc<ValidatorStatusTracker>,
    pub duty_cache: Arc<DutyCache>,
    pub config: Arc<Config>,
    pub metrics: Arc<Metrics>,
}

impl DutyContext {
    /// Slashable duties refuse to run once slashing has been detected,
    /// unless the operator explicitly disabled the protection.
    pub fn refuse_if_slashing_detected(&self, action: &str) -> Result<()> {
        if self.status_tracker.slashing_detected() && !self.config.disable_slashing_detection {
            bail!("Slashing detected, not {action}");
        }
        Ok(())
    }

    /// Wall-clock time remaining until the end of `slot`.
    pub fn time_remaining_in_slot(&self, slot: Slot) -> Duration {
        self.beacon_chain.time_until_slot_start(slot + 1)
    }

    pub fn observe_duty_start(&self, duty: ValidatorDuty, slot: Slot) {
        self.metrics
            .duties
            .start_time
            .with_label_values(&[duty.as_str()])
            .observe(self.beacon_chain.time_since_slot_start(slot).as_secs_f64());
    }

    pub fn observe_duty_submission(&self, duty: ValidatorDuty, slot: Slot) {
        self.metrics
            .duties
            .submission_time
            .with_label_values(&[duty.as_str()])
            .observe(self.beacon_chain.time_since_slot_start(slot).as_secs_f64());
    }
}

/// Monotonic per-service duty progress. The started marker doubles as the
/// at-most-once-per-slot guard: the head-event path and the slot-deadline
/// path race on it, and whichever acquires it first performs the duty.
pub struct DutyRunState {
    started: AtomicI64,
    completed: AtomicI64,
}

impl Default for DutyRunState {
    fn default() -> Self {
        DutyRunState {
            started: AtomicI64::new(-1),
            completed: AtomicI64::new(-1),
        }
    }
}

impl DutyRunState {
    pub fn last_started(&self) -> i64 {
        self.started.load(Ordering::Relaxed)
    }

    pub fn last_completed(&self) -> i64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Claim `slot`, failing if a duty for it (or a later slot) has already
    /// started.
    pub fn try_begin(&self, slot: Slot) -> Result<()> {
        let slot = slot as i64;
        loop {
            let current = self.started.load(Ordering::Relaxed);
            if slot <= current {
                bail!("duty already started for slot {current}");
            }
            if self
                .started
                .compare_exchange(current, slot, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    pub fn mark_completed(&self, slot: Slot) {
        self.completed.fetch_max(slot as i64, Ordering::Relaxed);
    }

    pub fn has_ongoing_duty(&self) -> bool {
        self.last_started() > self.last_completed()
    }
}

/// The per-slot fallback task (attest / produce at the 1/3 deadline). A head
/// event arriving earlier aborts it.
#[derive(Default)]
pub struct ScheduledDutyTask {
    inner: Mutex<Option<(Slot, AbortHandle)>>,
}

impl ScheduledDutyTask {
    /// Replace the scheduled task, aborting any previously scheduled one.
    pub fn replace(&self, slot: Slot, handle: AbortHandle) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        if let Some((_, previous)) = inner.take() {
            previous.abort();
        }
        *inner = Some((slot, handle));
    }

    /// Cancel the scheduled task if it is for `slot`.
    pub fn cancel(&self, slot: Slot) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        if let Some((scheduled_slot, handle)) = inner.take() {
            if scheduled_slot == slot {
                handle.abort();
            } else {
                *inner = Some((scheduled_slot, handle));
            }
        }
    }
}

/// Drive a service's `update_duties` routine: run it immediately, then again
/// at every epoch boundary; on failure retry after one second. The trigger
/// forces an immediate re-run (reorg events, dependent-root mismatches).
pub(crate) fn spawn_update_duties_loop<F, Fut>(
    service_name: &'static str,
    beacon_chain: Arc<BeaconChain>,
    metrics: Arc<Metrics>,
    trigger: Arc<Notify>,
    update: F,
) where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send,
{
    tokio::spawn(async move {
        loop {
            let delay = match update().await {
                Ok(()) => {
                    let next_epoch_slot = beacon_chain
                        .spec
                        .start_slot_of_epoch(beacon_chain.current_epoch() + 1);
                    beacon_chain.time_until_slot_start(next_epoch_slot)
                }
                Err(e) => {
                    metrics.inc_error(ErrorType::DutiesUpdate);
                    tracing::warn!("Failed to update {service_name} duties: {e}");
                    DUTIES_UPDATE_RETRY_DELAY
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = trigger.notified() => {}
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duty_run_state_is_monotonic() {
        let state = DutyRunState::default();
        assert_eq!(state.last_started(), -1);

        state.try_begin(10).unwrap();
        assert_eq!(state.last_started(), 10);
        assert!(state.has_ongoing_duty());

        state.mark_completed(10);
        assert!(!state.has_ongoing_duty());

        // Same slot and older slots are refused.
        assert!(state.try_begin(10).is_err());
        assert!(state.try_begin(9).is_err());

        state.try_begin(11).unwrap();
        assert_eq!(state.last_started(), 11);

        // Completion never decreases.
        state.mark_completed(5);
        assert_eq!(state.last_completed(), 10);
    }

    #[test]
    fn try_begin_allows_each_slot_once() {
        let state = DutyRunState::default();
        // Head-event path and deadline path race for the same slot; exactly
        // one of them may proceed.
        let first = state.try_begin(42);
        let second = state.try_begin(42);
        assert!(first.is_ok());
        assert!(second.is_err());
    }
}

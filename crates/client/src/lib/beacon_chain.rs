use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::sync::broadcast;

use vigil_shared::beacon_api::{ForkVersion, GenesisData};
use vigil_shared::eth_consensus_layer::{Epoch, Slot, SyncCommitteePeriod};
use vigil_shared::remote_signer::{ForkInfo, SignerFork};

use crate::chain_spec::ChainSpec;

/// Sleeps can overshoot by a few milliseconds; sleep short of the deadline
/// and spin the remainder with zero-cost yields.
const SLEEP_UNDERSHOOT: Duration = Duration::from_millis(16);

const TICK_CHANNEL_CAPACITY: usize = 8;

#[derive(Debug, Error)]
pub enum BeaconChainError {
    #[error("unsupported fork for epoch {0}")]
    UnsupportedFork(Epoch),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotTick {
    pub slot: Slot,
    pub is_new_epoch: bool,
}

/// Maps wall time to slots and epochs, classifies the active fork and
/// broadcasts a tick at every slot boundary.
pub struct BeaconChain {
    pub spec: Arc<ChainSpec>,
    genesis: GenesisData,
    tick_tx: broadcast::Sender<SlotTick>,
}

fn unix_now() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
}

impl BeaconChain {
    pub fn new(spec: Arc<ChainSpec>, genesis: GenesisData) -> Self {
        let (tick_tx, _) = broadcast::channel(TICK_CHANNEL_CAPACITY);
        BeaconChain {
            spec,
            genesis,
            tick_tx,
        }
    }

    pub fn genesis(&self) -> &GenesisData {
        &self.genesis
    }

    pub fn current_slot(&self) -> Slot {
        let now_ms = unix_now().as_millis() as u64;
        let genesis_ms = self.genesis.genesis_time * 1_000;
        if now_ms <= genesis_ms {
            return 0;
        }
        (now_ms - genesis_ms) / self.spec.slot_duration_ms()
    }

    pub fn current_epoch(&self) -> Epoch {
        self.spec.epoch_of(self.current_slot())
    }

    pub fn current_sync_period(&self) -> SyncCommitteePeriod {
        self.spec.sync_period_of_epoch(self.current_epoch())
    }

    /// Unix timestamp of the start of `slot`.
    pub fn timestamp_for_slot(&self, slot: Slot) -> Duration {
        Duration::from_millis(self.genesis.genesis_time * 1_000 + slot * self.spec.slot_duration_ms())
    }

    pub fn time_since_slot_start(&self, slot: Slot) -> Duration {
        unix_now().saturating_sub(self.timestamp_for_slot(slot))
    }

    /// Wall-clock time remaining until the start of `slot`, zero if passed.
    pub fn time_until_slot_start(&self, slot: Slot) -> Duration {
        self.timestamp_for_slot(slot).saturating_sub(unix_now())
    }

    /// Tokio instant corresponding to `offset` past the start of `slot`.
    pub fn instant_for_slot_offset(&self, slot: Slot, offset: Duration) -> tokio::time::Instant {
        let target = self.timestamp_for_slot(slot) + offset;
        tokio::time::Instant::now() + target.saturating_sub(unix_now())
    }

    async fn wait_for_timestamp(&self, target: Duration) {
        let now = unix_now();
        if target > now {
            tokio::time::sleep((target - now).saturating_sub(SLEEP_UNDERSHOOT)).await;
        }
        while unix_now() < target {
            tokio::task::yield_now().await;
        }
    }

    pub async fn wait_for_next_slot(&self) {
        let next = self.current_slot() + 1;
        self.wait_for_timestamp(self.timestamp_for_slot(next)).await;
    }

    pub async fn wait_for_epoch(&self, epoch: Epoch) {
        self.wait_for_timestamp(self.timestamp_for_slot(self.spec.start_slot_of_epoch(epoch)))
            .await;
    }

    pub fn fork_version(&self, slot: Slot) -> Result<ForkVersion, BeaconChainError> {
        let epoch = self.spec.epoch_of(slot);
        self.spec
            .fork_version_at_epoch(epoch)
            .ok_or(BeaconChainError::UnsupportedFork(epoch))
    }

    pub fn current_fork_version(&self) -> Result<ForkVersion, BeaconChainError> {
        self.fork_version(self.current_slot())
    }

    pub fn fork(&self, slot: Slot) -> Result<SignerFork, BeaconChainError> {
        let spec = &self.spec;
        let fork = match self.fork_version(slot)? {
            ForkVersion::Gloas => SignerFork {
                previous_version: spec.fulu_fork_version.clone(),
                current_version: spec.gloas_fork_version.clone(),
                epoch: spec.gloas_fork_epoch,
            },
            ForkVersion::Fulu => SignerFork {
                previous_version: spec.electra_fork_version.clone(),
                current_version: spec.fulu_fork_version.clone(),
                epoch: spec.fulu_fork_epoch,
            },
            ForkVersion::Electra => SignerFork {
                previous_version: spec.deneb_fork_version.clone(),
                current_version: spec.electra_fork_version.clone(),
                epoch: spec.electra_fork_epoch,
            },
        };
        Ok(fork)
    }

    pub fn fork_info(&self, slot: Slot) -> Result<ForkInfo, BeaconChainError> {
        Ok(ForkInfo {
            fork: self.fork(slot)?,
            genesis_validators_root: self.genesis.genesis_validators_root.clone(),
        })
    }

    /// Subscribe to slot ticks. Subscriptions happen once at startup; a
    /// receiver that lags skips the missed ticks rather than replaying them.
    pub fn subscribe_ticks(&self) -> broadcast::Receiver<SlotTick> {
        self.tick_tx.subscribe()
    }

    pub fn start_slot_ticker(self: &Arc<Self>) {
        let chain = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let slot = chain.current_slot();
                let epoch = chain.spec.epoch_of(slot);
                let is_new_epoch = slot % chain.spec.slots_per_epoch == 0;
                if is_new_epoch {
                    tracing::info!("Epoch {epoch}");
                }
                tracing::info!("Slot {slot}");

                // Receivers come and go; a send with no receivers is fine.
                let _ = chain.tick_tx.send(SlotTick { slot, is_new_epoch });

                chain.wait_for_next_slot().await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networks::Network;

    fn test_chain(seconds_per_slot: u64, genesis_offset_secs: u64) -> BeaconChain {
        let mut spec = ChainSpec::for_network(Network::Mainnet).unwrap();
        spec.seconds_per_slot = seconds_per_slot;
        spec.electra_fork_epoch = 0;
        spec.fulu_fork_epoch = 10_000;
        spec.gloas_fork_epoch = 20_000;
        let genesis = GenesisData {
            genesis_time: unix_now().as_secs() - genesis_offset_secs,
            genesis_validators_root: format!("0x{}", "42".repeat(32)),
            genesis_fork_version: "0x00000000".into(),
        };
        BeaconChain::new(Arc::new(spec), genesis)
    }

    #[test]
    fn slot_math_matches_elapsed_time() {
        let chain = test_chain(12, 3600);
        let slot = chain.current_slot();
        assert!((300..=301).contains(&slot), "slot {slot}");
        assert_eq!(chain.current_epoch(), slot / 32);
    }

    #[test]
    fn slot_is_zero_before_genesis() {
        let mut spec = ChainSpec::for_network(Network::Mainnet).unwrap();
        spec.electra_fork_epoch = 0;
        let genesis = GenesisData {
            genesis_time: unix_now().as_secs() + 10_000,
            genesis_validators_root: format!("0x{}", "42".repeat(32)),
            genesis_fork_version: "0x00000000".into(),
        };
        let chain = BeaconChain::new(Arc::new(spec), genesis);
        assert_eq!(chain.current_slot(), 0);
    }

    #[test]
    fn timestamp_for_slot_is_inverse_of_slot_math() {
        let chain = test_chain(12, 3600);
        let ts = chain.timestamp_for_slot(100);
        assert_eq!(
            ts.as_secs(),
            chain.genesis().genesis_time + 100 * 12
        );
    }

    #[test]
    fn fork_schedule_lookup() {
        let chain = test_chain(12, 3600);
        assert_eq!(chain.fork_version(0).unwrap(), ForkVersion::Electra);
        assert_eq!(
            chain.fork_version(10_000 * 32).unwrap(),
            ForkVersion::Fulu
        );
        assert_eq!(
            chain.fork_version(20_000 * 32).unwrap(),
            ForkVersion::Gloas
        );

        let fork = chain.fork(10_000 * 32).unwrap();
        assert_eq!(fork.current_version, chain.spec.fulu_fork_version);
        assert_eq!(fork.previous_version, chain.spec.electra_fork_version);
        assert_eq!(fork.epoch, 10_000);
    }

    #[test]
    fn pre_electra_fork_is_an_error() {
        let mut spec = ChainSpec::for_network(Network::Mainnet).unwrap();
        spec.electra_fork_epoch = 1_000_000;
        spec.fulu_fork_epoch = u64::MAX;
        spec.gloas_fork_epoch = u64::MAX;
        let genesis = GenesisData {
            genesis_time: unix_now().as_secs(),
            genesis_validators_root: format!("0x{}", "42".repeat(32)),
            genesis_fork_version: "0x00000000".into(),
        };
        let chain = BeaconChain::new(Arc::new(spec), genesis);
        assert!(chain.fork_version(0).is_err());
    }

    #[tokio::test]
    async fn wait_for_next_slot_lands_on_the_boundary() {
        let chain = test_chain(1, 3600);
        let before = chain.current_slot();
        chain.wait_for_next_slot().await;
        assert!(chain.current_slot() > before);
    }

    #[tokio::test]
    async fn ticker_broadcasts_slot_ticks() {
        let chain = Arc::new(test_chain(1, 3600));
        let mut ticks = chain.subscribe_ticks();
        chain.start_slot_ticker();
        let tick = tokio::time::timeout(Duration::from_secs(3), ticks.recv())
            .await
            .expect("tick within one slot")
            .expect("channel open");
        assert!(tick.slot >= 3599);
    }
}

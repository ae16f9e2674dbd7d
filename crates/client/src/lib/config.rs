use std::path::PathBuf;

use thiserror::Error;

use vigil_shared::eth_spec::GRAFFITI_BYTES;
use vigil_shared::util::{encode_graffiti, GraffitiError};

use crate::networks::Network;

pub const DEFAULT_GAS_LIMIT: u64 = 30_000_000;
pub const DEFAULT_BUILDER_BOOST_FACTOR: u64 = 90;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no beacon node urls provided")]
    NoBeaconNodeUrls,
    #[error("beacon node urls must be unique: {0:?}")]
    DuplicateBeaconNodeUrls(Vec<String>),
    #[error("attestation consensus threshold {threshold} cannot be met with {nodes} beacon node(s)")]
    ThresholdTooHigh { threshold: usize, nodes: usize },
    #[error("attestation consensus threshold must be at least 1")]
    ThresholdZero,
    #[error("fee recipient must be a 0x-prefixed 20-byte hex string: {0}")]
    InvalidFeeRecipient(String),
    #[error(transparent)]
    Graffiti(#[from] GraffitiError),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub network: Network,
    pub beacon_node_urls: Vec<String>,
    /// Optional disjoint pool used exclusively for block proposals.
    pub beacon_node_urls_proposal: Vec<String>,
    pub remote_signer_url: Option<String>,
    pub fee_recipient: String,
    pub graffiti: [u8; GRAFFITI_BYTES],
    pub gas_limit: u64,
    pub use_external_builder: bool,
    pub builder_boost_factor: u64,
    pub attestation_consensus_threshold: usize,
    pub enable_doppelganger_detection: bool,
    pub disable_slashing_detection: bool,
    pub enable_keymanager: bool,
    pub ignore_spec_mismatch: bool,
    /// Overrides the per-network default when set.
    pub compare_consensus_block_value_only: Option<bool>,
    pub data_dir: PathBuf,
}

pub struct ConfigBuilder {
    network: Network,
    beacon_node_urls: Vec<String>,
    beacon_node_urls_proposal: Vec<String>,
    remote_signer_url: Option<String>,
    fee_recipient: String,
    graffiti: String,
    gas_limit: u64,
    use_external_builder: bool,
    builder_boost_factor: u64,
    attestation_consensus_threshold: Option<usize>,
    enable_doppelganger_detection: bool,
    disable_slashing_detection: bool,
    enable_keymanager: bool,
    ignore_spec_mismatch: bool,
    compare_consensus_block_value_only: Option<bool>,
    data_dir: PathBuf,
}

impl ConfigBuilder {
    pub fn new(network: Network, beacon_node_urls: Vec<String>, fee_recipient: String) -> Self {
        ConfigBuilder {
            network,
            beacon_node_urls,
            beacon_node_urls_proposal: Vec::new(),
            remote_signer_url: None,
            fee_recipient,
            graffiti: String::new(),
            gas_limit: DEFAULT_GAS_LIMIT,
            use_external_builder: false,
            builder_boost_factor: DEFAULT_BUILDER_BOOST_FACTOR,
            attestation_consensus_threshold: None,
            enable_doppelganger_detection: false,
            disable_slashing_detection: false,
            enable_keymanager: false,
            ignore_spec_mismatch: false,
            compare_consensus_block_value_only: None,
            data_dir: PathBuf::from("./data"),
        }
    }

    pub fn beacon_node_urls_proposal(mut self, urls: Vec<String>) -> Self {
        self.beacon_node_urls_proposal = urls;
        self
    }

    pub fn remote_signer_url(mut self, url: Option<String>) -> Self {
        self.remote_signer_url = url;
        self
    }

    pub fn graffiti(mut self, graffiti: String) -> Self {
        self.graffiti = graffiti;
        self
    }

    pub fn gas_limit(mut self, gas_limit: u64) -> Self {
        self.gas_limit = gas_limit;
        self
    }

    pub fn use_external_builder(mut self, value: bool) -> Self {
        self.use_external_builder = value;
        self
    }

    pub fn builder_boost_factor(mut self, value: u64) -> Self {
        self.builder_boost_factor = value;
        self
    }

    pub fn attestation_consensus_threshold(mut self, value: Option<usize>) -> Self {
        self.attestation_consensus_threshold = value;
        self
    }

    pub fn enable_doppelganger_detection(mut self, value: bool) -> Self {
        self.enable_doppelganger_detection = value;
        self
    }

    pub fn disable_slashing_detection(mut self, value: bool) -> Self {
        self.disable_slashing_detection = value;
        self
    }

    pub fn enable_keymanager(mut self, value: bool) -> Self {
        self.enable_keymanager = value;
        self
    }

    pub fn ignore_spec_mismatch(mut self, value: bool) -> Self {
        self.ignore_spec_mismatch = value;
        self
    }

    pub fn compare_consensus_block_value_only(mut self, value: Option<bool>) -> Self {
        self.compare_consensus_block_value_only = value;
        self
    }

    pub fn data_dir(mut self, dir: PathBuf) -> Self {
        self.data_dir = dir;
        self
    }

    pub fn build(self) -> Result<Config, ConfigError> {
        if self.beacon_node_urls.is_empty() {
            return Err(ConfigError::NoBeaconNodeUrls);
        }
        for urls in [&self.beacon_node_urls, &self.beacon_node_urls_proposal] {
            let mut unique = urls.clone();
            unique.sort();
            unique.dedup();
            if unique.len() != urls.len() {
                return Err(ConfigError::DuplicateBeaconNodeUrls(urls.clone()));
            }
        }

        if !self.fee_recipient.starts_with("0x")
            || self.fee_recipient.len() != 42
            || hex::decode(&self.fee_recipient[2..]).is_err()
        {
            return Err(ConfigError::InvalidFeeRecipient(self.fee_recipient));
        }

        // Default threshold: a majority of the connected beacon nodes.
        let node_count = self.beacon_node_urls.len();
        let threshold = self
            .attestation_consensus_threshold
            .unwrap_or(node_count / 2 + 1);
        if threshold == 0 {
            return Err(ConfigError::ThresholdZero);
        }
        if threshold > node_count {
            return Err(ConfigError::ThresholdTooHigh {
                threshold,
                nodes: node_count,
            });
        }

        Ok(Config {
            network: self.network,
            beacon_node_urls: self.beacon_node_urls,
            beacon_node_urls_proposal: self.beacon_node_urls_proposal,
            remote_signer_url: self.remote_signer_url,
            fee_recipient: self.fee_recipient,
            graffiti: encode_graffiti(&self.graffiti)?,
            gas_limit: self.gas_limit,
            use_external_builder: self.use_external_builder,
            builder_boost_factor: self.builder_boost_factor,
            attestation_consensus_threshold: threshold,
            enable_doppelganger_detection: self.enable_doppelganger_detection,
            disable_slashing_detection: self.disable_slashing_detection,
            enable_keymanager: self.enable_keymanager,
            ignore_spec_mismatch: self.ignore_spec_mismatch,
            compare_consensus_block_value_only: self.compare_consensus_block_value_only,
            data_dir: self.data_dir,
        })
    }
}

impl Config {
    /// Whether block selection compares only the consensus block value.
    pub fn compare_consensus_block_value_only(&self) -> bool {
        self.compare_consensus_block_value_only
            .unwrap_or_else(|| self.network.xdai_denominated_payloads())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> ConfigBuilder {
        ConfigBuilder::new(
            Network::Mainnet,
            vec![
                "http://beacon-node-a:5052".into(),
                "http://beacon-node-b:5052".into(),
                "http://beacon-node-c:5052".into(),
            ],
            format!("0x{}", "ab".repeat(20)),
        )
    }

    #[test]
    fn default_threshold_is_a_majority() {
        let config = builder().build().unwrap();
        assert_eq!(config.attestation_consensus_threshold, 2);
    }

    #[test]
    fn rejects_threshold_above_node_count() {
        let result = builder().attestation_consensus_threshold(Some(4)).build();
        assert!(matches!(result, Err(ConfigError::ThresholdTooHigh { .. })));
    }

    #[test]
    fn rejects_duplicate_urls() {
        let result = ConfigBuilder::new(
            Network::Mainnet,
            vec!["http://a".into(), "http://a".into()],
            format!("0x{}", "ab".repeat(20)),
        )
        .build();
        assert!(matches!(result, Err(ConfigError::DuplicateBeaconNodeUrls(_))));
    }

    #[test]
    fn rejects_bad_fee_recipient() {
        let result = ConfigBuilder::new(
            Network::Mainnet,
            vec!["http://a".into()],
            "abcd".into(),
        )
        .build();
        assert!(matches!(result, Err(ConfigError::InvalidFeeRecipient(_))));
    }

    #[test]
    fn gnosis_compares_consensus_value_by_default() {
        let config = ConfigBuilder::new(
            Network::Gnosis,
            vec!["http://a".into()],
            format!("0x{}", "ab".repeat(20)),
        )
        .build()
        .unwrap();
        assert!(config.compare_consensus_block_value_only());

        let overridden = ConfigBuilder::new(
            Network::Gnosis,
            vec!["http://a".into()],
            format!("0x{}", "ab".repeat(20)),
        )
        .compare_consensus_block_value_only(Some(false))
        .build()
        .unwrap();
        assert!(!overridden.compare_consensus_block_value_only());
    }
}

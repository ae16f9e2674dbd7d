//! Environment-variable driven configuration for the service binary.

use std::env;
use std::fmt::Debug;
use std::str::FromStr;

#[derive(Clone, Copy)]
pub struct EnvVarSpec {
    pub key: &'static str,
    pub sensitive: bool,
}

impl EnvVarSpec {
    pub fn optional<TVal: FromStr>(&'static self) -> Option<TVal> {
        match env::var(self.key) {
            Ok(raw) => match raw.parse() {
                Ok(value) => Some(value),
                Err(_) => panic!("Failed to parse value for env var {}", self.key),
            },
            Err(e) => {
                tracing::debug!("Failed reading env var {}: {e:?}", self.key);
                None
            }
        }
    }

    pub fn default<TVal: FromStr>(&'static self, default: TVal) -> TVal {
        self.optional().unwrap_or(default)
    }

    pub fn required<TVal: FromStr>(&'static self) -> TVal {
        let raw = env::var(self.key)
            .unwrap_or_else(|e| panic!("Failed to read env var {}: {e:?}", self.key));
        raw.parse()
            .unwrap_or_else(|_| panic!("Failed to parse value {raw} for env var {}", self.key))
    }

    /// Comma-separated list, empty when unset.
    pub fn list(&'static self) -> Vec<String> {
        match env::var(self.key) {
            Ok(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(str::to_owned)
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn flag(&'static self) -> bool {
        matches!(
            env::var(self.key).as_deref().map(str::to_ascii_lowercase).as_deref(),
            Ok("true") | Ok("1") | Ok("yes")
        )
    }
}

impl Debug for EnvVarSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.sensitive {
            f.write_str("***")
        } else {
            f.write_str(self.key)
        }
    }
}

pub const NETWORK: EnvVarSpec = EnvVarSpec {
    key: "VIGIL_NETWORK",
    sensitive: false,
};
pub const BEACON_NODE_URLS: EnvVarSpec = EnvVarSpec {
    key: "VIGIL_BEACON_NODE_URLS",
    sensitive: false,
};
pub const BEACON_NODE_URLS_PROPOSAL: EnvVarSpec = EnvVarSpec {
    key: "VIGIL_BEACON_NODE_URLS_PROPOSAL",
    sensitive: false,
};
pub const REMOTE_SIGNER_URL: EnvVarSpec = EnvVarSpec {
    key: "VIGIL_REMOTE_SIGNER_URL",
    sensitive: false,
};
pub const FEE_RECIPIENT: EnvVarSpec = EnvVarSpec {
    key: "VIGIL_FEE_RECIPIENT",
    sensitive: false,
};
pub const DATA_DIR: EnvVarSpec = EnvVarSpec {
    key: "VIGIL_DATA_DIR",
    sensitive: false,
};
pub const GRAFFITI: EnvVarSpec = EnvVarSpec {
    key: "VIGIL_GRAFFITI",
    sensitive: false,
};
pub const GAS_LIMIT: EnvVarSpec = EnvVarSpec {
    key: "VIGIL_GAS_LIMIT",
    sensitive: false,
};
pub const USE_EXTERNAL_BUILDER: EnvVarSpec = EnvVarSpec {
    key: "VIGIL_USE_EXTERNAL_BUILDER",
    sensitive: false,
};
pub const BUILDER_BOOST_FACTOR: EnvVarSpec = EnvVarSpec {
    key: "VIGIL_BUILDER_BOOST_FACTOR",
    sensitive: false,
};
pub const ATTESTATION_CONSENSUS_THRESHOLD: EnvVarSpec = EnvVarSpec {
    key: "VIGIL_ATTESTATION_CONSENSUS_THRESHOLD",
    sensitive: false,
};
pub const ENABLE_DOPPELGANGER_DETECTION: EnvVarSpec = EnvVarSpec {
    key: "VIGIL_ENABLE_DOPPELGANGER_DETECTION",
    sensitive: false,
};
pub const DISABLE_SLASHING_DETECTION: EnvVarSpec = EnvVarSpec {
    key: "VIGIL_DISABLE_SLASHING_DETECTION",
    sensitive: false,
};
pub const ENABLE_KEYMANAGER: EnvVarSpec = EnvVarSpec {
    key: "VIGIL_ENABLE_KEYMANAGER",
    sensitive: false,
};
pub const IGNORE_SPEC_MISMATCH: EnvVarSpec = EnvVarSpec {
    key: "VIGIL_IGNORE_SPEC_MISMATCH",
    sensitive: false,
};
pub const COMPARE_CONSENSUS_BLOCK_VALUE_ONLY: EnvVarSpec = EnvVarSpec {
    key: "VIGIL_COMPARE_CONSENSUS_BLOCK_VALUE_ONLY",
    sensitive: false,
};
pub const LOG_FORMAT: EnvVarSpec = EnvVarSpec {
    key: "VIGIL_LOG_FORMAT",
    sensitive: false,
};
pub const SERVICE_BIND_TO_ADDR: EnvVarSpec = EnvVarSpec {
    key: "SERVICE_BIND_TO_ADDR",
    sensitive: false,
};

use derive_more::FromStr;

use vigil_shared::beacon_api::GenesisData;

/// Networks with built-in genesis and spec parameters. `Custom` defers both
/// to the connected beacon nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromStr)]
pub enum Network {
    Mainnet,
    Hoodi,
    Gnosis,
    Chiado,
    Custom,
}

impl Network {
    pub fn name(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Hoodi => "hoodi",
            Network::Gnosis => "gnosis",
            Network::Chiado => "chiado",
            Network::Custom => "custom",
        }
    }

    /// Gnosis-family networks denominate execution payload values in xDAI,
    /// so their value is not comparable to the consensus block value. Block
    /// selection on these networks defaults to consensus value only.
    pub fn xdai_denominated_payloads(&self) -> bool {
        matches!(self, Network::Gnosis | Network::Chiado)
    }

    pub fn known_genesis(&self) -> Option<GenesisData> {
        let (genesis_time, genesis_validators_root, genesis_fork_version) = match self {
            Network::Mainnet => (
                1_606_824_023,
                "0x4b363db94e286120d76eb905340fdd4e54bfe9f06bf33ff6cf5ad27f511bfe95",
                "0x00000000",
            ),
            Network::Hoodi => (
                1_742_213_400,
                "0x212f13fc4df078b6cb7db228f1c8307566dcecf900867401a92023d7ba99cb5f",
                "0x10000910",
            ),
            Network::Gnosis => (
                1_638_993_340,
                "0xf5dcb5564e829aab27264b9becd5dfaa017085611224cb3036f573368dbb9d47",
                "0x00000064",
            ),
            Network::Chiado => (
                1_665_396_300,
                "0x9d642dac73058fbf39c0ae41ab1e34e4d889043cb199851ded7095bc99eb4c1e",
                "0x0000006f",
            ),
            Network::Custom => return None,
        };
        Some(GenesisData {
            genesis_time,
            genesis_validators_root: genesis_validators_root.to_string(),
            genesis_fork_version: genesis_fork_version.to_string(),
        })
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_networks_have_genesis() {
        for network in [Network::Mainnet, Network::Hoodi, Network::Gnosis, Network::Chiado] {
            let genesis = network.known_genesis().unwrap();
            assert!(genesis.genesis_time > 0);
            assert!(genesis.genesis_validators_root.starts_with("0x"));
        }
        assert!(Network::Custom.known_genesis().is_none());
    }

    #[test]
    fn xdai_payload_flag() {
        assert!(Network::Gnosis.xdai_denominated_payloads());
        assert!(Network::Chiado.xdai_denominated_payloads());
        assert!(!Network::Mainnet.xdai_denominated_payloads());
    }
}

use std::collections::BTreeSet;

use ethereum_hashing::hash_fixed;
use thiserror::Error;

use crate::eth_spec::GRAFFITI_BYTES;

#[derive(Debug, Error)]
pub enum GraffitiError {
    #[error("encoded graffiti exceeds the maximum length of {GRAFFITI_BYTES} bytes")]
    TooLong,
}

#[derive(Debug, Error)]
pub enum HexError {
    #[error("missing 0x prefix: {0}")]
    MissingPrefix(String),
    #[error("invalid hex: {0}")]
    Invalid(#[from] hex::FromHexError),
    #[error("unexpected length {got}, expected {expected} bytes")]
    Length { got: usize, expected: usize },
}

/// UTF-8 graffiti, zero-padded to 32 bytes.
pub fn encode_graffiti(graffiti: &str) -> Result<[u8; GRAFFITI_BYTES], GraffitiError> {
    let encoded = graffiti.as_bytes();
    if encoded.len() > GRAFFITI_BYTES {
        return Err(GraffitiError::TooLong);
    }
    let mut out = [0u8; GRAFFITI_BYTES];
    out[..encoded.len()].copy_from_slice(encoded);
    Ok(out)
}

pub fn decode_graffiti(graffiti: &[u8; GRAFFITI_BYTES]) -> String {
    let end = graffiti
        .iter()
        .rposition(|b| *b != 0)
        .map_or(0, |pos| pos + 1);
    String::from_utf8_lossy(&graffiti[..end]).into_owned()
}

pub fn hex_to_bytes(value: &str) -> Result<Vec<u8>, HexError> {
    let stripped = value
        .strip_prefix("0x")
        .ok_or_else(|| HexError::MissingPrefix(value.to_string()))?;
    Ok(hex::decode(stripped)?)
}

pub fn hex_to_fixed_bytes<const N: usize>(value: &str) -> Result<[u8; N], HexError> {
    let bytes = hex_to_bytes(value)?;
    bytes.as_slice().try_into().map_err(|_| HexError::Length {
        got: bytes.len(),
        expected: N,
    })
}

pub fn bytes_to_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// `bytes_to_uint64(hash(signature)[0..8])` from the consensus spec.
fn hash_prefix_to_u64(signature: &[u8]) -> u64 {
    let digest = hash_fixed(signature);
    u64::from_le_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

/// Whether a selection proof makes the validator an aggregator for its
/// beacon committee.
pub fn is_committee_aggregator(
    selection_proof: &[u8],
    committee_length: u64,
    target_aggregators_per_committee: u64,
) -> bool {
    let modulo = std::cmp::max(1, committee_length / target_aggregators_per_committee);
    hash_prefix_to_u64(selection_proof) % modulo == 0
}

/// Whether a selection proof makes the validator an aggregator for a sync
/// subcommittee.
pub fn is_sync_subcommittee_aggregator(
    selection_proof: &[u8],
    sync_committee_size: u64,
    sync_committee_subnet_count: u64,
    target_aggregators_per_sync_subcommittee: u64,
) -> bool {
    let modulo = std::cmp::max(
        1,
        sync_committee_size / sync_committee_subnet_count / target_aggregators_per_sync_subcommittee,
    );
    hash_prefix_to_u64(selection_proof) % modulo == 0
}

/// Subnets a sync committee member belongs to, given its indices within the
/// sync committee.
pub fn compute_sync_subnets(
    committee_indices: &[u64],
    sync_committee_size: u64,
    sync_committee_subnet_count: u64,
) -> BTreeSet<u64> {
    let subcommittee_size = sync_committee_size / sync_committee_subnet_count;
    committee_indices
        .iter()
        .map(|index| index / subcommittee_size)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graffiti_round_trip() {
        for s in ["", "vigil", "exactly-thirty-two-bytes-long!!!"] {
            let encoded = encode_graffiti(s).unwrap();
            assert_eq!(encoded.len(), GRAFFITI_BYTES);
            assert_eq!(decode_graffiti(&encoded), s);
        }
    }

    #[test]
    fn graffiti_rejects_over_long_strings() {
        assert!(encode_graffiti(&"a".repeat(33)).is_err());
    }

    #[test]
    fn hex_round_trip() {
        let bytes = vec![0xde, 0xad, 0xbe, 0xef];
        let encoded = bytes_to_hex(&bytes);
        assert_eq!(encoded, "0xdeadbeef");
        assert_eq!(hex_to_bytes(&encoded).unwrap(), bytes);
        assert!(hex_to_bytes("deadbeef").is_err());
    }

    // sha256(0x01 * 96)[0..8] as a little-endian u64 is 15010667366611956363;
    // with committee_length 128 and 16 target aggregators the modulo is 8 and
    // 15010667366611956363 % 8 == 3.
    #[test]
    fn committee_aggregator_known_vectors() {
        let proof_one = [0x01u8; 96];
        assert!(!is_committee_aggregator(&proof_one, 128, 16));

        // sha256(0x02 * 96)[0..8] -> 6463443705522100576, divisible by 8.
        let proof_two = [0x02u8; 96];
        assert!(is_committee_aggregator(&proof_two, 128, 16));
    }

    #[test]
    fn committee_aggregator_is_deterministic() {
        let proof = [0x5au8; 96];
        let first = is_committee_aggregator(&proof, 400, 16);
        let second = is_committee_aggregator(&proof, 400, 16);
        assert_eq!(first, second);
    }

    #[test]
    fn small_committees_always_aggregate() {
        // committee_length < target => modulo clamps to 1.
        let proof = [0xffu8; 96];
        assert!(is_committee_aggregator(&proof, 4, 16));
    }

    proptest::proptest! {
        #[test]
        fn graffiti_round_trips_for_any_short_string(s in "[ -~]{0,32}") {
            let encoded = encode_graffiti(&s).unwrap();
            proptest::prop_assert_eq!(decode_graffiti(&encoded), s);
        }

        #[test]
        fn hex_round_trips_for_any_bytes(bytes in proptest::collection::vec(0u8.., 0..128)) {
            let encoded = bytes_to_hex(&bytes);
            proptest::prop_assert_eq!(hex_to_bytes(&encoded).unwrap(), bytes);
        }
    }

    #[test]
    fn sync_subnets_for_member_indices() {
        // Subcommittee size = 512 / 4 = 128.
        let subnets = compute_sync_subnets(&[0, 127, 128, 511], 512, 4);
        assert_eq!(subnets.into_iter().collect::<Vec<_>>(), vec![0, 1, 3]);
    }

    #[test]
    fn sync_subcommittee_aggregator_modulo_matches_committee_case() {
        // 512 / 4 / 16 = 8, the same modulo as the committee vector above.
        let proof_two = [0x02u8; 96];
        assert!(is_sync_subcommittee_aggregator(&proof_two, 512, 4, 16));
        let proof_one = [0x01u8; 96];
        assert!(!is_sync_subcommittee_aggregator(&proof_one, 512, 4, 16));
    }
}

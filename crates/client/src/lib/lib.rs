pub mod attestation_data_provider;
pub mod beacon_chain;
pub mod beacon_node;
pub mod chain_spec;
pub mod config;
pub mod db;
pub mod doppelganger;
pub mod duty_cache;
pub mod keymanager;
pub mod logging;
pub mod metrics;
pub mod multi_beacon_node;
pub mod networks;
pub mod remote_signer;
pub mod services;
pub mod signature_provider;
pub mod sse;
pub mod validator_status_tracker;

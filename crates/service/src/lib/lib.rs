pub mod env;
pub mod server;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use prometheus::Registry;

use vigil_client::attestation_data_provider::AttestationDataProvider;
use vigil_client::beacon_chain::BeaconChain;
use vigil_client::chain_spec::ChainSpec;
use vigil_client::config::{Config, ConfigBuilder, DEFAULT_BUILDER_BOOST_FACTOR, DEFAULT_GAS_LIMIT};
use vigil_client::db::Db;
use vigil_client::doppelganger::DoppelgangerDetector;
use vigil_client::duty_cache::DutyCache;
use vigil_client::keymanager::Keymanager;
use vigil_client::metrics::Metrics;
use vigil_client::multi_beacon_node::MultiBeaconNode;
use vigil_client::networks::Network;
use vigil_client::remote_signer::RemoteSigner;
use vigil_client::services::attestation::AttestationService;
use vigil_client::services::block_proposal::BlockProposalService;
use vigil_client::services::event_consumer::EventConsumer;
use vigil_client::services::sync_committee::SyncCommitteeService;
use vigil_client::services::DutyContext;
use vigil_client::signature_provider::SignatureProvider;
use vigil_client::validator_status_tracker::ValidatorStatusTracker;
use vigil_shared::beacon_api::{GenesisData, GetGenesisResponse, GetSpecResponse};

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub fn load_config() -> Result<Config> {
    let network: Network = env::NETWORK.required();
    let beacon_node_urls = env::BEACON_NODE_URLS.list();
    let fee_recipient: String = env::FEE_RECIPIENT.required();

    ConfigBuilder::new(network, beacon_node_urls, fee_recipient)
        .beacon_node_urls_proposal(env::BEACON_NODE_URLS_PROPOSAL.list())
        .remote_signer_url(env::REMOTE_SIGNER_URL.optional())
        .graffiti(env::GRAFFITI.default(String::new()))
        .gas_limit(env::GAS_LIMIT.default(DEFAULT_GAS_LIMIT))
        .use_external_builder(env::USE_EXTERNAL_BUILDER.flag())
        .builder_boost_factor(env::BUILDER_BOOST_FACTOR.default(DEFAULT_BUILDER_BOOST_FACTOR))
        .attestation_consensus_threshold(env::ATTESTATION_CONSENSUS_THRESHOLD.optional())
        .enable_doppelganger_detection(env::ENABLE_DOPPELGANGER_DETECTION.flag())
        .disable_slashing_detection(env::DISABLE_SLASHING_DETECTION.flag())
        .enable_keymanager(env::ENABLE_KEYMANAGER.flag())
        .ignore_spec_mismatch(env::IGNORE_SPEC_MISMATCH.flag())
        .compare_consensus_block_value_only(env::COMPARE_CONSENSUS_BLOCK_VALUE_ONLY.optional())
        .data_dir(env::DATA_DIR.default("./data".into()))
        .build()
        .context("invalid configuration")
}

/// The data directory must exist and be writable before anything persists
/// state into it.
pub fn check_data_dir_permissions(data_dir: &Path) -> Result<()> {
    if !data_dir.is_dir() {
        tracing::info!("Data directory does not exist, attempting to create it");
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory at {data_dir:?}"))?;
    }

    let probe = data_dir.join(".vigil_test_permissions");
    let content = "test_permissions";
    std::fs::write(&probe, content)?;
    let read_back = std::fs::read_to_string(&probe)?;
    std::fs::remove_file(&probe)?;
    if read_back != content {
        bail!("mismatch between data written and read in the data directory");
    }
    Ok(())
}

/// For custom networks the spec and genesis come from the first configured
/// beacon node instead of built-in network parameters.
async fn fetch_custom_network_config(base_url: &str) -> Result<(ChainSpec, GenesisData)> {
    let base = base_url.strip_suffix('/').unwrap_or(base_url);
    let client = reqwest_client()?;

    let spec_response: GetSpecResponse = client
        .get(format!("{base}/eth/v1/config/spec"))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    let spec = ChainSpec::parse(&spec_response.data)?;

    let genesis_response: GetGenesisResponse = client
        .get(format!("{base}/eth/v1/beacon/genesis"))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    Ok((spec, genesis_response.data))
}

fn reqwest_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?)
}

async fn resolve_network(config: &Config) -> Result<(Arc<ChainSpec>, GenesisData)> {
    match (
        ChainSpec::for_network(config.network),
        config.network.known_genesis(),
    ) {
        (Some(spec), Some(genesis)) => Ok((Arc::new(spec), genesis)),
        _ => {
            let url = config
                .beacon_node_urls
                .first()
                .context("no beacon node urls configured")?;
            let (spec, genesis) = fetch_custom_network_config(url).await?;
            Ok((Arc::new(spec), genesis))
        }
    }
}

async fn wait_for_genesis(beacon_chain: &BeaconChain) {
    loop {
        let remaining = beacon_chain.time_until_slot_start(0);
        if remaining.is_zero() {
            return;
        }
        tracing::info!("Waiting for genesis: {:.2}s remaining", remaining.as_secs_f64());
        tokio::time::sleep(remaining.min(Duration::from_secs(10))).await;
    }
}

pub async fn run(config: Config) -> Result<()> {
    let config = Arc::new(config);
    let registry = Registry::new();
    let metrics = Arc::new(Metrics::new()?);
    metrics.register_on(&registry)?;

    check_data_dir_permissions(&config.data_dir)?;

    let (spec, genesis) = resolve_network(&config).await?;

    let multi_beacon_node = Arc::new(MultiBeaconNode::new(
        Arc::clone(&spec),
        Arc::clone(&config),
        Arc::clone(&metrics),
    )?);
    multi_beacon_node.initialize().await?;

    let beacon_chain = Arc::new(BeaconChain::new(Arc::clone(&spec), genesis));
    wait_for_genesis(&beacon_chain).await;
    beacon_chain.start_slot_ticker();

    let current_fork = beacon_chain
        .current_fork_version()
        .context("the current epoch is before the earliest supported fork")?;
    tracing::info!(
        "Starting vigil {} on {}, current fork: {current_fork}, current epoch: {}, current slot: {}",
        env!("CARGO_PKG_VERSION"),
        config.network,
        beacon_chain.current_epoch(),
        beacon_chain.current_slot()
    );

    let signer = if config.enable_keymanager {
        let db = Arc::new(Db::open(&config.data_dir)?);
        db.run_migrations()?;
        let keymanager = Arc::new(Keymanager::new(
            db,
            Arc::clone(&config),
            Arc::clone(&metrics),
        )?);
        Arc::new(SignatureProvider::Keymanager(keymanager))
    } else {
        let url = config
            .remote_signer_url
            .as_deref()
            .context("remote signer url is required unless the keymanager is enabled")?;
        let remote_signer = Arc::new(RemoteSigner::new(url, Arc::clone(&metrics))?);
        Arc::new(SignatureProvider::RemoteSigner(remote_signer))
    };

    let status_tracker = Arc::new(ValidatorStatusTracker::new(
        Arc::clone(&multi_beacon_node),
        Arc::clone(&beacon_chain),
        Arc::clone(&signer),
        Arc::clone(&metrics),
    ));
    status_tracker.initialize().await?;
    status_tracker.spawn_refresh_task();
    tracing::info!("Initialized validator status tracker");

    if config.enable_doppelganger_detection {
        let detector = DoppelgangerDetector::new(
            Arc::clone(&beacon_chain),
            multi_beacon_node.best_beacon_node()?,
            Arc::clone(&status_tracker),
        );
        detector.detect().await?;
    }

    let duty_cache = Arc::new(DutyCache::new(config.data_dir.clone()));
    let ctx = DutyContext {
        multi_beacon_node: Arc::clone(&multi_beacon_node),
        beacon_chain: Arc::clone(&beacon_chain),
        signer,
        status_tracker: Arc::clone(&status_tracker),
        duty_cache,
        config: Arc::clone(&config),
        metrics: Arc::clone(&metrics),
    };

    let attestation_data_provider = Arc::new(AttestationDataProvider::new(Arc::clone(
        &multi_beacon_node,
    )));
    attestation_data_provider.spawn_prune_task();

    let attestation_service = Arc::new(AttestationService::new(
        ctx.clone(),
        Arc::clone(&attestation_data_provider),
    ));
    let block_proposal_service = Arc::new(BlockProposalService::new(ctx.clone()));
    let sync_committee_service = Arc::new(SyncCommitteeService::new(ctx.clone()));

    attestation_service.start();
    block_proposal_service.start();
    sync_committee_service.start();
    tracing::info!("Started validator duty services");

    let event_consumer = Arc::new(EventConsumer::new(
        Arc::clone(&multi_beacon_node),
        Arc::clone(&beacon_chain),
        Arc::clone(&attestation_service),
        Arc::clone(&block_proposal_service),
        Arc::clone(&sync_committee_service),
        Arc::clone(&status_tracker),
        Arc::clone(&metrics),
    ));
    event_consumer.start();
    tracing::info!("Started event consumer");

    server::spawn(registry);

    wait_for_shutdown_signal().await?;
    tracing::info!("Received shutdown signal, finishing ongoing duties");

    // Give in-flight and imminent duties a chance to finish, bounded by two
    // slots, then flush the duty caches.
    let deadline = tokio::time::Instant::now() + 2 * beacon_chain.spec.slot_duration();
    while tokio::time::Instant::now() < deadline {
        let busy = attestation_service.has_ongoing_duty()
            || attestation_service.has_upcoming_duty()
            || block_proposal_service.has_ongoing_duty()
            || block_proposal_service.has_upcoming_duty()
            || sync_committee_service.has_ongoing_duty();
        if !busy {
            break;
        }
        tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
    }

    attestation_service.persist_duties();
    block_proposal_service.persist_duties();
    sync_committee_service.persist_duties();
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = sigterm.recv() => {}
            result = tokio::signal::ctrl_c() => result?,
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok(())
    }
}

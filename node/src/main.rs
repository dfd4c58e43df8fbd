//! Meridian node entry point. Wires the consensus core to its collaborators
//! — ledger store, open-ledger pool, load accountant, fee tracker — and runs
//! the one-second tick loop that consults the timing oracle, drives rounds,
//! and watches the disk-space floor.

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, Command};
use config::Config;
use ed25519_dalek::SigningKey;
use meridian_consensus::{
    ConsensusConfig, ConsensusMetrics, MemoryEngine, OpenLedger, ProposalDisposition, RoundDriver,
    StaticUnl,
};
use meridian_load::{FeeTracker, LoadAccountant, LoadConfig, LoadKind};
use meridian_storage::{LedgerStore, MemoryLedgerStore};
use meridian_types::{ClosedLedger, LedgerHeader, Proposal, Seconds, TransactionSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Free space below this is fatal.
const DISK_LOW_BYTES: u64 = 512 * 1024 * 1024;
/// Ticks between disk probes.
const DISK_CHECK_EVERY: u64 = 30;
/// Ticks between cache sweeps.
const SWEEP_EVERY: u64 = 10;
/// Open-ledger backlog that raises the local fee factor.
const FEE_BACKLOG_THRESHOLD: usize = 256;

/// Application configuration.
#[derive(Debug, Clone)]
struct AppConfig {
    validator_seed: [u8; 32],
    data_dir: String,
    consensus: ConsensusConfig,
    load: LoadConfig,
    fee_escalation_fraction: u32,
}

fn load_app_config(config_path: Option<&str>, data_dir_override: Option<&str>) -> Result<AppConfig> {
    let mut builder = Config::builder()
        .set_default("validator_seed", "01".repeat(32))?
        .set_default("data_dir", "./data")?
        .set_default("ledger_idle_interval", 15i64)?
        .set_default("ledger_min_consensus", 2i64)?
        .set_default("peer_position_timeout", 20i64)?
        .set_default("round_stall_threshold", 20i64)?
        .set_default("stall_quiet", 5i64)?
        .set_default("close_time_resolution", 10i64)?
        .set_default("load_credit_rate", 10i64)?
        .set_default("load_credit_limit", 50i64)?
        .set_default("load_debit_warn", -50i64)?
        .set_default("load_debit_limit", -100i64)?
        .set_default("fee_escalation_fraction", 16i64)?;

    if let Some(path) = config_path {
        builder = builder.add_source(config::File::with_name(path).required(true));
    }
    builder = builder.add_source(config::Environment::with_prefix("MERIDIAN"));
    let cfg = builder.build().context("loading configuration")?;

    let seed_hex: String = cfg.get("validator_seed")?;
    let seed_bytes = hex::decode(seed_hex.trim()).context("validator_seed must be hex")?;
    let validator_seed: [u8; 32] = seed_bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("validator_seed must be 32 bytes"))?;

    let consensus = ConsensusConfig {
        ledger_idle_interval: cfg.get::<u32>("ledger_idle_interval")?,
        ledger_min_consensus: cfg.get::<u32>("ledger_min_consensus")?,
        peer_position_timeout: cfg.get::<u32>("peer_position_timeout")?,
        round_stall_threshold: cfg.get::<u32>("round_stall_threshold")?,
        stall_quiet: cfg.get::<u32>("stall_quiet")?,
        close_time_resolution: cfg.get::<u32>("close_time_resolution")?,
        ..ConsensusConfig::default()
    };
    let load = LoadConfig {
        credit_rate: cfg.get::<i64>("load_credit_rate")?,
        credit_limit: cfg.get::<i64>("load_credit_limit")?,
        debit_warn: cfg.get::<i64>("load_debit_warn")?,
        debit_limit: cfg.get::<i64>("load_debit_limit")?,
        ..LoadConfig::default()
    };

    Ok(AppConfig {
        validator_seed,
        data_dir: data_dir_override
            .map(str::to_string)
            .unwrap_or(cfg.get::<String>("data_dir")?),
        consensus,
        load,
        fee_escalation_fraction: cfg.get::<u32>("fee_escalation_fraction")?,
    })
}

fn wall_now() -> Seconds {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs() as Seconds
}

/// Route a peer proposal through the driver and settle the load accounting
/// for its source. Returns true when the source should be disconnected.
fn integrate_proposal(
    driver: &mut RoundDriver,
    accountant: &LoadAccountant,
    source: &str,
    proposal: Proposal,
    now: Seconds,
) -> bool {
    match driver.apply_peer_proposal(proposal, now) {
        ProposalDisposition::Accepted => {
            accountant.adjust_kind(source, LoadKind::NewTrusted);
        }
        ProposalDisposition::Invalid => {
            accountant.adjust_kind(source, LoadKind::InvalidSignature);
        }
        // Untrusted proposers are not accounted; stale proposals are free.
        ProposalDisposition::Untrusted | ProposalDisposition::Stale => {}
    }
    if accountant.should_warn(source) {
        warn!(source, "source approaching load cutoff");
    }
    accountant.should_cutoff(source)
}

/// Nudge the fee factor after a close based on the remaining backlog.
fn update_fee_factor(fees: &FeeTracker, backlog: usize) {
    let changed = if backlog > FEE_BACKLOG_THRESHOLD {
        fees.raise_local_fee()
    } else {
        fees.lower_local_fee()
    };
    if changed {
        info!(status = ?fees.status(), "fee factor changed");
    }
}

fn disk_space_ok(data_dir: &str) -> bool {
    match fs2::available_space(Path::new(data_dir)) {
        Ok(free) if free < DISK_LOW_BYTES => {
            error!(free, floor = DISK_LOW_BYTES, "free disk space below floor");
            false
        }
        Ok(_) => true,
        Err(err) => {
            warn!(%err, "disk space probe failed");
            true
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("meridian-node")
        .about("Meridian ledger node")
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .value_name("FILE")
                .help("Configuration file"),
        )
        .arg(
            Arg::new("data-dir")
                .long("data-dir")
                .value_name("DIR")
                .help("Data directory (overrides configuration)"),
        )
        .arg(
            Arg::new("standalone")
                .long("standalone")
                .action(ArgAction::SetTrue)
                .help("Run without peers, closing ledgers on the local clock"),
        )
        .get_matches();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let standalone = matches.get_flag("standalone");
    let app_config = load_app_config(
        matches.get_one::<String>("config").map(String::as_str),
        matches.get_one::<String>("data-dir").map(String::as_str),
    )?;
    std::fs::create_dir_all(&app_config.data_dir)
        .with_context(|| format!("creating data dir {}", app_config.data_dir))?;

    let key = SigningKey::from_bytes(&app_config.validator_seed);
    info!(
        validator = %hex::encode(key.verifying_key().to_bytes()),
        data_dir = %app_config.data_dir,
        "starting meridian node"
    );

    // Construct the subsystems and seed the chain with a genesis ledger.
    let store: Arc<MemoryLedgerStore> = Arc::new(MemoryLedgerStore::new());
    if store.latest()?.is_none() {
        store.push_closed_ledger(ClosedLedger {
            header: LedgerHeader::genesis(wall_now()),
            tx_set: TransactionSet::new(),
            metas: Vec::new(),
        })?;
        info!("starting new ledger chain");
    }

    let pool = Arc::new(OpenLedger::new());
    let metrics = Arc::new(ConsensusMetrics::new());
    let accountant = Arc::new(LoadAccountant::new(app_config.load));
    let fees = Arc::new(FeeTracker::new(app_config.fee_escalation_fraction));
    // Standalone trust: just ourselves. A UNL file feeds this in a network
    // deployment.
    let unl = Arc::new(StaticUnl::new([key.verifying_key().to_bytes()]));

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Proposal>();
    let mut driver = RoundDriver::new(
        app_config.consensus.clone(),
        key,
        store.clone(),
        Arc::new(MemoryEngine::default()),
        unl,
        pool.clone(),
        metrics.clone(),
        outbound_tx,
    );

    // Peer transport feeds this; absent a transport it stays idle.
    let (_inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<(String, Proposal)>();
    if !standalone {
        warn!("peer transport not configured; closing ledgers on the local clock");
    }

    let canonicalise_task = accountant.spawn_canonicalise_task();
    // Outbound proposals would go to the peer transport; drain and trace.
    let broadcast_task = tokio::spawn(async move {
        while let Some(proposal) = outbound_rx.recv().await {
            debug!(seq = proposal.seq, set = %proposal.tx_set_hash, "proposal broadcast");
        }
    });

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut open_secs: u32 = 0;
    let mut tick_count: u64 = 0;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown request");
                break;
            }
            _ = ticker.tick() => {
                tick_count += 1;
                let now = wall_now();

                if tick_count % DISK_CHECK_EVERY == 0 && !disk_space_ok(&app_config.data_dir) {
                    break;
                }
                if tick_count % SWEEP_EVERY == 0 {
                    driver.sweep_caches(accountant.uptime_secs());
                }

                while let Ok((source, proposal)) = inbound_rx.try_recv() {
                    if integrate_proposal(&mut driver, &accountant, &source, proposal, now) {
                        // The transport layer disconnects on this signal.
                        warn!(source = %source, "load cutoff; disconnecting source");
                    }
                }

                if driver.in_round() {
                    match driver.tick(now) {
                        Ok(Some(ledger)) => {
                            open_secs = 0;
                            info!(
                                seq = ledger.seq(),
                                transactions = ledger.tx_set.len(),
                                close_time = ledger.header.close_time,
                                "ledger closed"
                            );
                            update_fee_factor(&fees, pool.len());
                        }
                        Ok(None) => {}
                        Err(err) => {
                            error!(%err, "round tick failed; aborting round");
                            driver.abort();
                        }
                    }
                } else {
                    open_secs += 1;
                    if driver.should_close_now(!pool.is_empty(), open_secs) {
                        if let Err(err) = driver.start_round(now) {
                            error!(%err, "failed to start consensus round");
                        }
                    }
                }
            }
        }
    }

    driver.abort();
    canonicalise_task.abort();
    broadcast_task.abort();
    let snapshot = metrics.snapshot();
    info!(?snapshot, "stopped");
    Ok(())
}

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use legit_crowd::blob_store::InMemoryBlobStore;
use legit_crowd::config::CrowdConfig;
use legit_crowd::elgamal::generate_keypair;
use legit_crowd::ledger::{Address, Gas, InMemoryLedger, InMemoryLedgerConfig};
use legit_crowd::logging::init_tracing;
use legit_crowd::network::{
    ControlClient, ControlServer, PeerDirectory, ProofServer, TaskPullClient, TaskPullServer, TcpProofClient,
};
use legit_crowd::randomizer::RandomizerNode;
use legit_crowd::requester::{ChainVerifier, RequesterNode};
use legit_crowd::sequencer::TransactionSequencer;
use legit_crowd::submitter::SubmitterNode;
use legit_crowd::task::{SimpleSubtask, SimpleTask, Task};
use legit_crowd::tokio_tools::run_blocking;

const LOG_TARGET: &str = "bin::crowd_demo";

#[derive(Debug, Parser)]
#[command(name = "crowd_demo")]
#[command(about = "Run one privacy-preserving crowdsourcing round over loopback", long_about = None)]
struct Args {
    /// JSON configuration file; flags below override it
    #[arg(long, env = "CROWD_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "CROWD_SUBMITTERS", default_value_t = 3)]
    submitters: usize,

    #[arg(long, env = "CROWD_RANDOMIZERS", default_value_t = 5)]
    randomizers: u64,

    #[arg(long, env = "CROWD_RANDOMIZERS_PER_SUBTASK")]
    randomizers_per_subtask: Option<usize>,

    #[arg(long, env = "CROWD_SUBTASKS")]
    subtasks: Option<usize>,

    /// Seconds the requester waits for chains before aggregating what it has
    #[arg(long, env = "CROWD_ROUND_DEADLINE_SECS")]
    round_deadline_secs: Option<u64>,

    /// Number of items in the counting task
    #[arg(long, default_value_t = 100)]
    items: i64,

    #[arg(long, env = "CROWD_KEY_BITS")]
    key_bits: Option<u64>,

    /// Seed the demo RNG to make keys and randomness deterministic
    #[arg(long)]
    rng_seed: Option<u64>,

    /// Toggle structured (JSON) tracing output
    #[arg(long)]
    json: bool,
}

fn build_config(args: &Args) -> Result<CrowdConfig> {
    let mut config = match &args.config {
        Some(path) => CrowdConfig::from_json_file(path)?,
        None => CrowdConfig::default(),
    };
    if let Some(bits) = args.key_bits {
        config.protocol.key_bits = bits;
    }
    if let Some(count) = args.randomizers_per_subtask {
        config.protocol.randomizers_per_subtask = count;
    }
    if let Some(count) = args.subtasks {
        config.protocol.subtask_count = count;
    }
    if let Some(secs) = args.round_deadline_secs {
        config.node.round_deadline = Duration::from_secs(secs);
    }
    config.validate()?;
    if args.randomizers < config.protocol.randomizers_per_subtask as u64 {
        bail!(
            "{} randomizers cannot cover {} per subtask",
            args.randomizers,
            config.protocol.randomizers_per_subtask
        );
    }
    if args.submitters == 0 {
        bail!("at least one submitter is required");
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init_tracing(args.json, "info")?;
    let config = build_config(&args)?;

    let cancel = CancellationToken::new();
    tokio::select! {
        result = run_round(&args, &config, cancel.clone()) => {
            cancel.cancel();
            result
        }
        _ = signal::ctrl_c() => {
            warn!(target: LOG_TARGET, "received shutdown signal; aborting round");
            cancel.cancel();
            Ok(())
        }
    }
}

async fn sequencer_for(ledger: &Arc<InMemoryLedger>, config: &CrowdConfig, account: String) -> Result<Arc<TransactionSequencer>> {
    let sequencer = TransactionSequencer::start(Address::new(account), ledger.clone(), config.node.sequencer.clone())
        .await
        .context("failed to start sequencer")?;
    Ok(Arc::new(sequencer))
}

async fn run_round(args: &Args, config: &CrowdConfig, cancel: CancellationToken) -> Result<()> {
    let mut rng = match args.rng_seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let loopback: SocketAddr = "127.0.0.1:0".parse()?;
    let node = &config.node;

    let started = Instant::now();
    let params = config.keygen_params();
    let mut keygen_rng = StdRng::seed_from_u64(rng.gen());
    let (pk, sk) = run_blocking("keygen", move || generate_keypair(&params, &mut keygen_rng)).await??;
    let (pk, sk) = (Arc::new(pk), Arc::new(sk));
    info!(
        target: LOG_TARGET,
        bits = config.protocol.key_bits,
        fingerprint = %pk.fingerprint(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "requester key pair generated"
    );

    let ledger = Arc::new(InMemoryLedger::new(InMemoryLedgerConfig::new(
        config.protocol.randomizers_per_subtask,
    )));
    let blobs = Arc::new(InMemoryBlobStore::new());
    let peers = Arc::new(PeerDirectory::new());
    let mut groups = Vec::new();
    let mut controls: Vec<(String, ControlClient)> = Vec::new();

    for id in 1..=args.randomizers {
        let randomizer = Arc::new(RandomizerNode::new(
            id,
            Arc::clone(&pk),
            ledger.clone(),
            blobs.clone(),
            sequencer_for(&ledger, config, format!("0xrandomizer{id}")).await?,
            config.randomizer_config(),
            StdRng::seed_from_u64(rng.gen()),
        ));
        randomizer.register().await?;

        let proofs = ProofServer::bind(
            loopback,
            id,
            Arc::clone(&pk),
            randomizer.proof_store(),
            node.proof_session_timeout,
            StdRng::seed_from_u64(rng.gen()),
        )
        .await?;
        peers.register(id, proofs.local_addr()?);
        tokio::spawn(proofs.run(cancel.child_token()));

        let control = ControlServer::bind(loopback, randomizer.clone(), node.proof_session_timeout).await?;
        controls.push((format!("randomizer {id}"), ControlClient::new(control.local_addr()?, node.proof_session_timeout)));
        tokio::spawn(control.run(cancel.child_token()));

        groups.push(randomizer.spawn(cancel.child_token()));
    }

    let items = args.items.max(0);
    let task = Arc::new(SimpleTask::new(
        "count the items",
        (0..items).collect(),
        config.protocol.subtask_count,
    ));
    let verifier = ChainVerifier::new(
        Arc::clone(&pk),
        sk,
        ledger.clone(),
        blobs.clone(),
        Arc::new(TcpProofClient::new(
            Arc::clone(&peers),
            node.proof_session_timeout,
            StdRng::seed_from_u64(rng.gen()),
        )),
    );
    let (requester, result) = RequesterNode::new(Arc::clone(&task), verifier, ledger.clone(), config.requester_config())?;
    let requester = Arc::new(requester);
    groups.push(requester.spawn(cancel.child_token()));

    let pulls = TaskPullServer::bind(loopback, requester.subtask_queue(), requester.config().task_pull_timeout).await?;
    let pull_addr = pulls.local_addr()?;
    tokio::spawn(pulls.run(cancel.child_token()));
    let control = ControlServer::bind(loopback, requester.clone(), node.proof_session_timeout).await?;
    controls.push(("requester".into(), ControlClient::new(control.local_addr()?, node.proof_session_timeout)));
    tokio::spawn(control.run(cancel.child_token()));

    let mut submitters = Vec::new();
    for n in 0..args.submitters {
        let submitter: Arc<SubmitterNode<SimpleSubtask>> = Arc::new(SubmitterNode::new(
            format!("submitter-{n}"),
            Arc::clone(&pk),
            blobs.clone(),
            sequencer_for(&ledger, config, format!("0xsubmitter{n}")).await?,
            TaskPullClient::new(pull_addr, node.task_pull_timeout),
            StdRng::seed_from_u64(rng.gen()),
        ));
        let control = ControlServer::bind(loopback, submitter.clone(), node.proof_session_timeout).await?;
        let client = ControlClient::new(control.local_addr()?, node.proof_session_timeout);
        tokio::spawn(control.run(cancel.child_token()));
        controls.push((submitter.name().to_string(), client.clone()));
        submitters.push((submitter, client));
    }

    let round_started = Instant::now();
    for (_, client) in &submitters {
        client.start().await.context("failed to start submitter")?;
    }
    for (submitter, _) in &submitters {
        let summary = submitter.finished().await?;
        info!(
            target: LOG_TARGET,
            submitter = submitter.name(),
            pulled = summary.pulled,
            confirmed = summary.confirmed.len(),
            failed = summary.failed.len(),
            "submitter finished"
        );
    }

    let aggregate = result.await.context("requester stopped before aggregating")?;
    println!(
        "aggregated result: {:?} ({} of {} subtasks merged, {} invalid, {} excluded) in {:?}",
        aggregate.output,
        aggregate.merged.len(),
        task.subtask_count(),
        aggregate.invalid.len(),
        aggregate.excluded.len(),
        round_started.elapsed()
    );
    let flagged = requester.flagged();
    if !flagged.is_empty() {
        println!("flagged randomizers: {flagged:?}");
    }

    let mut total: Gas = 0;
    for (name, client) in &controls {
        let gas = client.gas_cost().await.with_context(|| format!("gas query to {name} failed"))?;
        total += gas;
        println!("{name:>14}: {gas} gas");
    }
    println!("{:>14}: {total} gas", "total");

    cancel.cancel();
    for group in groups {
        group.shutdown(Duration::from_secs(2)).await;
    }
    Ok(())
}

//! lambdadelta - in-process Lambdadelta network simulation
//!
//! Starts a set of members on an in-memory transport, has each of them
//! publish events and waits until every timeline holds the same events in
//! the same order.

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use lambdadelta::config::{Config, DEFAULT_EVENT_TYPE};
use lambdadelta::message_id::RegistryError;
use lambdadelta::node::{open_datastore, Lambdadelta, NodeError};
use lambdadelta::SystemClock;
use lambdadelta_core::{EventId, RlnGroup, RlnIdentity, TransparentRln};
use lambdadelta_net::{KeyPair, MemoryHub};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "lambdadelta", version, about = "Lambdadelta event feed simulation")]
struct SimArgs {
    #[command(flatten)]
    config: Config,

    /// Number of simulated members
    #[arg(long, default_value_t = 4)]
    peers: usize,

    /// Events published by each member
    #[arg(long, default_value_t = 1)]
    events_per_peer: usize,

    /// Give up waiting for convergence after this many seconds
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = SimArgs::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lambdadelta=info"));
    if args.log_format == LogFormat::Json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }

    info!("lambdadelta v{} - event feed simulation", env!("CARGO_PKG_VERSION"));

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Simulation failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: SimArgs) -> anyhow::Result<()> {
    if args.peers == 0 {
        bail!("At least one peer is required");
    }
    args.config.validate()?;

    let identities: Vec<RlnIdentity> = (0..args.peers)
        .map(|i| RlnIdentity::from_seed(format!("member-{i}").as_bytes()))
        .collect();
    let group = RlnGroup::new(identities.iter().map(|id| id.commitment()));
    let clock = Arc::new(SystemClock);
    let hub = MemoryHub::new();

    let mut nodes = Vec::with_capacity(args.peers);
    for (i, identity) in identities.into_iter().enumerate() {
        let mut config = args.config.clone();
        if let Some(dir) = &config.data_dir {
            config.data_dir = Some(dir.join(format!("member-{i}")));
        }
        let mut seed = [0u8; 32];
        seed[..8].copy_from_slice(&(i as u64).to_le_bytes());
        let keypair = KeyPair::from_seed(&seed);
        let network = hub.join(&keypair);
        let store = open_datastore(&config).context("opening datastore")?;
        let node = Lambdadelta::new(
            config,
            keypair,
            Arc::new(TransparentRln::new(Some(identity), group.clone())),
            network,
            store,
            clock.clone(),
        )?;
        node.start().await?;
        nodes.push(node);
    }
    hub.connect_all();
    info!("Started {} members on topic {}", nodes.len(), args.config.topic);

    for round in 0..args.events_per_peer {
        for (i, node) in nodes.iter().enumerate() {
            let payload = format!("member {i} event {round}").into_bytes();
            let id = publish(node, payload).await?;
            info!("Member {} published {}", i, id);
        }
    }

    let expected = args.peers * args.events_per_peer;
    let deadline = Instant::now() + Duration::from_secs(args.timeout_secs);
    let agreed = loop {
        if converged(&nodes, expected)? {
            break true;
        }
        if Instant::now() >= deadline {
            break false;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    };

    for (i, node) in nodes.iter().enumerate() {
        let stats = node.stats();
        info!(
            "Member {}: {} in timeline, {} unconfirmed, {} gossip accepted, {} stemmed, {} fluffed",
            i,
            stats.feed.timeline,
            stats.feed.unconfirmed,
            stats.sync.gossip_accepted,
            stats.relay.stemmed,
            stats.relay.fluffed,
        );
    }
    for node in &nodes {
        if let Err(e) = node.close().await {
            warn!("Close failed for {}: {}", node.peer_id(), e);
        }
    }

    if !agreed {
        bail!("Timelines did not converge on {expected} events within {}s", args.timeout_secs);
    }
    info!("All {} timelines agree on {} events", args.peers, expected);
    Ok(())
}

/// Publish, waiting out the rate-limit window when it is spent
async fn publish(node: &Lambdadelta, payload: Vec<u8>) -> anyhow::Result<EventId> {
    loop {
        match node.new_event(DEFAULT_EVENT_TYPE, payload.clone()).await {
            Ok(event) => return Ok(event.event_id),
            Err(NodeError::Registry(RegistryError::MessageLimitReached { .. })) => {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn converged(nodes: &[Lambdadelta], expected: usize) -> anyhow::Result<bool> {
    let mut reference: Option<Vec<EventId>> = None;
    for node in nodes {
        let ids: Vec<EventId> = node.events()?.into_iter().map(|e| e.event_id).collect();
        if ids.len() != expected {
            return Ok(false);
        }
        match &reference {
            Some(first) if *first != ids => return Ok(false),
            Some(_) => {}
            None => reference = Some(ids),
        }
    }
    Ok(true)
}

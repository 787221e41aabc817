use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use rand::Rng;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use swarmguard::audit::{AuditSink, TracingAuditSink};
use swarmguard::clock::{Clock, SystemClock};
use swarmguard::config::SwarmGuardConfig;
use swarmguard::mesh::{ClusterCoordinator, EventChannel, GossipChannel};
use swarmguard::ratelimit::{AdaptiveLimiter, AttemptContext, Decision, KeyType, RateLimitKey};
use swarmguard::store::{CacheBackend, MemoryStore};

#[derive(Debug, Parser)]
#[command(name = "swarmguard", version, about = "Adaptive, cluster-aware rate limiting")]
struct Cli {
    /// Configuration file (YAML)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Register this node and run cluster maintenance until shut down
    ///
    /// Node records, locks and global limits live in this process's in-memory
    /// store, so separate `serve` processes each coordinate alone. Gossip only
    /// carries notifications between them.
    Serve,
    /// Fire attempts against one key and print each decision
    Simulate {
        /// Key type: ip, user, endpoint or custom
        #[arg(long, default_value = "ip")]
        key_type: KeyType,

        /// Key identifier
        #[arg(long, default_value = "127.0.0.1")]
        id: String,

        /// Number of attempts
        #[arg(short = 'n', long, default_value_t = 10)]
        attempts: u32,

        /// Pause between attempts in milliseconds
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,

        /// User agent reported with each attempt
        #[arg(long)]
        user_agent: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = SwarmGuardConfig::load(cli.config.as_deref())?;
    info!(
        node_id = %config.cluster.node_id,
        max_attempts = config.limiter.max_attempts,
        window_secs = config.limiter.window_secs,
        cluster = config.cluster.enabled,
        "Configuration loaded"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store: Arc<dyn CacheBackend> = Arc::new(MemoryStore::with_clock(clock.clone()));
    let audit: Arc<dyn AuditSink> = Arc::new(TracingAuditSink);

    match cli.command {
        Command::Serve => serve(config, store, clock, audit).await,
        Command::Simulate {
            key_type,
            id,
            attempts,
            interval_ms,
            user_agent,
        } => {
            let key = RateLimitKey::new(key_type, id);
            let ctx = AttemptContext { user_agent };
            simulate(config, store, clock, audit, key, ctx, attempts, interval_ms).await
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn serve(
    config: SwarmGuardConfig,
    store: Arc<dyn CacheBackend>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
) -> anyhow::Result<()> {
    store.ping().await?;

    let gossip = match (&config.cluster.gossip, config.cluster.enabled) {
        (Some(gossip_config), true) => Some(Arc::new(
            GossipChannel::start(&config.cluster.node_id, gossip_config).await?,
        )),
        (Some(_), false) => {
            warn!("Gossip configured but cluster coordination is disabled");
            None
        }
        _ => None,
    };
    if gossip.is_some() {
        warn!(
            "Coordinator state is held in this process's in-memory store; \
             peers reached over gossip will not see this node's registration"
        );
    }
    let channel = gossip.clone().map(|g| g as Arc<dyn EventChannel>);

    let interval = config.cluster.maintenance_interval();
    let coordinator = Arc::new(ClusterCoordinator::new(
        store,
        clock,
        audit,
        channel,
        config.cluster.clone(),
    ));

    let role = coordinator.register_node().await?;
    info!(node_id = %coordinator.node_id(), role = ?role, "Node started");

    let maintenance = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(jittered(interval)).await;
                let report = coordinator.run_maintenance().await;
                info!(
                    role = ?report.role,
                    synchronized = report.synchronized,
                    removed_nodes = report.removed_nodes,
                    "Maintenance round complete"
                );
            }
        })
    };

    shutdown_signal().await;
    maintenance.abort();
    let _ = maintenance.await;

    if let Err(e) = coordinator.deregister().await {
        warn!(error = %e, "Failed to deregister node");
    }
    drop(coordinator);
    if let Some(gossip) = gossip.and_then(|g| Arc::try_unwrap(g).ok()) {
        gossip.shutdown().await?;
    }

    info!("Swarmguard stopped");
    Ok(())
}

/// Spread maintenance rounds so nodes do not contend for locks in step.
fn jittered(interval: Duration) -> Duration {
    let spread = interval.as_millis() as u64 / 10;
    let jitter = rand::thread_rng().gen_range(0..=spread);
    interval + Duration::from_millis(jitter)
}

#[allow(clippy::too_many_arguments)]
async fn simulate(
    config: SwarmGuardConfig,
    store: Arc<dyn CacheBackend>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
    key: RateLimitKey,
    ctx: AttemptContext,
    attempts: u32,
    interval_ms: u64,
) -> anyhow::Result<()> {
    let coordinator = if config.cluster.enabled {
        let coordinator = Arc::new(ClusterCoordinator::new(
            store.clone(),
            clock.clone(),
            audit.clone(),
            None,
            config.cluster.clone(),
        ));
        coordinator.register_node().await?;
        Some(coordinator)
    } else {
        None
    };
    let cache_key = key.cache_key();
    let limiter =
        AdaptiveLimiter::connect(key, &config, store, clock, audit, coordinator.clone()).await?;

    for n in 1..=attempts {
        match limiter.check(&ctx).await? {
            Decision::Admitted { remaining, score } => {
                println!("#{n:<4} admitted  remaining={remaining} score={score:.3}")
            }
            Decision::Denied {
                reason,
                retry_after,
            } => println!("#{n:<4} denied    reason={reason:?} retry_after={retry_after}s"),
        }
        if interval_ms > 0 {
            tokio::time::sleep(Duration::from_millis(interval_ms)).await;
        }
    }

    let rules = limiter.active_applicable_rules().await;
    println!(
        "score={:.3} applicable_rules={:?}",
        limiter.behavior_score().await,
        rules.iter().map(|r| r.name()).collect::<Vec<_>>()
    );

    if let Some(coordinator) = coordinator {
        // Let spawned count updates land
        tokio::time::sleep(Duration::from_millis(50)).await;
        if let Some(state) = coordinator.get_global_limit(&cache_key).await {
            println!(
                "global count={} max={} node={}",
                state.count, state.max, state.node_id
            );
        }
    }
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

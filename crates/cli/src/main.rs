use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use dpsync_agent::{spawn_change_loop, Agent, AgentConfig, AgentEvent, ChangeEvent, Report};
use dpsync_core::ObjectState;
use dpsync_descriptors::SimDevice;
use dpsync_models::{ConfigItem, DesiredState, Interface, ItemKind, Route};
use dpsync_reconcile::CascadePolicy;
use dpsync_txn::{LocalTransport, ResyncTxn};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "dpsyncctl", version, about = "dpsync CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Agent config file (YAML); environment variables are used otherwise
    #[arg(long = "config", global = true, env = "DPSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Override the cascade policy (requeue|drop)
    #[arg(long = "cascade", global = true)]
    cascade: Option<CascadePolicy>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replay the interface/route scenario on the simulated device
    Demo,
    /// Resync a desired-state file against the simulated device
    Resync {
        /// YAML file with an `items` list
        file: PathBuf,
        /// Only validate and print derived keys
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
    },
    /// Feed a desired-state file through the change loop, one event per item
    Replay {
        file: PathBuf,
    },
    /// Print the derived key of every item in a desired-state file
    Keys {
        file: PathBuf,
    },
}

#[derive(Debug, Serialize)]
struct Row {
    key: String,
    kind: ItemKind,
    state: ObjectState,
    index: Option<u32>,
}

fn init_tracing() {
    let env = std::env::var("DPSYNC_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("DPSYNC_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid DPSYNC_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_config(cli: &Cli) -> Result<AgentConfig> {
    let mut cfg = match &cli.config {
        Some(path) => AgentConfig::from_yaml_file(path)?,
        None => AgentConfig::from_env(),
    };
    if let Some(p) = cli.cascade {
        cfg.cascade = p;
    }
    Ok(cfg)
}

fn load_items(path: &Path) -> Result<Vec<ConfigItem>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let ds: DesiredState = serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    Ok(ds.items)
}

fn rows(agent: &Agent, keys: impl IntoIterator<Item = String>) -> Vec<Row> {
    keys.into_iter()
        .filter_map(|key| {
            let kind = ItemKind::of_key(&key)?;
            Some(Row { state: agent.state(&key), index: agent.lookup_index(&key), kind, key })
        })
        .collect()
}

fn all_rows(agent: &Agent) -> Vec<Row> { rows(agent, ItemKind::ALL.iter().flat_map(|k| agent.keys(*k))) }

fn print_rows(output: Output, rows: &[Row]) -> Result<()> {
    match output {
        Output::Human => {
            println!("{:<9} {:<6} {:<14} KEY", "STATE", "INDEX", "KIND");
            for r in rows {
                let idx = r.index.map(|i| i.to_string()).unwrap_or_else(|| "-".to_string());
                println!("{:<9} {:<6} {:<14} {}", r.state.to_string(), idx, r.kind.to_string(), r.key);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(rows)?),
    }
    Ok(())
}

fn print_step(output: Output, step: &str, report: &Report, dev: &SimDevice) {
    if output != Output::Human {
        return;
    }
    println!("== {}", step);
    for t in &report.transitions {
        let call = if t.device_call { " *" } else { "" };
        println!("   {:<9} -> {:<9} {}{}", t.from.to_string(), t.to.to_string(), t.key, call);
    }
    for e in &report.errors {
        println!("   error: {}", e);
    }
    println!("   device calls so far: {}", dev.call_names().join(", "));
}

fn demo(output: Output, cfg: &AgentConfig) -> Result<()> {
    let dev = SimDevice::new();
    let agent = Agent::with_device(&dev, cfg.cascade)?;
    let memif = Interface::memif("memif1", 1).with_address("10.0.0.1/24");
    let route = Route::new("10.1.0.0/24", "10.0.0.2").via("memif1");

    let r = agent.put(route.clone().into())?;
    print_step(output, "put route (interface missing)", &r, &dev);
    let r = agent.put(memif.into())?;
    print_step(output, "put memif1", &r, &dev);
    let r = agent.delete(&dpsync_models::interface_key("memif1"))?;
    print_step(output, "delete memif1", &r, &dev);
    let r = agent.delete(&route.key())?;
    print_step(output, "delete route", &r, &dev);

    print_rows(output, &all_rows(&agent))?;
    if dev.integrity_violations() > 0 {
        anyhow::bail!("simulated device saw {} integrity violations", dev.integrity_violations());
    }
    Ok(())
}

async fn resync(output: Output, cfg: &AgentConfig, file: &Path, dry_run: bool) -> Result<()> {
    let items = load_items(file)?;
    if dry_run {
        let mut bad = 0usize;
        for item in &items {
            if let Err(e) = validate(item) {
                bad += 1;
                eprintln!("{}: {}", item.key(), e);
            }
        }
        let keys: Vec<String> = items.iter().map(|i| i.key()).collect();
        info!(items = keys.len(), invalid = bad, "dry run");
        for k in keys {
            println!("{}", k);
        }
        if bad > 0 {
            anyhow::bail!("{} invalid items", bad);
        }
        return Ok(());
    }

    let dev = SimDevice::new();
    let agent = Arc::new(Agent::with_device(&dev, cfg.cascade)?);
    let transport = Arc::new(LocalTransport::new(Arc::clone(&agent)));
    let started = Instant::now();
    let mut txn = ResyncTxn::new(transport);
    for item in items {
        txn = txn.item(item);
    }
    let res = txn.send().receive_reply().await;
    info!(elapsed_ms = started.elapsed().as_millis() as u64, calls = dev.call_names().len(), "resync finished");
    print_rows(output, &all_rows(&agent))?;
    res.context("resync")?;
    Ok(())
}

fn validate(item: &ConfigItem) -> std::result::Result<(), dpsync_core::ValidationError> {
    match item {
        ConfigItem::Interface(v) => v.validate(),
        ConfigItem::Route(v) => v.validate(),
        ConfigItem::BridgeDomain(v) => v.validate(),
        ConfigItem::LocalSid(v) => v.validate(),
        ConfigItem::Tmc(v) => v.validate(),
    }
}

async fn replay(output: Output, cfg: &AgentConfig, file: &Path) -> Result<()> {
    let items = load_items(file)?;
    let dev = SimDevice::new();
    let agent = Arc::new(Agent::with_device(&dev, cfg.cascade)?);
    let (tx, handle) = spawn_change_loop(Arc::clone(&agent), cfg);
    let mut epochs = handle.subscribe_epoch();
    let keys: Vec<String> = items.iter().map(|i| i.key()).collect();
    for item in items {
        tx.send(AgentEvent::Change(ChangeEvent::put(item))).await.context("change loop stopped")?;
    }
    drop(tx);
    if tokio::time::timeout(Duration::from_secs(10), handle.join()).await.is_err() {
        warn!("change loop did not drain in time");
    }
    info!(epoch = *epochs.borrow_and_update(), "replay finished");
    print_rows(output, &rows(&agent, keys))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let cfg = load_config(&cli)?;
    info!(cascade = ?cfg.cascade, queue_cap = cfg.queue_cap, tick_ms = cfg.tick_ms, "agent config");

    match &cli.command {
        Commands::Demo => demo(cli.output, &cfg)?,
        Commands::Resync { file, dry_run } => resync(cli.output, &cfg, file, *dry_run).await?,
        Commands::Replay { file } => replay(cli.output, &cfg, file).await?,
        Commands::Keys { file } => {
            let items = load_items(file)?;
            match cli.output {
                Output::Human => {
                    for item in &items {
                        println!("{:<14} {}", item.kind().to_string(), item.key());
                    }
                }
                Output::Json => {
                    let keys: Vec<String> = items.iter().map(|i| i.key()).collect();
                    println!("{}", serde_json::to_string_pretty(&keys)?);
                }
            }
        }
    }
    Ok(())
}

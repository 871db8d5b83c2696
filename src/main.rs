use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use tracing_subscriber::{fmt, EnvFilter};

use counterflow::buffer::{delivery, BufferService};
use counterflow::config::{BufferEntry, Config};
use counterflow::counters::{load_definitions_file, AgentDescriptor, MetricCatalog, SampleRecord};
use counterflow::expression::{EvalCache, Evaluator};

/// Category tag of evaluated sample records in delivered batches.
const SAMPLE_CATEGORY: u32 = 1;

/// Accelerator performance-counter evaluation and buffered delivery.
#[derive(Parser)]
#[command(name = "counterflow", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load the config and metric definitions, and build an evaluator for
    /// every configured agent.
    Check,

    /// Show the hardware counters a metric needs on an agent.
    Counters {
        /// Metric name.
        metric: String,

        /// Agent name from the config.
        #[arg(long)]
        agent: String,
    },

    /// Evaluate metrics over recorded samples and deliver them through a
    /// configured buffer.
    Evaluate {
        /// Metric names.
        #[arg(required = true)]
        metrics: Vec<String>,

        /// Agent name from the config.
        #[arg(long)]
        agent: String,

        /// YAML map of hardware counter name to per-instance values.
        #[arg(long)]
        samples: PathBuf,

        /// Buffer name from the config. Default: the first buffer.
        #[arg(long)]
        buffer: Option<String>,

        /// Print buffer metrics in the Prometheus text format afterwards.
        #[arg(long)]
        print_metrics: bool,
    },

    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Command::Version = &cli.command {
        println!("counterflow {}", version::full());
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting counterflow",
    );

    let catalog = Arc::new(load_definitions_file(&cfg.metric_definitions)?);

    match cli.command {
        Command::Check => check(&cfg, &catalog),
        Command::Counters { metric, agent } => counters(&cfg, catalog, &agent, &metric),
        Command::Evaluate {
            metrics,
            agent,
            samples,
            buffer,
            print_metrics,
        } => evaluate(
            &cfg,
            catalog,
            &agent,
            &metrics,
            &samples,
            buffer.as_deref(),
            print_metrics,
        ),
        Command::Version => Ok(()),
    }
}

fn check(cfg: &Config, catalog: &Arc<MetricCatalog>) -> Result<()> {
    for arch in catalog.architectures() {
        println!(
            "{arch}: {} metrics, {} blocks",
            catalog.metrics_for_architecture(arch).count(),
            catalog.blocks_for_architecture(arch).len()
        );
    }

    for agent in &cfg.agents {
        let evaluator = evaluator_for(catalog, agent)?;
        evaluator
            .constant_samples(agent)
            .with_context(|| format!("resolving constants for agent {}", agent.name))?;
        println!("agent {} ({}): ok", agent.name, agent.architecture);
    }

    for buffer in &cfg.buffers {
        println!(
            "buffer {}: {} bytes, watermark {}, {:?}",
            buffer.name, buffer.size, buffer.watermark, buffer.policy
        );
    }
    Ok(())
}

fn counters(cfg: &Config, catalog: Arc<MetricCatalog>, agent: &str, metric: &str) -> Result<()> {
    let agent = find_agent(cfg, agent)?;
    let evaluator = evaluator_for(&catalog, agent)?;

    let target = evaluator.metric(metric)?;
    println!("{} (id {})", target.name, target.id);
    if !target.description.is_empty() {
        println!("  {}", target.description);
    }
    if target.is_derived() {
        println!("  expression: {}", target.expression);
    }

    let dims: Vec<String> = evaluator
        .dimensions(metric)?
        .iter()
        .map(|d| format!("{}={}", d.dimension, d.size))
        .collect();
    println!(
        "  dimensions: [{}] ({} instances)",
        dims.join(", "),
        evaluator.instance_count(metric)?
    );

    println!("  required counters:");
    for counter in evaluator.required_counters(metric)? {
        let source = if counter.is_constant() {
            format!("constant {}", counter.constant)
        } else {
            match counter.event {
                Some(event) => format!("{} event {event}", counter.block),
                None => counter.block.clone(),
            }
        };
        println!("    {} ({source})", counter.name);
    }

    for (counter, mode) in evaluator.accumulate_requests(metric)? {
        println!("  accumulate: {} {}", counter.name, mode.as_str());
    }
    Ok(())
}

fn evaluate(
    cfg: &Config,
    catalog: Arc<MetricCatalog>,
    agent: &str,
    metrics: &[String],
    samples: &Path,
    buffer: Option<&str>,
    print_metrics: bool,
) -> Result<()> {
    let agent = find_agent(cfg, agent)?;
    let evaluator = evaluator_for(&catalog, agent)?;

    let data = std::fs::read_to_string(samples)
        .with_context(|| format!("reading samples {}", samples.display()))?;
    let input: BTreeMap<String, Vec<f64>> = serde_yaml::from_str(&data)
        .with_context(|| format!("parsing samples {}", samples.display()))?;

    let mut base = evaluator.constant_samples(agent)?;
    for (name, values) in &input {
        let metric = evaluator.metric(name)?;
        if metric.is_derived() || metric.is_constant() {
            bail!("{name} is not a hardware counter");
        }
        let mut records = SampleRecord::from_values(metric.id, evaluator.dimensions(name)?, values)
            .with_context(|| format!("laying out samples for {name}"))?;
        for record in &mut records {
            record.agent_id = agent.agent_id;
        }
        base.insert(metric.id, records);
    }

    let entry = match buffer {
        Some(name) => cfg
            .buffer(name)
            .with_context(|| format!("unknown buffer {name}"))?
            .clone(),
        None => cfg.buffers.first().cloned().unwrap_or_else(|| BufferEntry {
            name: "default".to_string(),
            size: 1024 * 1024,
            watermark: 0,
            policy: Default::default(),
        }),
    };

    let delivered = Arc::new(Mutex::new(Vec::new()));
    let service = BufferService::new(cfg.flush.service_options())?;
    let buffer_id = service.allocate();
    {
        let sink = Arc::clone(&delivered);
        service.configure(
            buffer_id,
            entry.buffer_config(agent.agent_id),
            delivery(move |batch| {
                sink.lock().extend(
                    batch
                        .records
                        .iter()
                        .filter_map(|r| r.payload::<SampleRecord>().map(|s| (r.kind(), *s))),
                );
            }),
        )?;
    }

    let mut cache = EvalCache::new();
    for name in metrics {
        let metric_id = evaluator.metric(name)?.id;
        cache.clear();
        let records = evaluator.evaluate_with_cache(name, &base, &mut cache)?;
        for record in records {
            service.emplace(buffer_id, SAMPLE_CATEGORY, metric_id as u32, *record)?;
        }
    }

    let drops = service.drop_count(buffer_id)?;
    service.destroy(buffer_id)?;

    for (kind, record) in delivered.lock().iter() {
        let name = catalog
            .by_id(u64::from(*kind))
            .map_or("?", |m| m.name.as_str());
        println!("{name:<32} {} {}", record.id, record.value);
    }
    if drops > 0 {
        println!("dropped {drops} records");
    }

    if print_metrics {
        print!("{}", service.metrics().render()?);
    }
    Ok(())
}

fn find_agent<'a>(cfg: &'a Config, name: &str) -> Result<&'a AgentDescriptor> {
    cfg.agent(name)
        .with_context(|| format!("unknown agent {name}"))
}

fn evaluator_for(catalog: &Arc<MetricCatalog>, agent: &AgentDescriptor) -> Result<Evaluator> {
    Evaluator::new(Arc::clone(catalog), &agent.architecture)
        .with_context(|| format!("building evaluator for agent {}", agent.name))
}

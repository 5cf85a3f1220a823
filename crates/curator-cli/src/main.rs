//! curator: run preservation pipelines on a local in-memory node.

mod node;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info};

use curator_core::CuratorConfig;
use curator_core::domain::{Institution, Stage, Status, Topic};
use curator_core::impls::pack_bag;
use curator_core::logging;
use curator_core::ports::Clock;
use curator_core::producer::bucket_reader::BucketReaderConfig;
use curator_core::producer::{BucketReader, Producer};

use crate::node::{LocalNode, POLL_INTERVAL};

#[derive(Debug, Parser)]
#[command(name = "curator", version, about = "Staged preservation pipelines")]
struct Cli {
    /// TOML configuration file; defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the effective configuration as JSON.
    Config,
    /// Serve pipelines until interrupted.
    Run {
        /// Pipelines to start; all of them when omitted.
        #[arg(value_enum)]
        pipelines: Vec<PipelineArg>,
    },
    /// Ingest one generated bag through fetch, store and record.
    Demo {
        #[arg(long, default_value = "example.edu")]
        institution: String,
        #[arg(long, default_value = "photos")]
        bag: String,
        /// Give up after this many seconds.
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PipelineArg {
    Fetch,
    Store,
    Record,
    Fixity,
    FileDelete,
    ColdRestore,
    Restore,
    Replication,
}

impl From<PipelineArg> for Topic {
    fn from(arg: PipelineArg) -> Self {
        match arg {
            PipelineArg::Fetch => Topic::Fetch,
            PipelineArg::Store => Topic::Store,
            PipelineArg::Record => Topic::Record,
            PipelineArg::Fixity => Topic::Fixity,
            PipelineArg::FileDelete => Topic::FileDelete,
            PipelineArg::ColdRestore => Topic::ColdRestore,
            PipelineArg::Restore => Topic::Restore,
            PipelineArg::Replication => Topic::Replication,
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<CuratorConfig> {
    let config = match path {
        Some(path) => CuratorConfig::load_from_file(path)?,
        None => {
            let config = CuratorConfig::default();
            config.validate()?;
            config
        }
    };
    Ok(config)
}

async fn serve(config: CuratorConfig, pipelines: Vec<PipelineArg>) -> anyhow::Result<()> {
    let topics: Vec<Topic> = if pipelines.is_empty() {
        Topic::ALL.to_vec()
    } else {
        pipelines.into_iter().map(Topic::from).collect()
    };
    let node = LocalNode::new(config)?;
    let running = topics.into_iter().map(|topic| node.start(topic)).collect();

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    LocalNode::stop_all(running).await;
    Ok(())
}

async fn demo(config: CuratorConfig, institution: &str, bag: &str, timeout: u64) -> anyhow::Result<()> {
    let node = LocalNode::new(config)?;
    let bucket = format!("receiving.{institution}");
    node.registry.add_institution(Institution::new(institution)).await;

    let tar = pack_bag(
        bag,
        &[
            ("data/readme.txt".to_string(), b"generated by curator demo\n".to_vec()),
            ("data/image.bin".to_string(), vec![7u8; 4096]),
        ],
    )?;
    node.storage
        .insert(&bucket, &format!("{bag}.tar"), &tar, node.services.clock.now());

    let mut reader = BucketReader::new(
        node.services.registry.clone(),
        node.services.broker.clone(),
        node.services.storage.clone(),
        node.services.ids.clone(),
        node.services.clock.clone(),
        BucketReaderConfig {
            buckets: vec![bucket.clone()],
            cache_hours: node.config.cache_hours,
            max_file_size: node.config.max_file_size,
            collect_stats: node.config.collect_stats,
        },
    );
    let report = reader.run().await?;
    if report.queued != 1 {
        bail!("expected one queued bag, producer reported {report:?}");
    }

    let running: Vec<_> = [Topic::Fetch, Topic::Store, Topic::Record]
        .into_iter()
        .map(|topic| node.start(topic))
        .collect();

    let finished = tokio::time::timeout(Duration::from_secs(timeout), async {
        loop {
            let items = node.registry.work_items().await;
            if let Some(item) = items.into_iter().find(|i| i.is_terminal()) {
                return item;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    })
    .await;
    LocalNode::stop_all(running).await;

    let item = finished.map_err(|_| anyhow::anyhow!("bag was not ingested within {timeout}s"))?;
    println!("{}", serde_json::to_string_pretty(&item)?);
    if item.status != Status::Success || item.stage != Stage::Cleanup {
        bail!("ingest ended as {:?} at {}: {}", item.status, item.stage, item.note);
    }
    let primary = &node.config.preservation.primary_bucket;
    println!("stored {} file(s) in {primary}", node.storage.keys(primary).len());
    Ok(())
}

async fn execute(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_ref())?;
    logging::init(&config.log)?;

    match cli.command {
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Run { pipelines } => serve(config, pipelines).await,
        Command::Demo {
            institution,
            bag,
            timeout,
        } => demo(config, &institution, &bag, timeout).await,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = execute(cli).await {
        error!(error = %err, "command failed");
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

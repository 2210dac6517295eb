use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info};

use judge_engine::jobs::events::JudgeEvent;
use judge_engine::{Engine, EngineConfig, WorkerJob};

/// Run one judge job and stream its events as JSON lines
#[derive(Debug, Parser)]
#[command(name = "judge-engine", version, about)]
struct Cli {
    /// Job file (JSON); stdin when omitted
    job_file: Option<PathBuf>,

    /// Language table replacing the built-in one
    #[arg(long, env = "JUDGE_LANGUAGES_CONFIG")]
    languages: Option<PathBuf>,

    /// Test cases run at the same time
    #[arg(long, env = "JUDGE_MAX_PARALLEL")]
    max_parallel: Option<usize>,

    /// Parent directory for per-job scratch space
    #[arg(long, env = "JUDGE_SCRATCH_ROOT")]
    scratch_root: Option<PathBuf>,
}

fn read_job(path: Option<&PathBuf>) -> Result<WorkerJob> {
    let content = match path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read job file {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read job from stdin")?;
            buf
        }
    };
    serde_json::from_str(&content).context("Failed to parse job")
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("judge_engine=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let mut config = EngineConfig::from_env()?;
    if let Some(path) = cli.languages {
        config.languages_config = Some(path);
    }
    if let Some(n) = cli.max_parallel {
        config.max_parallel = n.max(1);
    }
    if let Some(root) = cli.scratch_root {
        config.evaluator_cache_dir = root.join("evaluators");
        config.scratch_root = root;
    }

    let engine = Arc::new(Engine::from_config(config).context("Failed to initialize engine")?);
    let job = read_job(cli.job_file.as_ref())?;

    // events go out through one printer task so lines never interleave
    let (tx, mut rx) = mpsc::unbounded_channel::<JudgeEvent>();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => error!("Failed to serialize event: {}", e),
            }
        }
    });

    let result = engine.run_job(job, &tx).await;
    drop(tx);
    printer.await.context("Event printer failed")?;

    let output = result.context("Job failed")?;
    println!("{}", serde_json::to_string(&output)?);
    info!("Job complete");

    Ok(())
}

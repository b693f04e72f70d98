use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};

use episode_pipeline::config::{Config, LinkMode};
use episode_pipeline::logging;
use episode_pipeline::pipeline::steps::{
    AlignTransformStep, DiscoverStep, MaterializeStep, StatsStep, ValidateStep,
};
use episode_pipeline::pipeline::{Pipeline, PipelineStep, StepContext, StepResult};

#[derive(Parser)]
#[command(name = "episode_pipeline")]
#[command(about = "Robot demonstration dataset pipeline")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct CommonArgs {
    /// TOML config file (defaults apply when omitted)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Raw dataset root
    #[arg(long, global = true)]
    raw_root: Option<PathBuf>,

    /// Work root for all stage artifacts
    #[arg(long, global = true)]
    work_root: Option<PathBuf>,

    /// Worker threads for per-episode work
    #[arg(long, global = true)]
    workers: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan the raw tree and update the episode manifest
    Discover {
        /// Comma-separated chunk ids to rescan (others keep their prior entries)
        #[arg(long, value_delimiter = ',')]
        only_chunks: Vec<String>,
    },
    /// Run the validation battery over the manifest
    Validate {
        /// Skip video fps / frame count checks
        #[arg(long)]
        skip_video: bool,
    },
    /// Reduce per-episode stats of validated episodes
    Stats,
    /// Clean, reindex and normalize validated episodes
    AlignTransform {
        /// Write cleaned episodes without z-scoring
        #[arg(long)]
        no_normalize: bool,
    },
    /// Assign splits and write the final dataset
    Materialize {
        /// symlink, copy, hardlink or manifest-only
        #[arg(long)]
        link_videos: Option<LinkMode>,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Run every stage in order
    Run {
        #[arg(long)]
        skip_video: bool,
        #[arg(long)]
        link_videos: Option<LinkMode>,
    },
}

fn load_config(args: &CommonArgs) -> anyhow::Result<Config> {
    let config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => Config::default(),
    };
    let mut config = config.apply_env()?;
    if let Some(root) = &args.raw_root {
        config.paths.raw_root = root.clone();
    }
    if let Some(root) = &args.work_root {
        config.paths.work_root = root.clone();
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    Ok(config)
}

fn print_result(result: &StepResult) {
    println!("\n📊 {} results:", result.step);
    println!("   Processed: {}", result.processed);
    println!("   Excluded: {}", result.excluded);
    println!("   Flagged: {}", result.flagged);
    if !result.reasons.is_empty() {
        println!("   Reasons:");
        for (reason, count) in &result.reasons {
            println!("     - {}: {}", reason, count);
        }
    }
    println!("   {}", result.message);
}

fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let mut config = load_config(&cli.common)?;
    logging::init_logging(&config.paths.log_dir);

    let steps: Vec<Box<dyn PipelineStep>> = match cli.command {
        Commands::Discover { only_chunks } => {
            if !only_chunks.is_empty() {
                config.discover.only_chunks = only_chunks;
            }
            vec![Box::new(DiscoverStep)]
        }
        Commands::Validate { skip_video } => {
            config.validate.skip_video |= skip_video;
            vec![Box::new(ValidateStep)]
        }
        Commands::Stats => vec![Box::new(StatsStep)],
        Commands::AlignTransform { no_normalize } => {
            if no_normalize {
                config.transform.normalize = false;
            }
            vec![Box::new(AlignTransformStep)]
        }
        Commands::Materialize { link_videos, seed } => {
            if let Some(mode) = link_videos {
                config.materialize.link_videos = mode;
            }
            if let Some(seed) = seed {
                config.materialize.seed = seed;
            }
            vec![Box::new(MaterializeStep)]
        }
        Commands::Run {
            skip_video,
            link_videos,
        } => {
            println!("🚀 Running full pipeline...");
            config.validate.skip_video |= skip_video;
            if let Some(mode) = link_videos {
                config.materialize.link_videos = mode;
            }
            return run(Pipeline::full(), config);
        }
    };
    run(Pipeline::new(steps), config)
}

fn run(pipeline: Pipeline, config: Config) -> anyhow::Result<()> {
    config.validate()?;
    info!(
        "Raw root {}, work root {}",
        config.paths.raw_root.display(),
        config.paths.work_root.display()
    );
    let ctx = StepContext::new(config);

    match pipeline.run(&ctx) {
        Ok(results) => {
            for result in &results {
                print_result(result);
            }
            println!("\n✅ Done");
            Ok(())
        }
        Err(e) => {
            error!("Pipeline failed: {}", e);
            println!("❌ Pipeline failed: {}", e);
            Err(e.into())
        }
    }
}

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use uuid::Uuid;

use ccsi_harness::cache::{ReplyCache, SqliteReplyCache};
use ccsi_harness::catalog::EraId;
use ccsi_harness::config::EngineConfig;
use ccsi_harness::dataset::Dataset;
use ccsi_harness::gateway::{build_gateway, TracingUsageSink};
use ccsi_harness::interpolate::interpolate_baseline;
use ccsi_harness::logging::{init_logging, DEFAULT_LOG_PATH};
use ccsi_harness::repair::{GenerationPlan, RowRepairEngine};

#[derive(Parser)]
#[command(name = "ccsi", version, about = "CCSI dataset harness")]
struct Cli {
    /// TOML engine configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Append-only run log
    #[arg(long, global = true, default_value = DEFAULT_LOG_PATH)]
    log: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Re-score failed or empty rows through the oracle, interpolating on failure
    Repair {
        #[arg(long)]
        input: PathBuf,
        /// Defaults to overwriting the input
        #[arg(long)]
        output: Option<PathBuf>,
        /// Reply cache database (overrides the config file)
        #[arg(long, conflicts_with = "offline")]
        cache: Option<PathBuf>,
        /// Skip the oracle and write interpolated baselines; needs no credential
        #[arg(long)]
        offline: bool,
    },
    /// Fill in grid cells missing from the dataset, saving after every row
    Generate {
        #[arg(long, value_enum)]
        plan: CliPlan,
        /// Existing dataset; created when absent
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long)]
        cache: Option<PathBuf>,
    },
    /// Recompute dimension and index totals
    Totals {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
        /// Only report rows whose stored totals are stale; fail if any
        #[arg(long)]
        check: bool,
    },
    /// Write the working dataset (no future-scenario eras)
    Working {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },
    /// Convert between CSV and JSON Lines (by file extension)
    Convert {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },
    /// Print the interpolated baseline for one cell as JSON
    Baseline {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        era: String,
        #[arg(long)]
        region: String,
    },
    /// Export the reply cache to JSONL
    CacheExport {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        out: PathBuf,
    },
    /// Prune the reply cache (by age and/or size)
    CachePrune {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        max_age_days: Option<u64>,
        #[arg(long)]
        max_rows: Option<usize>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum CliPlan {
    Historical,
    Modern,
}

impl From<CliPlan> for GenerationPlan {
    fn from(value: CliPlan) -> Self {
        match value {
            CliPlan::Historical => GenerationPlan::Historical,
            CliPlan::Modern => GenerationPlan::Modern,
        }
    }
}

fn open_cache(
    flag: Option<PathBuf>,
    config: &EngineConfig,
) -> Result<Option<Arc<dyn ReplyCache>>, Box<dyn std::error::Error>> {
    match flag.or_else(|| config.cache_path.clone()) {
        Some(path) => {
            info!(path = %path.display(), "using reply cache");
            let cache: Arc<dyn ReplyCache> = Arc::new(SqliteReplyCache::new(path)?);
            Ok(Some(cache))
        }
        None => Ok(None),
    }
}

fn build_engine(
    config: &EngineConfig,
    cache: Option<Arc<dyn ReplyCache>>,
) -> Result<(RowRepairEngine, Arc<TracingUsageSink>), Box<dyn std::error::Error>> {
    let run_id = Uuid::new_v4();
    info!(%run_id, provider = %config.provider, model = %config.model, "starting run");
    let gateway = build_gateway(config)?.with_run(run_id);
    let usage = gateway.usage_sink().clone();
    let engine = RowRepairEngine::new(Arc::new(gateway), config).with_run(run_id);
    let engine = match cache {
        Some(cache) => engine.with_cache(cache),
        None => engine,
    };
    Ok((engine, usage))
}

fn log_usage(usage: &TracingUsageSink) {
    let totals = usage.totals();
    info!(
        calls = totals.calls,
        failed = totals.failed_calls,
        input_tokens = totals.input_tokens,
        output_tokens = totals.output_tokens,
        "oracle usage"
    );
}

fn output_or_input<'a>(output: &'a Option<PathBuf>, input: &'a Path) -> &'a Path {
    output.as_deref().unwrap_or(input)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(Some(cli.log.as_path()))?;
    let config = EngineConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Repair {
            input,
            output,
            cache,
            offline,
        } => {
            let mut dataset = Dataset::load(&input)?;
            let report = if offline {
                let run_id = Uuid::new_v4();
                info!(%run_id, "starting offline repair");
                RowRepairEngine::offline(&config)
                    .with_run(run_id)
                    .repair_all(&mut dataset)
                    .await
            } else {
                let (engine, usage) = build_engine(&config, open_cache(cache, &config)?)?;
                let report = engine.repair_all(&mut dataset).await;
                log_usage(&usage);
                report
            };
            dataset.save(output_or_input(&output, &input))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Generate {
            plan,
            input,
            output,
            cache,
        } => {
            let mut dataset = Dataset::load_or_default(&input)?;
            let target = output_or_input(&output, &input).to_path_buf();
            let (engine, usage) = build_engine(&config, open_cache(cache, &config)?)?;
            let report = engine
                .generate_missing(&mut dataset, plan.into(), |d| d.save(&target))
                .await?;
            dataset.save(&target)?;
            log_usage(&usage);
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Totals {
            input,
            output,
            check,
        } => {
            let mut dataset = Dataset::load(&input)?;
            if check {
                let stale = dataset.inconsistent_totals();
                for key in &stale {
                    println!("{key}");
                }
                if !stale.is_empty() {
                    return Err(format!("{} rows have stale totals", stale.len()).into());
                }
                println!("all {} rows consistent", dataset.len());
            } else {
                let changed = dataset.recompute_totals();
                dataset.save(output_or_input(&output, &input))?;
                println!("recomputed totals; {changed} rows changed");
            }
        }
        Commands::Working { input, output } => {
            let dataset = Dataset::load(&input)?;
            let working = dataset.without_future_eras();
            working.save(&output)?;
            let counts = working.series_counts();
            println!(
                "{} rows ({} historical, {} modern); dropped {} future-scenario rows",
                counts.total(),
                counts.historical,
                counts.modern,
                dataset.len() - working.len()
            );
        }
        Commands::Convert { input, output } => {
            let dataset = Dataset::load(&input)?;
            dataset.save(&output)?;
            println!("wrote {} rows to {}", dataset.len(), output.display());
        }
        Commands::Baseline { input, era, region } => {
            let dataset = Dataset::load(&input)?;
            let era: EraId = era.parse()?;
            let baseline = interpolate_baseline(&dataset, &era, &region);
            println!("{}", serde_json::to_string_pretty(&baseline)?);
        }
        Commands::CacheExport { db, out } => {
            let path = db
                .or_else(|| config.cache_path.clone())
                .unwrap_or_else(SqliteReplyCache::default_path);
            let cache = SqliteReplyCache::new(path)?;
            let rows = cache.export_jsonl(&out).await?;
            println!("exported {rows} replies to {}", out.display());
        }
        Commands::CachePrune {
            db,
            max_age_days,
            max_rows,
        } => {
            if max_age_days.is_none() && max_rows.is_none() {
                return Err("cache-prune requires --max-age-days and/or --max-rows".into());
            }
            if matches!(max_rows, Some(0)) {
                return Err("--max-rows must be >= 1".into());
            }
            let path = db
                .or_else(|| config.cache_path.clone())
                .unwrap_or_else(SqliteReplyCache::default_path);
            let cache = SqliteReplyCache::new(path)?;
            let _lock = cache.lock_exclusive()?;
            let stats = cache.prune(max_age_days, max_rows).await?;
            println!(
                "pruned {} rows; {} rows remain",
                stats.deleted, stats.remaining
            );
        }
    }

    Ok(())
}

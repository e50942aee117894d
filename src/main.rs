use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use mgscreen::cluster::{select_clusters_with, DistanceMatrix};
use mgscreen::config::{Config, RunConfig};
use mgscreen::core::{GraphBuilder, SampleRegistry, TaskGraph};
use mgscreen::orchestration::{RunReport, Scheduler, SchedulerEvent};
use mgscreen::pipeline::{preflight, screening_templates, REPORT_JSON};
use mgscreen::stage::stage_directory;
use mgscreen::{mlog, mlog_error, mlog_warn, Error, Result};

/// Staged sample map written under the output root when `-i` is a directory.
const STAGED_MAP: &str = "data.json";

/// mgscreen - metagenomic sample screening pipeline
#[derive(Parser, Debug)]
#[command(name = "mgscreen")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    MGSCREEN_DEBUG=1     Enable debug logging (alternative to --debug)"
)]
pub struct Cli {
    /// Enable debug logging (writes to <output>/.mgscreen/mgscreen.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Config file (default: ~/.mgscreen/mgscreen.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Stage (if needed), build the task graph and run it
    Run {
        /// Sample map JSON, or a directory of FASTQ files to stage
        #[arg(short = 'i', long)]
        input: PathBuf,

        /// Output root
        #[arg(short = 'o', long)]
        output: PathBuf,

        /// Subsampling depth; also the staging threshold unless min_reads is set
        #[arg(short = 'r', long)]
        reads: Option<u64>,

        /// k-mer size for redundancy estimation and sketching
        #[arg(short = 'k', long)]
        kmer: Option<u32>,

        /// Seed for subsampling and cluster selection
        #[arg(short = 's', long)]
        seed: Option<u64>,

        /// Completeness target (percent) for the redundancy projection
        #[arg(short = 'c', long)]
        completeness: Option<u32>,

        /// Tasks allowed to run at once
        #[arg(short = 't', long)]
        workers: Option<usize>,

        /// Print the tasks that would run and exit
        #[arg(long)]
        dry_run: bool,

        /// Write the run report as JSON
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Print the task graph in dependency order without running anything
    Plan {
        #[arg(short = 'i', long)]
        input: PathBuf,

        #[arg(short = 'o', long)]
        output: PathBuf,
    },

    /// Discover FASTQ files in a directory and write a grouped sample map
    Stage {
        /// Directory to search recursively
        #[arg(short = 'i', long)]
        input: PathBuf,

        /// Sample map to write
        #[arg(short = 'o', long)]
        output: PathBuf,

        /// Minimum reads for a sample to be screened
        #[arg(short = 'r', long)]
        min_reads: Option<u64>,

        /// Count only forward files and assume reverse files match
        #[arg(long)]
        approximate_reverse: bool,

        /// Files counted at once
        #[arg(short = 't', long)]
        workers: Option<usize>,
    },

    /// Choose a cluster count from a distance matrix
    Cluster {
        /// Square TSV or `mash dist` output
        #[arg(short = 'i', long)]
        input: PathBuf,

        /// Output prefix for the silhouette, assignment and medoid tables
        #[arg(short = 'o', long)]
        output: PathBuf,

        #[arg(long)]
        k_min: Option<usize>,

        #[arg(long)]
        k_max: Option<usize>,

        #[arg(long)]
        seed: Option<u64>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match dispatch(cli) {
        Ok(code) => code,
        Err(e) => {
            mlog_error!("{}", e);
            if e.is_build_error() {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn dispatch(cli: Cli) -> Result<ExitCode> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Command::Run {
            input,
            output,
            reads,
            kmer,
            seed,
            completeness,
            workers,
            dry_run,
            report,
        } => {
            config.reads = reads.unwrap_or(config.reads);
            config.kmer = kmer.unwrap_or(config.kmer);
            config.seed = seed.or(config.seed);
            config.completeness = completeness.unwrap_or(config.completeness);
            config.workers = workers.unwrap_or(config.workers);
            config.validate()?;
            run_pipeline(&input, &output, config, cli.debug, dry_run, report.as_deref())
        }
        Command::Plan { input, output } => run_plan(&input, &output, config, cli.debug),
        Command::Stage {
            input,
            output,
            min_reads,
            approximate_reverse,
            workers,
        } => {
            config.min_reads = min_reads.or(config.min_reads);
            config.approximate_reverse_reads |= approximate_reverse;
            config.workers = workers.unwrap_or(config.workers);
            config.validate()?;
            run_stage(&input, &output, &config, cli.debug)
        }
        Command::Cluster {
            input,
            output,
            k_min,
            k_max,
            seed,
        } => {
            config.k_min = k_min.unwrap_or(config.k_min);
            config.k_max = k_max.unwrap_or(config.k_max);
            config.seed = seed.or(config.seed);
            config.validate()?;
            run_cluster(&input, &output, &config, cli.debug)
        }
    }
}

/// Create the output root and return it as an absolute path.
fn prepare_output_root(output: &Path, debug: bool) -> Result<PathBuf> {
    std::fs::create_dir_all(output)?;
    let root = std::path::absolute(output)?;
    mgscreen::log::init(&root, debug);
    Ok(root)
}

/// Resolve `-i` to a sample map, staging a directory on first use.
async fn resolve_sample_map(input: &Path, root: &Path, config: &Config) -> Result<PathBuf> {
    if !input.is_dir() {
        return Ok(std::path::absolute(input)?);
    }
    let map = root.join(STAGED_MAP);
    if map.exists() {
        mlog!("Reusing staged sample map {}", map.display());
        return Ok(map);
    }
    let staged = stage_directory(
        input,
        config.effective_min_reads(),
        config.read_count_mode(),
        config.workers,
    )
    .await?;
    staged.write(&map)?;
    Ok(map)
}

fn load_samples(map: &Path) -> Result<SampleRegistry> {
    let base = map.parent().unwrap_or_else(|| Path::new("."));
    let samples = SampleRegistry::load(map)?.absolutize(base);
    if samples.is_empty() {
        mlog_warn!("Sample map {} has no samples to screen", map.display());
    }
    if let Some(summary) = samples.threshold_summary() {
        mlog!("{}", summary.message);
    }
    Ok(samples)
}

fn build_graph(run: &RunConfig, samples: &SampleRegistry) -> Result<TaskGraph> {
    let templates = screening_templates(run, samples);
    GraphBuilder::new(&run.output_root).build(&templates, samples)
}

fn run_pipeline(
    input: &Path,
    output: &Path,
    config: Config,
    debug: bool,
    dry_run: bool,
    report_path: Option<&Path>,
) -> Result<ExitCode> {
    let root = prepare_output_root(output, debug)?;
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        let map = resolve_sample_map(input, &root, &config).await?;
        let workers = config.workers;
        let run = RunConfig::new(map, root.clone(), config);
        mlog!(
            "mgscreen run: map={} output={} seed={} workers={}",
            run.sample_map.display(),
            root.display(),
            run.seed,
            workers
        );

        let samples = load_samples(&run.sample_map)?;
        let graph = build_graph(&run, &samples)?;

        let cancel = CancellationToken::new();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let mut scheduler = Scheduler::new(graph, &root, workers)
            .with_events(event_tx)
            .with_cancellation(cancel.clone());

        if dry_run {
            let planned = scheduler.planned();
            for id in &planned {
                println!("{}", id);
            }
            println!(
                "{} of {} tasks would run",
                planned.len(),
                scheduler.graph().task_count()
            );
            return Ok(ExitCode::SUCCESS);
        }

        preflight(scheduler.graph())?;

        let interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                mlog_warn!("Interrupted; cancelling running tasks");
                interrupt.cancel();
            }
        });
        let printer = tokio::spawn(print_events(event_rx));

        let report = scheduler.run().await?;
        drop(scheduler);
        let _ = printer.await;

        finish(&report, &root, report_path)
    })
}

/// Progress lines for the terminal; the log file gets the detail.
async fn print_events(mut rx: mpsc::UnboundedReceiver<SchedulerEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            SchedulerEvent::TaskStarted {
                task_id,
                attempt,
                resources,
            } if attempt > 1 => println!("[retry {}] {} ({})", attempt, task_id, resources),
            SchedulerEvent::TaskStarted { task_id, .. } => println!("[start] {}", task_id),
            SchedulerEvent::TaskSucceeded { task_id } => println!("[done]  {}", task_id),
            SchedulerEvent::TaskFailed { task_id, .. } => println!("[fail]  {}", task_id),
            SchedulerEvent::TaskPoisoned { task_id, ancestor } => {
                println!("[skip]  {} ({} failed)", task_id, ancestor)
            }
            SchedulerEvent::AllTasksComplete => break,
            _ => {}
        }
    }
}

fn finish(report: &RunReport, root: &Path, report_path: Option<&Path>) -> Result<ExitCode> {
    if let Some(path) = report_path {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(report)?)?;
    }

    println!();
    println!("{}", report.summary());
    if report.is_success() {
        println!("Report: {}", root.join(REPORT_JSON).display());
        Ok(ExitCode::SUCCESS)
    } else {
        for poisoned in &report.poisoned {
            println!("  {} skipped ({} failed)", poisoned.task, poisoned.ancestor);
        }
        Ok(ExitCode::FAILURE)
    }
}

fn run_plan(input: &Path, output: &Path, config: Config, debug: bool) -> Result<ExitCode> {
    let root = prepare_output_root(output, debug)?;
    if input.is_dir() && !root.join(STAGED_MAP).exists() {
        return Err(Error::Validation(format!(
            "{} is a directory; stage it first with `mgscreen stage` or `mgscreen run`",
            input.display()
        )));
    }
    let map = if input.is_dir() {
        root.join(STAGED_MAP)
    } else {
        std::path::absolute(input)?
    };

    let run = RunConfig::new(map, root.clone(), config);
    let samples = load_samples(&run.sample_map)?;
    let scheduler = Scheduler::new(build_graph(&run, &samples)?, &root, run.config.workers);
    let planned = scheduler.planned();

    for task in scheduler.graph().topological_order() {
        let state = if planned.contains(&task.id) {
            "will run"
        } else {
            "up to date"
        };
        println!("{:<40} {}", task.id.to_string(), state);
    }
    println!(
        "{} tasks, {} to run",
        scheduler.graph().task_count(),
        planned.len()
    );
    Ok(ExitCode::SUCCESS)
}

fn run_stage(input: &Path, output: &Path, config: &Config, debug: bool) -> Result<ExitCode> {
    let output = std::path::absolute(output)?;
    let log_root = output.parent().unwrap_or_else(|| Path::new("."));
    mgscreen::log::init(log_root, debug);

    let rt = tokio::runtime::Runtime::new()?;
    let staged = rt.block_on(stage_directory(
        input,
        config.effective_min_reads(),
        config.read_count_mode(),
        config.workers,
    ))?;
    staged.write(&output)?;

    println!(
        "{} samples: {} with >= {} reads, {} below",
        staged.len(),
        staged.above.len(),
        staged.min_reads,
        staged.below.len()
    );
    println!("Wrote {}", output.display());
    Ok(ExitCode::SUCCESS)
}

fn run_cluster(input: &Path, prefix: &Path, config: &Config, debug: bool) -> Result<ExitCode> {
    let prefix = std::path::absolute(prefix)?;
    let log_root = prefix.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(log_root)?;
    mgscreen::log::init(log_root, debug);

    let seed = config.seed.unwrap_or_else(rand::random);
    let matrix = DistanceMatrix::from_tsv(input)?;
    let result = select_clusters_with(&matrix, &config.cluster_options(), seed)?;
    result.write_tables(&prefix)?;

    let mut json = prefix.clone().into_os_string();
    json.push("_clusters.json");
    std::fs::write(PathBuf::from(json), serde_json::to_string_pretty(&result)?)?;

    println!(
        "Selected k={} (silhouette {:.4}, seed {})",
        result.k,
        result.silhouette(),
        seed
    );
    for (label, members) in result.members() {
        println!("  cluster {}: {}", label, members.join(", "));
    }
    Ok(ExitCode::SUCCESS)
}

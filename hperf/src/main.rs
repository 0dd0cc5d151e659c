mod analyze;
mod collect;
mod config;
mod error;
mod list;
mod pipeline;
mod report;
mod templates;
mod topology;
mod workdir;

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hperf_pmu::ArchitectureProfile;
use hperf_sut::{Executor, LocalExecutor, RemoteExecutor, RemoteTarget};
use tracing::info_span;
use tracing_subscriber::{fmt, EnvFilter};

use crate::analyze::{AnalysisResult, Analyzer};
use crate::collect::SanityReport;
use crate::config::{CpuSelection, RunConfig, RunInfo};
use crate::pipeline::RunRequest;

/// Hardware counter and OS utilization profiler.
#[derive(Parser)]
#[command(name = "hperf", about, version)]
struct Cli {
    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Shorthand for `--log-level debug`.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sample a workload on the local host or a remote SUT.
    Collect {
        /// CPUs to aggregate over, e.g. `0,2,4-7`, or `all`.
        #[arg(short, long, default_value = "all")]
        cpu: CpuSelection,
        /// Seconds the OS utilization sampler runs for.
        #[arg(short, long, default_value_t = 10)]
        time: u64,
        /// Hardware sampling interval in milliseconds.
        #[arg(long, default_value_t = 1000)]
        interval: u64,
        #[arg(long, default_value = "/tmp/hperf")]
        tmp_dir: PathBuf,
        /// Remote SUT reachable over ssh.
        #[arg(long)]
        host: Option<String>,
        #[arg(long, requires = "host")]
        user: Option<String>,
        #[arg(long, default_value_t = 22)]
        port: u16,
        #[arg(long, requires = "host")]
        identity: Option<PathBuf>,
        #[arg(long, default_value = "/tmp/hperf")]
        remote_tmp_dir: PathBuf,
        /// Continue without asking when the sanity check finds problems.
        #[arg(short = 'y', long)]
        yes: bool,
        /// Only sample; run `analyze` later.
        #[arg(long)]
        no_analyze: bool,
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Aggregate an existing test directory again.
    Analyze {
        #[arg(long)]
        test_dir: PathBuf,
        /// Overrides the CPU selection recorded for the run.
        #[arg(short, long)]
        cpu: Option<CpuSelection>,
    },
    /// List compiled-in architecture profiles.
    List {
        /// Show events, groups and metrics of one profile.
        arch: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { cli.log_level.as_str() };
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Commands::Collect {
            cpu,
            time,
            interval,
            tmp_dir,
            host,
            user,
            port,
            identity,
            remote_tmp_dir,
            yes,
            no_analyze,
            command,
        } => {
            let config = RunConfig {
                command: command.join(" "),
                duration: time,
                interval_ms: interval,
                cpus: cpu,
                tmp_dir,
            };
            let target = host.map(|host| RemoteTarget {
                host,
                user,
                port,
                identity,
            });

            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("building tokio runtime")?;
            rt.block_on(do_collect(config, target, remote_tmp_dir, yes, !no_analyze))
        }
        Commands::Analyze { test_dir, cpu } => do_analyze(&test_dir, cpu),
        Commands::List { arch } => {
            match arch {
                Some(id) => {
                    let profile = ArchitectureProfile::load(&id)
                        .with_context(|| format!("loading profile '{id}'"))?;
                    println!("{}", list::describe(&profile));
                }
                None => println!("{}", list::architectures_table()),
            }
            Ok(())
        }
    }
}

async fn do_collect(
    mut config: RunConfig,
    target: Option<RemoteTarget>,
    remote_tmp_dir: PathBuf,
    assume_yes: bool,
    analyze: bool,
) -> Result<()> {
    config.tmp_dir = workdir::resolve_tmp_dir(&config.tmp_dir)?;
    let (test_id, test_dir) = workdir::create_test_dir(&config.tmp_dir)?;
    tracing::info!(test_id, dir = %test_dir.display(), "created test directory");

    let remote_host = target.as_ref().map(|t| t.host.clone());
    let executor: Arc<dyn Executor> = match target {
        Some(target) => {
            let host = target.host.clone();
            let remote = RemoteExecutor::connect(
                target,
                remote_tmp_dir.join(&test_id),
                &test_dir,
                info_span!("remote", host),
            )
            .with_context(|| format!("connecting to {host}"))?;
            Arc::new(remote)
        }
        None => Arc::new(LocalExecutor::new(&test_dir, info_span!("local"))),
    };

    let request = RunRequest {
        test_id,
        config,
        remote_host,
        analyze,
    };
    let confirm = |report: &SanityReport| confirm_findings(report, assume_yes);

    let outcome = match pipeline::run(executor, request, confirm, info_span!("run")).await {
        Ok(outcome) => outcome,
        Err(err) if !err.is_fatal() => {
            eprintln!("Raw results, if any, are kept in {}", test_dir.display());
            return Err(err.into());
        }
        Err(err) => return Err(err.into()),
    };

    println!("Test {} finished", outcome.info.test_id);
    match outcome.analysis {
        Some(result) => print_summary(&outcome.test_dir, &result),
        None => println!(
            "Raw results saved to {}; run `hperf analyze --test-dir {}` to aggregate them",
            outcome.test_dir.display(),
            outcome.test_dir.display()
        ),
    }
    Ok(())
}

fn do_analyze(test_dir: &Path, cpu: Option<CpuSelection>) -> Result<()> {
    analyze::verify_test_dir(test_dir)?;
    let info = RunInfo::load(test_dir)
        .with_context(|| format!("reading run metadata from {}", test_dir.display()))?;
    let profile = ArchitectureProfile::load(&info.arch_id)
        .with_context(|| format!("loading profile '{}'", info.arch_id))?;
    let selection = cpu.unwrap_or(info.config.cpus);

    let analyzer = Analyzer::new(test_dir, &profile, info_span!("analyze", test = info.test_id))?;
    let result = analyzer.analyze(&selection)?;
    report::save_all(test_dir, &result)?;

    print_summary(test_dir, &result);
    Ok(())
}

fn print_summary(test_dir: &Path, result: &AnalysisResult) {
    if let Some(started_at) = result.started_at {
        let start = chrono::DateTime::from_timestamp(started_at.trunc() as i64, 0)
            .map(|ts| ts.with_timezone(&chrono::Local).to_rfc3339());
        if let Some(start) = start {
            println!("Sampling started at {start}");
        }
    }
    println!("{}", report::summary_table(&result.aggregate));
    println!(
        "Results saved to {}",
        test_dir.join(workdir::ANALYSIS_DIR).display()
    );
}

/// Prints the sanity findings and asks whether to go on.
fn confirm_findings(report: &SanityReport, assume_yes: bool) -> bool {
    for finding in &report.findings {
        eprintln!("warning: {finding}");
    }
    if assume_yes {
        return true;
    }

    eprint!("Continue anyway? [y/N] ");
    if io::stderr().flush().is_err() {
        return false;
    }
    let mut answer = String::new();
    if io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim(), "y" | "Y" | "yes")
}

//! The collection run as an explicit state machine.

use std::path::PathBuf;
use std::sync::Arc;

use hperf_pmu::ArchitectureProfile;
use hperf_sut::Executor;
use tracing::{debug, error, info, Span};

use crate::analyze::{AnalysisResult, Analyzer};
use crate::collect::{Collector, SanityReport};
use crate::config::{RunConfig, RunInfo};
use crate::error::Error;
use crate::report;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Planning,
    SanityChecking,
    Running,
    Aggregating,
    Done,
    Failed,
}

impl Stage {
    fn allows(self, next: Stage) -> bool {
        use Stage::*;
        match (self, next) {
            (Done | Failed, _) => false,
            (_, Failed) => true,
            (Idle, Planning)
            | (Planning, SanityChecking)
            | (SanityChecking, Running)
            | (Running, Aggregating)
            | (Running, Done)
            | (Aggregating, Done) => true,
            _ => false,
        }
    }
}

pub struct Pipeline {
    stage: Stage,
    span: Span,
}

impl Pipeline {
    pub fn new(span: Span) -> Self {
        Pipeline {
            stage: Stage::Idle,
            span,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn advance(&mut self, next: Stage) -> Result<(), Error> {
        if !self.stage.allows(next) {
            return Err(Error::InvalidTransition {
                from: self.stage,
                to: next,
            });
        }
        let _enter = self.span.enter();
        info!(from = ?self.stage, to = ?next, "stage");
        self.stage = next;
        Ok(())
    }

    /// Moves to [`Stage::Failed`] and hands the error back to the caller.
    pub fn fail(&mut self, err: Error) -> Error {
        let _enter = self.span.enter();
        error!(stage = ?self.stage, %err, "run failed");
        self.stage = Stage::Failed;
        err
    }
}

pub struct RunRequest {
    pub test_id: String,
    pub config: RunConfig,
    pub remote_host: Option<String>,
    pub analyze: bool,
}

pub struct RunOutcome {
    pub info: RunInfo,
    pub test_dir: PathBuf,
    pub analysis: Option<AnalysisResult>,
}

/// Plans, samples and optionally aggregates one run.
///
/// `confirm` is consulted only when the sanity check found problems; a
/// `false` answer aborts the run before anything is sampled.
pub async fn run<F>(
    executor: Arc<dyn Executor>,
    request: RunRequest,
    confirm: F,
    span: Span,
) -> Result<RunOutcome, Error>
where
    F: FnOnce(&SanityReport) -> bool,
{
    let mut pipeline = Pipeline::new(span.clone());
    match run_stages(&mut pipeline, executor, request, confirm, span).await {
        Ok(outcome) => {
            debug_assert_eq!(pipeline.stage(), Stage::Done);
            Ok(outcome)
        }
        Err(err) => Err(pipeline.fail(err)),
    }
}

async fn run_stages<F>(
    pipeline: &mut Pipeline,
    executor: Arc<dyn Executor>,
    request: RunRequest,
    confirm: F,
    span: Span,
) -> Result<RunOutcome, Error>
where
    F: FnOnce(&SanityReport) -> bool,
{
    let test_dir = executor.local_dir().to_path_buf();

    pipeline.advance(Stage::Planning)?;
    let profile = hperf_pmu::detect_architecture(executor.as_ref(), &span)?;
    let groups = hperf_pmu::optimize_groups(&profile);
    let selection = hperf_pmu::selection_string(&profile, &groups)?;
    {
        let _enter = span.enter();
        info!(arch = profile.arch_id(), groups = groups.len(), "planned event groups");
        debug!(selection, "event selection");
    }

    let info = RunInfo {
        test_id: request.test_id,
        started_at: chrono::Local::now(),
        isa: profile.isa().to_string(),
        arch_id: profile.arch_id().to_string(),
        remote_host: request.remote_host,
        config: request.config,
        groups: groups
            .iter()
            .map(|group| group.iter().copied().collect())
            .collect(),
        selection,
    };
    info.save(&test_dir)?;

    pipeline.advance(Stage::SanityChecking)?;
    let collector = Collector::new(executor, span.clone());
    let report = collector.sanity_check(&profile)?;
    if !report.ok() && !confirm(&report) {
        return Err(Error::Aborted(format!(
            "{} sanity check finding(s)",
            report.findings.len()
        )));
    }

    pipeline.advance(Stage::Running)?;
    collector
        .collect(&profile, &info.selection, &info.config)
        .await?;

    let analysis = if request.analyze {
        pipeline.advance(Stage::Aggregating)?;
        Some(aggregate(&test_dir, &profile, &info, span)?)
    } else {
        None
    };

    pipeline.advance(Stage::Done)?;
    Ok(RunOutcome {
        info,
        test_dir,
        analysis,
    })
}

fn aggregate(
    test_dir: &std::path::Path,
    profile: &ArchitectureProfile,
    info: &RunInfo,
    span: Span,
) -> Result<AnalysisResult, Error> {
    let analyzer = Analyzer::new(test_dir, profile, span)?;
    let result = analyzer.analyze(&info.config.cpus)?;
    report::save_all(test_dir, &result)?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use hperf_pmu::cpu_family::{ISA_COMMAND, MODEL_COMMAND, MODEL_NAME_COMMAND};
    use hperf_sut::CommandOutput;

    use super::*;
    use crate::analyze::{
        PERF_RESULT_FILE, PERF_START_FILE, SAR_D_FILE, SAR_N_DEV_FILE, SAR_R_FILE, SAR_U_FILE,
    };
    use crate::collect::{PERF_SCRIPT, SAR_SCRIPT};
    use crate::config::CpuSelection;
    use crate::topology::CPU_TOPO_FILE;

    /// Pretends to be an Ice Lake box and drops canned sampler output into
    /// the test directory.
    struct FakeSut {
        dir: PathBuf,
        watchdog: &'static str,
        perf_code: i32,
        check_code: i32,
    }

    impl Executor for FakeSut {
        fn run_command(&self, command: &str) -> Result<CommandOutput, hperf_sut::Error> {
            let (stdout, exit_code) = match command {
                ISA_COMMAND => (" x86_64", 0),
                MODEL_NAME_COMMAND => (" Intel(R) Xeon(R) Platinum 8380 CPU @ 2.30GHz", 0),
                MODEL_COMMAND => (" 106", 0),
                cmd if cmd.contains("nmi_watchdog") => (self.watchdog, self.check_code),
                cmd if cmd.starts_with("ps -ef") => ("", self.check_code),
                _ => ("", 0),
            };
            Ok(CommandOutput {
                stdout: stdout.to_string(),
                exit_code,
            })
        }

        fn run_script(&self, _body: &str, file_name: &str) -> Result<i32, hperf_sut::Error> {
            let write = |name: &str, body: &str| fs::write(self.dir.join(name), body).unwrap();
            if file_name == PERF_SCRIPT {
                write(CPU_TOPO_FILE, "0\t0\t0\n1\t0\t1\n");
                write(PERF_START_FILE, "1709629200.5\n");
                write(
                    PERF_RESULT_FILE,
                    "1.0\tCPU0\t1000000000\tns\tduration_time\t1\t100.00\n\
                     1.0\tCPU0\t800\t\tcycles:D\t1\t100.00\n\
                     1.0\tCPU1\t1200\t\tcycles:D\t1\t100.00\n\
                     1.0\tCPU0\t1000\t\tinstructions:D\t1\t100.00\n\
                     1.0\tCPU1\t1000\t\tinstructions:D\t1\t100.00\n",
                );
                Ok(self.perf_code)
            } else {
                assert_eq!(file_name, SAR_SCRIPT);
                write(SAR_U_FILE, "timestamp,CPU,%user,%system\n1,-1,40.0,5.0\n");
                write(SAR_R_FILE, "timestamp,%memused\n1,30.0\n");
                write(SAR_N_DEV_FILE, "timestamp,IFACE,%ifutil\n1,eth0,1.0\n");
                write(SAR_D_FILE, "timestamp,DEV,%util\n1,dev8-0,3.0\n");
                Ok(0)
            }
        }

        fn working_dir(&self) -> &Path {
            &self.dir
        }

        fn local_dir(&self) -> &Path {
            &self.dir
        }
    }

    fn request(analyze: bool) -> RunRequest {
        RunRequest {
            test_id: "20240305_test001".to_string(),
            config: RunConfig {
                command: "sleep 1".to_string(),
                duration: 1,
                interval_ms: 1000,
                cpus: CpuSelection::All,
                tmp_dir: PathBuf::from("/tmp/hperf"),
            },
            remote_host: None,
            analyze,
        }
    }

    #[test]
    fn walks_the_happy_path() {
        let mut pipeline = Pipeline::new(Span::none());
        for stage in [
            Stage::Planning,
            Stage::SanityChecking,
            Stage::Running,
            Stage::Aggregating,
            Stage::Done,
        ] {
            pipeline.advance(stage).unwrap();
        }
        assert_eq!(pipeline.stage(), Stage::Done);
        assert!(pipeline.advance(Stage::Failed).is_err());
    }

    #[test]
    fn rejects_skipped_stages() {
        let mut pipeline = Pipeline::new(Span::none());
        let err = pipeline.advance(Stage::Running).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: Stage::Idle,
                to: Stage::Running
            }
        ));
    }

    #[test]
    fn failed_is_terminal() {
        let mut pipeline = Pipeline::new(Span::none());
        pipeline.advance(Stage::Planning).unwrap();
        let err = pipeline.fail(Error::Configuration("boom".to_string()));
        assert!(matches!(err, Error::Configuration(_)));
        assert_eq!(pipeline.stage(), Stage::Failed);
        assert!(pipeline.advance(Stage::SanityChecking).is_err());
    }

    #[tokio::test]
    async fn runs_and_aggregates() {
        let dir = tempfile::tempdir().unwrap();
        let sut = Arc::new(FakeSut {
            dir: dir.path().to_path_buf(),
            watchdog: "0",
            perf_code: 0,
            check_code: 0,
        });

        let outcome = run(sut, request(true), |_| panic!("no findings expected"), Span::none())
            .await
            .unwrap();

        assert_eq!(outcome.info.arch_id, "intel_icelake");
        assert_eq!(RunInfo::load(dir.path()).unwrap(), outcome.info);

        let analysis = outcome.analysis.unwrap();
        let cpi = analysis.hw.metric_names.iter().position(|n| n == "CPI").unwrap();
        assert_eq!(analysis.hw.rows[0].metrics[cpi], 1.0);
        let freq = analysis
            .aggregate
            .metrics
            .iter()
            .find(|(name, _)| name == "FREQUENCY")
            .unwrap();
        assert_eq!(freq.1, 2000.0);
        assert!(dir.path().join("analysis_results/aggregated_metrics.csv").is_file());
    }

    #[tokio::test]
    async fn declined_sanity_check_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let sut = Arc::new(FakeSut {
            dir: dir.path().to_path_buf(),
            watchdog: "1\n",
            perf_code: 0,
            check_code: 0,
        });

        let err = run(sut, request(true), |_| false, Span::none())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Aborted(_)));
        assert!(!dir.path().join(PERF_RESULT_FILE).exists());
    }

    #[tokio::test]
    async fn unreachable_sut_fails_before_sampling() {
        let dir = tempfile::tempdir().unwrap();
        let sut = Arc::new(FakeSut {
            dir: dir.path().to_path_buf(),
            watchdog: "0",
            perf_code: 0,
            check_code: 255,
        });

        let err = run(sut, request(true), |_| true, Span::none())
            .await
            .err()
            .unwrap();
        assert!(matches!(&err, Error::Execution { step, .. } if step == "sanity check"));
        assert!(!dir.path().join(PERF_RESULT_FILE).exists());
    }

    #[tokio::test]
    async fn sampler_failure_skips_aggregation() {
        let dir = tempfile::tempdir().unwrap();
        let sut = Arc::new(FakeSut {
            dir: dir.path().to_path_buf(),
            watchdog: "1",
            perf_code: 2,
            check_code: 0,
        });

        let err = run(sut, request(true), |_| true, Span::none())
            .await
            .err()
            .unwrap();
        assert!(matches!(&err, Error::PartialSampling { failed } if failed == &["perf"]));
        assert!(dir.path().join(SAR_U_FILE).exists());
        assert!(!dir.path().join("analysis_results").exists());
    }
}

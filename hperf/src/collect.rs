//! Runs the hardware and OS samplers on the SUT.

use std::path::Path;
use std::sync::Arc;

use hperf_pmu::{ArchitectureProfile, ISA_X86_64};
use hperf_sut::{shell_quote, Executor};
use tokio::task::JoinError;
use tracing::{debug, info, warn, Span};

use crate::config::{CpuSelection, RunConfig};
use crate::error::Error;
use crate::templates::{self, PERF_TEMPLATE, SAR_TEMPLATE};
use crate::topology::{self, CPU_INFO_FILE, CPU_TOPO_FILE};

pub const PERF_SCRIPT: &str = "perf.sh";
pub const SAR_SCRIPT: &str = "sar.sh";

pub const PERF_SAMPLER: &str = "perf";
pub const SAR_SAMPLER: &str = "sar";

/// Command columns of processes that compete for the counters.
const COMPETING_PROFILERS: [&str; 2] = ["linux-tools/.*/perf", "/intel/oneapi/vtune/.*/emon"];
const NMI_WATCHDOG_COMMAND: &str = "cat /proc/sys/kernel/nmi_watchdog";
/// grep's exit code when nothing matched.
const GREP_NO_MATCH: i32 = 1;

const SANITY_CHECK_STEP: &str = "sanity check";
const STATIC_FACTS_STEP: &str = "static SUT facts";
const TRANSFER_STEP: &str = "result transfer";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finding {
    CompetingProfiler(String),
    NmiWatchdogEnabled,
}

impl std::fmt::Display for Finding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Finding::CompetingProfiler(pattern) => {
                write!(f, "a process matching '{pattern}' is already running")
            }
            Finding::NmiWatchdogEnabled => {
                f.write_str("the NMI watchdog is enabled and holds a hardware counter")
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SanityReport {
    pub findings: Vec<Finding>,
}

impl SanityReport {
    pub fn ok(&self) -> bool {
        self.findings.is_empty()
    }
}

pub struct Collector {
    executor: Arc<dyn Executor>,
    span: Span,
}

impl Collector {
    pub fn new(executor: Arc<dyn Executor>, span: Span) -> Self {
        Collector { executor, span }
    }

    /// Looks for conditions that would steal counters from the run. A check
    /// that cannot be executed on the SUT fails the whole sanity check.
    pub fn sanity_check(&self, profile: &ArchitectureProfile) -> Result<SanityReport, Error> {
        let _enter = self.span.enter();
        let mut report = SanityReport::default();

        for pattern in COMPETING_PROFILERS {
            let command = format!(
                "ps -ef | awk '{{print $8}}' | grep {}",
                shell_quote(pattern)
            );
            let matches = self.query(&command, &[0, GREP_NO_MATCH])?;
            if !matches.trim().is_empty() {
                warn!(pattern, "competing profiler detected");
                report
                    .findings
                    .push(Finding::CompetingProfiler(pattern.to_string()));
            }
        }

        if profile.isa() == ISA_X86_64 {
            let watchdog = self.query(NMI_WATCHDOG_COMMAND, &[0])?;
            if watchdog.trim() == "1" {
                warn!("NMI watchdog is enabled");
                report.findings.push(Finding::NmiWatchdogEnabled);
            }
        }

        Ok(report)
    }

    /// Stdout of `command`, provided it exited with one of `accepted`.
    fn query(&self, command: &str, accepted: &[i32]) -> Result<String, Error> {
        let output = self
            .executor
            .run_command(command)
            .map_err(|err| Error::execution(SANITY_CHECK_STEP, err))?;
        if !accepted.contains(&output.exit_code) {
            return Err(Error::execution(
                SANITY_CHECK_STEP,
                hperf_sut::Error::CommandFailed {
                    command: command.to_string(),
                    code: output.exit_code,
                },
            ));
        }
        Ok(output.stdout)
    }

    pub fn perf_script(&self, selection: &str, config: &RunConfig) -> String {
        let dir = dir_param(self.executor.working_dir());
        let interval = config.interval_ms.to_string();
        templates::render(
            PERF_TEMPLATE,
            &[
                ("HPERF_PERF_DIR", &dir),
                ("HPERF_EVENT_GROUPS_STR", selection),
                ("HPERF_INTERVAL", &interval),
                ("HPERF_COMMAND", &config.command),
            ],
        )
    }

    pub fn sar_script(&self, config: &RunConfig) -> String {
        let dir = dir_param(self.executor.working_dir());
        let cpus = match &config.cpus {
            CpuSelection::All => String::new(),
            list => format!("-P {list}"),
        };
        let duration = config.duration.to_string();
        templates::render(
            SAR_TEMPLATE,
            &[
                ("HPERF_SAR_DIR", &dir),
                ("HPERF_P_STR", &cpus),
                ("HPERF_SAR_TIME", &duration),
            ],
        )
    }

    /// Runs both samplers to completion, pulls their output and reports
    /// which of them failed.
    pub async fn collect(
        &self,
        profile: &ArchitectureProfile,
        selection: &str,
        config: &RunConfig,
    ) -> Result<(), Error> {
        let executor = Arc::clone(&self.executor);
        let isa = profile.isa().to_string();
        let span = self.span.clone();
        tokio::task::spawn_blocking(move || {
            let _enter = span.enter();
            capture_static_facts(executor.as_ref(), &isa)
        })
        .await
        .map_err(|err| Error::execution(STATIC_FACTS_STEP, err))??;

        let perf_script = self.perf_script(selection, config);
        let sar_script = self.sar_script(config);
        {
            let _enter = self.span.enter();
            debug!(script = %perf_script, "hardware sampler script");
            debug!(script = %sar_script, "OS sampler script");
            info!(command = %config.command, "sampling started");
        }

        let perf_executor = Arc::clone(&self.executor);
        let perf = tokio::task::spawn_blocking(move || {
            perf_executor.run_script(&perf_script, PERF_SCRIPT)
        });
        let sar_executor = Arc::clone(&self.executor);
        let sar =
            tokio::task::spawn_blocking(move || sar_executor.run_script(&sar_script, SAR_SCRIPT));

        let (perf, sar) = tokio::join!(perf, sar);

        // whatever the samplers left behind is still worth having locally
        let fetch_executor = Arc::clone(&self.executor);
        let fetched = tokio::task::spawn_blocking(move || fetch_executor.fetch_results()).await;

        let _enter = self.span.enter();
        let perf = sampler_exit(PERF_SAMPLER, perf)?;
        let sar = sampler_exit(SAR_SAMPLER, sar)?;
        fetched
            .map_err(|err| Error::execution(TRANSFER_STEP, err))?
            .map_err(|err| Error::execution(TRANSFER_STEP, err))?;

        let mut failed = vec![];
        for (sampler, code) in [(PERF_SAMPLER, perf), (SAR_SAMPLER, sar)] {
            if code != 0 {
                warn!(sampler, code, "sampler exited with an error");
                failed.push(sampler.to_string());
            }
        }

        if !failed.is_empty() {
            return Err(Error::PartialSampling { failed });
        }

        info!("sampling finished");
        Ok(())
    }
}

/// Dumps `lscpu` and the CPU to socket table into the working directory.
fn capture_static_facts(executor: &dyn Executor, isa: &str) -> Result<(), Error> {
    let work_dir = executor.working_dir();

    let lscpu = format!(
        "lscpu > {}",
        shell_quote(&work_dir.join(CPU_INFO_FILE).to_string_lossy())
    );
    executor
        .run_checked(&lscpu)
        .map_err(|err| Error::execution("CPU inventory", err))?;

    let topo = topology::topology_command(isa, &work_dir.join(CPU_TOPO_FILE))?;
    executor
        .run_checked(&topo)
        .map_err(|err| Error::execution("CPU topology", err))?;

    debug!("captured static SUT facts");
    Ok(())
}

fn sampler_exit(
    sampler: &str,
    joined: Result<Result<i32, hperf_sut::Error>, JoinError>,
) -> Result<i32, Error> {
    joined
        .map_err(|err| Error::execution(sampler, err))?
        .map_err(|err| Error::execution(sampler, err))
}

fn dir_param(dir: &Path) -> String {
    shell_quote(&dir.to_string_lossy())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Mutex;

    use hperf_sut::CommandOutput;
    use insta::assert_snapshot;

    use super::*;

    /// In-memory SUT: commands answer from a table, scripts return a fixed
    /// exit code per file name.
    #[derive(Default)]
    struct MockExecutor {
        responses: HashMap<String, String>,
        command_code: i32,
        unreachable: bool,
        script_codes: HashMap<&'static str, i32>,
        crashing_script: Option<&'static str>,
        scripts: Mutex<Vec<String>>,
        commands: Mutex<Vec<String>>,
        fetched: Mutex<bool>,
    }

    impl Executor for MockExecutor {
        fn run_command(&self, command: &str) -> Result<CommandOutput, hperf_sut::Error> {
            self.commands.lock().unwrap().push(command.to_string());
            if self.unreachable {
                return Err(hperf_sut::Error::Unreachable {
                    host: "sut01".to_string(),
                    code: 255,
                });
            }
            let stdout = self
                .responses
                .iter()
                .find(|(needle, _)| command.contains(needle.as_str()))
                .map(|(_, out)| out.clone())
                .unwrap_or_default();
            Ok(CommandOutput {
                stdout,
                exit_code: self.command_code,
            })
        }

        fn run_script(&self, _body: &str, file_name: &str) -> Result<i32, hperf_sut::Error> {
            self.scripts.lock().unwrap().push(file_name.to_string());
            if self.crashing_script == Some(file_name) {
                panic!("{file_name} crashed");
            }
            Ok(self.script_codes.get(file_name).copied().unwrap_or(0))
        }

        fn working_dir(&self) -> &Path {
            Path::new("/tmp/hperf/20240305_test001")
        }

        fn local_dir(&self) -> &Path {
            Path::new("/tmp/hperf/20240305_test001")
        }

        fn fetch_results(&self) -> Result<(), hperf_sut::Error> {
            *self.fetched.lock().unwrap() = true;
            Ok(())
        }
    }

    fn config(cpus: CpuSelection) -> RunConfig {
        RunConfig {
            command: "./mat_mul 512".to_string(),
            duration: 5,
            interval_ms: 500,
            cpus,
            tmp_dir: PathBuf::from("/tmp/hperf"),
        }
    }

    fn profile(arch_id: &str) -> ArchitectureProfile {
        ArchitectureProfile::load(arch_id).unwrap()
    }

    #[tokio::test]
    async fn reports_failing_hardware_sampler() {
        let mock = Arc::new(MockExecutor {
            script_codes: HashMap::from([(PERF_SCRIPT, 1)]),
            ..Default::default()
        });
        let collector = Collector::new(mock.clone(), Span::none());

        let err = collector
            .collect(&profile("intel_icelake"), "cycles:D", &config(CpuSelection::All))
            .await
            .unwrap_err();

        assert!(matches!(&err, Error::PartialSampling { failed } if failed == &["perf"]));
        assert!(*mock.fetched.lock().unwrap());
        let mut scripts = mock.scripts.lock().unwrap().clone();
        scripts.sort();
        assert_eq!(scripts, vec![PERF_SCRIPT, SAR_SCRIPT]);
    }

    #[tokio::test]
    async fn fetches_results_even_when_a_sampler_crashes() {
        let mock = Arc::new(MockExecutor {
            crashing_script: Some(PERF_SCRIPT),
            ..Default::default()
        });
        let collector = Collector::new(mock.clone(), Span::none());

        let err = collector
            .collect(&profile("intel_icelake"), "cycles:D", &config(CpuSelection::All))
            .await
            .unwrap_err();

        assert!(matches!(&err, Error::Execution { step, .. } if step == "perf"));
        assert!(*mock.fetched.lock().unwrap());
    }

    #[tokio::test]
    async fn succeeds_when_both_samplers_do() {
        let mock = Arc::new(MockExecutor::default());
        let collector = Collector::new(mock.clone(), Span::none());

        collector
            .collect(&profile("arm"), "cycles:D", &config(CpuSelection::All))
            .await
            .unwrap();

        let commands = mock.commands.lock().unwrap();
        assert!(commands[0].starts_with("lscpu > "));
        assert!(commands[1].ends_with("/cpu_topo'"));
    }

    #[test]
    fn flags_competing_profilers_and_watchdog() {
        let mock = Arc::new(MockExecutor {
            responses: HashMap::from([
                ("vtune".to_string(), "/opt/intel/oneapi/vtune/2024/emon\n".to_string()),
                ("nmi_watchdog".to_string(), "1\n".to_string()),
            ]),
            ..Default::default()
        });
        let collector = Collector::new(mock.clone(), Span::none());

        let report = collector.sanity_check(&profile("intel_cascadelake")).unwrap();
        assert!(!report.ok());
        assert_eq!(
            report.findings,
            vec![
                Finding::CompetingProfiler("/intel/oneapi/vtune/.*/emon".to_string()),
                Finding::NmiWatchdogEnabled,
            ]
        );

        // the watchdog only matters on x86_64
        let report = collector.sanity_check(&profile("arm")).unwrap();
        assert_eq!(report.findings.len(), 1);
    }

    #[test]
    fn clean_system_passes() {
        let collector = Collector::new(Arc::new(MockExecutor::default()), Span::none());
        assert!(collector.sanity_check(&profile("intel_icelake")).unwrap().ok());
    }

    #[test]
    fn grep_without_match_is_clean() {
        let mock = Arc::new(MockExecutor {
            command_code: 1,
            ..Default::default()
        });
        let collector = Collector::new(mock, Span::none());
        assert!(collector.sanity_check(&profile("arm")).unwrap().ok());
    }

    #[test]
    fn unreachable_sut_fails_sanity_check() {
        let mock = Arc::new(MockExecutor {
            unreachable: true,
            ..Default::default()
        });
        let collector = Collector::new(mock.clone(), Span::none());

        let err = collector
            .sanity_check(&profile("intel_icelake"))
            .unwrap_err();
        assert!(matches!(&err, Error::Execution { step, .. } if step == "sanity check"));
        assert_eq!(mock.commands.lock().unwrap().len(), 1);
    }

    #[test]
    fn ssh_exit_255_fails_sanity_check() {
        let mock = Arc::new(MockExecutor {
            command_code: 255,
            ..Default::default()
        });
        let collector = Collector::new(mock, Span::none());

        let err = collector
            .sanity_check(&profile("intel_icelake"))
            .unwrap_err();
        assert!(matches!(&err, Error::Execution { step, .. } if step == "sanity check"));
        let source = std::error::Error::source(&err).unwrap().to_string();
        assert!(source.ends_with("exited with code 255"), "{source}");
    }

    #[test]
    fn failing_watchdog_read_fails_sanity_check() {
        let mock = Arc::new(MockExecutor {
            command_code: 1,
            ..Default::default()
        });
        let collector = Collector::new(mock, Span::none());
        assert!(matches!(
            collector.sanity_check(&profile("intel_cascadelake")),
            Err(Error::Execution { .. })
        ));
    }

    #[test]
    fn renders_sar_script_for_cpu_subset() {
        let collector = Collector::new(Arc::new(MockExecutor::default()), Span::none());
        let script = collector.sar_script(&config(CpuSelection::List(vec![0, 2])));
        assert_snapshot!(script, @r#"
        #!/bin/bash
        set -o pipefail
        TMP_DIR='/tmp/hperf/20240305_test001'
        sar_raw="$TMP_DIR"/sar_raw
        sar -A -o "$sar_raw" 1 5 > /dev/null 2>"$TMP_DIR"/sar_error || exit 1
        to_csv() { sed -e '1s/^# //' -e 's/;/,/g'; }
        sadf -d -U "$sar_raw" -- -u -P 0,2 | to_csv > "$TMP_DIR"/sar_u || exit 1
        sadf -d -U "$sar_raw" -- -r | to_csv > "$TMP_DIR"/sar_r || exit 1
        sadf -d -U "$sar_raw" -- -n DEV | to_csv > "$TMP_DIR"/sar_n_dev || exit 1
        sadf -d -U "$sar_raw" -- -d | to_csv > "$TMP_DIR"/sar_d || exit 1
        "#);
    }

    #[test]
    fn perf_script_carries_interval_and_selection() {
        let collector = Collector::new(Arc::new(MockExecutor::default()), Span::none());
        let script = collector.perf_script("cycles:D,'{r08d1}'", &config(CpuSelection::All));
        assert!(script.contains("-e cycles:D,'{r08d1}' -A -a"));
        assert!(script.contains("-I 500 --log-fd 3 ./mat_mul 512"));
    }
}

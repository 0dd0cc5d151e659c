use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use hperf_pmu::EventScope;

use crate::error::Error;

pub const CPU_INFO_FILE: &str = "cpu_info";
pub const CPU_TOPO_FILE: &str = "cpu_topo";

// processor | socket | core, one CPU per line
const X86_TOPOLOGY_SCRIPT: &str = r#"awk -F: 'BEGIN{i=0;j=0;k=0}/processor/{cpu[i]=$2;i++}/physical id/{skt[j]=$2;j++}/core id/{phy[k]=$2;k++}END{OFS="\t";for(key in cpu)print cpu[key],skt[key],phy[key]}' /proc/cpuinfo"#;
// aarch64 kernels do not report a physical id, every CPU lands on socket 0
const AARCH64_TOPOLOGY_SCRIPT: &str = r#"awk -F: 'BEGIN{i=0}/processor/{cpu[i]=$2;i++}END{OFS="\t";for(key in cpu)print cpu[key],0}' /proc/cpuinfo"#;

/// Command line that writes the CPU to socket table of the SUT to `output`.
pub fn topology_command(isa: &str, output: &Path) -> Result<String, Error> {
    let script = match isa {
        hperf_pmu::ISA_X86_64 => X86_TOPOLOGY_SCRIPT,
        hperf_pmu::ISA_AARCH64 => AARCH64_TOPOLOGY_SCRIPT,
        other => {
            return Err(Error::Configuration(format!(
                "no topology probe for ISA '{other}'"
            )))
        }
    };
    Ok(format!(
        "{script} > {}",
        hperf_sut::shell_quote(&output.to_string_lossy())
    ))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuTopology {
    sockets: BTreeMap<u32, u32>,
}

impl CpuTopology {
    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut sockets = BTreeMap::new();

        for (idx, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }

            let mut fields = line.split('\t').map(str::trim);
            let (Some(cpu), Some(socket)) = (fields.next(), fields.next()) else {
                return Err(Error::DataIntegrity(format!(
                    "malformed topology line {}: '{line}'",
                    idx + 1
                )));
            };
            let parse = |value: &str| {
                value.parse::<u32>().map_err(|_| {
                    Error::DataIntegrity(format!(
                        "malformed topology line {}: '{line}'",
                        idx + 1
                    ))
                })
            };
            sockets.insert(parse(cpu)?, parse(socket)?);
        }

        Ok(CpuTopology { sockets })
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        CpuTopology::parse(&fs::read_to_string(path)?)
    }

    pub fn socket_of(&self, cpu: u32) -> Option<u32> {
        self.sockets.get(&cpu).copied()
    }

    pub fn contains(&self, cpu: u32) -> bool {
        self.sockets.contains_key(&cpu)
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }
}

/// Unit a sample is attributed to after scope remapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Unit {
    Cpu(u32),
    Socket(u32),
    System,
}

impl Unit {
    pub fn parse(label: &str) -> Option<Unit> {
        if label == "SYSTEM" {
            return Some(Unit::System);
        }
        if let Some(id) = label.strip_prefix("SOCKET") {
            return id.parse().ok().map(Unit::Socket);
        }
        label.strip_prefix("CPU")?.parse().ok().map(Unit::Cpu)
    }

    /// Rewrites a CPU unit to the unit an event of `scope` rolls up to.
    pub fn remap(self, scope: EventScope, topology: &CpuTopology) -> Result<Unit, Error> {
        let Unit::Cpu(cpu) = self else {
            return Ok(self);
        };

        let socket = topology.socket_of(cpu).ok_or_else(|| {
            Error::DataIntegrity(format!("CPU{cpu} is missing from the CPU topology"))
        })?;

        Ok(match scope {
            EventScope::Cpu => self,
            // the sampler reports socket events on one CPU of that socket
            EventScope::Socket => Unit::Socket(socket),
            EventScope::System => Unit::System,
        })
    }
}

impl std::fmt::Display for Unit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Unit::Cpu(id) => write!(f, "CPU{id}"),
            Unit::Socket(id) => write!(f, "SOCKET{id}"),
            Unit::System => f.write_str("SYSTEM"),
        }
    }
}

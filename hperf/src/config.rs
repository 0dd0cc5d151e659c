use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

pub const RUN_INFO_FILE: &str = "info.json";

/// CPUs whose samples contribute to the aggregated results.
///
/// Sampling itself is always system-wide; the selection only narrows
/// aggregation and the OS utilization report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum CpuSelection {
    #[default]
    All,
    List(Vec<u32>),
}

impl FromStr for CpuSelection {
    type Err = Error;

    /// Accepts `all` or a list such as `2,4-8`. Duplicates are dropped and
    /// the order of first appearance is kept.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "all" {
            return Ok(CpuSelection::All);
        }

        let invalid = || Error::Configuration(format!("invalid CPU list '{s}'"));
        let parse_id = |id: &str| id.trim().parse::<u32>().map_err(|_| invalid());

        let mut cpus = vec![];
        for item in s.split(',') {
            let ids = match item.split_once('-') {
                Some((start, end)) => {
                    let (start, end) = (parse_id(start)?, parse_id(end)?);
                    if start > end {
                        return Err(invalid());
                    }
                    (start..=end).collect()
                }
                None => vec![parse_id(item)?],
            };
            for id in ids {
                if !cpus.contains(&id) {
                    cpus.push(id);
                }
            }
        }

        Ok(CpuSelection::List(cpus))
    }
}

impl fmt::Display for CpuSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CpuSelection::All => f.write_str("all"),
            CpuSelection::List(cpus) => {
                let ids: Vec<String> = cpus.iter().map(|id| id.to_string()).collect();
                f.write_str(&ids.join(","))
            }
        }
    }
}

impl From<CpuSelection> for String {
    fn from(selection: CpuSelection) -> Self {
        selection.to_string()
    }
}

impl TryFrom<String> for CpuSelection {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    pub command: String,
    /// Seconds the OS utilization sampler runs for.
    pub duration: u64,
    /// Hardware sampler interval in milliseconds.
    pub interval_ms: u64,
    pub cpus: CpuSelection,
    pub tmp_dir: PathBuf,
}

/// Everything `analyze` needs to re-aggregate a test directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub test_id: String,
    pub started_at: chrono::DateTime<chrono::Local>,
    pub isa: String,
    pub arch_id: String,
    pub remote_host: Option<String>,
    pub config: RunConfig,
    pub groups: Vec<Vec<u32>>,
    pub selection: String,
}

impl RunInfo {
    pub fn save(&self, test_dir: &Path) -> Result<(), Error> {
        let mut info_file = File::create(test_dir.join(RUN_INFO_FILE))?;
        serde_json::to_writer_pretty(&mut info_file, self)?;
        Ok(())
    }

    pub fn load(test_dir: &Path) -> Result<Self, Error> {
        let info_file = File::open(test_dir.join(RUN_INFO_FILE))?;
        Ok(serde_json::from_reader(info_file)?)
    }
}

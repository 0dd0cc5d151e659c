//! Reconstruction of scoped timeseries and metrics from raw sampler output.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use hperf_pmu::{ArchitectureProfile, EventScope};
use tracing::{debug, info, Span};

use crate::config::{CpuSelection, RUN_INFO_FILE};
use crate::error::Error;
use crate::topology::{CpuTopology, Unit, CPU_TOPO_FILE};

pub const PERF_RESULT_FILE: &str = "perf_result";
pub const PERF_START_FILE: &str = "perf_start_timestamp";
pub const SAR_U_FILE: &str = "sar_u";
pub const SAR_R_FILE: &str = "sar_r";
pub const SAR_N_DEV_FILE: &str = "sar_n_dev";
pub const SAR_D_FILE: &str = "sar_d";

pub const REQUIRED_FILES: [&str; 7] = [
    PERF_RESULT_FILE,
    CPU_TOPO_FILE,
    SAR_U_FILE,
    SAR_R_FILE,
    SAR_N_DEV_FILE,
    SAR_D_FILE,
    RUN_INFO_FILE,
];

pub const SW_COLUMNS: [&str; 5] = [
    "CPU_UTIL_USER",
    "CPU_UTIL_SYS",
    "MEM_UTIL",
    "NET_UTIL",
    "STORAGE_UTIL",
];

/// Seconds since the sampler started, totally ordered so it can key maps.
#[derive(Debug, Clone, Copy)]
pub struct Timestamp(pub f64);

impl PartialEq for Timestamp {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Timestamp {}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawSample {
    pub timestamp: Timestamp,
    pub unit: Unit,
    pub value: f64,
    pub token: String,
}

/// Parses `perf stat -x` interval output.
///
/// Columns are timestamp, unit, value, unit of measure, event and a few
/// columns this parser ignores. Counters perf could not read are skipped.
pub fn parse_perf_output<R: Read>(reader: R) -> Result<Vec<RawSample>, Error> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut samples = vec![];
    for record in reader.records() {
        let record = record?;
        if record.iter().all(str::is_empty) {
            continue;
        }

        let line = record.position().map_or(0, |pos| pos.line());
        let malformed = |what: &str| {
            Error::DataIntegrity(format!("{PERF_RESULT_FILE} line {line}: {what}"))
        };

        let (Some(timestamp), Some(unit), Some(value), Some(token)) =
            (record.get(0), record.get(1), record.get(2), record.get(4))
        else {
            return Err(malformed("too few columns"));
        };

        let Ok(value) = value.parse::<f64>() else {
            debug!(line, token, value, "skipping unreadable counter");
            continue;
        };
        let timestamp = timestamp
            .parse::<f64>()
            .map_err(|_| malformed("bad timestamp"))?;
        let unit = Unit::parse(unit).ok_or_else(|| malformed("bad unit"))?;

        samples.push(RawSample {
            timestamp: Timestamp(timestamp),
            unit,
            value,
            token: token.to_string(),
        });
    }

    Ok(samples)
}

/// Relabels SYSTEM and SOCKET scoped samples with the unit they describe.
pub fn remap_scope(
    samples: Vec<RawSample>,
    profile: &ArchitectureProfile,
    topology: &CpuTopology,
) -> Result<Vec<RawSample>, Error> {
    samples
        .into_iter()
        .map(|sample| {
            let event = profile.event_by_token(&sample.token).ok_or_else(|| {
                Error::DataIntegrity(format!("unknown event token '{}'", sample.token))
            })?;
            let unit = sample.unit.remap(event.scope, topology)?;
            Ok(RawSample { unit, ..sample })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitFilter {
    All,
    Only(BTreeSet<Unit>),
}

impl UnitFilter {
    pub fn contains(&self, unit: &Unit) -> bool {
        match self {
            UnitFilter::All => true,
            UnitFilter::Only(units) => units.contains(unit),
        }
    }
}

/// Units whose samples make up the selected scope.
///
/// An explicit CPU list also pulls in SYSTEM and the sockets of the listed
/// CPUs when the profile has events of those scopes.
pub fn select_units(
    selection: &CpuSelection,
    profile: &ArchitectureProfile,
    topology: &CpuTopology,
) -> Result<UnitFilter, Error> {
    let CpuSelection::List(cpus) = selection else {
        return Ok(UnitFilter::All);
    };

    let mut units = BTreeSet::new();
    for cpu in cpus {
        if !topology.contains(*cpu) {
            return Err(Error::DataIntegrity(format!(
                "selected CPU{cpu} is missing from the CPU topology"
            )));
        }
        units.insert(Unit::Cpu(*cpu));
    }

    if profile.has_scope(EventScope::System) {
        units.insert(Unit::System);
    }
    if profile.has_scope(EventScope::Socket) {
        for cpu in cpus {
            if let Some(socket) = topology.socket_of(*cpu) {
                units.insert(Unit::Socket(socket));
            }
        }
    }

    Ok(UnitFilter::Only(units))
}

/// Per timestamp, the summed value of each event id over the selected units.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScopedSeries {
    pub rows: BTreeMap<Timestamp, HashMap<u32, f64>>,
}

pub fn build_scoped_series(
    samples: &[RawSample],
    filter: &UnitFilter,
    profile: &ArchitectureProfile,
) -> Result<ScopedSeries, Error> {
    let mut series = ScopedSeries::default();

    for sample in samples {
        let event = profile.event_by_token(&sample.token).ok_or_else(|| {
            Error::DataIntegrity(format!("unknown event token '{}'", sample.token))
        })?;

        // every interval keeps its row even if the filter drops its samples
        let row = series.rows.entry(sample.timestamp).or_default();
        if filter.contains(&sample.unit) {
            *row.entry(event.id).or_insert(0.0) += sample.value;
        }
    }

    Ok(series)
}

#[derive(Debug, Clone, PartialEq)]
pub struct HwRow {
    pub timestamp: f64,
    pub events: Vec<f64>,
    pub metrics: Vec<f64>,
}

/// Event and metric values per interval, in profile order.
#[derive(Debug, Clone, PartialEq)]
pub struct HwTimeseries {
    pub event_names: Vec<String>,
    pub metric_names: Vec<String>,
    pub rows: Vec<HwRow>,
}

pub fn evaluate_metrics(series: &ScopedSeries, profile: &ArchitectureProfile) -> HwTimeseries {
    let rows = series
        .rows
        .iter()
        .map(|(timestamp, values)| {
            let value_of = |id: u32| values.get(&id).copied().unwrap_or(0.0);
            HwRow {
                timestamp: timestamp.0,
                events: profile.events().iter().map(|evt| value_of(evt.id)).collect(),
                metrics: profile
                    .metrics()
                    .iter()
                    .map(|metric| metric.evaluate(|id| Some(value_of(id))))
                    .collect(),
            }
        })
        .collect();

    HwTimeseries {
        event_names: profile.events().iter().map(|evt| evt.name.clone()).collect(),
        metric_names: profile.metrics().iter().map(|m| m.name.clone()).collect(),
        rows,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwRow {
    pub timestamp: f64,
    pub values: [f64; SW_COLUMNS.len()],
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SwTimeseries {
    pub rows: Vec<SwRow>,
}

/// Averages `columns` over all rows sharing a timestamp (one row per CPU,
/// interface or device in sar output).
pub fn average_sar_columns(
    name: &str,
    text: &str,
    columns: &[&str],
) -> Result<BTreeMap<Timestamp, Vec<f64>>, Error> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let headers = reader.headers()?.clone();
    let position = |column: &str| {
        headers
            .iter()
            .position(|h| h == column)
            .ok_or_else(|| Error::DataIntegrity(format!("{name} has no '{column}' column")))
    };
    let ts_idx = position("timestamp")?;
    let indices = columns
        .iter()
        .map(|column| position(column))
        .collect::<Result<Vec<_>, _>>()?;

    let mut sums: BTreeMap<Timestamp, (Vec<f64>, usize)> = BTreeMap::new();
    for record in reader.records() {
        let record = record?;
        let field = |idx: usize| -> Result<f64, Error> {
            record
                .get(idx)
                .and_then(|v| v.parse::<f64>().ok())
                .ok_or_else(|| {
                    Error::DataIntegrity(format!(
                        "{name}: malformed row '{}'",
                        record.iter().collect::<Vec<_>>().join(",")
                    ))
                })
        };

        let timestamp = Timestamp(field(ts_idx)?);
        let entry = sums
            .entry(timestamp)
            .or_insert_with(|| (vec![0.0; columns.len()], 0));
        for (sum, idx) in entry.0.iter_mut().zip(&indices) {
            *sum += field(*idx)?;
        }
        entry.1 += 1;
    }

    Ok(sums
        .into_iter()
        .map(|(ts, (totals, count))| {
            (ts, totals.into_iter().map(|t| t / count as f64).collect())
        })
        .collect())
}

/// Joins the four sar reports on the timestamps of the CPU report.
pub fn build_sw_timeseries(
    sar_u: &str,
    sar_r: &str,
    sar_n_dev: &str,
    sar_d: &str,
) -> Result<SwTimeseries, Error> {
    let cpu = average_sar_columns(SAR_U_FILE, sar_u, &["%user", "%system"])?;
    let mem = average_sar_columns(SAR_R_FILE, sar_r, &["%memused"])?;
    let net = average_sar_columns(SAR_N_DEV_FILE, sar_n_dev, &["%ifutil"])?;
    let storage = average_sar_columns(SAR_D_FILE, sar_d, &["%util"])?;

    let single = |map: &BTreeMap<Timestamp, Vec<f64>>, ts: &Timestamp| {
        map.get(ts).map_or(f64::NAN, |v| v[0])
    };

    let rows = cpu
        .iter()
        .map(|(ts, util)| SwRow {
            timestamp: ts.0,
            values: [
                util[0],
                util[1],
                single(&mem, ts),
                single(&net, ts),
                single(&storage, ts),
            ],
        })
        .collect();

    Ok(SwTimeseries { rows })
}

/// Summary of a whole run: event totals, metric means and mean utilization.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedMetrics {
    pub events: Vec<(String, f64)>,
    pub metrics: Vec<(String, f64)>,
    pub utilization: Vec<(String, f64)>,
}

impl AggregatedMetrics {
    pub fn entries(&self) -> impl Iterator<Item = &(String, f64)> {
        self.events
            .iter()
            .chain(&self.metrics)
            .chain(&self.utilization)
    }
}

fn nan_sum(values: impl Iterator<Item = f64>) -> f64 {
    values.filter(|v| !v.is_nan()).sum()
}

fn nan_mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values
        .filter(|v| !v.is_nan())
        .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        f64::NAN
    } else {
        sum / count as f64
    }
}

pub fn build_aggregate(hw: &HwTimeseries, sw: &SwTimeseries) -> AggregatedMetrics {
    let events = hw
        .event_names
        .iter()
        .enumerate()
        .map(|(idx, name)| (name.clone(), nan_sum(hw.rows.iter().map(|r| r.events[idx]))))
        .collect();
    let metrics = hw
        .metric_names
        .iter()
        .enumerate()
        .map(|(idx, name)| (name.clone(), nan_mean(hw.rows.iter().map(|r| r.metrics[idx]))))
        .collect();
    let utilization = SW_COLUMNS
        .iter()
        .enumerate()
        .map(|(idx, name)| {
            (
                name.to_string(),
                nan_mean(sw.rows.iter().map(|r| r.values[idx])),
            )
        })
        .collect();

    AggregatedMetrics {
        events,
        metrics,
        utilization,
    }
}

#[derive(Debug, Clone)]
pub struct AnalysisResult {
    pub hw: HwTimeseries,
    pub sw: SwTimeseries,
    pub aggregate: AggregatedMetrics,
    /// Wall-clock start of sampling in seconds since the epoch.
    pub started_at: Option<f64>,
}

pub fn verify_test_dir(test_dir: &Path) -> Result<(), Error> {
    if !test_dir.is_dir() {
        return Err(Error::Configuration(format!(
            "test directory {} does not exist",
            test_dir.display()
        )));
    }
    for name in REQUIRED_FILES {
        if !test_dir.join(name).exists() {
            return Err(Error::Configuration(format!(
                "{name} does not exist in {}",
                test_dir.display()
            )));
        }
    }
    Ok(())
}

pub struct Analyzer<'a> {
    test_dir: PathBuf,
    profile: &'a ArchitectureProfile,
    topology: CpuTopology,
    span: Span,
}

impl<'a> Analyzer<'a> {
    pub fn new(
        test_dir: impl Into<PathBuf>,
        profile: &'a ArchitectureProfile,
        span: Span,
    ) -> Result<Self, Error> {
        let test_dir = test_dir.into();
        let topology = CpuTopology::load(&test_dir.join(CPU_TOPO_FILE))?;
        if topology.is_empty() {
            return Err(Error::DataIntegrity(format!(
                "{CPU_TOPO_FILE} in {} lists no CPUs",
                test_dir.display()
            )));
        }
        {
            let _enter = span.enter();
            debug!(cpus = topology.len(), "loaded CPU topology");
        }

        Ok(Analyzer {
            test_dir,
            profile,
            topology,
            span,
        })
    }

    pub fn analyze(&self, selection: &CpuSelection) -> Result<AnalysisResult, Error> {
        let _enter = self.span.enter();

        let raw = fs::File::open(self.test_dir.join(PERF_RESULT_FILE))?;
        let samples = parse_perf_output(raw)?;
        debug!(samples = samples.len(), "parsed hardware samples");

        let samples = remap_scope(samples, self.profile, &self.topology)?;
        let filter = select_units(selection, self.profile, &self.topology)?;
        debug!(?filter, "selected units");

        let series = build_scoped_series(&samples, &filter, self.profile)?;
        let hw = evaluate_metrics(&series, self.profile);

        let read = |name: &str| fs::read_to_string(self.test_dir.join(name));
        let sw = build_sw_timeseries(
            &read(SAR_U_FILE)?,
            &read(SAR_R_FILE)?,
            &read(SAR_N_DEV_FILE)?,
            &read(SAR_D_FILE)?,
        )?;

        let aggregate = build_aggregate(&hw, &sw);
        info!(
            intervals = hw.rows.len(),
            utilization_samples = sw.rows.len(),
            "aggregation finished"
        );

        let started_at = read(PERF_START_FILE)
            .ok()
            .and_then(|text| text.trim().parse::<f64>().ok());

        Ok(AnalysisResult {
            hw,
            sw,
            aggregate,
            started_at,
        })
    }
}

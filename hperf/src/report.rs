use std::io::Write;
use std::path::{Path, PathBuf};

use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, CellAlignment, ContentArrangement, Table};
use num_format::{Locale, ToFormattedString};

use crate::analyze::{AggregatedMetrics, AnalysisResult, HwTimeseries, SwTimeseries, SW_COLUMNS};
use crate::error::Error;
use crate::workdir;

pub const HW_TIMESERIES_FILE: &str = "hw_timeseries.csv";
pub const SW_TIMESERIES_FILE: &str = "sw_timeseries.csv";
pub const AGGREGATED_FILE: &str = "aggregated_metrics.csv";

fn field(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else {
        value.to_string()
    }
}

pub fn write_hw_timeseries<W: Write>(writer: W, hw: &HwTimeseries) -> Result<(), Error> {
    let mut writer = csv::Writer::from_writer(writer);

    let header = std::iter::once("timestamp")
        .chain(hw.event_names.iter().map(String::as_str))
        .chain(hw.metric_names.iter().map(String::as_str));
    writer.write_record(header)?;

    for row in &hw.rows {
        let record = std::iter::once(row.timestamp)
            .chain(row.events.iter().copied())
            .chain(row.metrics.iter().copied())
            .map(field);
        writer.write_record(record)?;
    }

    writer.flush()?;
    Ok(())
}

pub fn write_sw_timeseries<W: Write>(writer: W, sw: &SwTimeseries) -> Result<(), Error> {
    let mut writer = csv::Writer::from_writer(writer);
    writer.write_record(std::iter::once("timestamp").chain(SW_COLUMNS))?;

    for row in &sw.rows {
        let record = std::iter::once(row.timestamp)
            .chain(row.values.iter().copied())
            .map(field);
        writer.write_record(record)?;
    }

    writer.flush()?;
    Ok(())
}

/// Writes the summary as a single row with one column per entry.
pub fn write_aggregate<W: Write>(writer: W, aggregate: &AggregatedMetrics) -> Result<(), Error> {
    let mut writer = csv::Writer::from_writer(writer);
    writer.write_record(aggregate.entries().map(|(name, _)| name.as_str()))?;
    writer.write_record(aggregate.entries().map(|(_, value)| field(*value)))?;
    writer.flush()?;
    Ok(())
}

/// Stores every CSV under `analysis_results/` and returns that directory.
pub fn save_all(test_dir: &Path, result: &AnalysisResult) -> Result<PathBuf, Error> {
    let dir = workdir::analysis_dir(test_dir)?;

    write_hw_timeseries(std::fs::File::create(dir.join(HW_TIMESERIES_FILE))?, &result.hw)?;
    write_sw_timeseries(std::fs::File::create(dir.join(SW_TIMESERIES_FILE))?, &result.sw)?;
    write_aggregate(std::fs::File::create(dir.join(AGGREGATED_FILE))?, &result.aggregate)?;

    Ok(dir)
}

fn display_value(value: f64) -> String {
    if value.is_nan() {
        "-".to_string()
    } else if value.abs() >= 1000.0 && value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        (value as i64).to_formatted_string(&Locale::en)
    } else {
        format!("{value:.3}")
    }
}

pub fn summary_table(aggregate: &AggregatedMetrics) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Name", "Value"]);

    for (name, value) in aggregate.entries() {
        table.add_row(vec![
            Cell::new(name),
            Cell::new(display_value(*value)).set_alignment(CellAlignment::Right),
        ]);
    }

    table
}

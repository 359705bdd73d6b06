//! How busy the monitored thread kept its cores, derived from the recorded cycle deltas and the
//! (fixed) core frequency.

use std::path::{Path, PathBuf};

use clap::clap_app;

use log::warn;

use prettytable::{cell, row, Table};

use crate::{
    stats::{max, mean, median, std_dev},
    tables::{Table as CsvTable, CYCLES_TABLE},
};

/// The fixed core frequency of the reference machines, in Hz.
pub const DEFAULT_FREQ_HZ: f64 = 2.9e9;

/// Utilization statistics over one run, in percent.
#[derive(Clone, Debug, PartialEq)]
pub struct Utilization {
    /// The number of intervals with a valid delta.
    pub intervals: usize,
    pub mean: f64,
    pub std_dev: f64,
    pub median: f64,
    pub max: f64,
    /// The mean over intervals in which the thread ran at all.
    pub active_mean: f64,
    pub active_std_dev: f64,
}

/// The share (in percent, clipped to 0..=100) of `cores` cores at `freq_hz` that `delta` cycles
/// occupy in `interval_sec` seconds.
pub fn interval_utilization(delta: u64, freq_hz: f64, cores: u32, interval_sec: f64) -> f64 {
    let available = freq_hz * f64::from(cores) * interval_sec;
    if available <= 0.0 {
        return 0.0;
    }

    (delta as f64 / available * 100.0).max(0.0).min(100.0)
}

/// Summarize the given cycle deltas. `None` if there are none.
pub fn summarize(
    deltas: &[u64],
    freq_hz: f64,
    cores: u32,
    interval_sec: f64,
) -> Option<Utilization> {
    let util: Vec<f64> = deltas
        .iter()
        .map(|d| interval_utilization(*d, freq_hz, cores, interval_sec))
        .collect();

    let active: Vec<f64> = deltas
        .iter()
        .zip(util.iter())
        .filter(|(d, _)| **d > 0)
        .map(|(_, u)| *u)
        .collect();

    Some(Utilization {
        intervals: util.len(),
        mean: mean(&util)?,
        std_dev: std_dev(&util)?,
        median: median(&util)?,
        max: max(&util)?,
        active_mean: mean(&active).unwrap_or(0.0),
        active_std_dev: std_dev(&active).unwrap_or(0.0),
    })
}

/// The cycle deltas recorded in run directory `dir`, skipping unparsable rows. With a `limit`,
/// reading stops at the first row past `limit` seconds.
pub fn read_deltas(dir: &Path, limit: Option<i64>) -> Result<Vec<u64>, failure::Error> {
    Ok(CsvTable::new(dir, CYCLES_TABLE)
        .read_pairs::<i64, u64>("second", "ksmd_cycles_delta")?
        .into_iter()
        .take_while(|(second, _)| limit.map_or(true, |limit| *second <= limit))
        .map(|(_, delta)| delta)
        .collect())
}

pub fn cli_options() -> clap::App<'static, 'static> {
    fn is_pos_f64(s: String) -> Result<(), String> {
        match s.as_str().parse::<f64>() {
            Ok(v) if v > 0.0 => Ok(()),
            Ok(..) => Err("must be positive".into()),
            Err(e) => Err(format!("{:?}", e)),
        }
    }

    fn is_u32(s: String) -> Result<(), String> {
        s.as_str()
            .parse::<u32>()
            .map(|_| ())
            .map_err(|e| format!("{:?}", e))
    }

    fn is_i64(s: String) -> Result<(), String> {
        s.as_str()
            .parse::<i64>()
            .map(|_| ())
            .map_err(|e| format!("{:?}", e))
    }

    clap_app! { utilization =>
        (about: "Summarize the CPU utilization of the monitored thread in recorded runs.")
        (@arg DIRS: +required +multiple "The run directories")
        (@arg FREQ: --freq +takes_value {is_pos_f64}
         "The fixed frequency of the cores, in Hz (default: 2900000000)")
        (@arg CORES: --cores +takes_value {is_u32}
         "The number of cores the thread is pinned to (default: 1)")
        (@arg INTERVAL: --interval +takes_value {is_pos_f64}
         "The reporting interval of the runs in seconds (default: 1)")
        (@arg LIMIT: --limit +takes_value {is_i64}
         "Only consider the first LIMIT seconds of each run")
    }
}

pub fn run(sub_m: &clap::ArgMatches<'_>) -> Result<(), failure::Error> {
    let dirs: Vec<PathBuf> = sub_m
        .values_of("DIRS")
        .map(|dirs| dirs.map(PathBuf::from).collect())
        .unwrap_or_default();
    let freq = sub_m
        .value_of("FREQ")
        .map(str::parse::<f64>)
        .transpose()?
        .unwrap_or(DEFAULT_FREQ_HZ);
    let cores = sub_m.value_of("CORES").unwrap_or("1").parse::<u32>()?;
    let interval = sub_m.value_of("INTERVAL").unwrap_or("1").parse::<f64>()?;
    let limit = sub_m
        .value_of("LIMIT")
        .map(str::parse::<i64>)
        .transpose()?;

    println!(
        "{:.2} GHz x {} core(s) x {} s = {:.2e} cycles per interval",
        freq / 1e9,
        cores,
        interval,
        freq * f64::from(cores) * interval
    );

    let mut table = Table::new();
    table.set_format(*prettytable::format::consts::FORMAT_CLEAN);
    table.set_titles(row![ Fwbu =>
        "Directory", "Intervals", "Mean", "Std Dev", "Median", "Max", "Active Mean",
        "Active Std Dev"
    ]);

    for dir in &dirs {
        if !CsvTable::new(dir, CYCLES_TABLE).path().exists() {
            warn!("Skipping {}: no {}", dir.display(), CYCLES_TABLE);
            continue;
        }

        let deltas = match read_deltas(dir, limit) {
            Ok(deltas) => deltas,
            Err(err) => {
                warn!("Skipping {}: {}", dir.display(), err);
                continue;
            }
        };

        match summarize(&deltas, freq, cores, interval) {
            Some(util) => {
                let pct = |v: f64| format!("{:.2}%", v);
                table.add_row(row![
                    b->dir.display(),
                    r->util.intervals,
                    r->pct(util.mean),
                    r->pct(util.std_dev),
                    r->pct(util.median),
                    r->pct(util.max),
                    r->pct(util.active_mean),
                    r->pct(util.active_std_dev)
                ]);
            }
            None => warn!("No valid cycle data in {}", dir.display()),
        }
    }

    if table.len() == 0 {
        failure::bail!("No data found in any directory.");
    }

    table.printstd();

    Ok(())
}

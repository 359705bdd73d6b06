//! Compare how fast KSM scanned pages in several recorded runs, both per second of wall-clock
//! time and per cycle spent in `ksmd`, over the first `limit` seconds of each run.

use std::path::{Path, PathBuf};

use clap::clap_app;

use itertools::Itertools;

use log::warn;

use prettytable::{cell, row, Table};

use crate::tables::{Table as CsvTable, CYCLES_TABLE, PAGES_TABLE};

/// The throughput figures of one run. Fields are `None` when they cannot be computed (missing
/// data, division by zero).
#[derive(Clone, Debug, PartialEq)]
pub struct RunThroughput {
    pub label: String,
    /// `pages_scanned` at the last recorded second within the limit.
    pub pages: Option<i64>,
    /// Total `ksmd` cycles within the limit.
    pub cycles: Option<u64>,
    /// Pages per second.
    pub total_tput: Option<f64>,
    /// Pages per cycle.
    pub effective_tput: Option<f64>,
    pub cycles_per_page: Option<f64>,
    /// Microseconds per page.
    pub usec_per_page: Option<f64>,
    /// The first problem encountered, if any.
    pub error: Option<String>,
}

/// The last non-sentinel `pages_scanned` value at or before `limit` seconds. Reading stops at the
/// first row past the limit.
pub fn final_pages_scanned(dir: &Path, limit: i64) -> Result<i64, String> {
    let table = CsvTable::new(dir, PAGES_TABLE);
    if !table.path().exists() {
        return Err(format!("Missing {}", PAGES_TABLE));
    }

    let rows = table
        .read_int_pairs("second", "pages_scanned")
        .map_err(|err| format!("ReadErr:{}", err))?;

    let mut latest = None;
    for (second, pages) in rows {
        if second > limit {
            break;
        }
        if pages >= 0 {
            latest = Some(pages);
        }
    }

    latest.ok_or_else(|| format!("No pages <= {}s", limit))
}

/// The sum of the cycle deltas at or before `limit` seconds, saturating at `u64::MAX`. The second
/// element describes a problem, if any; an empty table still yields `Some(0)` with a "no cycles"
/// problem.
pub fn total_cycles(dir: &Path, limit: i64) -> (Option<u64>, Option<String>) {
    let table = CsvTable::new(dir, CYCLES_TABLE);
    if !table.path().exists() {
        return (None, Some(format!("Missing {}", CYCLES_TABLE)));
    }

    let rows = match table.read_pairs::<i64, u64>("second", "ksmd_cycles_delta") {
        Ok(rows) => rows,
        Err(err) => return (None, Some(format!("ReadErr:{}", err))),
    };

    let within: Vec<u64> = rows
        .into_iter()
        .filter(|(second, _)| *second <= limit)
        .map(|(_, delta)| delta)
        .collect();

    if within.is_empty() && limit > 0 {
        (Some(0), Some(format!("No cycles <= {}s", limit)))
    } else {
        (Some(within.iter().fold(0u64, |sum, d| sum.saturating_add(*d))), None)
    }
}

/// Compute all throughput figures of the run recorded in `dir`.
pub fn compute(dir: &Path, label: &str, limit: i64) -> RunThroughput {
    let (pages, pages_err) = match final_pages_scanned(dir, limit) {
        Ok(pages) => (Some(pages), None),
        Err(err) => (None, Some(err)),
    };
    let (cycles, cycles_err) = total_cycles(dir, limit);

    let mut run = RunThroughput {
        label: label.into(),
        pages,
        cycles,
        total_tput: None,
        effective_tput: None,
        cycles_per_page: None,
        usec_per_page: None,
        error: pages_err.or(cycles_err),
    };

    if let Some(pages) = pages {
        if limit > 0 {
            run.total_tput = Some(pages as f64 / limit as f64);
            if pages > 0 {
                run.usec_per_page = Some(limit as f64 * 1e6 / pages as f64);
            }
        }

        if let Some(cycles) = cycles {
            if pages > 0 {
                run.cycles_per_page = Some(cycles as f64 / pages as f64);
            }
            if cycles > 0 {
                run.effective_tput = Some(pages as f64 / cycles as f64);
            }
        }
    }

    run
}

/// The position and value of the first defined value of a column.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Baseline {
    pub index: usize,
    pub value: f64,
}

pub fn baseline<F>(runs: &[RunThroughput], column: F) -> Option<Baseline>
where
    F: Fn(&RunThroughput) -> Option<f64>,
{
    runs.iter()
        .enumerate()
        .find_map(|(index, run)| column(run).map(|value| Baseline { index, value }))
}

/// `value` with its ratio to the baseline, e.g. `12.50 (2.00x)`.
fn relative(value: f64, formatted: String, index: usize, base: Option<Baseline>) -> String {
    match base {
        Some(base) if base.value > 0.0 => {
            if base.index == index {
                format!("{} (1.00x)", formatted)
            } else {
                format!("{} ({:.2}x)", formatted, value / base.value)
            }
        }
        _ => formatted,
    }
}

/// Format an integer with thousands separators.
pub fn group_digits<N: Into<i128>>(n: N) -> String {
    let n = n.into();
    let digits = n.unsigned_abs().to_string();
    let first = digits.len() % 3;

    let mut groups = Vec::new();
    if first > 0 {
        groups.push(&digits[..first]);
    }
    groups.extend((first..digits.len()).step_by(3).map(|i| &digits[i..i + 3]));

    let grouped = groups.iter().join(",");
    if n < 0 {
        format!("-{}", grouped)
    } else {
        grouped
    }
}

/// Build the comparison table.
pub fn render(runs: &[RunThroughput], limit: i64) -> Table {
    let base_total = baseline(runs, |r| r.total_tput);
    let base_effective = baseline(runs, |r| r.effective_tput);
    let base_usec = baseline(runs, |r| r.usec_per_page);

    let mut table = Table::new();
    table.set_format(*prettytable::format::consts::FORMAT_CLEAN);
    table.set_titles(row![ Fwbu =>
        "Label", "Pages Scanned", "KSMD Cycles", "Total Tput (pg/s)", "Effective Tput (pg/cyc)",
        "Cycles/Page", "µs/Page"
    ]);

    for (i, run) in runs.iter().enumerate() {
        if let Some(error) = &run.error {
            let err = format!("Err:{}", error);
            table.add_row(row![b->run.label, Fr->err, Fr->err, Fr->err, Fr->err, Fr->err, Fr->err]);
            continue;
        }

        let na = || "N/A".to_owned();

        let pages = run.pages.map(group_digits).unwrap_or_else(na);
        let cycles = run.cycles.map(group_digits).unwrap_or_else(na);

        let total = match run.total_tput {
            Some(v) => relative(v, format!("{:.2}", v), i, base_total),
            None if limit <= 0 => "N/A (lim<=0)".into(),
            None => na(),
        };

        let effective = match run.effective_tput {
            Some(v) => relative(v, format!("{:.8}", v), i, base_effective),
            None if run.pages.is_some() && run.cycles == Some(0) => "N/A (Cyc=0)".into(),
            None => na(),
        };

        let per_page = match run.cycles_per_page {
            Some(v) => format!("{:.2}", v),
            None if run.cycles.is_some() && run.pages == Some(0) => "N/A (Pg=0)".into(),
            None => na(),
        };

        let usec = match run.usec_per_page {
            Some(v) => relative(v, format!("{:.2}", v), i, base_usec),
            None if run.pages == Some(0) && limit > 0 => "N/A (Pg=0)".into(),
            None if run.pages.is_some() && limit <= 0 => "N/A (lim<=0)".into(),
            None => na(),
        };

        table.add_row(row![b->run.label, r->pages, r->cycles, r->total, r->effective, r->per_page, r->usec]);
    }

    table
}

/// The label of a run directory: its last path component.
fn default_label(dir: &Path) -> String {
    dir.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| dir.display().to_string())
}

/// Pair the `DIRS` of `sub_m` with their `LABELS` (or default labels), dropping directories that
/// don't exist. Fails if the label count is off or no directory remains.
pub fn labelled_dirs(
    sub_m: &clap::ArgMatches<'_>,
) -> Result<Vec<(PathBuf, String)>, failure::Error> {
    let dirs: Vec<PathBuf> = sub_m
        .values_of("DIRS")
        .map(|dirs| dirs.map(PathBuf::from).collect())
        .unwrap_or_default();
    let labels: Option<Vec<String>> = sub_m
        .values_of("LABELS")
        .map(|labels| labels.map(Into::into).collect());

    if let Some(labels) = &labels {
        if labels.len() != dirs.len() {
            failure::bail!(
                "{} labels given for {} directories",
                labels.len(),
                dirs.len()
            );
        }
    }

    // Drop directories that don't exist, along with their labels.
    let runs: Vec<(PathBuf, String)> = dirs
        .into_iter()
        .enumerate()
        .filter_map(|(i, dir)| {
            if dir.is_dir() {
                let label = match &labels {
                    Some(labels) => labels[i].clone(),
                    None => default_label(&dir),
                };
                Some((dir, label))
            } else {
                warn!("Skipping {}: not a directory", dir.display());
                None
            }
        })
        .collect();

    if runs.is_empty() {
        failure::bail!("No valid directories found to process.");
    }

    Ok(runs)
}

pub fn cli_options() -> clap::App<'static, 'static> {
    fn is_i64(s: String) -> Result<(), String> {
        s.as_str()
            .parse::<i64>()
            .map(|_| ())
            .map_err(|e| format!("{:?}", e))
    }

    clap_app! { throughput =>
        (about: "Compare the KSM scan throughput of recorded runs.")
        (@arg DIRS: +required +multiple
         "The run directories to compare. The first one with data is the baseline.")
        (@arg LIMIT: --limit +required +takes_value {is_i64}
         "Only consider the first LIMIT seconds of each run")
        (@arg LABELS: --labels +takes_value +multiple
         "A label for each directory (default: the directory names)")
    }
}

pub fn run(sub_m: &clap::ArgMatches<'_>) -> Result<(), failure::Error> {
    let limit = sub_m.value_of("LIMIT").unwrap_or("0").parse::<i64>()?;
    let runs = labelled_dirs(sub_m)?;

    let results: Vec<RunThroughput> = runs
        .iter()
        .map(|(dir, label)| compute(dir, label, limit))
        .collect();

    render(&results, limit).printstd();

    Ok(())
}

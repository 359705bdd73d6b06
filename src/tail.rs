//! Compare the tail latency of two Redis/YCSB configurations using the geometric mean of one
//! latency percentile across the core YCSB workloads.

use std::path::Path;

use clap::clap_app;

use failure::ResultExt;

use crate::stats::geometric_mean;

/// The (workload suffix, operations) pairs that enter the mean.
pub const WORKLOAD_OPS: &[(&str, &[&str])] = &[
    ("a", &["READ", "UPDATE"]),
    ("b", &["READ", "UPDATE"]),
    ("c", &["READ"]),
    ("d", &["READ", "INSERT"]),
];

pub const DEFAULT_CSV: &str = "all_union_summaries.csv";
pub const DEFAULT_METRIC: &str = "99.900ptile";

/// One row of a union-summary table.
#[derive(Clone, Debug)]
pub struct SummaryRow {
    pub group: String,
    pub operation: String,
    /// The chosen metric, if the row has a number there.
    pub value: Option<f64>,
}

/// Read the `group`, `operation` and `metric` columns of a union-summary CSV.
pub fn read_summaries(path: &Path, metric: &str) -> Result<Vec<SummaryRow>, failure::Error> {
    let mut reader =
        csv::Reader::from_path(path).with_context(|_| format!("opening {}", path.display()))?;

    let headers = reader.headers()?.clone();
    let column = |name: &str| headers.iter().position(|h| h.trim() == name);

    let group = column("group")
        .ok_or_else(|| failure::format_err!("{} has no `group` column", path.display()))?;
    let operation = column("operation")
        .ok_or_else(|| failure::format_err!("{} has no `operation` column", path.display()))?;
    let metric = column(metric);

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.with_context(|_| format!("reading {}", path.display()))?;

        rows.push(SummaryRow {
            group: record.get(group).unwrap_or("").trim().to_owned(),
            operation: record.get(operation).unwrap_or("").trim().to_owned(),
            value: metric
                .and_then(|i| record.get(i))
                .and_then(|v| v.trim().parse::<f64>().ok()),
        });
    }

    Ok(rows)
}

/// The geometric mean of the metric over the workload operations of configuration `config`, or
/// `None` if there is no usable value.
///
/// For each (workload, operation) pair, the first row of the configuration whose group ends with
/// `_<workload>` is used.
pub fn config_geomean(rows: &[SummaryRow], config: &str) -> Option<f64> {
    let prefix = format!("{}_", config);
    let config_rows: Vec<&SummaryRow> = rows
        .iter()
        .filter(|r| r.group.starts_with(&prefix))
        .collect();

    let mut latencies = Vec::new();
    for (workload, operations) in WORKLOAD_OPS {
        let suffix = format!("_{}", workload);
        for op in operations.iter() {
            let value = config_rows
                .iter()
                .find(|r| r.group.ends_with(&suffix) && r.operation == *op)
                .and_then(|r| r.value);

            if let Some(value) = value {
                if value.is_finite() && value > 0.0 {
                    latencies.push(value);
                }
            }
        }
    }

    geometric_mean(&latencies)
}

pub fn cli_options() -> clap::App<'static, 'static> {
    clap_app! { tail =>
        (about: "Compare the geometric-mean tail latency of two configurations.")
        (@arg BASELINE: +required "The baseline configuration (usually the best performing)")
        (@arg TARGET: +required "The configuration to compare")
        (@arg CSV: --csv +takes_value "The summary table (default: all_union_summaries.csv)")
        (@arg METRIC: --metric +takes_value "The latency column (default: 99.900ptile)")
    }
}

pub fn run(sub_m: &clap::ArgMatches<'_>) -> Result<(), failure::Error> {
    let baseline = sub_m.value_of("BASELINE").unwrap();
    let target = sub_m.value_of("TARGET").unwrap();
    let csv = Path::new(sub_m.value_of("CSV").unwrap_or(DEFAULT_CSV));
    let metric = sub_m.value_of("METRIC").unwrap_or(DEFAULT_METRIC);

    let rows = read_summaries(csv, metric)?;

    let (base_mean, target_mean) = match (
        config_geomean(&rows, baseline),
        config_geomean(&rows, target),
    ) {
        (Some(b), Some(t)) => (b, t),
        _ => failure::bail!("Could not calculate geometric means"),
    };

    println!("{}: {:.2}µs", baseline, base_mean);
    println!("{}: {:.2}µs", target, target_mean);
    println!(
        "{} is {:.2}x vs {}",
        target,
        target_mean / base_mean,
        baseline
    );

    Ok(())
}

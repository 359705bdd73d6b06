//! How much memory KSM saved over the course of recorded runs, and when each run first reached a
//! given amount of savings.

use std::path::Path;

use clap::clap_app;

use log::warn;

use prettytable::{cell, row, Table};

use crate::{
    tables::{Table as CsvTable, MEMORY_TABLE, PAGES_TABLE},
    throughput::labelled_dirs,
};

/// The page size the KSM counters are in.
pub const PAGE_SIZE_BYTES: f64 = 4096.0;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// The savings of one run over time.
#[derive(Clone, Debug, PartialEq)]
pub struct SharingSummary {
    pub label: String,
    /// The number of samples within the limit.
    pub samples: usize,
    /// Savings at the last sample, in GiB.
    pub final_gib: Option<f64>,
    pub peak_gib: Option<f64>,
    /// The peak RAM usage of the system, in GiB, if the memory table is present.
    pub peak_ram_gib: Option<f64>,
    /// The first (second, savings) at which the savings reached the mark.
    pub mark_reached: Option<(i64, f64)>,
    pub error: Option<String>,
}

/// Read column `column` of table `name` as GiB (after multiplying by `scale`), stopping at the
/// first row past `limit` seconds. Negative values (read failures) are skipped.
fn gib_series(
    dir: &Path,
    name: &str,
    column: &str,
    scale: f64,
    limit: Option<i64>,
) -> Result<Vec<(i64, f64)>, failure::Error> {
    Ok(CsvTable::new(dir, name)
        .read_int_pairs("second", column)?
        .into_iter()
        .take_while(|(second, _)| limit.map_or(true, |limit| *second <= limit))
        .filter(|(_, value)| *value >= 0)
        .map(|(second, value)| (second, value as f64 * scale / GIB))
        .collect())
}

/// The memory KSM saves over time, i.e. `pages_sharing` in GiB.
pub fn savings_series(dir: &Path, limit: Option<i64>) -> Result<Vec<(i64, f64)>, failure::Error> {
    gib_series(dir, PAGES_TABLE, "pages_sharing", PAGE_SIZE_BYTES, limit)
}

/// The RAM in use over time, in GiB.
pub fn ram_series(dir: &Path, limit: Option<i64>) -> Result<Vec<(i64, f64)>, failure::Error> {
    gib_series(dir, MEMORY_TABLE, "ram_used_bytes", 1.0, limit)
}

/// The first sample at which the value reaches `mark`.
pub fn first_crossing(series: &[(i64, f64)], mark: f64) -> Option<(i64, f64)> {
    series.iter().cloned().find(|(_, value)| *value >= mark)
}

fn peak(series: &[(i64, f64)]) -> Option<f64> {
    series
        .iter()
        .map(|(_, value)| *value)
        .fold(None, |acc, v| match acc {
            Some(m) if m >= v => Some(m),
            _ => Some(v),
        })
}

/// Summarize the run recorded in `dir`.
pub fn summarize(dir: &Path, label: &str, limit: Option<i64>, mark: Option<f64>) -> SharingSummary {
    let mut summary = SharingSummary {
        label: label.into(),
        samples: 0,
        final_gib: None,
        peak_gib: None,
        peak_ram_gib: None,
        mark_reached: None,
        error: None,
    };

    if !CsvTable::new(dir, PAGES_TABLE).path().exists() {
        summary.error = Some(format!("Missing {}", PAGES_TABLE));
        return summary;
    }

    let savings = match savings_series(dir, limit) {
        Ok(savings) => savings,
        Err(err) => {
            summary.error = Some(format!("ReadErr:{}", err));
            return summary;
        }
    };

    summary.samples = savings.len();
    summary.final_gib = savings.last().map(|(_, value)| *value);
    summary.peak_gib = peak(&savings);
    summary.mark_reached = mark.and_then(|mark| first_crossing(&savings, mark));

    match ram_series(dir, limit) {
        Ok(ram) => summary.peak_ram_gib = peak(&ram),
        Err(err) => warn!("No memory usage for {}: {}", label, err),
    }

    summary
}

/// Build the summary table. The mark column is only present with a mark.
pub fn render(runs: &[SharingSummary], mark: Option<f64>) -> Table {
    let gib = |v: Option<f64>| v.map_or_else(|| "N/A".to_owned(), |v| format!("{:.2}", v));

    let mut table = Table::new();
    table.set_format(*prettytable::format::consts::FORMAT_CLEAN);

    let mut titles = row![ Fwbu =>
        "Label", "Samples", "Final Savings (GiB)", "Peak Savings (GiB)", "Peak RAM Used (GiB)"
    ];
    if let Some(mark) = mark {
        titles.add_cell(cell!(Fwbu->format!("Reached {} GiB", mark)));
    }
    table.set_titles(titles);

    for run in runs {
        if let Some(error) = &run.error {
            table.add_row(row![b->run.label, Fr->format!("Err:{}", error)]);
            continue;
        }

        let mut row = row![
            b->run.label,
            r->run.samples,
            r->gib(run.final_gib),
            r->gib(run.peak_gib),
            r->gib(run.peak_ram_gib)
        ];
        if mark.is_some() {
            match run.mark_reached {
                Some((second, _)) => row.add_cell(cell!(Fg->format!("{}s", second))),
                None => row.add_cell(cell!(Fy->"never")),
            }
        }
        table.add_row(row);
    }

    table
}

pub fn cli_options() -> clap::App<'static, 'static> {
    fn is_i64(s: String) -> Result<(), String> {
        s.as_str()
            .parse::<i64>()
            .map(|_| ())
            .map_err(|e| format!("{:?}", e))
    }

    fn is_f64(s: String) -> Result<(), String> {
        s.as_str()
            .parse::<f64>()
            .map(|_| ())
            .map_err(|e| format!("{:?}", e))
    }

    clap_app! { sharing =>
        (about: "Summarize the memory saved by KSM in recorded runs.")
        (@arg DIRS: +required +multiple "The run directories")
        (@arg LIMIT: --limit +takes_value {is_i64}
         "Only consider the first LIMIT seconds of each run")
        (@arg MARK: --mark +takes_value {is_f64}
         "Report when each run first saved at least MARK GiB")
        (@arg LABELS: --labels +takes_value +multiple
         "A label for each directory (default: the directory names)")
    }
}

pub fn run(sub_m: &clap::ArgMatches<'_>) -> Result<(), failure::Error> {
    let limit = sub_m
        .value_of("LIMIT")
        .map(str::parse::<i64>)
        .transpose()?;
    let mark = sub_m
        .value_of("MARK")
        .map(str::parse::<f64>)
        .transpose()?;
    let runs = labelled_dirs(sub_m)?;

    let results: Vec<SharingSummary> = runs
        .iter()
        .map(|(dir, label)| summarize(dir, label, limit, mark))
        .collect();

    render(&results, mark).printstd();

    Ok(())
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::path::Path;

    use super::{cli_options, first_crossing, render, savings_series, summarize, GIB};
    use crate::throughput::labelled_dirs;

    /// Pages per GiB.
    const PAGES_PER_GIB: i64 = 262_144;

    fn write_run(dir: &Path, sharing: &[(i64, i64)], ram: &[(i64, i64)]) {
        fs::create_dir_all(dir).unwrap();

        let mut pages = String::from(
            "second,pages_scanned,pages_shared,pages_sharing,pages_volatile,pages_unshared\n",
        );
        for (second, value) in sharing {
            pages.push_str(&format!("{},0,0,{},0,0\n", second, value));
        }
        fs::write(dir.join("ksm_stats.csv"), pages).unwrap();

        let mut memory = String::from("second,ram_used_bytes,swap_used_bytes\n");
        for (second, value) in ram {
            memory.push_str(&format!("{},{},0\n", second, value));
        }
        fs::write(dir.join("memory_usage.csv"), memory).unwrap();
    }

    #[test]
    fn savings_in_gib() {
        let tmp = tempfile::tempdir().unwrap();
        write_run(
            tmp.path(),
            &[(1, PAGES_PER_GIB), (2, -2), (3, 3 * PAGES_PER_GIB), (4, 4 * PAGES_PER_GIB)],
            &[],
        );

        assert_eq!(
            savings_series(tmp.path(), None).unwrap(),
            vec![(1, 1.0), (3, 3.0), (4, 4.0)]
        );
        assert_eq!(
            savings_series(tmp.path(), Some(3)).unwrap(),
            vec![(1, 1.0), (3, 3.0)]
        );
    }

    #[test]
    fn crossing() {
        let series = [(1, 0.5), (2, 1.5), (3, 1.2), (4, 2.5)];
        assert_eq!(first_crossing(&series, 1.5), Some((2, 1.5)));
        assert_eq!(first_crossing(&series, 2.0), Some((4, 2.5)));
        assert_eq!(first_crossing(&series, 3.0), None);
        assert_eq!(first_crossing(&[], 0.0), None);
    }

    #[test]
    fn summary_with_mark_and_limit() {
        let tmp = tempfile::tempdir().unwrap();
        write_run(
            tmp.path(),
            &[(1, PAGES_PER_GIB), (2, 2 * PAGES_PER_GIB), (3, PAGES_PER_GIB), (9, 8 * PAGES_PER_GIB)],
            &[(1, 4 * GIB as i64), (2, 6 * GIB as i64), (9, 10 * GIB as i64)],
        );

        let s = summarize(tmp.path(), "a", Some(5), Some(2.0));
        assert_eq!(s.error, None);
        assert_eq!(s.samples, 3);
        assert_eq!(s.final_gib, Some(1.0));
        assert_eq!(s.peak_gib, Some(2.0));
        assert_eq!(s.peak_ram_gib, Some(6.0));
        assert_eq!(s.mark_reached, Some((2, 2.0)));

        // Past the limit only.
        let s = summarize(tmp.path(), "a", Some(5), Some(5.0));
        assert_eq!(s.mark_reached, None);
        let s = summarize(tmp.path(), "a", None, Some(5.0));
        assert_eq!(s.mark_reached, Some((9, 8.0)));
    }

    #[test]
    fn missing_tables() {
        let tmp = tempfile::tempdir().unwrap();
        let s = summarize(tmp.path(), "empty", None, None);
        assert_eq!(s.error.as_deref(), Some("Missing ksm_stats.csv"));

        // The memory table is optional.
        write_run(tmp.path(), &[(1, PAGES_PER_GIB)], &[]);
        fs::remove_file(tmp.path().join("memory_usage.csv")).unwrap();
        let s = summarize(tmp.path(), "no-mem", None, None);
        assert_eq!(s.error, None);
        assert_eq!(s.peak_ram_gib, None);
        assert_eq!(s.final_gib, Some(1.0));
    }

    #[test]
    fn table() {
        let tmp = tempfile::tempdir().unwrap();
        let (a, b) = (tmp.path().join("a"), tmp.path().join("b"));
        write_run(&a, &[(1, PAGES_PER_GIB), (7, 2 * PAGES_PER_GIB)], &[]);
        write_run(&b, &[(1, PAGES_PER_GIB)], &[]);

        let runs = vec![
            summarize(&a, "a", None, Some(2.0)),
            summarize(&b, "b", None, Some(2.0)),
            summarize(&tmp.path().join("c"), "c", None, Some(2.0)),
        ];

        let table = render(&runs, Some(2.0));
        table.printstd();

        let rendered = table.to_string();
        assert!(rendered.contains("Reached 2 GiB"));
        assert!(rendered.contains("7s"));
        assert!(rendered.contains("never"));
        assert!(rendered.contains("Err:Missing ksm_stats.csv"));

        assert!(!render(&runs, None).to_string().contains("Reached"));
    }

    #[test]
    fn labels_follow_their_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let (a, b) = (tmp.path().join("a"), tmp.path().join("b"));
        write_run(&a, &[(1, PAGES_PER_GIB)], &[]);
        write_run(&b, &[(1, PAGES_PER_GIB)], &[]);
        let gone = tmp.path().join("gone");

        let args = |labels: &[&str]| {
            let mut args = vec!["sharing".to_owned()];
            args.extend([&a, &gone, &b].iter().map(|d| d.display().to_string()));
            args.extend(vec!["--mark".to_owned(), "0.5".to_owned()]);
            if !labels.is_empty() {
                args.push("--labels".into());
                args.extend(labels.iter().map(|l| l.to_string()));
            }
            cli_options().get_matches_from_safe(args).unwrap()
        };

        let runs = labelled_dirs(&args(&["x", "y", "z"])).unwrap();
        assert_eq!(runs, vec![(a.clone(), "x".to_owned()), (b.clone(), "z".to_owned())]);

        let runs = labelled_dirs(&args(&[])).unwrap();
        assert_eq!(runs[1].1, "b");

        assert!(labelled_dirs(&args(&["x"])).is_err());

        let matches = args(&[]);
        assert_eq!(matches.value_of("MARK"), Some("0.5"));
    }
}

//! Merge failure statistics from the kernel log of a KSM-instrumented kernel.
//!
//! At the end of every scan the kernel prints one `[Failure Statistics]` line with the number of
//! stable merges, unstable merges, explicit failures and implicit failures, usually followed by a
//! breakdown of the explicit failures:
//!
//! ```text
//! [  812.402113] [Failure Statistics], 5120, 311, 87, 12
//! [  812.402119] Merge failure reasons:
//! [  812.402121] [pages_are_not_identical], 80
//! [  812.402124] [page_locked], 7
//! ```
//!
//! Each such block is one "index". We report rates per index, over the first few indexes (before
//! the merging stabilizes), and over the whole log.

use std::collections::BTreeMap;
use std::path::Path;

use clap::clap_app;

use failure::ResultExt;

use log::info;

use regex::Regex;

use serde::Serialize;

/// The number of indexes that make up the warm-up phase.
pub const BEFORE_STABILIZE_INDEXES: usize = 3;

/// The (normalized) reason explicit failures are attributed to when the contents differ.
pub const NOT_IDENTICAL_REASON: &str = "pages are not identical";

const TIMESTAMP_RE: &str = r"\[\s*\d+\.\d+\]";
const STATS_RE: &str = r"\[Failure Statistics\],\s*(\d+),\s*(\d+),\s*(\d+),\s*(\d+)";
const REASONS_HEADER_RE: &str = r"Merge failure reasons:\s*$";
const REASON_RE: &str = r"\[\s*\d+\.\d+\]\s*\[\s*([A-Za-z0-9_ ]+)\s*\]\s*,\s*(\d+)\s*$";

/// The columns of the CSV report, in order.
const CSV_HEADER: &[&str] = &[
    "stable_merge",
    "unstable_merge",
    "explicit_fail",
    "implicit_fail",
    "total_trials",
    "total_fail",
    "pages_not_identical",
    "etc_count",
    "total_fail_rate",
    "pages_not_identical_rate",
    "implicit_rate",
    "etc_rate",
];

/// One `[Failure Statistics]` block and the reasons listed after it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FailureBlock {
    pub stable_merge: u64,
    pub unstable_merge: u64,
    pub explicit_fail: u64,
    pub implicit_fail: u64,
    /// Reason name (as printed) to count.
    pub reasons: BTreeMap<String, u64>,
}

impl FailureBlock {
    /// The explicit failures attributed to differing page contents.
    pub fn pages_not_identical(&self) -> u64 {
        self.reasons
            .iter()
            .filter(|(name, _)| normalize_reason(name) == NOT_IDENTICAL_REASON)
            .fold(0u64, |sum, (_, count)| sum.saturating_add(*count))
    }
}

/// Lowercase, `_` as space, runs of whitespace collapsed.
pub fn normalize_reason(name: &str) -> String {
    name.replace('_', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Splits a kernel log into timestamped chunks and finds the failure blocks in them.
pub struct FailureLogParser {
    timestamp: Regex,
    stats: Regex,
    reasons_header: Regex,
    reason: Regex,
}

impl FailureLogParser {
    pub fn new() -> Result<Self, failure::Error> {
        Ok(FailureLogParser {
            timestamp: Regex::new(TIMESTAMP_RE)?,
            stats: Regex::new(STATS_RE)?,
            reasons_header: Regex::new(REASONS_HEADER_RE)?,
            reason: Regex::new(REASON_RE)?,
        })
    }

    /// Split `text` in front of every `[ <seconds>.<fraction>]` timestamp. Chunks are trimmed and
    /// empty ones dropped. Anything before the first timestamp is a chunk of its own.
    pub fn chunks<'t>(&self, text: &'t str) -> Vec<&'t str> {
        let mut bounds = vec![0];
        bounds.extend(self.timestamp.find_iter(text).map(|m| m.start()));
        bounds.push(text.len());

        bounds
            .windows(2)
            .map(|w| text[w[0]..w[1]].trim())
            .filter(|chunk| !chunk.is_empty())
            .collect()
    }

    /// The four counts of a `[Failure Statistics]` chunk.
    fn counts(&self, chunk: &str) -> Option<[u64; 4]> {
        let caps = self.stats.captures(chunk)?;
        let mut counts = [0; 4];
        for (i, count) in counts.iter_mut().enumerate() {
            *count = caps[i + 1].parse().ok()?;
        }
        Some(counts)
    }

    /// A `[ <ts>] [<name>], <count>` reason line.
    fn reason(&self, chunk: &str) -> Option<(String, u64)> {
        let caps = self.reason.captures(chunk)?;
        Some((caps[1].trim().to_owned(), caps[2].parse().ok()?))
    }

    /// All failure blocks in `text`, in order.
    ///
    /// The reasons of a block are the reason lines directly following the first `Merge failure
    /// reasons:` chunk after it. Unrelated chunks before that header are skipped, but another
    /// statistics chunk ends the search. The first chunk after the header that is not a reason
    /// line ends the list.
    pub fn parse(&self, text: &str) -> Vec<FailureBlock> {
        let chunks = self.chunks(text);
        let mut blocks = Vec::new();

        for (i, chunk) in chunks.iter().enumerate() {
            let [stable_merge, unstable_merge, explicit_fail, implicit_fail] =
                match self.counts(chunk) {
                    Some(counts) => counts,
                    None => continue,
                };

            let mut rest = chunks[i + 1..].iter();
            let mut saw_header = false;
            for next in &mut rest {
                if self.reasons_header.is_match(next) {
                    saw_header = true;
                    break;
                }
                if self.stats.is_match(next) {
                    break;
                }
            }

            let mut reasons = BTreeMap::new();
            if saw_header {
                for next in rest {
                    match self.reason(next) {
                        Some((name, count)) => {
                            reasons.insert(name, count);
                        }
                        None => break,
                    }
                }
            }

            blocks.push(FailureBlock {
                stable_merge,
                unstable_merge,
                explicit_fail,
                implicit_fail,
                reasons,
            });
        }

        blocks
    }
}

/// The unformatted rates; `None` where the denominator is zero.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RawRates {
    pub total_fail_rate: Option<f64>,
    pub pages_not_identical_rate: Option<f64>,
    pub implicit_rate: Option<f64>,
    pub etc_rate: Option<f64>,
}

/// Failure statistics over one or more blocks.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FailureStats {
    pub stable_merge: u64,
    pub unstable_merge: u64,
    pub explicit_fail: u64,
    pub implicit_fail: u64,
    pub total_trials: u64,
    pub total_fail: u64,
    pub pages_not_identical: u64,
    /// Explicit failures for any other reason.
    pub etc_count: u64,
    pub total_fail_rate: String,
    pub pages_not_identical_rate: String,
    pub implicit_rate: String,
    pub etc_rate: String,
    #[serde(rename = "_raw")]
    pub raw: RawRates,
    #[serde(rename = "_indexes_used", skip_serializing_if = "Option::is_none")]
    pub indexes_used: Option<usize>,
}

fn ratio(num: u64, denom: u64) -> Option<f64> {
    if denom > 0 {
        Some(num as f64 / denom as f64)
    } else {
        None
    }
}

fn pct(rate: Option<f64>) -> String {
    rate.map_or_else(|| "NA".to_owned(), |r| format!("{:.2}%", r * 100.0))
}

impl FailureStats {
    /// Sum the counts of `blocks` and compute the rates of the sums.
    pub fn over(blocks: &[FailureBlock]) -> Self {
        let sum = |f: fn(&FailureBlock) -> u64| {
            blocks
                .iter()
                .map(f)
                .fold(0u64, |sum, v| sum.saturating_add(v))
        };

        let stable_merge = sum(|b| b.stable_merge);
        let unstable_merge = sum(|b| b.unstable_merge);
        let explicit_fail = sum(|b| b.explicit_fail);
        let implicit_fail = sum(|b| b.implicit_fail);
        let pages_not_identical = sum(FailureBlock::pages_not_identical);

        let total_trials = stable_merge
            .saturating_add(unstable_merge)
            .saturating_add(explicit_fail)
            .saturating_add(implicit_fail);
        let total_fail = explicit_fail.saturating_add(implicit_fail);
        let etc_count = explicit_fail.saturating_sub(pages_not_identical);

        let raw = RawRates {
            total_fail_rate: ratio(total_fail, total_trials),
            pages_not_identical_rate: ratio(pages_not_identical, total_fail),
            implicit_rate: ratio(implicit_fail, total_fail),
            etc_rate: ratio(etc_count, total_fail),
        };

        FailureStats {
            stable_merge,
            unstable_merge,
            explicit_fail,
            implicit_fail,
            total_trials,
            total_fail,
            pages_not_identical,
            etc_count,
            total_fail_rate: pct(raw.total_fail_rate),
            pages_not_identical_rate: pct(raw.pages_not_identical_rate),
            implicit_rate: pct(raw.implicit_rate),
            etc_rate: pct(raw.etc_rate),
            raw,
            indexes_used: None,
        }
    }

    fn csv_record(&self) -> Vec<String> {
        vec![
            self.stable_merge.to_string(),
            self.unstable_merge.to_string(),
            self.explicit_fail.to_string(),
            self.implicit_fail.to_string(),
            self.total_trials.to_string(),
            self.total_fail.to_string(),
            self.pages_not_identical.to_string(),
            self.etc_count.to_string(),
            self.total_fail_rate.clone(),
            self.pages_not_identical_rate.clone(),
            self.implicit_rate.clone(),
            self.etc_rate.clone(),
        ]
    }
}

/// Everything reported about one log.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FailureReport {
    pub total_indexes: usize,
    pub indexes: Vec<FailureStats>,
    pub before_stabilize: FailureStats,
    pub total: FailureStats,
}

impl FailureReport {
    pub fn new(blocks: &[FailureBlock]) -> Self {
        let indexes: Vec<_> = blocks
            .iter()
            .map(|b| FailureStats::over(std::slice::from_ref(b)))
            .collect();

        let warmup = &blocks[..blocks.len().min(BEFORE_STABILIZE_INDEXES)];
        let mut before_stabilize = FailureStats::over(warmup);
        before_stabilize.indexes_used = Some(warmup.len());

        FailureReport {
            total_indexes: indexes.len(),
            indexes,
            before_stabilize,
            total: FailureStats::over(blocks),
        }
    }

    /// One row per index, then the totals.
    pub fn write_csv(&self, path: &Path) -> Result<(), failure::Error> {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|_| format!("creating {}", path.display()))?;

        writer.write_record(CSV_HEADER)?;
        for stats in self.indexes.iter().chain(std::iter::once(&self.total)) {
            writer.write_record(stats.csv_record())?;
        }
        writer.flush()?;

        Ok(())
    }
}

pub fn cli_options() -> clap::App<'static, 'static> {
    clap_app! { failures =>
        (about: "Compute KSM merge failure statistics from a kernel log.")
        (@arg LOGFILE: +required "The kernel log to parse")
        (@arg CSV: --csv +takes_value
         "Also write the per-index statistics and the totals to this CSV file")
    }
}

pub fn run(sub_m: &clap::ArgMatches<'_>) -> Result<(), failure::Error> {
    let logfile = Path::new(sub_m.value_of("LOGFILE").unwrap());

    let bytes = std::fs::read(logfile).with_context(|_| format!("reading {}", logfile.display()))?;
    // Undecodable bytes are dropped.
    let text = String::from_utf8_lossy(&bytes).replace(std::char::REPLACEMENT_CHARACTER, "");

    let blocks = FailureLogParser::new()?.parse(&text);
    info!("Found {} failure statistics blocks", blocks.len());

    let report = FailureReport::new(&blocks);
    println!("{}", serde_json::to_string_pretty(&report)?);

    if let Some(csv) = sub_m.value_of("CSV") {
        report.write_csv(Path::new(csv))?;
        info!("Wrote {}", csv);
    }

    Ok(())
}

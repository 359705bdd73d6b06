//! Parsing of the interval reports printed by `perf stat -I`.
//!
//! For every reporting interval, `perf` prints one line per event, e.g.
//!
//! ```text
//!      1.001188117          1,234,567      cycles
//!      2.002097172      <not counted>      cycles
//! ```
//!
//! Everything else `perf` prints (column headers, the final summary, blank lines) is not an
//! interval report and is ignored by the caller.

use failure::Fail;

/// Printed by `perf` in place of a count when the event could not be scheduled during an interval
/// (e.g. the monitored thread never ran). We treat it as zero activity.
pub const NOT_COUNTED: &str = "<not counted>";

#[derive(Debug, Fail, PartialEq, Eq)]
pub enum ParseError {
    #[fail(display = "count `{}` before `{}` does not fit in 64 bits", digits, metric)]
    OutOfRange { digits: String, metric: String },
}

/// Like `try_parse_interval_line`, but a count that does not fit in a `u64` is also no match.
pub fn parse_interval_line(line: &str, metric: &str) -> Option<u64> {
    try_parse_interval_line(line, metric).ok().and_then(|delta| delta)
}

/// Extract the per-interval delta of `metric` from one line of `perf stat -I` output.
///
/// - A `<not counted>` line for `metric` yields `Some(0)`.
/// - A line with a decimal count (optionally grouped with `,`) followed by whitespace and
///   `metric` yields that count.
/// - Anything else yields `None`.
///
/// A count that does not fit in a `u64` is an error.
pub fn try_parse_interval_line(line: &str, metric: &str) -> Result<Option<u64>, ParseError> {
    if metric.is_empty() {
        return Ok(None);
    }

    if line.contains(NOT_COUNTED) && line.contains(metric) {
        return Ok(Some(0));
    }

    for (idx, _) in line.match_indices(metric) {
        let before = &line[..idx];

        // The count must be separated from the metric name by whitespace.
        let trimmed = before.trim_end();
        if trimmed.len() == before.len() {
            continue;
        }

        let token_start = trimmed
            .rfind(|c: char| !(c.is_ascii_digit() || c == ','))
            .map(|i| i + 1)
            .unwrap_or(0);
        let token = &trimmed[token_start..];
        if token.is_empty() {
            continue;
        }

        let digits: String = token.chars().filter(|c| *c != ',').collect();
        if digits.is_empty() {
            // Separators only, e.g. `, cycles`.
            return Ok(None);
        }

        return digits
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ParseError::OutOfRange {
                digits,
                metric: metric.to_owned(),
            });
    }

    Ok(None)
}

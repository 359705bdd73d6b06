//! The append-only CSV tables written by the monitor, one row per reporting interval each, and
//! helpers for reading them back.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use failure::ResultExt;

use serde::{Deserialize, Serialize};

use crate::ksm::KsmStats;
use crate::procfs::MemInfo;

pub const MEMORY_TABLE: &str = "memory_usage.csv";
pub const CYCLES_TABLE: &str = "ksmd_perf_stats.csv";
pub const PAGES_TABLE: &str = "ksm_stats.csv";

pub const MEMORY_HEADER: &[&str] = &["second", "ram_used_bytes", "swap_used_bytes"];
pub const CYCLES_HEADER: &[&str] = &["second", "ksmd_cycles_delta", "ksmd_pid"];
pub const PAGES_HEADER: &[&str] = &[
    "second",
    "pages_scanned",
    "pages_shared",
    "pages_sharing",
    "pages_volatile",
    "pages_unshared",
];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRow {
    pub second: u64,
    pub ram_used_bytes: u64,
    pub swap_used_bytes: u64,
}

impl MemoryRow {
    pub fn new(second: u64, mem: &MemInfo) -> Self {
        MemoryRow {
            second,
            ram_used_bytes: mem.ram_used(),
            swap_used_bytes: mem.swap_used(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleRow {
    pub second: u64,
    pub ksmd_cycles_delta: u64,
    pub ksmd_pid: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageStatRow {
    pub second: u64,
    pub pages_scanned: i64,
    pub pages_shared: i64,
    pub pages_sharing: i64,
    pub pages_volatile: i64,
    pub pages_unshared: i64,
}

impl PageStatRow {
    /// Failed counter reads are recorded as their sentinel values.
    pub fn new(second: u64, stats: &KsmStats) -> Self {
        PageStatRow {
            second,
            pages_scanned: stats.pages_scanned.sentinel(),
            pages_shared: stats.pages_shared.sentinel(),
            pages_sharing: stats.pages_sharing.sentinel(),
            pages_volatile: stats.pages_volatile.sentinel(),
            pages_unshared: stats.pages_unshared.sentinel(),
        }
    }
}

/// One CSV file that is only ever appended to.
#[derive(Clone, Debug)]
pub struct Table {
    path: PathBuf,
}

impl Table {
    pub fn new<P: AsRef<Path>>(dir: P, name: &str) -> Self {
        Table {
            path: dir.as_ref().join(name),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the header row if and only if the file does not exist yet. Existing files (e.g. from
    /// an earlier run into the same directory) are left untouched. Returns true if the header was
    /// written.
    pub fn init(&self, header: &[&str]) -> Result<bool, failure::Error> {
        let file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(ref err) if err.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
            Err(err) => {
                return Err(err)
                    .with_context(|_| format!("creating {}", self.path.display()))
                    .map_err(Into::into)
            }
        };

        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(header)?;
        writer.flush()?;

        Ok(true)
    }

    /// Append one row.
    pub fn append<R: Serialize>(&self, row: &R) -> Result<(), failure::Error> {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .with_context(|_| format!("opening {}", self.path.display()))?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        writer.serialize(row)?;
        writer.flush()?;

        Ok(())
    }

    /// Read the integer columns `a` and `b` of every row in which both parse; other rows are
    /// skipped.
    pub fn read_int_pairs(&self, a: &str, b: &str) -> Result<Vec<(i64, i64)>, failure::Error> {
        self.read_pairs(a, b)
    }

    /// Read columns `a` and `b` of every row in which both parse as `A` and `B`; other rows are
    /// skipped. A missing column is an error.
    pub fn read_pairs<A, B>(&self, a: &str, b: &str) -> Result<Vec<(A, B)>, failure::Error>
    where
        A: FromStr,
        B: FromStr,
    {
        let mut reader = csv::Reader::from_path(&self.path)
            .with_context(|_| format!("opening {}", self.path.display()))?;

        let headers = reader.headers()?.clone();
        let column = |name: &str| {
            headers.iter().position(|h| h.trim() == name).ok_or_else(|| {
                failure::format_err!("{} has no column `{}`", self.path.display(), name)
            })
        };
        let (ia, ib) = (column(a)?, column(b)?);

        let mut pairs = Vec::new();
        for record in reader.records() {
            let record = match record {
                Ok(record) => record,
                Err(..) => continue,
            };

            let va = record.get(ia).and_then(|v| v.trim().parse::<A>().ok());
            let vb = record.get(ib).and_then(|v| v.trim().parse::<B>().ok());
            if let (Some(va), Some(vb)) = (va, vb) {
                pairs.push((va, vb));
            }
        }

        Ok(pairs)
    }
}

/// The three tables of one run.
#[derive(Clone, Debug)]
pub struct RunTables {
    pub memory: Table,
    pub cycles: Table,
    pub pages: Table,
}

impl RunTables {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        let dir = dir.as_ref();
        RunTables {
            memory: Table::new(dir, MEMORY_TABLE),
            cycles: Table::new(dir, CYCLES_TABLE),
            pages: Table::new(dir, PAGES_TABLE),
        }
    }

    /// Write the headers of any tables that do not exist yet.
    pub fn init(&self) -> Result<(), failure::Error> {
        self.memory.init(MEMORY_HEADER)?;
        self.cycles.init(CYCLES_HEADER)?;
        self.pages.init(PAGES_HEADER)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::fs;

    use super::{CycleRow, MemoryRow, PageStatRow, RunTables, Table, CYCLES_HEADER};
    use crate::ksm::{Counter, KsmStats};

    #[test]
    fn init_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let table = Table::new(tmp.path(), "t.csv");

        assert!(table.init(CYCLES_HEADER).unwrap());
        table
            .append(&CycleRow {
                second: 3,
                ksmd_cycles_delta: 10,
                ksmd_pid: 97,
            })
            .unwrap();
        assert!(!table.init(CYCLES_HEADER).unwrap());
        assert!(!table.init(CYCLES_HEADER).unwrap());

        assert_eq!(
            fs::read_to_string(table.path()).unwrap(),
            "second,ksmd_cycles_delta,ksmd_pid\n3,10,97\n"
        );
    }

    #[test]
    fn run_tables_headers() {
        let tmp = tempfile::tempdir().unwrap();
        let tables = RunTables::new(tmp.path());
        tables.init().unwrap();
        tables.init().unwrap();

        assert_eq!(
            fs::read_to_string(tables.memory.path()).unwrap(),
            "second,ram_used_bytes,swap_used_bytes\n"
        );
        assert_eq!(
            fs::read_to_string(tables.cycles.path()).unwrap(),
            "second,ksmd_cycles_delta,ksmd_pid\n"
        );
        assert_eq!(
            fs::read_to_string(tables.pages.path()).unwrap(),
            "second,pages_scanned,pages_shared,pages_sharing,pages_volatile,pages_unshared\n"
        );
    }

    #[test]
    fn rows_are_appended_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let tables = RunTables::new(tmp.path());
        tables.init().unwrap();

        for second in 1..=2 {
            tables
                .memory
                .append(&MemoryRow {
                    second,
                    ram_used_bytes: 1000 * second,
                    swap_used_bytes: 0,
                })
                .unwrap();
        }

        assert_eq!(
            fs::read_to_string(tables.memory.path()).unwrap(),
            "second,ram_used_bytes,swap_used_bytes\n1,1000,0\n2,2000,0\n"
        );
    }

    #[test]
    fn page_rows_carry_sentinels() {
        let stats = KsmStats {
            pages_scanned: Counter::Value(5),
            pages_shared: Counter::Missing,
            pages_sharing: Counter::Malformed,
            pages_volatile: Counter::Unreadable,
            pages_unshared: Counter::Value(0),
        };

        assert_eq!(
            PageStatRow::new(7, &stats),
            PageStatRow {
                second: 7,
                pages_scanned: 5,
                pages_shared: -1,
                pages_sharing: -2,
                pages_volatile: -3,
                pages_unshared: 0,
            }
        );
    }

    #[test]
    fn read_pairs_skips_bad_rows() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("ksm_stats.csv");
        fs::write(
            &path,
            "second,pages_scanned,pages_shared\n\
             1,100,3\n\
             x,200,3\n\
             3,,3\n\
             4,400,3\n",
        )
        .unwrap();

        let table = Table::new(tmp.path(), "ksm_stats.csv");
        assert_eq!(
            table.read_int_pairs("second", "pages_scanned").unwrap(),
            vec![(1, 100), (4, 400)]
        );
        assert!(table.read_int_pairs("second", "nope").is_err());
    }

    #[test]
    fn cycle_deltas_read_back_as_written() {
        let tmp = tempfile::tempdir().unwrap();
        let tables = RunTables::new(tmp.path());
        tables.init().unwrap();

        let huge = i64::max_value() as u64 + 10;
        tables
            .cycles
            .append(&CycleRow {
                second: 1,
                ksmd_cycles_delta: huge,
                ksmd_pid: 97,
            })
            .unwrap();

        assert_eq!(
            tables
                .cycles
                .read_pairs::<i64, u64>("second", "ksmd_cycles_delta")
                .unwrap(),
            vec![(1, huge)]
        );
        // Too large for the signed reader.
        assert!(tables
            .cycles
            .read_int_pairs("second", "ksmd_cycles_delta")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn read_missing_table() {
        let tmp = tempfile::tempdir().unwrap();
        let table = Table::new(tmp.path(), "missing.csv");
        assert!(table.read_int_pairs("second", "pages_scanned").is_err());
    }
}

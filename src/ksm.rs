//! The KSM counters exported in sysfs (`/sys/kernel/mm/ksm/`).

use std::path::Path;

/// The result of reading one counter file.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Counter {
    Value(i64),
    /// The file does not exist (e.g. KSM is not built into the kernel).
    Missing,
    /// The file does not contain an integer.
    Malformed,
    /// Any other read failure.
    Unreadable,
}

impl Counter {
    /// Read a file containing a single integer. Content that is not UTF-8 is malformed, not
    /// unreadable.
    pub fn read(path: &Path) -> Self {
        match std::fs::read(path) {
            Ok(bytes) => match std::str::from_utf8(&bytes)
                .ok()
                .and_then(|contents| contents.trim().parse::<i64>().ok())
            {
                Some(value) => Counter::Value(value),
                None => Counter::Malformed,
            },
            Err(ref err) if err.kind() == std::io::ErrorKind::NotFound => Counter::Missing,
            Err(..) => Counter::Unreadable,
        }
    }

    /// The value recorded in the page-stat table. Consumers of those tables expect failures to be
    /// encoded as `-1` (missing), `-2` (malformed) and `-3` (other errors).
    pub fn sentinel(self) -> i64 {
        match self {
            Counter::Value(value) => value,
            Counter::Missing => -1,
            Counter::Malformed => -2,
            Counter::Unreadable => -3,
        }
    }
}

/// A snapshot of the page counters of KSM.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct KsmStats {
    /// Pages scanned so far.
    pub pages_scanned: Counter,
    /// Shared pages in use (one per set of merged pages).
    pub pages_shared: Counter,
    /// Additional mappings of shared pages, i.e. how much is saved.
    pub pages_sharing: Counter,
    /// Pages changing too fast to be merged.
    pub pages_volatile: Counter,
    /// Pages checked but not merged.
    pub pages_unshared: Counter,
}

impl KsmStats {
    /// Read all counters from the given sysfs directory. Never fails; see `Counter`.
    pub fn read(sysfs: &Path) -> Self {
        let read = |name: &str| Counter::read(&sysfs.join(name));

        KsmStats {
            pages_scanned: read("pages_scanned"),
            pages_shared: read("pages_shared"),
            pages_sharing: read("pages_sharing"),
            pages_volatile: read("pages_volatile"),
            pages_unshared: read("pages_unshared"),
        }
    }
}

//! Reading the process table and memory usage from procfs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use failure::ResultExt;

use log::debug;

/// A view of procfs rooted at some directory (normally `/proc`).
#[derive(Clone, Debug)]
pub struct ProcessTable {
    root: PathBuf,
}

impl ProcessTable {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        ProcessTable { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Find the process whose name is `name` (kernel threads are also matched when listed as
    /// `[name]`). If several match, the lowest pid wins.
    pub fn find_by_name(&self, name: &str) -> Result<Option<u32>, failure::Error> {
        let bracketed = format!("[{}]", name);
        let mut found = None;

        let entries = std::fs::read_dir(&self.root)
            .with_context(|_| format!("listing processes in {}", self.root.display()))?;
        for entry in entries {
            let entry = entry.context("process enumeration error")?;

            // Skip any directories that aren't a process.
            let pid = match entry
                .file_name()
                .to_str()
                .and_then(|pid| pid.parse::<u32>().ok())
            {
                Some(pid) => pid,
                None => continue,
            };

            // If the read fails, the process probably exited in the meantime.
            let comm = match std::fs::read_to_string(entry.path().join("comm")) {
                Ok(comm) => comm,
                Err(err) => {
                    debug!("Unable to read the name of pid {}: {}", pid, err);
                    continue;
                }
            };
            let comm = comm.trim_end_matches('\n');

            if comm == name || comm == bracketed {
                found = Some(found.map_or(pid, |other: u32| other.min(pid)));
            }
        }

        Ok(found)
    }

    /// Returns true if a process with the given pid currently exists.
    pub fn pid_exists(&self, pid: u32) -> bool {
        self.root.join(pid.to_string()).is_dir()
    }

    /// Read the system-wide memory usage.
    pub fn meminfo(&self) -> Result<MemInfo, failure::Error> {
        let path = self.root.join("meminfo");
        let contents = std::fs::read_to_string(&path)
            .with_context(|_| format!("reading {}", path.display()))?;
        MemInfo::parse(&contents)
    }
}

/// The subset of `/proc/meminfo` needed to compute used RAM and swap, in bytes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct MemInfo {
    pub total: u64,
    pub free: u64,
    pub buffers: u64,
    pub cached: u64,
    pub reclaimable_slab: u64,
    pub swap_total: u64,
    pub swap_free: u64,
}

impl MemInfo {
    /// Parse the contents of `/proc/meminfo`. `MemTotal` and `MemFree` are required; other fields
    /// default to zero.
    pub fn parse(contents: &str) -> Result<Self, failure::Error> {
        let mut fields = HashMap::new();

        for line in contents.lines() {
            let mut parts = line.split(':');
            let (key, rest) = match (parts.next(), parts.next()) {
                (Some(key), Some(rest)) => (key.trim(), rest),
                _ => continue,
            };

            let mut rest = rest.split_whitespace();
            let value = match rest.next().and_then(|v| v.parse::<u64>().ok()) {
                Some(value) => value,
                None => continue,
            };
            let bytes = match rest.next() {
                Some("kB") => value * 1024,
                _ => value,
            };

            fields.insert(key, bytes);
        }

        let required = |key: &str| {
            fields
                .get(key)
                .copied()
                .ok_or_else(|| failure::format_err!("meminfo has no `{}` field", key))
        };
        let optional = |key: &str| fields.get(key).copied().unwrap_or(0);

        Ok(MemInfo {
            total: required("MemTotal")?,
            free: required("MemFree")?,
            buffers: optional("Buffers"),
            cached: optional("Cached"),
            reclaimable_slab: optional("SReclaimable"),
            swap_total: optional("SwapTotal"),
            swap_free: optional("SwapFree"),
        })
    }

    /// RAM in use, excluding buffers and the page cache (including reclaimable slab). Falls back
    /// to `total - free` if the caches appear larger than the used memory.
    pub fn ram_used(&self) -> u64 {
        let used = self.total.saturating_sub(self.free);
        let caches = self.buffers + self.cached + self.reclaimable_slab;
        if caches <= used {
            used - caches
        } else {
            used
        }
    }

    pub fn swap_used(&self) -> u64 {
        self.swap_total.saturating_sub(self.swap_free)
    }
}

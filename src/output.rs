//! Utilities for choosing where a run's output goes and for recording the settings of the run
//! next to its data.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{offset::Local, DateTime};

use failure::ResultExt;

use serde::{ser::SerializeMap, Serialize, Serializer};

use crate::paths::RUN_PARAMS_FILE;

/// The environment variable naming the current trial. If set, it is embedded in the names of run
/// directories.
pub const TRIAL_TAG_VAR: &str = "MY_CLOUD_TRIAL";

/// The run directory prefix when no trial tag is set.
pub const DEFAULT_PREFIX: &str = "raw_data";

/// The prefix of run directory names: `raw_<tag>_` for a tagged trial, `raw_data` otherwise.
pub fn run_dir_prefix(tag: Option<&str>) -> String {
    match tag {
        Some(tag) if !tag.is_empty() => format!("raw_{}_", tag),
        _ => DEFAULT_PREFIX.into(),
    }
}

/// Create and return the first directory `<base>/<prefix><N>` (N = 1, 2, ...) that does not exist
/// yet. Creation is atomic, so two monitors started together never share a directory.
pub fn select_run_dir(base: &Path, prefix: &str) -> std::io::Result<PathBuf> {
    for n in 1.. {
        let candidate = base.join(format!("{}{}", prefix, n));
        match std::fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(ref err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err),
        }
    }

    unreachable!()
}

/// `RunSettings` records the settings a run was started with, so that the tables in a run
/// directory can be interpreted later without guessing.
///
/// The `settings!` macro is the convenient way to build one. Settings are kept as JSON values
/// and written out, with the time the run started, to the run's params file.
#[derive(Debug, Clone)]
pub struct RunSettings {
    settings: BTreeMap<String, serde_json::Value>,
    timestamp: DateTime<Local>,
}

impl RunSettings {
    pub fn new() -> Self {
        RunSettings {
            settings: BTreeMap::new(),
            timestamp: Local::now(),
        }
    }

    /// Register a new setting called `name` with value `value`. Registering the same name twice
    /// is an error.
    pub fn register<V: Serialize>(&mut self, name: &str, value: &V) -> Result<(), failure::Error> {
        let value = serde_json::to_value(value)
            .with_context(|_| format!("unable to serialize setting `{}`", name))?;

        if let Some(prev) = self.settings.insert(name.into(), value) {
            failure::bail!("Setting {:?} previously registered with value {}", name, prev);
        }

        Ok(())
    }

    /// Returns the value of setting `setting` deserialized to a `D`, or `None` if no such setting
    /// is registered or it is not a `D`.
    pub fn get<D: serde::de::DeserializeOwned>(&self, setting: &str) -> Option<D> {
        self.settings
            .get(setting)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    pub fn timestamp(&self) -> &DateTime<Local> {
        &self.timestamp
    }

    /// Write the params file into `dir` unless one exists already. Returns true if the file was
    /// written.
    pub fn write_params(&self, dir: &Path) -> Result<bool, failure::Error> {
        let path = dir.join(RUN_PARAMS_FILE);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(ref err) if err.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
            Err(err) => {
                return Err(err)
                    .with_context(|_| format!("creating {}", path.display()))
                    .map_err(Into::into)
            }
        };

        let json = serde_json::to_string_pretty(self)?;
        writeln!(file, "{}", json).with_context(|_| format!("writing {}", path.display()))?;

        Ok(true)
    }
}

impl Default for RunSettings {
    fn default() -> Self {
        Self::new()
    }
}

impl Serialize for RunSettings {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.settings.len() + 1))?;
        map.serialize_entry(
            "timestamp",
            &self.timestamp.format("%Y-%m-%d-%H-%M-%S").to_string(),
        )?;
        for (k, v) in &self.settings {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

#[doc(hidden)]
#[macro_export]
macro_rules! __settings_helper {
    ($settings:ident ,) => {};
    ($settings:ident, $name:ident : $value:expr, $($tail:tt)*) => {{
        $settings.register(stringify!($name), &$value)?;
        $crate::__settings_helper!($settings, $($tail)*);
    }};
}

/// A convenience macro for creating `RunSettings`. The syntax is `name: value,` where `name` is
/// the name of the setting and `value` is any serializable expression. Evaluates to a
/// `Result<RunSettings, failure::Error>`.
///
/// ```rust,ignore
/// let settings = settings! {
///     event: "cycles",
///     interval_ms: 1000,
///     target: cfg.target_name,
/// }?;
/// ```
#[macro_export]
macro_rules! settings {
    ($($tail:tt)*) => {{
        (|| -> Result<$crate::output::RunSettings, failure::Error> {
            let mut settings = $crate::output::RunSettings::new();

            $crate::__settings_helper!(settings, $($tail)*);

            Ok(settings)
        })()
    }}
}

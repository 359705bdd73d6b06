//! End-to-end runs of the monitor against fake process tables and KSM counters, with `/bin/sh`
//! scripts standing in for `perf`.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use ksm_monitor::{
    control::send_stop,
    monitor::{run_monitor, MonitorConfig, RunSummary, StopReason},
    supervisor::{Shutdown, ToolInvocation},
    MonitorError,
};

const TARGET_PID: u32 = 4242;

/// A fake `/proc` with `ksmd` as pid 4242 and a fake KSM sysfs directory under `root`, and a
/// config that runs `script` as the sampling tool.
fn setup(root: &Path, script: &str) -> MonitorConfig {
    let procfs = root.join("proc");
    let pid_dir = procfs.join(TARGET_PID.to_string());
    fs::create_dir_all(&pid_dir).unwrap();
    fs::write(pid_dir.join("comm"), "ksmd\n").unwrap();
    fs::write(
        procfs.join("meminfo"),
        "MemTotal:       2048 kB\n\
         MemFree:         512 kB\n\
         Buffers:         100 kB\n\
         Cached:          300 kB\n\
         SReclaimable:    124 kB\n\
         SwapTotal:      1024 kB\n\
         SwapFree:       1000 kB\n",
    )
    .unwrap();

    let sysfs = root.join("ksm");
    fs::create_dir_all(&sysfs).unwrap();
    for (name, value) in &[
        ("pages_scanned", "1000"),
        ("pages_shared", "10"),
        ("pages_sharing", "90"),
        ("pages_volatile", "3"),
        ("pages_unshared", "7"),
    ] {
        fs::write(sysfs.join(name), format!("{}\n", value)).unwrap();
    }

    let out = root.join("out");
    fs::create_dir_all(&out).unwrap();

    let mut cfg = MonitorConfig::new(ToolInvocation::new("/bin/sh", &["-c", script]), "cycles");
    cfg.pipe = root.join("ram_monitor_pipe");
    cfg.out_base = out;
    cfg.procfs = procfs;
    cfg.ksm_sysfs = sysfs;
    cfg
}

fn spawn_run(cfg: MonitorConfig) -> JoinHandle<Result<RunSummary, failure::Error>> {
    std::thread::spawn(move || run_monitor(&cfg))
}

/// Wait until `cond` holds, for up to 10 seconds.
fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

fn run_dir(cfg: &MonitorConfig) -> PathBuf {
    cfg.out_base.join("raw_data1")
}

/// The data rows of a table, split into fields.
fn rows(path: &Path) -> Vec<Vec<String>> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .skip(1)
        .map(|line| line.split(',').map(String::from).collect())
        .collect()
}

fn line_count(path: &Path) -> usize {
    fs::read_to_string(path)
        .map(|contents| contents.lines().count())
        .unwrap_or(0)
}

#[test]
fn records_interval_and_stops_via_pipe() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = setup(
        tmp.path(),
        "echo '# time             counts unit events' >&2; \
         sleep 1; \
         echo '     1.001058392          2,000,000      cycles' >&2; \
         exec sleep 30",
    );
    let dir = run_dir(&cfg);
    let pipe = cfg.pipe.clone();

    let handle = spawn_run(cfg);

    let cycles_table = dir.join("ksmd_perf_stats.csv");
    assert!(wait_for(|| line_count(&cycles_table) >= 2));

    // The loop is up, so the listener is too.
    let stop_sent = Instant::now();
    send_stop(&pipe).unwrap();

    let summary = handle.join().unwrap().unwrap();
    assert!(stop_sent.elapsed() < Duration::from_secs(5));

    assert_eq!(summary.run_dir, dir);
    assert_eq!(summary.target_pid, TARGET_PID);
    assert_eq!(summary.intervals, 1);
    assert_eq!(summary.reason, StopReason::Signalled);
    assert_eq!(summary.shutdown, Shutdown::Interrupted);

    // The tool is gone.
    assert!(!Path::new("/proc").join(summary.tool_pid.to_string()).exists());

    let cycles = rows(&cycles_table);
    assert_eq!(cycles.len(), 1);
    let second = cycles[0][0].parse::<u64>().unwrap();
    assert!(second >= 1);
    assert_eq!(cycles[0][1], "2000000");
    assert_eq!(cycles[0][2], "4242");

    let memory = rows(&dir.join("memory_usage.csv"));
    assert_eq!(
        memory,
        vec![vec![
            second.to_string(),
            ((2048 - 512 - 100 - 300 - 124) * 1024).to_string(),
            (24 * 1024).to_string(),
        ]]
    );

    let pages = rows(&dir.join("ksm_stats.csv"));
    assert_eq!(
        pages,
        vec![vec![
            second.to_string(),
            "1000".to_owned(),
            "10".to_owned(),
            "90".to_owned(),
            "3".to_owned(),
            "7".to_owned(),
        ]]
    );

    let params: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(dir.join("run.params")).unwrap()).unwrap();
    assert_eq!(params["target_pid"], TARGET_PID);
    assert_eq!(params["config"]["metric"], "cycles");
}

#[test]
fn target_not_found() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = setup(tmp.path(), "exec sleep 30");
    fs::write(
        cfg.procfs.join(TARGET_PID.to_string()).join("comm"),
        "kswapd0\n",
    )
    .unwrap();

    let err = run_monitor(&cfg).unwrap_err();
    match err.downcast_ref::<MonitorError>() {
        Some(MonitorError::TargetNotFound { name }) => assert_eq!(name, "ksmd"),
        other => panic!("unexpected error {:?}", other),
    }

    // The run directory exists, with headers only.
    assert_eq!(line_count(&run_dir(&cfg).join("ksmd_perf_stats.csv")), 1);
}

#[test]
fn tool_exits_immediately() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = setup(
        tmp.path(),
        "echo 'Error: No permission to enable cycles event.' >&2; exit 3",
    );

    let err = run_monitor(&cfg).unwrap_err();
    match err.downcast_ref::<MonitorError>() {
        Some(MonitorError::ToolExitedImmediately { code, diagnostics }) => {
            assert_eq!(*code, Some(3));
            assert!(diagnostics.contains("No permission"));
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn stops_when_target_vanishes() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = setup(tmp.path(), "exec sleep 30");
    let params = run_dir(&cfg).join("run.params");
    let pid_dir = cfg.procfs.join(TARGET_PID.to_string());

    let handle = spawn_run(cfg);

    assert!(wait_for(|| params.exists()));
    std::thread::sleep(Duration::from_millis(300));
    fs::remove_dir_all(&pid_dir).unwrap();

    let summary = handle.join().unwrap().unwrap();
    assert_eq!(summary.reason, StopReason::TargetVanished);
    assert_eq!(summary.intervals, 0);
    assert_eq!(summary.shutdown, Shutdown::Interrupted);
}

#[test]
fn stops_when_stream_ends() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = setup(tmp.path(), "exec 2>&-; exec sleep 30");

    let summary = run_monitor(&cfg).unwrap();
    assert_eq!(summary.reason, StopReason::StreamEnded);
    assert_eq!(summary.shutdown, Shutdown::Interrupted);
}

#[test]
fn stops_when_tool_exits() {
    let tmp = tempfile::tempdir().unwrap();
    // The background sleep keeps the report stream open after the tool itself exits.
    let cfg = setup(tmp.path(), "sleep 5 & sleep 1; exit 4");

    let summary = run_monitor(&cfg).unwrap();
    assert_eq!(summary.reason, StopReason::ToolExited(Some(4)));
    assert_eq!(summary.shutdown, Shutdown::Exited);
}

#[test]
fn runs_get_separate_directories() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = setup(tmp.path(), "exec 2>&-; exec sleep 30");

    let first = run_monitor(&cfg).unwrap();
    let second = run_monitor(&cfg).unwrap();

    assert_eq!(first.run_dir, cfg.out_base.join("raw_data1"));
    assert_eq!(second.run_dir, cfg.out_base.join("raw_data2"));
}

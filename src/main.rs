//! This program monitors `ksmd` during an experiment and summarizes the recorded data afterwards.
//! Which routine is chosen by passing different command line arguments.

use ksm_monitor::{control, failures, monitor, sharing, tail, throughput, utilization};

fn run() -> Result<(), failure::Error> {
    let matches = clap::App::new("ksm-monitor")
        .about(
            "This program monitors ksmd during an experiment and summarizes the recorded data \
             afterwards. Which routine is chosen by passing different command line arguments.",
        )
        .subcommand(monitor::cli_options())
        .subcommand(control::cli_options())
        .subcommand(throughput::cli_options())
        .subcommand(utilization::cli_options())
        .subcommand(tail::cli_options())
        .subcommand(sharing::cli_options())
        .subcommand(failures::cli_options())
        .setting(clap::AppSettings::SubcommandRequiredElseHelp)
        .setting(clap::AppSettings::DisableVersion)
        .get_matches();

    match matches.subcommand() {
        ("monitor", Some(sub_m)) => monitor::run(sub_m),
        ("stop", Some(sub_m)) => control::run(sub_m),
        ("throughput", Some(sub_m)) => throughput::run(sub_m),
        ("utilization", Some(sub_m)) => utilization::run(sub_m),
        ("tail", Some(sub_m)) => tail::run(sub_m),
        ("sharing", Some(sub_m)) => sharing::run(sub_m),
        ("failures", Some(sub_m)) => failures::run(sub_m),

        _ => {
            unreachable!();
        }
    }
}

fn main() {
    use console::style;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Set the RUST_BACKTRACE environment variable so that we always get backtraces.
    std::env::set_var("RUST_BACKTRACE", "1");

    // If an error occurred, try to print something helpful.
    if let Err(err) = run() {
        const MESSAGE: &str =
r#"== ERROR ==================================================================================
`ksm-monitor` encountered an error. The log above may offer clues. More detail is available by
setting the RUST_LOG=debug environment variable. If perf could not attach to ksmd, check that you
are running as root and that ksmd is running."#;

        println!("{}", style(MESSAGE).red().bold());

        // Startup conditions get a one-line explanation.
        if let Some(err) = err.downcast_ref::<ksm_monitor::MonitorError>() {
            println!("The run could not start: {}", err);
        }

        // Print error and backtrace
        println!(
            "`ksm-monitor` encountered the following error:\n{}\n{}",
            err.as_fail(),
            err.backtrace(),
        );

        std::process::exit(101);
    }
}

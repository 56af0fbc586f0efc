//! `profsession`: run a fixed sequence of profiling tools against one binary
//! and archive everything they produce.

mod cli_logger;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use profsession::{
    ArchiveFormat, Config, DEFAULT_BINARY, DEFAULT_CONFIG_FILE, DEFAULT_DURATION_SECS,
    DEFAULT_OUTDIR, SessionConfig, ToolLocator, plan_session, run_session,
};

use crate::cli_logger::CliLogger;

#[derive(Debug, Parser)]
#[command(name = "profsession", version)]
#[command(
    about = "Profile one binary with time, perf, valgrind and the NVIDIA tools, \
             then archive the results",
    long_about = None
)]
struct Cli {
    /// Executable to profile
    #[arg(long, default_value = DEFAULT_BINARY)]
    binary: PathBuf,

    /// Argument string for the target, split with shell quoting rules
    #[arg(long, default_value = "", allow_hyphen_values = true)]
    args: String,

    /// Seconds the target may run under `time`, `perf record` and `nsys`
    #[arg(
        long,
        default_value_t = DEFAULT_DURATION_SECS,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    duration: u64,

    /// Directory receiving every artifact
    #[arg(long, default_value = DEFAULT_OUTDIR)]
    outdir: PathBuf,

    /// Settings file; missing is fine
    #[arg(long, env = "PROFSESSION_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Checkout of the FlameGraph scripts
    #[arg(long, env = "FLAMEGRAPH_DIR")]
    flamegraph_dir: Option<PathBuf>,

    /// Time box for the valgrind massif run
    #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
    massif_timeout: Option<u64>,

    /// Sampling frequency for `perf record`
    #[arg(long, value_name = "HZ", value_parser = clap::value_parser!(u32).range(1..))]
    perf_frequency: Option<u32>,

    #[arg(long, value_enum)]
    archive: Option<ArchiveFormat>,

    /// Install linux-tools for the running kernel when no perf is usable
    #[arg(long)]
    install_perf: bool,

    /// Skip the kernel-matched perf lookup and use whatever is on PATH
    #[arg(long, conflicts_with = "install_perf")]
    no_perf_resolve: bool,

    /// Print the resolved plan without running anything
    #[arg(long)]
    dry_run: bool,

    #[arg(long)]
    json: bool,

    #[arg(long)]
    no_color: bool,
}

impl Cli {
    /// Settings file with command-line overrides applied.
    fn settings(&self) -> Config {
        let mut config = Config::load_optional(&self.config);
        if let Some(dir) = &self.flamegraph_dir {
            config.tools.flamegraph_dir = Some(dir.clone());
        }
        if let Some(secs) = self.massif_timeout {
            config.limits.massif_timeout_secs = secs;
        }
        if let Some(hz) = self.perf_frequency {
            config.perf.frequency = hz;
        }
        if let Some(format) = self.archive {
            config.archive = format;
        }
        if self.install_perf {
            config.perf.install = true;
        }
        if self.no_perf_resolve {
            config.perf.resolve = false;
        }
        config
    }
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return ExitCode::from(usage_exit_status(&err));
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(!cli.no_color)
        .init();

    let logger = CliLogger::new(cli.json, cli.no_color);
    match run(&cli, &logger) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            logger.print_error(&format!("{err:#}"));
            ExitCode::FAILURE
        }
    }
}

/// Help and version are not failures; every other parse error is a usage error.
fn usage_exit_status(err: &clap::Error) -> u8 {
    u8::from(err.use_stderr())
}

fn run(cli: &Cli, logger: &CliLogger) -> Result<()> {
    let config = cli.settings();
    let locator = ToolLocator::from_config(&config.tools);
    let session = SessionConfig::new(
        cli.binary.clone(),
        cli.args.clone(),
        cli.duration,
        cli.outdir.clone(),
    )?;
    tracing::debug!(
        "session binary={} duration={}s outdir={} search_path={:?}",
        session.binary.display(),
        session.duration_secs,
        session.outdir.display(),
        locator.search_path()
    );

    if cli.dry_run {
        let plan = plan_session(&session, &config, &locator)?;
        return logger.print_serialized(&plan);
    }

    let report = run_session(&session, &config, &locator, &mut |event| {
        logger.print_event(event)
    })?;
    logger.print_run_report(&report)
}

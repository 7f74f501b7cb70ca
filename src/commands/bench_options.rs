use snapbench::HarnessConfig;
use std::{error::Error, time::Duration};
use structopt::{clap, clap::AppSettings, StructOpt};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "snapbench",
    about = "Benchmark a function repeatedly from identical memory state",
    after_help = "Use SNAPBENCH_LOG to control logging; e.g. SNAPBENCH_LOG=all:warn,monitor:debug"
)]
#[structopt(global_settings = &[AppSettings::UnifiedHelpMessage])]
pub struct BenchOptions {
    /// Number of timed iterations.
    #[structopt(short = "n", long, default_value = "10")]
    pub iterations: usize,

    /// Pin the benchmark thread to this CPU.
    #[structopt(long)]
    pub cpu: Option<usize>,

    /// Stack size for the target, e.g. `8M` or `512K`.
    #[structopt(long, default_value = "8M", parse(try_from_str = parse_size))]
    pub target_stack_size: usize,

    /// How long to wait for write protection to be armed, in milliseconds.
    #[structopt(long, default_value = "5000")]
    pub arm_timeout_ms: u64,

    #[structopt(
        long,
        help = "Checksum every monitored region before the first iteration and verify it after \
        every restore."
    )]
    pub verify_restore: bool,

    #[structopt(
        long,
        help = "Do not write protect restored pages again. Later iterations then miss writes to \
        pages an earlier iteration touched; only useful to demonstrate that."
    )]
    pub no_rearm: bool,

    /// Send the target's stdout to /dev/null while it runs.
    #[structopt(short = "q", long)]
    pub quiet_target: bool,

    /// Print the report as JSON.
    #[structopt(long)]
    pub json: bool,

    #[structopt(subcommand)]
    pub cmd: BenchSubCommand,
}

#[derive(StructOpt, Debug, Clone)]
pub enum BenchSubCommand {
    /// Benchmark one of the built-in targets with the given arguments.
    #[structopt(name = "run", setting = AppSettings::TrailingVarArg)]
    Run {
        /// Built-in target name. See `snapbench targets`.
        target: String,

        /// Arguments handed to the target on every iteration.
        args: Vec<String>,
    },

    /// Print this process's memory regions and whether each would be monitored.
    #[structopt(name = "maps")]
    Maps,

    /// List the built-in targets.
    #[structopt(name = "targets")]
    Targets,
}

impl BenchOptions {
    pub fn harness_config(&self) -> HarnessConfig {
        HarnessConfig {
            target_stack_size: self.target_stack_size,
            arm_timeout: Duration::from_millis(self.arm_timeout_ms),
            verify_restore: self.verify_restore,
            rearm: !self.no_rearm,
            ..HarnessConfig::default()
        }
    }
}

/// A byte count with an optional `K`, `M` or `G` suffix.
fn parse_size(size_s: &str) -> Result<usize, Box<dyn Error>> {
    let size_s = size_s.trim();
    let (digits, shift) = match size_s.chars().last() {
        Some('k') | Some('K') => (&size_s[..size_s.len() - 1], 10),
        Some('m') | Some('M') => (&size_s[..size_s.len() - 1], 20),
        Some('g') | Some('G') => (&size_s[..size_s.len() - 1], 30),
        _ => (size_s, 0),
    };
    let n = digits.parse::<usize>()?;
    match n.checked_mul(1usize << shift) {
        Some(0) | None => Err(Box::new(clap::Error::with_description(
            "Size must be a positive integer, optionally followed by K, M or G",
            clap::ErrorKind::InvalidValue,
        ))),
        Some(size) => Ok(size),
    }
}

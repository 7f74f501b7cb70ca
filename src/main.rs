#[macro_use]
extern crate snapbench;

mod commands;

use crate::commands::{
    bench_options::{BenchOptions, BenchSubCommand},
    exit_result::ExitResult,
    maps_command::MapsCommand,
    run_command::RunCommand,
    targets_command::TargetsCommand,
    BenchCommand,
};
use snapbench::log::LogDebug;
use structopt::StructOpt;

fn main() -> ExitResult<()> {
    let options = BenchOptions::from_args();

    #[cfg(feature = "interpose")]
    log!(LogDebug, "mmap override active: {}", snapbench::interpose::is_active());
    #[cfg(not(feature = "interpose"))]
    log!(LogDebug, "mmap override not built in");

    match &options.cmd {
        BenchSubCommand::Run { .. } => RunCommand::new(&options).run(),
        BenchSubCommand::Maps => MapsCommand::new(&options).run(),
        BenchSubCommand::Targets => TargetsCommand::new().run(),
    }
}

use exit_result::ExitResult;

pub mod bench_options;
pub mod demo_targets;
pub mod exit_result;
pub mod maps_command;
pub mod run_command;
pub mod targets_command;

pub trait BenchCommand {
    fn run(&mut self) -> ExitResult<()>;
}

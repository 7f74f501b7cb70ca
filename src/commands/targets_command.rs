use crate::commands::{
    demo_targets::DEMOS,
    exit_result::{ExitResult, EXIT_USAGE},
    BenchCommand,
};
use std::io::{self, stdout, Write};

pub struct TargetsCommand;

impl TargetsCommand {
    pub fn new() -> TargetsCommand {
        TargetsCommand
    }

    fn targets(&self, out: &mut dyn Write) -> io::Result<()> {
        for demo in DEMOS {
            writeln!(out, "{:<24} {}", demo.usage, demo.about)?;
        }
        Ok(())
    }
}

impl BenchCommand for TargetsCommand {
    fn run(&mut self) -> ExitResult<()> {
        match self.targets(&mut stdout()) {
            Ok(()) => ExitResult::Ok(()),
            Err(e) => ExitResult::err_from(e, EXIT_USAGE),
        }
    }
}

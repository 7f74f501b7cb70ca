use crate::commands::{
    bench_options::{BenchOptions, BenchSubCommand},
    demo_targets,
    exit_result::{ExitResult, EXIT_RUN, EXIT_SETUP, EXIT_USAGE},
    BenchCommand,
};
use nix::{
    fcntl::{open, OFlag},
    sys::stat::Mode,
    unistd::{close, dup, dup2},
};
use snapbench::{
    address_space::region_catalog::ProcMapsCatalog,
    log::{LogDebug, LogInfo, LogWarn},
    report::Report,
    util::pin_to_cpu,
    Harness, HarnessConfig,
};
use std::{
    io::{self, stdout, Write},
    os::unix::io::RawFd,
};

pub struct RunCommand {
    target: String,
    args: Vec<String>,
    iterations: usize,
    cpu: Option<usize>,
    quiet_target: bool,
    json: bool,
    config: HarnessConfig,
}

impl RunCommand {
    pub fn new(options: &BenchOptions) -> RunCommand {
        match options.cmd.clone() {
            BenchSubCommand::Run { target, args } => RunCommand {
                target,
                args,
                iterations: options.iterations,
                cpu: options.cpu,
                quiet_target: options.quiet_target,
                json: options.json,
                config: options.harness_config(),
            },
            _ => panic!("Unexpected BenchSubCommand variant. Not a `Run` variant!"),
        }
    }
}

impl BenchCommand for RunCommand {
    fn run(&mut self) -> ExitResult<()> {
        if let Some(cpu) = self.cpu {
            if let Err(e) = pin_to_cpu(cpu) {
                return ExitResult::Err(format!("cannot pin to cpu {}: {}", cpu, e).into(), EXIT_USAGE);
            }
            log!(LogDebug, "pinned to cpu {}", cpu);
        }
        let mut target = match demo_targets::build(&self.target, &self.args) {
            Ok(t) => t,
            Err(msg) => return ExitResult::Err(msg.into(), EXIT_USAGE),
        };

        let silencer = if self.quiet_target {
            match StdoutSilencer::new() {
                Ok(s) => Some(s),
                Err(e) => return ExitResult::err_from(e, EXIT_SETUP),
            }
        } else {
            None
        };

        let mut harness = match Harness::new(self.config.clone(), &mut ProcMapsCatalog::new()) {
            Ok(h) => h,
            Err(e) => return ExitResult::harness(e, EXIT_SETUP),
        };
        if let Err(e) = harness.normalize().and_then(|_| harness.arm()) {
            return ExitResult::harness(e, EXIT_SETUP);
        }
        log!(
            LogInfo,
            "running `{}` {} time(s) over {} region(s)",
            self.target,
            self.iterations,
            harness.monitored().len()
        );

        let run = harness.run(&mut *target, &self.args, self.iterations);
        let teardown = harness.teardown();
        drop(silencer);

        let mut run = match run {
            Ok(run) => run,
            Err(e) => return ExitResult::harness(e, EXIT_SETUP),
        };
        let report = Report::new(&self.target, &run);
        let mut out = stdout();
        let written = if self.json {
            report.write_json(&mut out)
        } else {
            report.write_text(&mut out)
        };
        if let Err(e) = written.and_then(|_| out.flush()) {
            return ExitResult::err_from(e, EXIT_RUN);
        }

        if let Err(e) = teardown {
            return ExitResult::harness(e, EXIT_RUN);
        }
        if let Some(e) = run.aborted.take() {
            return ExitResult::harness(e, EXIT_RUN);
        }
        let failures = run.failures();
        if failures > 0 {
            return ExitResult::Err(
                format!("{} of {} iteration(s) failed", failures, run.samples.len()).into(),
                EXIT_RUN,
            );
        }
        ExitResult::Ok(())
    }
}

/// Points fd 1 at /dev/null until dropped.
struct StdoutSilencer {
    saved: RawFd,
}

impl StdoutSilencer {
    fn new() -> io::Result<StdoutSilencer> {
        stdout().flush()?;
        let saved = dup(libc::STDOUT_FILENO)?;
        let silenced = open("/dev/null", OFlag::O_WRONLY | OFlag::O_CLOEXEC, Mode::empty())
            .and_then(|null| {
                let r = dup2(null, libc::STDOUT_FILENO);
                close(null).unwrap_or(());
                r
            });
        if let Err(e) = silenced {
            close(saved).unwrap_or(());
            return Err(e.into());
        }
        Ok(StdoutSilencer { saved })
    }
}

impl Drop for StdoutSilencer {
    fn drop(&mut self) {
        stdout().flush().unwrap_or(());
        if let Err(e) = dup2(self.saved, libc::STDOUT_FILENO) {
            log!(LogWarn, "could not restore stdout: {}", e);
        }
        close(self.saved).unwrap_or(());
    }
}

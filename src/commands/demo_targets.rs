//! Targets built into the binary. Each is set up once, before the harness
//! arms, and then run unchanged on every iteration.

use rand::{rngs::StdRng, Rng, SeedableRng};
use snapbench::{util::page_size, Target, TargetFailure};
use std::io::{stdout, Write};

/// Iteration started from memory a previous iteration left behind.
const EXIT_DIRTY_START: i32 = 2;
/// The target's own result check failed.
const EXIT_BAD_RESULT: i32 = 3;

pub struct DemoTarget {
    pub name: &'static str,
    pub usage: &'static str,
    pub about: &'static str,
    build: fn(&[String]) -> Result<Box<dyn Target>, String>,
}

pub const DEMOS: &[DemoTarget] = &[
    DemoTarget {
        name: "sort",
        usage: "sort [count] [seed]",
        about: "Sort `count` random u64s in place and print the median.",
        build: SortTarget::build,
    },
    DemoTarget {
        name: "scribble",
        usage: "scribble [pages]",
        about: "Dirty one byte in each of `pages` pages and churn the heap.",
        build: ScribbleTarget::build,
    },
];

pub fn build(name: &str, args: &[String]) -> Result<Box<dyn Target>, String> {
    match DEMOS.iter().find(|d| d.name == name) {
        Some(demo) => (demo.build)(args),
        None => Err(format!(
            "unknown target `{}`; built-in targets: {}",
            name,
            DEMOS.iter().map(|d| d.name).collect::<Vec<_>>().join(", ")
        )),
    }
}

fn arg<T: std::str::FromStr>(args: &[String], i: usize, default: T) -> Result<T, String> {
    match args.get(i) {
        None => Ok(default),
        Some(s) => s
            .parse::<T>()
            .map_err(|_| format!("could not parse argument {} (`{}`)", i + 1, s)),
    }
}

pub struct SortTarget {
    data: Vec<u64>,
    first: u64,
}

impl SortTarget {
    fn build(args: &[String]) -> Result<Box<dyn Target>, String> {
        let count: usize = arg(args, 0, 100_000)?;
        let seed: u64 = arg(args, 1, 1)?;
        if count < 2 {
            return Err("sort needs a count of at least 2".into());
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let mut data: Vec<u64> = (0..count).map(|_| rng.gen()).collect();
        // The smallest value must not start in front, otherwise a leaked
        // sorted state looks like a clean start.
        let min = data.iter().enumerate().min_by_key(|(_, v)| **v).map(|(i, _)| i);
        if min == Some(0) {
            data.swap(0, count - 1);
        }
        if data[0] == data.iter().copied().min().unwrap_or(0) {
            return Err("sort needs at least two distinct values".into());
        }
        let first = data[0];
        Ok(Box::new(SortTarget { data, first }))
    }
}

impl Target for SortTarget {
    fn run(&mut self, _args: &[String]) -> Result<(), TargetFailure> {
        if self.data[0] != self.first {
            return Err(TargetFailure::new(EXIT_DIRTY_START));
        }
        self.data.sort_unstable();
        if !self.data.windows(2).all(|w| w[0] <= w[1]) {
            return Err(TargetFailure::new(EXIT_BAD_RESULT));
        }
        let mut out = stdout();
        writeln!(out, "median {}", self.data[self.data.len() / 2])
            .map_err(|_| TargetFailure::new(EXIT_BAD_RESULT))
    }
}

pub struct ScribbleTarget {
    buf: Vec<u8>,
    page_size: usize,
}

impl ScribbleTarget {
    fn build(args: &[String]) -> Result<Box<dyn Target>, String> {
        let pages: usize = arg(args, 0, 64)?;
        if pages == 0 {
            return Err("scribble needs at least one page".into());
        }
        let ps = page_size();
        Ok(Box::new(ScribbleTarget {
            buf: vec![0; pages * ps],
            page_size: ps,
        }))
    }
}

impl Target for ScribbleTarget {
    fn run(&mut self, _args: &[String]) -> Result<(), TargetFailure> {
        let ps = self.page_size;
        if self.buf.iter().step_by(ps).any(|&b| b != 0) {
            return Err(TargetFailure::new(EXIT_DIRTY_START));
        }
        for (i, page) in self.buf.chunks_mut(ps).enumerate() {
            page[i % ps] = 0xA5;
            page[0] = 1;
        }
        let churn: Vec<u64> = (0..self.buf.len() as u64 / 8).collect();
        if churn.iter().sum::<u64>() == 0 && churn.len() > 1 {
            return Err(TargetFailure::new(EXIT_BAD_RESULT));
        }
        Ok(())
    }
}

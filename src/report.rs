//! Turning a `BenchRun` into numbers a person (or a script) can read.

use crate::scheduler::{BenchRun, IterationOutcome, IterationSample};
use serde::Serialize;
use std::{io, io::Write, time::Duration};

fn micros(d: Duration) -> f64 {
    d.as_secs_f64() * 1e6
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Summary {
    pub iterations: usize,
    pub failures: usize,
    pub min_us: f64,
    pub median_us: f64,
    pub mean_us: f64,
    pub max_us: f64,
    /// Sample standard deviation; 0 with fewer than two samples.
    pub stddev_us: f64,
    pub pages_restored: usize,
    pub aborted: Option<String>,
}

impl Summary {
    pub fn new(samples: &[IterationSample], aborted: Option<String>) -> Summary {
        let mut times: Vec<f64> = samples.iter().map(|s| micros(s.duration)).collect();
        times.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let n = times.len();
        let mean = if n == 0 {
            0.0
        } else {
            times.iter().sum::<f64>() / n as f64
        };
        let median = match n {
            0 => 0.0,
            _ if n % 2 == 1 => times[n / 2],
            _ => (times[n / 2 - 1] + times[n / 2]) / 2.0,
        };
        let stddev = if n < 2 {
            0.0
        } else {
            (times.iter().map(|t| (t - mean).powi(2)).sum::<f64>() / (n - 1) as f64).sqrt()
        };
        Summary {
            iterations: n,
            failures: samples
                .iter()
                .filter(|s| s.outcome != IterationOutcome::Completed)
                .count(),
            min_us: times.first().copied().unwrap_or(0.0),
            median_us: median,
            mean_us: mean,
            max_us: times.last().copied().unwrap_or(0.0),
            stddev_us: stddev,
            pages_restored: samples.iter().map(|s| s.pages_restored).sum(),
            aborted,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SampleRecord {
    pub iteration: usize,
    pub duration_us: f64,
    pub outcome: IterationOutcome,
    pub pages_restored: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct Report {
    pub target: String,
    pub summary: Summary,
    pub samples: Vec<SampleRecord>,
}

impl Report {
    pub fn new(target: &str, run: &BenchRun) -> Report {
        Report {
            target: target.to_owned(),
            summary: Summary::new(&run.samples, run.aborted.as_ref().map(|e| e.to_string())),
            samples: run
                .samples
                .iter()
                .enumerate()
                .map(|(i, s)| SampleRecord {
                    iteration: i + 1,
                    duration_us: micros(s.duration),
                    outcome: s.outcome,
                    pages_restored: s.pages_restored,
                })
                .collect(),
        }
    }

    pub fn write_json<W: Write>(&self, w: &mut W) -> io::Result<()> {
        serde_json::to_writer_pretty(&mut *w, self)?;
        writeln!(w)
    }

    pub fn write_text<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let s = &self.summary;
        for r in &self.samples {
            write!(w, "iteration {:>4}: {:>12.3} us, {:>5} page(s)", r.iteration, r.duration_us, r.pages_restored)?;
            match r.outcome {
                IterationOutcome::Completed => writeln!(w)?,
                IterationOutcome::Failed(code) => writeln!(w, ", failed ({})", code)?,
            }
        }
        writeln!(w, "{}: {} iteration(s), {} failed", self.target, s.iterations, s.failures)?;
        writeln!(
            w,
            "  min {:.3} us  median {:.3} us  mean {:.3} us  max {:.3} us  stddev {:.3} us",
            s.min_us, s.median_us, s.mean_us, s.max_us, s.stddev_us
        )?;
        writeln!(w, "  pages restored: {}", s.pages_restored)?;
        if let Some(e) = &s.aborted {
            writeln!(w, "  run aborted: {}", e)?;
        }
        Ok(())
    }
}

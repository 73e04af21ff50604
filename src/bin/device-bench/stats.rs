use std::io::Write;
use std::time::Duration;

use anyhow::Result;
use hdrhistogram::Histogram;
use tokio::time::Instant;

use device_bench::configuration::OperationContext;
use device_bench::sharded_stats;

use crate::gocompat::strconv::format_duration;

pub type ShardedStats = sharded_stats::ShardedStats<Stats>;

const LATENCY_SIG_FIG: u8 = 3;

/// Creates sharded write statistics; histograms are kept only if
/// latency is measured.
pub fn new_sharded_stats(measure_latency: bool) -> ShardedStats {
    ShardedStats::new(move || Stats::new(measure_latency))
}

pub struct Stats {
    pub operations: u64,
    pub cells: u64,
    pub errors: u64,

    pub latencies: Option<LatencyHistograms>,
}

pub struct LatencyHistograms {
    // Latency, measured both with and without the coordinated omission fix
    pub raw: Histogram<u64>,
    pub co_fixed: Histogram<u64>,
}

fn new_histogram() -> Histogram<u64> {
    Histogram::new(LATENCY_SIG_FIG).expect("3 significant figures are supported")
}

impl Stats {
    pub fn new(measure_latency: bool) -> Self {
        Stats {
            operations: 0,
            cells: 0,
            errors: 0,
            latencies: measure_latency.then(|| LatencyHistograms {
                raw: new_histogram(),
                co_fixed: new_histogram(),
            }),
        }
    }

    /// Accounts a finished write of `cells` cells.
    pub fn account_op(&mut self, ctx: &OperationContext, result: &Result<()>, cells: usize) {
        self.operations += 1;
        match result {
            Ok(()) => {
                self.cells += cells as u64;
                self.account_latency(ctx);
            }
            Err(_) => self.errors += 1,
        }
    }

    fn account_latency(&mut self, ctx: &OperationContext) {
        if let Some(ls) = &mut self.latencies {
            let now = Instant::now();
            let _ = ls
                .raw
                .record((now - ctx.actual_start_time).as_nanos() as u64);
            let _ = ls
                .co_fixed
                .record((now - ctx.scheduled_start_time).as_nanos() as u64);
        }
    }
}

impl sharded_stats::Stats for Stats {
    fn clear(&mut self) {
        self.operations = 0;
        self.cells = 0;
        self.errors = 0;
        if let Some(ls) = &mut self.latencies {
            ls.raw.reset();
            ls.co_fixed.reset();
        }
    }

    fn combine(&mut self, other: &Self) {
        self.operations += other.operations;
        self.cells += other.cells;
        self.errors += other.errors;
        if let (Some(ls1), Some(ls2)) = (&mut self.latencies, &other.latencies) {
            // Auto-resizing histograms accept any recorded value
            let _ = ls1.raw.add(&ls2.raw);
            let _ = ls1.co_fixed.add(&ls2.co_fixed);
        }
    }
}

/// Prints the progress of a write run, one line per interval,
/// and the summary at the end.
pub struct StatsPrinter {
    start_time: Instant,
    with_latency: bool,
}

impl StatsPrinter {
    pub fn new(with_latency: bool) -> Self {
        Self {
            start_time: Instant::now(),
            with_latency,
        }
    }

    pub fn print_header(&self, out: &mut impl Write) -> Result<()> {
        if self.with_latency {
            writeln!(
                out,
                "{:9} {:>7} {:>7} {:>6} {:>8} {:>8} {:>8} {:>8} {:>8}",
                "time", "ops/s", "cells/s", "errors", "max", "99.9th", "99th", "median", "mean",
            )?;
        } else {
            writeln!(
                out,
                "{:9} {:>7} {:>7} {:>6}",
                "time", "ops/s", "cells/s", "errors",
            )?;
        }
        Ok(())
    }

    pub fn print_partial(&self, stats: &Stats, out: &mut impl Write) -> Result<()> {
        let time = format_duration(self.start_time.elapsed());
        match (&stats.latencies, self.with_latency) {
            (Some(ls), true) => {
                let h = &ls.co_fixed;
                writeln!(
                    out,
                    "{:9} {:>7} {:>7} {:>6} {:>8} {:>8} {:>8} {:>8} {:>8}",
                    time,
                    stats.operations,
                    stats.cells,
                    stats.errors,
                    nanos(h.max()),
                    nanos(h.value_at_quantile(0.999)),
                    nanos(h.value_at_quantile(0.99)),
                    nanos(h.value_at_quantile(0.5)),
                    nanos(h.mean() as u64),
                )?;
            }
            _ => {
                writeln!(
                    out,
                    "{:9} {:>7} {:>7} {:>6}",
                    time, stats.operations, stats.cells, stats.errors,
                )?;
            }
        }
        Ok(())
    }

    pub fn print_final(&self, stats: &Stats, out: &mut impl Write) -> Result<()> {
        let time = self.start_time.elapsed();
        writeln!(out)?;
        writeln!(out, "Results:")?;
        writeln!(out, "Time (avg):\t{}", format_duration(time))?;
        writeln!(out, "Total ops:\t{}", stats.operations)?;
        writeln!(out, "Total cells:\t{}", stats.cells)?;
        if stats.errors != 0 {
            writeln!(out, "Total errors:\t{}", stats.errors)?;
        }

        let secs = time.as_secs_f64().max(f64::EPSILON);
        writeln!(out, "Operations/s:\t{:.1}", stats.operations as f64 / secs)?;
        writeln!(out, "Cells/s:\t{:.1}", stats.cells as f64 / secs)?;

        if let Some(ls) = &stats.latencies {
            print_latency_summary("raw latency", &ls.raw, out)?;
            print_latency_summary("c-o fixed latency", &ls.co_fixed, out)?;
        }
        Ok(())
    }
}

fn nanos(n: u64) -> String {
    format_duration(Duration::from_nanos(n))
}

fn print_latency_summary(name: &str, h: &Histogram<u64>, out: &mut impl Write) -> Result<()> {
    writeln!(out, "{name}:")?;
    writeln!(out, "  max:\t\t{}", nanos(h.max()))?;
    writeln!(out, "  99.9th:\t{}", nanos(h.value_at_quantile(0.999)))?;
    writeln!(out, "  99th:\t\t{}", nanos(h.value_at_quantile(0.99)))?;
    writeln!(out, "  95th:\t\t{}", nanos(h.value_at_quantile(0.95)))?;
    writeln!(out, "  90th:\t\t{}", nanos(h.value_at_quantile(0.9)))?;
    writeln!(out, "  median:\t{}", nanos(h.value_at_quantile(0.5)))?;
    writeln!(out, "  mean:\t\t{}", nanos(h.mean() as u64))?;
    Ok(())
}

//! Latency instrumentation for transfers: the sender records one round trip time per
//!  acknowledged packet, the receiver records the processing time per datagram.

use std::fmt::{Display, Formatter};
use std::time::Duration;
use tokio::time::Instant;

/// Throughput is reported as 0 for transfers shorter than this to avoid meaningless numbers
const MIN_ELAPSED_FOR_THROUGHPUT: Duration = Duration::from_millis(1);

/// Bin width (in millis) used when all samples are (almost) equal
const DEGENERATE_BIN_WIDTH_MILLIS: f64 = 1.0;

const HISTOGRAM_BAR_WIDTH: usize = 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Sample {
    duration: Duration,
    is_retry: bool,
}

#[derive(Clone, Debug, Default)]
pub struct LatencyRecorder {
    samples: Vec<Sample>,
    start_time: Option<Instant>,
    end_time: Option<Instant>,
    total_bytes: usize,
}

impl LatencyRecorder {
    pub fn new() -> LatencyRecorder {
        Default::default()
    }

    pub fn start_transfer(&mut self) {
        self.start_transfer_at(Instant::now());
    }

    pub fn start_transfer_at(&mut self, at: Instant) {
        self.start_time = Some(at);
        self.end_time = None;
    }

    pub fn end_transfer(&mut self, total_bytes: usize) {
        self.end_transfer_at(Instant::now(), total_bytes);
    }

    pub fn end_transfer_at(&mut self, at: Instant, total_bytes: usize) {
        self.end_time = Some(at);
        self.total_bytes = total_bytes;
    }

    pub fn record(&mut self, duration: Duration, is_retry: bool) {
        self.samples.push(Sample { duration, is_retry });
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn retry_count(&self) -> usize {
        self.samples.iter()
            .filter(|s| s.is_retry)
            .count()
    }

    /// Time between start and end of the transfer, or zero if the transfer was not started
    ///  and ended
    pub fn elapsed(&self) -> Duration {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => end.saturating_duration_since(start),
            _ => Duration::ZERO,
        }
    }

    pub fn summary(&self) -> LatencySummary {
        let count = self.samples.len();
        let retries = self.retry_count();
        let elapsed = self.elapsed();

        let throughput = if elapsed < MIN_ELAPSED_FOR_THROUGHPUT {
            0.0
        }
        else {
            self.total_bytes as f64 / elapsed.as_secs_f64()
        };

        if count == 0 {
            return LatencySummary {
                count,
                retries,
                mean: Duration::ZERO,
                median: Duration::ZERO,
                min: Duration::ZERO,
                max: Duration::ZERO,
                retry_rate: 0.0,
                elapsed,
                total_bytes: self.total_bytes,
                throughput,
            };
        }

        let mut sorted = self.samples.iter()
            .map(|s| s.duration)
            .collect::<Vec<_>>();
        sorted.sort();

        let total = sorted.iter().sum::<Duration>();
        let median = if count % 2 == 0 {
            (sorted[count / 2 - 1] + sorted[count / 2]) / 2
        }
        else {
            sorted[count / 2]
        };

        LatencySummary {
            count,
            retries,
            mean: mean(total, count),
            median,
            min: sorted[0],
            max: sorted[count - 1],
            retry_rate: retries as f64 / count as f64,
            elapsed,
            total_bytes: self.total_bytes,
            throughput,
        }
    }

    /// Buckets all samples into `num_bins` equal-width bins between the smallest and the biggest
    ///  sample. Returns `None` if there are no samples or no bins.
    pub fn histogram(&self, num_bins: usize) -> Option<Histogram> {
        if num_bins == 0 || self.samples.is_empty() {
            return None;
        }

        let sample_millis = self.samples.iter()
            .map(|s| millis(s.duration))
            .collect::<Vec<_>>();
        let min = sample_millis.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = sample_millis.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

        let mut bin_width = (max - min) / num_bins as f64;
        if bin_width < 0.00001 {
            bin_width = DEGENERATE_BIN_WIDTH_MILLIS;
        }

        let mut counts = vec![0usize; num_bins];
        for m in sample_millis {
            let bin = (((m - min) / bin_width) as usize).min(num_bins - 1);
            counts[bin] += 1;
        }

        Some(Histogram {
            min_millis: min,
            bin_width_millis: bin_width,
            counts,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LatencySummary {
    pub count: usize,
    pub retries: usize,
    pub mean: Duration,
    pub median: Duration,
    pub min: Duration,
    pub max: Duration,
    /// fraction of samples that were flagged as retries, in [0, 1]
    pub retry_rate: f64,
    pub elapsed: Duration,
    pub total_bytes: usize,
    /// bytes per second
    pub throughput: f64,
}

fn millis(d: Duration) -> f64 {
    d.as_nanos() as f64 / 1_000_000.0
}

/// NB: `Duration` only divides by `u32`, so bigger counts fall back to float division
fn mean(total: Duration, count: usize) -> Duration {
    match u32::try_from(count) {
        Ok(count) => total / count,
        Err(_) => total.div_f64(count as f64),
    }
}

impl Display for LatencySummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "===== Latency and Performance Statistics =====")?;
        writeln!(f, "Total packets: {}", self.count)?;
        writeln!(f, "Total retries: {}", self.retries)?;
        writeln!(f, "Retry rate: {:.2}%", self.retry_rate * 100.0)?;
        writeln!(f, "Average latency: {:.2} ms", millis(self.mean))?;
        writeln!(f, "Median latency: {:.2} ms", millis(self.median))?;
        writeln!(f, "Minimum latency: {:.2} ms", millis(self.min))?;
        writeln!(f, "Maximum latency: {:.2} ms", millis(self.max))?;
        writeln!(f, "Total transfer time: {:.2} ms", millis(self.elapsed))?;
        writeln!(f, "Data transferred: {} bytes", self.total_bytes)?;
        write!(f, "Throughput: {:.2} KB/s", self.throughput / 1024.0)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Histogram {
    pub min_millis: f64,
    pub bin_width_millis: f64,
    pub counts: Vec<usize>,
}

impl Histogram {
    /// (start, end) of a bin in millis
    pub fn bin_range(&self, bin: usize) -> (f64, f64) {
        let start = self.min_millis + bin as f64 * self.bin_width_millis;
        (start, start + self.bin_width_millis)
    }
}

impl Display for Histogram {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Latency Distribution:")?;

        let max_count = self.counts.iter().cloned().max().unwrap_or(0).max(1);
        for (bin, &count) in self.counts.iter().enumerate() {
            let (start, end) = self.bin_range(bin);
            let bar_len = HISTOGRAM_BAR_WIDTH * count / max_count;
            writeln!(f, "{:6.1} - {:6.1} ms: {} ({})", start, end, "#".repeat(bar_len), count)?;
        }
        Ok(())
    }
}

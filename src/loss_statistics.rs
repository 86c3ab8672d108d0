/// Loss-based controller regions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LossRegion {
    /// Loss below the low threshold (2% by default); bitrate is increasing.
    LossFree,
    /// Loss between the low and high thresholds; bitrate holds.
    LossLimited,
    /// Loss above the high threshold (10% by default); bitrate is decreasing.
    LossDegraded,
}

/// Running min/max/mean/stddev over a stream of samples.
#[derive(Clone, Copy, Debug, Default)]
pub struct SummaryStats {
    count: u64,
    min: i64,
    max: i64,
    sum: i64,
    sum_sq: f64,
}

impl SummaryStats {
    pub fn accept(&mut self, value: i64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;
        self.sum_sq += (value as f64) * (value as f64);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn min(&self) -> i64 {
        self.min
    }

    pub fn max(&self) -> i64 {
        self.max
    }

    pub fn sum(&self) -> i64 {
        self.sum
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum as f64 / self.count as f64
    }

    pub fn stddev(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let mean = self.mean();
        let variance = (self.sum_sq / self.count as f64 - mean * mean).max(0.0);
        variance.sqrt()
    }
}

/// Cumulative time spent in each loss region, in milliseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BweStatistics {
    pub loss_free_ms: i64,
    pub loss_limited_ms: i64,
    pub loss_degraded_ms: i64,
}

/// Records how much time the estimator spends in each loss region, together
/// with bitrate/loss summary statistics for the current run of the same
/// region. Purely observational; never feeds back into the estimate.
#[derive(Debug)]
pub struct StatisticsRecorder {
    current_region: Option<LossRegion>,
    last_transition_timestamp_ms: i64,
    /// Duration of the current run after `consecutive_visits` loops.
    current_run_duration_ms: i64,
    consecutive_visits: u64,
    run_start_bitrate_bps: i64,
    run_bitrate_stats: SummaryStats,
    run_loss_stats: SummaryStats,
    /// Avoids resetting the run accumulators when nothing was recorded.
    dirty: bool,
    totals: BweStatistics,
}

impl Default for StatisticsRecorder {
    fn default() -> Self {
        Self {
            current_region: None,
            last_transition_timestamp_ms: -1,
            current_run_duration_ms: 0,
            consecutive_visits: 0,
            run_start_bitrate_bps: 0,
            run_bitrate_stats: SummaryStats::default(),
            run_loss_stats: SummaryStats::default(),
            dirty: false,
            totals: BweStatistics::default(),
        }
    }
}

impl StatisticsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one estimator evaluation. `timed_out` marks intervals where
    /// receiver feedback had gone stale; `next_region` is `None` in that case.
    pub fn update(
        &mut self,
        now_ms: i64,
        timed_out: bool,
        next_region: Option<LossRegion>,
        bitrate_bps: i64,
        fraction_loss_q8: u8,
    ) {
        if self.last_transition_timestamp_ms > -1 && !timed_out {
            self.dirty = true;
            self.current_run_duration_ms += now_ms - self.last_transition_timestamp_ms;
        }
        self.last_transition_timestamp_ms = now_ms;

        if !timed_out {
            self.dirty = true;
            self.run_loss_stats.accept(fraction_loss_q8 as i64);
            self.consecutive_visits += 1;
            if self.current_region == next_region {
                self.run_bitrate_stats.accept(bitrate_bps);
                return;
            }
        }

        if let Some(region) = self.current_region {
            // Transitioning out; roll the run into the per-region totals.
            match region {
                LossRegion::LossFree => self.totals.loss_free_ms += self.current_run_duration_ms,
                LossRegion::LossLimited => {
                    self.totals.loss_limited_ms += self.current_run_duration_ms
                }
                LossRegion::LossDegraded => {
                    self.totals.loss_degraded_ms += self.current_run_duration_ms
                }
            }
            tracing::trace!(
                region = ?region,
                duration_ms = self.current_run_duration_ms,
                consecutive_visits = self.consecutive_visits,
                min_loss = self.run_loss_stats.min() as f32 / 256.0,
                max_loss = self.run_loss_stats.max() as f32 / 256.0,
                avg_loss = self.run_loss_stats.mean() / 256.0,
                min_bps = self.run_bitrate_stats.min(),
                max_bps = self.run_bitrate_stats.max(),
                avg_bps = self.run_bitrate_stats.mean(),
                delta_bps = bitrate_bps - self.run_start_bitrate_bps,
                "loss_estimate"
            );
        }

        self.current_region = next_region;
        self.run_start_bitrate_bps = bitrate_bps;
        if self.dirty {
            self.run_bitrate_stats = SummaryStats::default();
            self.run_loss_stats = SummaryStats::default();
            self.consecutive_visits = 0;
            self.current_run_duration_ms = 0;
            self.dirty = false;
        }
        self.run_bitrate_stats.accept(bitrate_bps);
    }

    pub fn snapshot(&self) -> BweStatistics {
        self.totals
    }
}

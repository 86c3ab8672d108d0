/*
 *  Copyright (c) 2012 The WebRTC project authors. All Rights Reserved.
 *
 *  Use of this source code is governed by a BSD-style license
 *  that can be found in the LICENSE file in the root of the source
 *  tree. An additional intellectual property rights grant can be found
 *  in the file PATENTS.  All contributing project authors may
 *  be found in the AUTHORS file in the root of the source tree.
 */

use std::collections::VecDeque;

use crate::{BweConfig, BweStatistics, LossRegion, StatisticsRecorder};

/// Loss-based send-side bandwidth estimation, after
/// <https://tools.ietf.org/html/draft-ietf-rmcat-gcc-01>.
///
/// Single-threaded; all entry points must be serialized by the caller
/// (`BandwidthEstimator` wraps this in a mutex). Times are monotonic
/// wall-clock milliseconds, bitrates are bits per second.
pub struct SendSideBandwidthEstimation {
    low_loss_threshold: f32,
    high_loss_threshold: f32,
    bitrate_threshold_bps: i64,
    in_timeout_experiment: bool,

    first_report_time_ms: i64,
    lost_packets_since_last_loss_update_q8: i64,
    expected_packets_since_last_loss_update: i64,
    has_decreased_since_last_fraction_loss: bool,
    latest_fraction_loss: u8,
    last_feedback_ms: i64,
    last_packet_report_ms: i64,
    last_timeout_ms: i64,
    last_round_trip_time_ms: i64,

    min_bitrate_configured: i64,
    max_bitrate_configured: i64,
    time_last_decrease_ms: i64,
    last_low_bitrate_log_ms: i64,

    /// The max bitrate as set by the receiver, signalled via REMB.
    /// Zero means no ceiling is known.
    latest_remb: i64,
    latest_estimate: i64,
    min_bitrate_history: VecDeque<(i64, i64)>,

    stats: StatisticsRecorder,
}

impl SendSideBandwidthEstimation {
    const BWE_INCREASE_INTERVAL_MS: i64 = 1000;
    const BWE_DECREASE_INTERVAL_MS: i64 = 300;
    const DEFAULT_MIN_BITRATE_BPS: i64 = 10_000;
    const DEFAULT_MAX_BITRATE_BPS: i64 = 1_000_000_000;
    const START_PHASE_MS: i64 = 2000;
    const LIMIT_NUM_PACKETS: i64 = 20;
    // Expecting that RTCP feedback is sent uniformly within [0.5, 1.5]s
    // intervals.
    const FEEDBACK_INTERVAL_MS: i64 = 1500;
    const PACKET_REPORT_TIMEOUT_INTERVALS: f64 = 1.2;
    const FEEDBACK_TIMEOUT_INTERVALS: i64 = 3;
    const TIMEOUT_INTERVAL_MS: i64 = 1000;
    const DEFAULT_RTT_MS: i64 = 100;
    const LOW_BITRATE_LOG_PERIOD_MS: i64 = 10_000;

    /// The experiment branches are decided once per instance; `rng` is
    /// injected so tests can pin them.
    pub fn new(config: &BweConfig, rng: &mut fastrand::Rng) -> Self {
        let loss_experiment = rng.f32() < config.loss_experiment.probability;
        let (low_loss_threshold, high_loss_threshold, bitrate_threshold_bps) = if loss_experiment {
            tracing::info!(
                low_loss_threshold = config.loss_experiment.low_loss_threshold,
                high_loss_threshold = config.loss_experiment.high_loss_threshold,
                bitrate_threshold_kbps = config.loss_experiment.bitrate_threshold_kbps,
                "Enabled loss experiment"
            );
            (
                config.loss_experiment.low_loss_threshold,
                config.loss_experiment.high_loss_threshold,
                1000 * config.loss_experiment.bitrate_threshold_kbps,
            )
        } else {
            (0.02, 0.1, 0)
        };
        let in_timeout_experiment = rng.f32() < config.timeout_experiment_probability;

        let mut bwe = Self {
            low_loss_threshold,
            high_loss_threshold,
            bitrate_threshold_bps,
            in_timeout_experiment,
            first_report_time_ms: -1,
            lost_packets_since_last_loss_update_q8: 0,
            expected_packets_since_last_loss_update: 0,
            has_decreased_since_last_fraction_loss: false,
            latest_fraction_loss: 0,
            last_feedback_ms: -1,
            last_packet_report_ms: -1,
            last_timeout_ms: -1,
            last_round_trip_time_ms: -1,
            min_bitrate_configured: Self::DEFAULT_MIN_BITRATE_BPS,
            max_bitrate_configured: Self::DEFAULT_MAX_BITRATE_BPS,
            time_last_decrease_ms: 0,
            last_low_bitrate_log_ms: -1,
            latest_remb: 0,
            latest_estimate: 0,
            min_bitrate_history: VecDeque::new(),
            stats: StatisticsRecorder::new(),
        };
        bwe.set_min_max_bitrate(config.min_bitrate_bps, config.max_bitrate_bps);
        bwe.latest_estimate = config.start_bitrate_bps;
        bwe
    }

    pub fn latest_estimate(&self) -> i64 {
        self.latest_estimate
    }

    pub fn latest_remb(&self) -> i64 {
        self.latest_remb
    }

    /// Most recent loss fraction, Q8 fixed point (fraction of 256).
    pub fn latest_fraction_loss(&self) -> u8 {
        self.latest_fraction_loss
    }

    pub fn statistics(&self) -> BweStatistics {
        self.stats.snapshot()
    }

    /// Call periodically, and after every accepted receiver block.
    pub fn update_estimate(&mut self, now_ms: i64) {
        let mut bitrate = self.latest_estimate;

        // We trust the REMB during the first 2 seconds if we haven't had any
        // packet loss reported, to allow startup bitrate probing.
        if self.latest_fraction_loss == 0
            && self.is_in_start_phase(now_ms)
            && self.latest_remb > bitrate
        {
            self.update_target_bitrate(self.latest_remb, now_ms);
            self.min_bitrate_history.clear();
            self.min_bitrate_history
                .push_back((now_ms, self.latest_estimate));
            return;
        }
        self.update_min_history(now_ms);
        if self.last_packet_report_ms == -1 {
            // No feedback received yet.
            self.update_target_bitrate(self.latest_estimate, now_ms);
            return;
        }

        let time_since_packet_report_ms = now_ms - self.last_packet_report_ms;
        let time_since_feedback_ms = now_ms - self.last_feedback_ms;
        if (time_since_packet_report_ms as f64)
            < Self::PACKET_REPORT_TIMEOUT_INTERVALS * Self::FEEDBACK_INTERVAL_MS as f64
        {
            let loss = self.latest_fraction_loss as f32 / 256.0;
            // We only make decisions based on loss when the bitrate is above a
            // threshold. This is a crude way of handling loss which is
            // uncorrelated to congestion.
            if self.latest_estimate < self.bitrate_threshold_bps || loss <= self.low_loss_threshold
            {
                // Loss < 2%: Increase rate by 8% of the min bitrate in the
                // last BWE_INCREASE_INTERVAL_MS.
                // Note that by remembering the bitrate over the last second
                // one can rampup one second faster than if only allowed to
                // start ramping at 8% per second rate now.
                bitrate = (self.min_bitrate_history.front().unwrap().1 as f64 * 1.08 + 0.5) as i64;

                // Add 1 kbps extra, just to make sure that we do not get
                // stuck (gives a little extra increase at low rates,
                // negligible at higher rates).
                bitrate += 1000;
                self.record_stats(now_ms, false, Some(LossRegion::LossFree));
            } else if self.latest_estimate > self.bitrate_threshold_bps {
                if loss <= self.high_loss_threshold {
                    // Loss between 2% - 10%: Do nothing.
                    self.record_stats(now_ms, false, Some(LossRegion::LossLimited));
                } else {
                    // Loss > 10%: Limit the rate decreases to once per
                    // BWE_DECREASE_INTERVAL_MS + rtt.
                    if !self.has_decreased_since_last_fraction_loss
                        && now_ms - self.time_last_decrease_ms
                            >= Self::BWE_DECREASE_INTERVAL_MS + self.rtt_ms()
                    {
                        self.time_last_decrease_ms = now_ms;

                        // Reduce rate:
                        //   newRate = rate * (1 - 0.5*lossRate);
                        //   where packetLoss = 256*lossRate;
                        bitrate = (bitrate as f64 * (512 - self.latest_fraction_loss as i64) as f64
                            / 512.0) as i64;
                        self.has_decreased_since_last_fraction_loss = true;
                        self.record_stats(now_ms, false, Some(LossRegion::LossDegraded));
                    }
                }
            }
        } else {
            self.record_stats(now_ms, true, None);
            if time_since_feedback_ms
                > Self::FEEDBACK_TIMEOUT_INTERVALS * Self::FEEDBACK_INTERVAL_MS
                && (self.last_timeout_ms == -1
                    || now_ms - self.last_timeout_ms > Self::TIMEOUT_INTERVAL_MS)
                && self.in_timeout_experiment
            {
                // Prolonged silence from the receiver is treated as an
                // implicit congestion signal.
                bitrate = (bitrate as f64 * 0.8) as i64;
                // Reset accumulators since we've already acted on missing
                // feedback and shouldn't act again on these old lost packets.
                self.lost_packets_since_last_loss_update_q8 = 0;
                self.expected_packets_since_last_loss_update = 0;
                self.last_timeout_ms = now_ms;
            }
        }
        self.update_target_bitrate(bitrate, now_ms);
    }

    /// Call with the aggregated outcome of one RTCP receiver-report interval.
    pub fn update_receiver_block(
        &mut self,
        fraction_lost: u8,
        number_of_packets: i64,
        now_ms: i64,
    ) {
        self.last_feedback_ms = now_ms;
        if self.first_report_time_ms == -1 {
            self.first_report_time_ms = now_ms;
        }

        if number_of_packets > 0 {
            let lost_q8 = fraction_lost as i64 * number_of_packets;
            self.lost_packets_since_last_loss_update_q8 += lost_q8;
            self.expected_packets_since_last_loss_update += number_of_packets;

            // Don't generate a loss rate until it can be based on enough
            // packets.
            if self.expected_packets_since_last_loss_update < Self::LIMIT_NUM_PACKETS {
                return;
            }
            self.has_decreased_since_last_fraction_loss = false;
            self.latest_fraction_loss = (self.lost_packets_since_last_loss_update_q8
                / self.expected_packets_since_last_loss_update)
                .min(255) as u8;

            // Reset accumulators.
            self.lost_packets_since_last_loss_update_q8 = 0;
            self.expected_packets_since_last_loss_update = 0;
            self.last_packet_report_ms = now_ms;
            self.update_estimate(now_ms);
        }
    }

    /// Call when a REMB report arrives. The new ceiling applies immediately,
    /// without waiting for the next periodic update.
    pub fn update_receiver_estimate(&mut self, bandwidth_bps: i64) {
        self.latest_remb = bandwidth_bps;
        self.latest_estimate = self.cap_bitrate_to_thresholds(self.latest_estimate);
    }

    /// Most recent RTT measurement from the transport, in milliseconds.
    /// Negative means unknown; sanity is checked at the point of use.
    pub fn update_rtt(&mut self, rtt_ms: i64) {
        self.last_round_trip_time_ms = rtt_ms;
    }

    pub fn set_min_max_bitrate(&mut self, min_bitrate_bps: i64, max_bitrate_bps: i64) {
        self.min_bitrate_configured = min_bitrate_bps.max(Self::DEFAULT_MIN_BITRATE_BPS);
        self.max_bitrate_configured = if max_bitrate_bps > 0 {
            max_bitrate_bps.max(self.min_bitrate_configured)
        } else {
            Self::DEFAULT_MAX_BITRATE_BPS
        };
    }

    fn is_in_start_phase(&self, now_ms: i64) -> bool {
        self.first_report_time_ms == -1
            || now_ms - self.first_report_time_ms < Self::START_PHASE_MS
    }

    fn rtt_ms(&self) -> i64 {
        let rtt = self.last_round_trip_time_ms;
        if !(0..=1000).contains(&rtt) {
            tracing::warn!(
                rtt_ms = rtt,
                "RTT not measured, or has a suspiciously high value. Using the default of 100ms."
            );
            return Self::DEFAULT_RTT_MS;
        }
        rtt
    }

    fn cap_bitrate_to_thresholds(&self, mut bitrate: i64) -> i64 {
        if self.latest_remb > 0 && bitrate > self.latest_remb {
            bitrate = self.latest_remb;
        }
        bitrate.clamp(self.min_bitrate_configured, self.max_bitrate_configured)
    }

    // Caps `new_bitrate` to the REMB/min/max thresholds and commits it,
    // warning when the candidate fell below the configured minimum.
    fn update_target_bitrate(&mut self, mut new_bitrate: i64, now_ms: i64) {
        if self.latest_remb > 0 && new_bitrate > self.latest_remb {
            new_bitrate = self.latest_remb;
        }
        new_bitrate = new_bitrate.min(self.max_bitrate_configured);
        if new_bitrate < self.min_bitrate_configured {
            self.maybe_log_low_bitrate_warning(new_bitrate, now_ms);
            new_bitrate = self.min_bitrate_configured;
        }
        self.latest_estimate = new_bitrate;
    }

    // Rate-limited so a persistently starved link does not flood the log.
    fn maybe_log_low_bitrate_warning(&mut self, bitrate: i64, now_ms: i64) {
        if self.last_low_bitrate_log_ms == -1
            || now_ms - self.last_low_bitrate_log_ms > Self::LOW_BITRATE_LOG_PERIOD_MS
        {
            tracing::warn!(
                bitrate_bps = bitrate,
                min_bitrate_bps = self.min_bitrate_configured,
                "Estimated available bandwidth is below the configured min bitrate."
            );
            self.last_low_bitrate_log_ms = now_ms;
        }
    }

    // Updates history of min bitrates. After this returns,
    // min_bitrate_history.front() contains the min bitrate used during the
    // last BWE_INCREASE_INTERVAL_MS.
    fn update_min_history(&mut self, now_ms: i64) {
        // Remove old data points from history. Since history precision is in
        // ms, add one so it is able to increase bitrate if it is off by as
        // little as 0.5ms.
        while let Some(&(timestamp_ms, _)) = self.min_bitrate_history.front() {
            if now_ms - timestamp_ms + 1 <= Self::BWE_INCREASE_INTERVAL_MS {
                break;
            }
            self.min_bitrate_history.pop_front();
        }

        // Typical minimum sliding-window algorithm: Pop values higher than
        // current bitrate before pushing it.
        while let Some(&(_, bitrate)) = self.min_bitrate_history.back() {
            if self.latest_estimate > bitrate {
                break;
            }
            self.min_bitrate_history.pop_back();
        }

        self.min_bitrate_history
            .push_back((now_ms, self.latest_estimate));
    }

    fn record_stats(&mut self, now_ms: i64, timed_out: bool, region: Option<LossRegion>) {
        self.stats.update(
            now_ms,
            timed_out,
            region,
            self.latest_estimate,
            self.latest_fraction_loss,
        );
    }
}

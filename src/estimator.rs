use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::{
    BweConfig, BweStatistics, ConfigError, ReceiverReportAggregator, ReportBlock,
    SendSideBandwidthEstimation,
};

/// Source of round-trip-time measurements for the transport the estimator
/// runs on. Implemented by the RTCP machinery that computes RTT from sender
/// report / receiver report timestamps.
pub trait RttProvider: Send + Sync {
    /// Last measured RTT to the remote endpoint, or `None` if no measurement
    /// exists yet.
    fn rtt_ms(&self) -> Option<i64>;
}

/// Handle returned by [`BandwidthEstimator::add_listener`], used to remove
/// the listener again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListenerHandle(u64);

type Listener = Arc<dyn Fn(i64) + Send + Sync>;

struct State {
    bwe: SendSideBandwidthEstimation,
    aggregator: ReceiverReportAggregator,
    last_update_time_ms: i64,
}

/// Thread-safe send-side bandwidth estimator.
///
/// Serializes the periodic update and asynchronous RTCP feedback arrival
/// through a single lock, and publishes estimate changes to registered
/// listeners. Listeners are invoked after the lock is released so they may
/// call back into the estimator.
pub struct BandwidthEstimator {
    state: Mutex<State>,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_listener_id: AtomicU64,
    rtt_provider: Option<Arc<dyn RttProvider>>,
}

impl BandwidthEstimator {
    /// Target cadence of the periodic update.
    const UPDATE_INTERVAL_MS: i64 = 25;

    pub fn new(config: &BweConfig) -> Result<Self, ConfigError> {
        Self::with_rng(config, fastrand::Rng::new())
    }

    /// Like [`new`](Self::new) but with an explicit RNG for the per-instance
    /// experiment coin flips, so tests are deterministic.
    pub fn with_rng(config: &BweConfig, mut rng: fastrand::Rng) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            state: Mutex::new(State {
                bwe: SendSideBandwidthEstimation::new(config, &mut rng),
                aggregator: ReceiverReportAggregator::new(),
                last_update_time_ms: -1,
            }),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(0),
            rtt_provider: None,
        })
    }

    pub fn set_rtt_provider(&mut self, provider: Arc<dyn RttProvider>) {
        self.rtt_provider = Some(provider);
    }

    /// Feeds one batch of RTCP receiver-report blocks. Invoked from the
    /// network-receive path.
    pub fn on_receiver_reports(&self, blocks: &[ReportBlock], now_ms: i64) {
        let (old, new) = {
            let mut state = self.state.lock().unwrap();
            self.refresh_rtt(&mut state);
            let old = state.bwe.latest_estimate();
            match state.aggregator.aggregate(blocks) {
                Some((fraction_lost, packet_count)) => {
                    state
                        .bwe
                        .update_receiver_block(fraction_lost, packet_count, now_ms)
                }
                // Feedback arrived even if the batch carried no usable
                // packet delta; the core must still see it or the
                // feedback-timeout accounting drifts.
                None => state.bwe.update_receiver_block(0, 0, now_ms),
            }
            (old, state.bwe.latest_estimate())
        };
        self.notify_if_changed(old, new);
    }

    /// Feeds a REMB report. The ceiling applies to the estimate immediately.
    pub fn on_remb(&self, bitrate_bps: i64) {
        let (old, new) = {
            let mut state = self.state.lock().unwrap();
            let old = state.bwe.latest_estimate();
            state.bwe.update_receiver_estimate(bitrate_bps);
            (old, state.bwe.latest_estimate())
        };
        self.notify_if_changed(old, new);
    }

    /// The periodic update; drive this from a recurring scheduler paced by
    /// [`time_until_next_run`](Self::time_until_next_run).
    pub fn run(&self, now_ms: i64) {
        let (old, new) = {
            let mut state = self.state.lock().unwrap();
            self.refresh_rtt(&mut state);
            let old = state.bwe.latest_estimate();
            state.bwe.update_estimate(now_ms);
            state.last_update_time_ms = now_ms;
            (old, state.bwe.latest_estimate())
        };
        self.notify_if_changed(old, new);
    }

    /// Milliseconds until the next periodic update is due.
    pub fn time_until_next_run(&self, now_ms: i64) -> i64 {
        let last = self.state.lock().unwrap().last_update_time_ms;
        if last == -1 {
            return 0;
        }
        (Self::UPDATE_INTERVAL_MS - (now_ms - last)).max(0)
    }

    pub fn set_min_max_bitrate(&self, min_bitrate_bps: i64, max_bitrate_bps: i64) {
        self.state
            .lock()
            .unwrap()
            .bwe
            .set_min_max_bitrate(min_bitrate_bps, max_bitrate_bps);
    }

    pub fn latest_estimate(&self) -> i64 {
        self.state.lock().unwrap().bwe.latest_estimate()
    }

    pub fn latest_remb(&self) -> i64 {
        self.state.lock().unwrap().bwe.latest_remb()
    }

    pub fn latest_fraction_loss(&self) -> u8 {
        self.state.lock().unwrap().bwe.latest_fraction_loss()
    }

    pub fn statistics(&self) -> BweStatistics {
        self.state.lock().unwrap().bwe.statistics()
    }

    /// Registers a callback fired with the new estimate (bps) whenever the
    /// estimate changes.
    pub fn add_listener(&self, listener: impl Fn(i64) + Send + Sync + 'static) -> ListenerHandle {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .unwrap()
            .push((id, Arc::new(listener)));
        ListenerHandle(id)
    }

    pub fn remove_listener(&self, handle: ListenerHandle) {
        self.listeners
            .lock()
            .unwrap()
            .retain(|(id, _)| *id != handle.0);
    }

    fn refresh_rtt(&self, state: &mut State) {
        if let Some(provider) = &self.rtt_provider {
            if let Some(rtt_ms) = provider.rtt_ms() {
                state.bwe.update_rtt(rtt_ms);
            }
        }
    }

    // Snapshot the listener set before firing so a listener may re-enter the
    // estimator without deadlocking.
    fn notify_if_changed(&self, old_bps: i64, new_bps: i64) {
        if old_bps == new_bps {
            return;
        }
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(new_bps);
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicI64;

    use super::*;

    fn make_estimator(config: &BweConfig) -> BandwidthEstimator {
        BandwidthEstimator::with_rng(config, fastrand::Rng::with_seed(7)).unwrap()
    }

    fn block(ssrc: u64, seq: u64, lost: u8) -> ReportBlock {
        ReportBlock {
            ssrc,
            extended_highest_seq_num: seq,
            fraction_lost: lost,
        }
    }

    struct FixedRtt(i64);

    impl RttProvider for FixedRtt {
        fn rtt_ms(&self) -> Option<i64> {
            Some(self.0)
        }
    }

    #[test]
    fn invalid_config_fails_construction() {
        let mut config = BweConfig::default();
        config.timeout_experiment_probability = -0.5;
        assert!(BandwidthEstimator::new(&config).is_err());
    }

    #[test]
    fn listeners_are_notified_on_change() {
        let estimator = make_estimator(&BweConfig::default());
        let seen = Arc::new(AtomicI64::new(0));
        let seen_by_listener = seen.clone();
        estimator.add_listener(move |bps| seen_by_listener.store(bps, Ordering::SeqCst));

        estimator.on_receiver_reports(&[block(1, 0, 0)], 0);
        // First block carries no delta, so no estimate change yet.
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        estimator.on_receiver_reports(&[block(1, 100, 0)], 100);
        assert_eq!(seen.load(Ordering::SeqCst), estimator.latest_estimate());
    }

    #[test]
    fn removed_listener_is_not_notified() {
        let estimator = make_estimator(&BweConfig::default());
        let seen = Arc::new(AtomicI64::new(0));
        let seen_by_listener = seen.clone();
        let handle =
            estimator.add_listener(move |bps| seen_by_listener.store(bps, Ordering::SeqCst));
        estimator.remove_listener(handle);

        estimator.on_remb(50_000);
        assert_ne!(estimator.latest_estimate(), 0);
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn listener_may_reenter_the_estimator() {
        let estimator = Arc::new(make_estimator(&BweConfig::default()));
        let observed = Arc::new(AtomicI64::new(0));
        let estimator_for_listener = estimator.clone();
        let observed_by_listener = observed.clone();
        estimator.add_listener(move |_| {
            // Re-entering must not deadlock on the state lock.
            observed_by_listener.store(
                estimator_for_listener.latest_estimate(),
                Ordering::SeqCst,
            );
        });

        estimator.on_remb(100_000);
        assert_eq!(observed.load(Ordering::SeqCst), 100_000);
    }

    #[test]
    fn run_cadence_targets_25ms() {
        let estimator = make_estimator(&BweConfig::default());
        // Never run: due immediately.
        assert_eq!(estimator.time_until_next_run(1_000), 0);

        estimator.run(1_000);
        assert_eq!(estimator.time_until_next_run(1_000), 25);
        assert_eq!(estimator.time_until_next_run(1_010), 15);
        assert_eq!(estimator.time_until_next_run(1_025), 0);
        assert_eq!(estimator.time_until_next_run(1_100), 0);
    }

    #[test]
    fn rtt_provider_paces_decreases() {
        let config = BweConfig {
            start_bitrate_bps: 1_000_000,
            ..Default::default()
        };
        let mut estimator = make_estimator(&config);
        estimator.set_rtt_provider(Arc::new(FixedRtt(600)));

        estimator.on_receiver_reports(&[block(1, 0, 0)], 0);
        estimator.on_receiver_reports(&[block(1, 100, 0)], 100);
        // 50% loss triggers one decrease.
        estimator.on_receiver_reports(&[block(1, 200, 128)], 10_000);
        let decreased = estimator.latest_estimate();
        assert!(decreased < 1_000_000);

        // 300ms + 600ms rtt have not elapsed; with the default 100ms rtt this
        // second decrease would already apply.
        estimator.on_receiver_reports(&[block(1, 300, 128)], 10_500);
        assert_eq!(estimator.latest_estimate(), decreased);

        estimator.on_receiver_reports(&[block(1, 400, 128)], 11_000);
        assert!(estimator.latest_estimate() < decreased);
    }

    #[test]
    fn delta_less_feedback_defers_timeout_decay() {
        let config = BweConfig {
            // Probability 1.0 forces the timeout branch regardless of seed.
            timeout_experiment_probability: 1.0,
            ..Default::default()
        };
        let estimator = make_estimator(&config);
        estimator.on_receiver_reports(&[block(1, 0, 0)], 0);
        estimator.on_receiver_reports(&[block(1, 100, 0)], 100);
        let before = estimator.latest_estimate();

        // The receiver keeps reporting, but with no sequence-number
        // progress. That is still feedback, so the timeout decay must not
        // treat it as silence.
        for second in 1..=5i64 {
            estimator.on_receiver_reports(&[block(1, 100, 0)], second * 1_000);
        }
        estimator.run(5_200);
        assert_eq!(estimator.latest_estimate(), before);
    }

    #[test]
    fn feedback_and_ticks_share_one_estimate() {
        let estimator = Arc::new(make_estimator(&BweConfig::default()));
        let feed = estimator.clone();
        let feeder = std::thread::spawn(move || {
            for i in 0..100i64 {
                feed.on_receiver_reports(&[block(1, (i as u64 + 1) * 50, 0)], i * 30);
            }
        });
        for i in 0..100i64 {
            estimator.run(i * 25);
        }
        feeder.join().unwrap();
        assert!(estimator.latest_estimate() >= 10_000);
    }

    #[test]
    fn statistics_snapshot_is_available_concurrently() {
        let estimator = make_estimator(&BweConfig::default());
        estimator.on_receiver_reports(&[block(1, 0, 0)], 0);
        estimator.on_receiver_reports(&[block(1, 100, 0)], 500);
        let stats = estimator.statistics();
        // Still inside the first loss-free run; totals roll on region change.
        assert_eq!(stats.loss_degraded_ms, 0);
    }
}

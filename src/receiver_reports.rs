use std::collections::HashMap;

/// One receiver-report block, as delivered by the RTCP feedback source for a
/// single remote sender SSRC.
#[derive(Clone, Copy, Debug)]
pub struct ReportBlock {
    pub ssrc: u64,
    pub extended_highest_seq_num: u64,
    /// Packet loss as a Q8 fixed-point fraction of 256.
    pub fraction_lost: u8,
}

/// Folds a batch of per-SSRC report blocks into a single weighted loss
/// fraction and packet count for the reporting interval.
///
/// Out-of-order or duplicate blocks are dropped per SSRC without raising an
/// error; stale feedback is normal network behavior, not a fault.
#[derive(Debug, Default)]
pub struct ReceiverReportAggregator {
    last_seq_num: HashMap<u64, u64>,
}

impl ReceiverReportAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the rounded weighted-average fraction lost (Q8) and the total
    /// packet count covered by `blocks`, or `None` when the batch carries no
    /// usable delta or the weighted average is out of range (corrupt
    /// feedback).
    pub fn aggregate(&mut self, blocks: &[ReportBlock]) -> Option<(u8, i64)> {
        let mut fraction_lost_sum: i64 = 0;
        let mut total_packets: i64 = 0;

        for block in blocks {
            let last = match self.last_seq_num.insert(block.ssrc, block.extended_highest_seq_num) {
                // First report for this SSRC carries no delta.
                None => continue,
                Some(last) => last,
            };
            let packet_count = block.extended_highest_seq_num as i64 - last as i64;
            if packet_count <= 0 {
                // Stale or duplicate report.
                continue;
            }
            if packet_count > u32::MAX as i64 {
                // Extended sequence numbers are 32 bits; a larger jump is
                // corrupt feedback, not a real packet count.
                tracing::warn!(
                    ssrc = block.ssrc,
                    packet_count,
                    "Dropping receiver report block with absurd sequence jump"
                );
                continue;
            }
            fraction_lost_sum += packet_count * block.fraction_lost as i64;
            total_packets += packet_count;
        }

        if total_packets == 0 {
            return None;
        }
        // Round half up; plain integer division here would shift the
        // loss-region boundaries at the margins.
        let fraction_lost = (fraction_lost_sum + total_packets / 2) / total_packets;
        if fraction_lost > 255 {
            tracing::warn!(
                fraction_lost,
                "Discarding receiver report batch with out-of-range loss fraction"
            );
            return None;
        }
        Some((fraction_lost as u8, total_packets))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn block(ssrc: u64, seq: u64, lost: u8) -> ReportBlock {
        ReportBlock {
            ssrc,
            extended_highest_seq_num: seq,
            fraction_lost: lost,
        }
    }

    #[test]
    fn first_report_carries_no_delta() {
        let mut aggregator = ReceiverReportAggregator::new();
        assert_eq!(aggregator.aggregate(&[block(1, 1000, 26)]), None);
        // Second report yields the delta since the first.
        assert_eq!(aggregator.aggregate(&[block(1, 1100, 26)]), Some((26, 100)));
    }

    #[test]
    fn stale_report_is_skipped() {
        let mut aggregator = ReceiverReportAggregator::new();
        aggregator.aggregate(&[block(1, 1000, 0)]);
        assert_eq!(aggregator.aggregate(&[block(1, 1000, 50)]), None);
        assert_eq!(aggregator.aggregate(&[block(1, 900, 50)]), None);
        // The stale sequence number still becomes the new baseline.
        assert_eq!(aggregator.aggregate(&[block(1, 950, 12)]), Some((12, 50)));
    }

    #[test]
    fn weights_loss_by_packet_count() {
        let mut aggregator = ReceiverReportAggregator::new();
        aggregator.aggregate(&[block(1, 0, 0), block(2, 0, 0)]);
        // 100 packets at 0 loss, 300 packets at 128: 38400/400 = 96 exactly.
        let result = aggregator.aggregate(&[block(1, 100, 0), block(2, 300, 128)]);
        assert_eq!(result, Some((96, 400)));
    }

    #[test]
    fn rounds_half_up() {
        let mut aggregator = ReceiverReportAggregator::new();
        aggregator.aggregate(&[block(1, 0, 0), block(2, 0, 0)]);
        // (1*10 + 1*11 + 1) / 2 = 11 with half-up, 10 with plain division.
        let result = aggregator.aggregate(&[block(1, 1, 10), block(2, 1, 11)]);
        assert_eq!(result, Some((11, 2)));
    }

    #[test]
    fn full_loss_stays_in_range() {
        let mut aggregator = ReceiverReportAggregator::new();
        aggregator.aggregate(&[block(1, 0, 0)]);
        // 255 is the ceiling of the Q8 scale; half-up rounding must not push
        // a fully lost interval past it.
        assert_eq!(aggregator.aggregate(&[block(1, 10, 255)]), Some((255, 10)));
    }

    #[test]
    fn absurd_sequence_jump_is_dropped() {
        let mut aggregator = ReceiverReportAggregator::new();
        aggregator.aggregate(&[block(1, 0, 0), block(2, 0, 0)]);
        // A jump past 32 bits cannot come from a real extended sequence
        // number; the block must be dropped without panicking, while sane
        // blocks in the same batch still count.
        let result =
            aggregator.aggregate(&[block(1, i64::MAX as u64, 255), block(2, 100, 10)]);
        assert_eq!(result, Some((10, 100)));
        // A batch with only the corrupt block carries no usable delta.
        assert_eq!(aggregator.aggregate(&[block(1, i64::MAX as u64, 255)]), None);
    }

    #[test]
    fn independent_ssrcs_tracked_separately() {
        let mut aggregator = ReceiverReportAggregator::new();
        assert_eq!(aggregator.aggregate(&[block(1, 500, u8::MAX)]), None);
        assert_eq!(aggregator.aggregate(&[block(2, 900, 3)]), None);
        assert_eq!(aggregator.aggregate(&[block(2, 1000, 3)]), Some((3, 100)));
    }
}

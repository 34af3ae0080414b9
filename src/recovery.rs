use std::collections::BTreeMap;

use crate::pnspace::{PacketNumberSpace, SentPacket, Space};

/// Maximum reordering in packets before packet-threshold loss detection
/// considers a packet lost (RFC 9002 §6.1.1).
const K_PACKET_THRESHOLD: u64 = 3;
/// Timer granularity; no implementation should use anything finer.
const K_GRANULARITY_MS: u64 = 1;
/// RTT assumed before the first sample arrives.
const K_INITIAL_RTT_MS: u64 = 500;
/// Consecutive PTOs after which the path is considered persistently congested.
const K_PERSISTENT_CONGESTION_THRESHOLD: u32 = 3;
/// Congestion window reduction factor applied on a loss event.
const K_LOSS_REDUCTION_DIVISOR: u64 = 2;

fn initial_window(max_datagram_size: u64) -> u64 {
    (10 * max_datagram_size).min((2 * max_datagram_size).max(14720))
}

fn minimum_window(max_datagram_size: u64) -> u64 {
    2 * max_datagram_size
}

/// RTT estimator per RFC 9002 §5: EWMA of 1/8 for the mean, 1/4 for the
/// mean deviation, seeded with `kInitialRtt` until the first real sample.
#[derive(Debug, Clone, Copy)]
pub struct RttEstimator {
    pub latest_rtt_ms: u64,
    pub smoothed_rtt_ms: u64,
    pub rttvar_ms: u64,
    pub min_rtt_ms: u64,
    first_sample_taken: bool,
}

impl RttEstimator {
    pub fn new() -> Self {
        Self {
            latest_rtt_ms: K_INITIAL_RTT_MS,
            smoothed_rtt_ms: K_INITIAL_RTT_MS,
            rttvar_ms: K_INITIAL_RTT_MS / 2,
            min_rtt_ms: u64::MAX,
            first_sample_taken: false,
        }
    }

    /// Folds in a new RTT sample. `ack_delay_ms` is the peer-reported,
    /// already-decoded ACK Delay, clamped to the handshake-confirmed max
    /// ack delay by the caller before this is invoked.
    pub fn update(&mut self, rtt_sample_ms: u64, ack_delay_ms: u64) {
        self.latest_rtt_ms = rtt_sample_ms;
        self.min_rtt_ms = self.min_rtt_ms.min(rtt_sample_ms);

        if !self.first_sample_taken {
            self.smoothed_rtt_ms = rtt_sample_ms;
            self.rttvar_ms = rtt_sample_ms / 2;
            self.first_sample_taken = true;
            return;
        }

        let adjusted_rtt = if rtt_sample_ms >= self.min_rtt_ms + ack_delay_ms {
            rtt_sample_ms - ack_delay_ms
        } else {
            rtt_sample_ms
        };

        let rttvar_sample = self.smoothed_rtt_ms.abs_diff(adjusted_rtt);
        self.rttvar_ms = (3 * self.rttvar_ms + rttvar_sample) / 4;
        self.smoothed_rtt_ms = (7 * self.smoothed_rtt_ms + adjusted_rtt) / 8;
    }

    /// Probe Timeout duration per RFC 9002 §6.2.1, before any PTO backoff
    /// doubling is applied.
    pub fn base_pto_ms(&self, max_ack_delay_ms: u64) -> u64 {
        self.smoothed_rtt_ms + (4 * self.rttvar_ms).max(K_GRANULARITY_MS) + max_ack_delay_ms
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

/// NewReno congestion controller (RFC 9002 §7), shared across all three
/// packet-number spaces for the one congestion-controlled path this crate
/// supports (no multipath, per the scope this corpus carries).
#[derive(Debug, Clone, Copy)]
pub struct CongestionController {
    pub cwnd: u64,
    pub ssthresh: u64,
    pub bytes_in_flight: u64,
    congestion_recovery_start_time_ms: Option<u64>,
}

impl CongestionController {
    pub fn new(max_datagram_size: u64) -> Self {
        Self {
            cwnd: initial_window(max_datagram_size),
            ssthresh: u64::MAX,
            bytes_in_flight: 0,
            congestion_recovery_start_time_ms: None,
        }
    }

    pub fn is_in_slow_start(&self) -> bool {
        self.cwnd < self.ssthresh
    }

    fn is_in_congestion_recovery(&self, sent_time_ms: u64) -> bool {
        self.congestion_recovery_start_time_ms.map(|t| sent_time_ms <= t).unwrap_or(false)
    }

    pub fn on_packet_sent(&mut self, size: u64) {
        self.bytes_in_flight += size;
    }

    /// Applies one acked packet. `max_datagram_size` drives slow-start's
    /// per-ACK growth; congestion avoidance grows by
    /// `max_datagram_size * acked / cwnd` per RFC 9002 §7.3.2.
    pub fn on_packet_acked(&mut self, sent_time_ms: u64, size: u64, max_datagram_size: u64) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(size);
        if self.is_in_congestion_recovery(sent_time_ms) {
            return;
        }
        if self.is_in_slow_start() {
            self.cwnd += size;
        } else {
            self.cwnd += max_datagram_size * size / self.cwnd.max(1);
        }
    }

    /// Enters congestion recovery on the first loss/ECN event of an episode,
    /// halving `cwnd` down to `kMinimumWindow`.
    pub fn on_congestion_event(&mut self, sent_time_ms: u64, now_ms: u64, max_datagram_size: u64) {
        if self.is_in_congestion_recovery(sent_time_ms) {
            return;
        }
        self.congestion_recovery_start_time_ms = Some(now_ms);
        self.cwnd = (self.cwnd / K_LOSS_REDUCTION_DIVISOR).max(minimum_window(max_datagram_size));
        self.ssthresh = self.cwnd;
    }

    /// Collapses to the minimum window on detection of persistent
    /// congestion (RFC 9002 §7.6), distinct from a single congestion event.
    pub fn on_persistent_congestion(&mut self, max_datagram_size: u64) {
        self.cwnd = minimum_window(max_datagram_size);
        self.congestion_recovery_start_time_ms = None;
    }

    pub fn is_app_or_flow_control_limited(&self, available_to_send: u64) -> bool {
        available_to_send < self.cwnd.saturating_sub(self.bytes_in_flight)
    }

    /// True once in-flight bytes are close enough to `cwnd` that the sender
    /// should force an ack-eliciting PING to keep the loss-detection timer
    /// alive, rather than going silent while still congestion-blocked.
    pub fn should_probe_with_ping(&self, max_datagram_size: u64) -> bool {
        self.bytes_in_flight + max_datagram_size > self.cwnd
    }
}

/// Outcome of a loss-detection pass: packets declared lost, and whether any
/// of them indicate persistent congestion.
pub struct DetectedLosses {
    pub lost: Vec<(u64, SentPacket)>,
    pub persistent_congestion: bool,
}

/// One per-connection recovery engine driving the three packet-number
/// spaces' loss detection, PTO, and the single shared congestion controller.
pub struct Recovery {
    pub rtt: RttEstimator,
    pub congestion: CongestionController,
    pub max_datagram_size: u64,
    pub pto_count: u32,
    pub loss_detection_timer_ms: Option<u64>,
    time_of_last_ack_eliciting_send_ms: BTreeMap<Space, u64>,
}

impl Recovery {
    pub fn new(max_datagram_size: u64) -> Self {
        Self {
            rtt: RttEstimator::new(),
            congestion: CongestionController::new(max_datagram_size),
            max_datagram_size,
            pto_count: 0,
            loss_detection_timer_ms: None,
            time_of_last_ack_eliciting_send_ms: BTreeMap::new(),
        }
    }

    pub fn on_packet_sent(&mut self, space: Space, now_ms: u64, sent: &SentPacket) {
        if sent.in_flight {
            self.congestion.on_packet_sent(sent.size as u64);
        }
        if sent.ack_eliciting {
            self.time_of_last_ack_eliciting_send_ms.insert(space, now_ms);
        }
    }

    /// Processes one ACK frame's effect on RTT and congestion state for
    /// packets in `space` whose numbers fall within `acked_ranges`
    /// (descending, inclusive, as decoded off the wire). Returns the set of
    /// newly-lost packets so the caller can requeue their frames.
    pub fn on_ack_received(
        &mut self,
        space: &mut PacketNumberSpace,
        acked_ranges: &[(u64, u64)],
        ack_delay_ms: u64,
        max_ack_delay_ms: u64,
        now_ms: u64,
    ) -> DetectedLosses {
        let mut newly_acked: Vec<(u64, SentPacket)> = Vec::new();
        let mut largest_newly_acked: Option<(u64, SentPacket)> = None;

        for &(lo, hi) in acked_ranges {
            let pns: Vec<u64> = space.sent.range(lo..=hi).map(|(&pn, _)| pn).collect();
            for pn in pns {
                if let Some(sent) = space.sent.remove(&pn) {
                    if largest_newly_acked.as_ref().map(|(p, _)| pn > *p).unwrap_or(true) {
                        largest_newly_acked = Some((pn, sent.clone()));
                    }
                    newly_acked.push((pn, sent));
                }
            }
        }

        if let Some(largest_acked) = acked_ranges.iter().map(|&(_, hi)| hi).max() {
            space.lg_acked = Some(space.lg_acked.map(|l| l.max(largest_acked)).unwrap_or(largest_acked));
        }

        // An RTT sample is only valid if it updates our knowledge of the
        // largest acked packet and that packet was ack-eliciting (RFC 9002 §5.1).
        if let Some((pn, sent)) = &largest_newly_acked {
            if sent.ack_eliciting && space.lg_acked == Some(*pn) {
                let rtt_sample_ms = now_ms.saturating_sub(sent.time_sent_ms);
                self.rtt.update(rtt_sample_ms, ack_delay_ms.min(max_ack_delay_ms));
            }
        }

        for (_, sent) in &newly_acked {
            if sent.in_flight {
                self.congestion.on_packet_acked(sent.time_sent_ms, sent.size as u64, self.max_datagram_size);
            }
        }

        self.pto_count = 0;
        self.detect_and_remove_lost_packets(space, now_ms)
    }

    /// Declares lost every in-flight packet older than either the packet
    /// or time threshold relative to the largest acked packet number
    /// (RFC 9002 §6.1), removing them from `space.sent`.
    fn detect_and_remove_lost_packets(&mut self, space: &mut PacketNumberSpace, now_ms: u64) -> DetectedLosses {
        let Some(largest_acked) = space.lg_acked else {
            return DetectedLosses { lost: Vec::new(), persistent_congestion: false };
        };

        let loss_delay_ms = ((9 * self.rtt.smoothed_rtt_ms.max(self.rtt.latest_rtt_ms)) / 8).max(K_GRANULARITY_MS);
        let lost_send_time_threshold_ms = now_ms.saturating_sub(loss_delay_ms);

        let mut lost_pns = Vec::new();
        for (&pn, sent) in space.sent.range(..=largest_acked) {
            let by_packet_threshold = largest_acked >= pn + K_PACKET_THRESHOLD;
            let by_time_threshold = sent.time_sent_ms <= lost_send_time_threshold_ms;
            if by_packet_threshold || by_time_threshold {
                lost_pns.push(pn);
            }
        }

        let mut lost = Vec::new();
        for pn in &lost_pns {
            if let Some(sent) = space.sent.remove(pn) {
                lost.push((*pn, sent));
            }
        }

        let persistent_congestion = self.is_persistent_congestion(&lost, now_ms);

        if let Some((&first_pn, first_sent)) = lost.first().map(|(pn, s)| (pn, s)) {
            let _ = first_pn;
            if lost.iter().any(|(_, s)| s.in_flight) {
                let oldest_sent_time = lost.iter().map(|(_, s)| s.time_sent_ms).min().unwrap_or(first_sent.time_sent_ms);
                self.congestion.on_congestion_event(oldest_sent_time, now_ms, self.max_datagram_size);
            }
        }
        if persistent_congestion {
            self.congestion.on_persistent_congestion(self.max_datagram_size);
        }

        DetectedLosses { lost, persistent_congestion }
    }

    /// Persistent congestion (RFC 9002 §7.6): every in-flight packet sent
    /// within a single PTO-scaled window around the loss episode was lost.
    fn is_persistent_congestion(&self, lost: &[(u64, SentPacket)], _now_ms: u64) -> bool {
        if lost.len() < 2 {
            return false;
        }
        let earliest = lost.iter().map(|(_, s)| s.time_sent_ms).min().unwrap();
        let latest = lost.iter().map(|(_, s)| s.time_sent_ms).max().unwrap();
        let pto = self.rtt.base_pto_ms(0);
        let period = pto * K_PERSISTENT_CONGESTION_THRESHOLD as u64;
        latest.saturating_sub(earliest) >= period
    }

    /// Computes the absolute time the PTO timer should fire, doubled by
    /// `pto_count` consecutive expirations (RFC 9002 §6.2.1).
    pub fn pto_deadline_ms(&self, space: Space, max_ack_delay_ms: u64) -> Option<u64> {
        let last_send = *self.time_of_last_ack_eliciting_send_ms.get(&space)?;
        let pto = self.rtt.base_pto_ms(if space == Space::Application { max_ack_delay_ms } else { 0 });
        let backoff = 1u64 << self.pto_count.min(32);
        Some(last_send + pto.saturating_mul(backoff))
    }

    pub fn on_pto_expired(&mut self) {
        self.pto_count += 1;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn initial_window_matches_rfc6928_bounds() {
        assert_eq!(initial_window(1200), 10 * 1200);
        assert_eq!(initial_window(100), 14720);
    }

    #[test]
    fn rtt_estimator_seeds_from_first_sample() {
        let mut rtt = RttEstimator::new();
        rtt.update(100, 5);
        assert_eq!(rtt.smoothed_rtt_ms, 100);
        assert_eq!(rtt.rttvar_ms, 50);
        assert_eq!(rtt.min_rtt_ms, 100);
    }

    #[test]
    fn rtt_estimator_ewma_converges_toward_samples() {
        let mut rtt = RttEstimator::new();
        rtt.update(100, 0);
        for _ in 0..50 {
            rtt.update(120, 0);
        }
        assert!((rtt.smoothed_rtt_ms as i64 - 120).abs() < 2);
    }

    #[test]
    fn congestion_control_grows_in_slow_start_then_avoidance() {
        let mut cc = CongestionController::new(1200);
        let initial = cc.cwnd;
        cc.on_packet_sent(1200);
        cc.on_packet_acked(0, 1200, 1200);
        assert_eq!(cc.cwnd, initial + 1200);

        cc.ssthresh = cc.cwnd; // force congestion avoidance
        let before = cc.cwnd;
        cc.on_packet_sent(1200);
        cc.on_packet_acked(0, 1200, 1200);
        assert!(cc.cwnd > before && cc.cwnd < before + 1200);
    }

    #[test]
    fn congestion_event_halves_window_once_per_episode() {
        let mut cc = CongestionController::new(1200);
        let before = cc.cwnd;
        cc.on_congestion_event(100, 200, 1200);
        assert_eq!(cc.cwnd, (before / 2).max(2400));
        let after_first = cc.cwnd;
        // a second loss within the same episode (sent before recovery start) is a no-op
        cc.on_congestion_event(100, 250, 1200);
        assert_eq!(cc.cwnd, after_first);
    }

    #[test]
    fn loss_detection_uses_packet_threshold() {
        let mut recovery = Recovery::new(1200);
        let mut space = PacketNumberSpace::new();
        for pn in 0..5u64 {
            space.sent.insert(
                pn,
                SentPacket {
                    size: 1200,
                    time_sent_ms: pn * 10,
                    ack_eliciting: true,
                    in_flight: true,
                    frames: vec![],
                },
            );
        }
        // ack only the largest packet, 3+ ahead of pn=0 => pn 0 is packet-threshold lost
        let losses = recovery.on_ack_received(&mut space, &[(4, 4)], 0, 25, 1000);
        assert!(losses.lost.iter().any(|(pn, _)| *pn == 0));
    }

    #[test]
    fn pto_deadline_doubles_with_each_expiry() {
        let mut recovery = Recovery::new(1200);
        recovery.time_of_last_ack_eliciting_send_ms.insert(Space::Application, 1000);
        let first = recovery.pto_deadline_ms(Space::Application, 0).unwrap();
        recovery.on_pto_expired();
        let second = recovery.pto_deadline_ms(Space::Application, 0).unwrap();
        assert_eq!(second - 1000, (first - 1000) * 2);
    }
}

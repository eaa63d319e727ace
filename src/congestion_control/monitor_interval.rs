// Copyright (c) 2023 The TQUIC Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Monitor intervals attribute packet feedback to the sending rate that was
//! in effect when each packet was sent.
//!
//! A monitor interval covers `(start_time, start_time + duration]`. It only
//! knows it has seen all of its feedback once a packet sent after its end is
//! reported, since feedback about its last packets may still be in flight.

use std::time::Duration;
use std::time::Instant;

use log::*;

use crate::network_types::PacketResult;
use crate::units::DataRate;
use crate::units::DataSize;

/// Feedback collected for packets sent at one target rate.
#[derive(Debug, Clone)]
pub struct MonitorInterval {
    target_sending_rate: DataRate,

    start_time: Instant,

    duration: Duration,

    received_packets_rtt: Vec<Duration>,

    received_packets_sent_time: Vec<Instant>,

    lost_packets_sent_time: Vec<Instant>,

    received_packets_size: DataSize,

    lost_packets_size: DataSize,

    /// Set once a packet sent after the end of the interval is reported.
    got_complete_feedback: bool,
}

impl MonitorInterval {
    pub fn new(target_sending_rate: DataRate, start_time: Instant, duration: Duration) -> Self {
        Self {
            target_sending_rate,
            start_time,
            duration,
            received_packets_rtt: Vec::new(),
            received_packets_sent_time: Vec::new(),
            lost_packets_sent_time: Vec::new(),
            received_packets_size: DataSize::ZERO,
            lost_packets_size: DataSize::ZERO,
            got_complete_feedback: false,
        }
    }

    /// Record feedback about packets sent inside the interval.
    ///
    /// Return true once the interval is complete. The packet that completes
    /// the interval is not recorded.
    pub fn on_packets_feedback(&mut self, packet_results: &[PacketResult]) -> bool {
        for result in packet_results {
            let sent = match result.sent_packet {
                Some(sent) => sent,
                None => continue,
            };

            if sent.send_time <= self.start_time {
                continue;
            }

            if sent.send_time > self.end_time() {
                self.got_complete_feedback = true;
                return true;
            }

            match result.receive_time {
                Some(receive_time) => {
                    self.received_packets_rtt
                        .push(receive_time.saturating_duration_since(sent.send_time));
                    self.received_packets_sent_time.push(sent.send_time);
                    self.received_packets_size += sent.size;
                }
                None => {
                    self.lost_packets_sent_time.push(sent.send_time);
                    self.lost_packets_size += sent.size;
                }
            }
        }

        false
    }

    pub fn is_feedback_collecting_done(&self) -> bool {
        self.got_complete_feedback
    }

    pub fn end_time(&self) -> Instant {
        self.start_time + self.duration
    }

    pub fn interval_duration(&self) -> Duration {
        self.duration
    }

    pub fn target_bitrate(&self) -> DataRate {
        self.target_sending_rate
    }

    pub fn received_packets_rtt(&self) -> &[Duration] {
        &self.received_packets_rtt
    }

    pub fn received_packets_sent_time(&self) -> &[Instant] {
        &self.received_packets_sent_time
    }

    pub fn lost_packets_sent_time(&self) -> &[Instant] {
        &self.lost_packets_sent_time
    }

    /// Fraction of the recorded bytes that were lost.
    ///
    /// Return `None` until at least one byte has been recorded.
    pub fn loss_rate(&self) -> Option<f64> {
        let total = self.lost_packets_size + self.received_packets_size;
        if total.is_zero() {
            return None;
        }
        Some(self.lost_packets_size / total)
    }
}

/// A sequence of monitor intervals, one per target bitrate.
///
/// Intervals are started lazily: `notify_current_time` opens the next one once
/// the clock has passed the end of the open interval.
#[derive(Debug)]
pub struct MonitorBlock {
    last_known_time: Instant,

    monitor_intervals_bitrates: Vec<DataRate>,

    monitor_intervals: Vec<MonitorInterval>,

    intervals_duration: Duration,

    /// Rate to send at once every interval has ended.
    default_bitrate: DataRate,

    /// How long to wait for the feedback of an interval after its end.
    mi_timeout: Duration,

    /// Number of leading intervals with complete feedback.
    complete_feedback_mi_number: usize,

    got_complete_feedback: bool,
}

impl MonitorBlock {
    pub fn new(
        current_time: Instant,
        intervals_duration: Duration,
        default_bitrate: DataRate,
        mi_timeout: Duration,
        monitor_intervals_bitrates: Vec<DataRate>,
    ) -> Self {
        let mut monitor_intervals = Vec::with_capacity(monitor_intervals_bitrates.len());
        if let Some(bitrate) = monitor_intervals_bitrates.first() {
            monitor_intervals.push(MonitorInterval::new(
                *bitrate,
                current_time,
                intervals_duration,
            ));
        }

        Self {
            last_known_time: current_time,
            monitor_intervals_bitrates,
            monitor_intervals,
            intervals_duration,
            default_bitrate,
            mi_timeout,
            complete_feedback_mi_number: 0,
            got_complete_feedback: false,
        }
    }

    /// Advance the block clock and return the rate to send at.
    pub fn notify_current_time(&mut self, time: Instant) -> DataRate {
        self.last_known_time = time;

        let last = match self.monitor_intervals.last() {
            Some(last) => last,
            None => return self.default_bitrate,
        };
        if time < last.end_time() {
            return last.target_bitrate();
        }

        let next = self.monitor_intervals.len();
        let bitrate = match self.monitor_intervals_bitrates.get(next) {
            Some(bitrate) => *bitrate,
            None => return self.default_bitrate,
        };

        trace!(
            "monitor block: start interval {} at {} for {:?}",
            next,
            bitrate,
            self.intervals_duration
        );
        self.monitor_intervals
            .push(MonitorInterval::new(bitrate, time, self.intervals_duration));
        bitrate
    }

    /// The rate to send at, as of the last known time.
    pub fn target_bitrate(&self) -> DataRate {
        match self.monitor_intervals.last() {
            Some(last)
                if self.monitor_intervals.len() < self.monitor_intervals_bitrates.len()
                    || self.last_known_time < last.end_time() =>
            {
                last.target_bitrate()
            }
            _ => self.default_bitrate,
        }
    }

    /// Dispatch feedback to the intervals still collecting it.
    ///
    /// A batch that completes one interval is offered to the next one too, so
    /// feedback spanning several intervals is not lost. Return true once every
    /// interval is complete.
    pub fn on_packets_feedback(&mut self, packet_results: &[PacketResult]) -> bool {
        if self.got_complete_feedback {
            return true;
        }

        if self.monitor_intervals.is_empty() {
            self.got_complete_feedback = true;
            return true;
        }

        while let Some(interval) = self
            .monitor_intervals
            .get_mut(self.complete_feedback_mi_number)
        {
            if !interval.on_packets_feedback(packet_results) {
                break;
            }
            self.complete_feedback_mi_number += 1;
        }

        if self.complete_feedback_mi_number >= self.monitor_intervals_bitrates.len() {
            debug!("monitor block: feedback of {} intervals collected", self.size());
            self.got_complete_feedback = true;
        }
        self.got_complete_feedback
    }

    pub fn update_timeout(&mut self, new_timeout: Duration) {
        self.mi_timeout = new_timeout;
    }

    pub fn is_feedback_collecting_done(&self) -> bool {
        self.got_complete_feedback
    }

    /// Whether the first incomplete interval ended more than the timeout ago.
    pub fn is_timeout_expired(&self) -> bool {
        match self.monitor_intervals.get(self.complete_feedback_mi_number) {
            Some(interval) => self
                .last_known_time
                .checked_duration_since(interval.end_time())
                .map_or(false, |elapsed| elapsed >= self.mi_timeout),
            None => false,
        }
    }

    /// Number of intervals the block will run.
    pub fn size(&self) -> usize {
        self.monitor_intervals_bitrates.len()
    }

    /// The started interval at `index`.
    pub fn monitor_interval(&self, index: usize) -> Option<&MonitorInterval> {
        self.monitor_intervals.get(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network_types::SentPacket;

    const TARGET_SENDING_RATE: DataRate = DataRate::from_bps(100);
    const EPSILON: f64 = 0.05;
    const INTERVAL_DURATION: Duration = Duration::from_micros(10);
    const DEFAULT_RTT: Duration = Duration::from_micros(10);
    const DEFAULT_DATA_SIZE: DataSize = DataSize::from_bytes(100);
    const MI_TIMEOUT: Duration = Duration::from_micros(40);

    fn us(base: Instant, micros: f64) -> Instant {
        base + Duration::from_nanos((micros * 1000.0) as u64)
    }

    fn packet_results(send_times: &[Instant]) -> Vec<PacketResult> {
        send_times
            .iter()
            .map(|t| {
                PacketResult::received(SentPacket::new(*t, DEFAULT_DATA_SIZE), *t + DEFAULT_RTT)
            })
            .collect()
    }

    #[test]
    fn monitor_interval_initial_values() {
        let start = Instant::now();
        let interval = MonitorInterval::new(TARGET_SENDING_RATE, start, INTERVAL_DURATION);
        assert!(!interval.is_feedback_collecting_done());
        assert_eq!(interval.end_time(), start + INTERVAL_DURATION);
        assert_eq!(interval.interval_duration(), INTERVAL_DURATION);
        assert_eq!(interval.target_bitrate(), TARGET_SENDING_RATE);
        assert_eq!(interval.loss_rate(), None);
    }

    #[test]
    fn monitor_interval_collecting_feedback() {
        let start = Instant::now();
        let mut interval = MonitorInterval::new(TARGET_SENDING_RATE, start, INTERVAL_DURATION);

        assert!(!interval.on_packets_feedback(&packet_results(&[start])));
        assert!(!interval.is_feedback_collecting_done());

        assert!(!interval.on_packets_feedback(&packet_results(&[
            start,
            start + INTERVAL_DURATION
        ])));
        assert!(!interval.is_feedback_collecting_done());

        assert!(interval.on_packets_feedback(&packet_results(&[
            start + INTERVAL_DURATION,
            start + 2 * INTERVAL_DURATION
        ])));
        assert!(interval.is_feedback_collecting_done());
    }

    #[test]
    fn monitor_interval_received_packets_info() {
        let start = Instant::now();
        let mut interval = MonitorInterval::new(TARGET_SENDING_RATE, start, INTERVAL_DURATION);

        let send_times = [
            us(start, 0.0),
            us(start, 1.0),
            us(start, 5.0),
            us(start, 10.0),
            us(start, 20.0),
        ];
        let receive_times = [
            Some(us(start, 20.0)),
            Some(us(start, 20.0)),
            None,
            Some(us(start, 20.0)),
            Some(us(start, 40.0)),
        ];
        let results: Vec<PacketResult> = send_times
            .iter()
            .zip(receive_times.iter())
            .enumerate()
            .map(|(i, (send, receive))| PacketResult {
                sent_packet: Some(SentPacket::new(*send, DEFAULT_DATA_SIZE * (i as u64 + 1))),
                receive_time: *receive,
            })
            .collect();

        assert!(interval.on_packets_feedback(&results));
        assert!(interval.is_feedback_collecting_done());

        assert_eq!(
            interval.received_packets_rtt(),
            &[Duration::from_micros(19), Duration::from_micros(10)]
        );
        assert_eq!(interval.received_packets_sent_time(), &[send_times[1], send_times[3]]);
        assert_eq!(interval.lost_packets_sent_time(), &[send_times[2]]);

        // 300 bytes lost out of 200 + 300 + 400.
        assert_eq!(interval.loss_rate(), Some(1.0 / 3.0));
    }

    #[test]
    fn monitor_interval_skips_unmatched_feedback() {
        let start = Instant::now();
        let mut interval = MonitorInterval::new(TARGET_SENDING_RATE, start, INTERVAL_DURATION);
        let unmatched = PacketResult {
            sent_packet: None,
            receive_time: Some(start + INTERVAL_DURATION),
        };
        assert!(!interval.on_packets_feedback(&[unmatched]));
        assert!(interval.received_packets_rtt().is_empty());
        assert_eq!(interval.loss_rate(), None);
    }

    #[test]
    fn monitor_block_empty() {
        let start = Instant::now();
        let mut block = MonitorBlock::new(
            start,
            INTERVAL_DURATION,
            TARGET_SENDING_RATE,
            MI_TIMEOUT,
            vec![],
        );
        assert_eq!(block.size(), 0);
        assert!(block.monitor_interval(0).is_none());
        assert_eq!(block.target_bitrate(), TARGET_SENDING_RATE);
        assert_eq!(block.notify_current_time(start + INTERVAL_DURATION), TARGET_SENDING_RATE);
        assert!(!block.is_timeout_expired());
        assert!(block.on_packets_feedback(&[]));
        assert!(block.is_feedback_collecting_done());
    }

    #[test]
    fn monitor_block_initial_values() {
        let start = Instant::now();
        let block = MonitorBlock::new(
            start,
            INTERVAL_DURATION,
            TARGET_SENDING_RATE,
            MI_TIMEOUT,
            vec![TARGET_SENDING_RATE * (1.0 + EPSILON), TARGET_SENDING_RATE * (1.0 - EPSILON)],
        );
        assert!(!block.is_timeout_expired());
        assert!(!block.is_feedback_collecting_done());
        assert_eq!(block.target_bitrate(), TARGET_SENDING_RATE * (1.0 + EPSILON));
        assert_eq!(block.size(), 2);
    }

    #[test]
    fn monitor_block_one_interval_timeout() {
        let start = Instant::now();
        let mut block = MonitorBlock::new(
            start,
            INTERVAL_DURATION,
            TARGET_SENDING_RATE,
            MI_TIMEOUT,
            vec![TARGET_SENDING_RATE * 2.0],
        );
        assert!(!block.is_timeout_expired());
        assert!(!block.is_feedback_collecting_done());
        assert_eq!(block.target_bitrate(), TARGET_SENDING_RATE * 2.0);
        assert_eq!(block.size(), 1);

        assert_eq!(block.notify_current_time(us(start, 5.0)), TARGET_SENDING_RATE * 2.0);
        assert!(!block.is_timeout_expired());
        assert_eq!(block.target_bitrate(), TARGET_SENDING_RATE * 2.0);

        assert_eq!(block.notify_current_time(start + INTERVAL_DURATION), TARGET_SENDING_RATE);
        assert!(!block.is_timeout_expired());
        assert_eq!(block.target_bitrate(), TARGET_SENDING_RATE);
        assert_eq!(block.size(), 1);

        block.notify_current_time(start + MI_TIMEOUT);
        assert!(!block.is_timeout_expired());
        assert_eq!(block.target_bitrate(), TARGET_SENDING_RATE);

        block.notify_current_time(start + INTERVAL_DURATION + MI_TIMEOUT);
        assert!(block.is_timeout_expired());
        assert!(!block.is_feedback_collecting_done());
        assert_eq!(block.target_bitrate(), TARGET_SENDING_RATE);

        block.update_timeout(MI_TIMEOUT * 2);
        assert!(!block.is_timeout_expired());
    }

    #[test]
    fn monitor_block_one_interval_collect_feedback() {
        let start = Instant::now();
        let mut block = MonitorBlock::new(
            start,
            INTERVAL_DURATION,
            TARGET_SENDING_RATE,
            MI_TIMEOUT,
            vec![TARGET_SENDING_RATE * 2.0],
        );

        block.notify_current_time(us(start, 5.0));
        assert!(!block.on_packets_feedback(&packet_results(&[us(start, 1.0), us(start, 5.0)])));
        assert!(!block.is_feedback_collecting_done());

        block.notify_current_time(start + INTERVAL_DURATION);
        assert!(!block.on_packets_feedback(&packet_results(&[start + INTERVAL_DURATION])));
        assert!(!block.is_feedback_collecting_done());

        block.notify_current_time(start + 2 * INTERVAL_DURATION);
        assert!(block.on_packets_feedback(&packet_results(&[start + 2 * INTERVAL_DURATION])));
        assert!(block.is_feedback_collecting_done());

        let interval = block.monitor_interval(0).unwrap();
        assert_eq!(interval.received_packets_sent_time().len(), 3);
    }

    #[test]
    fn monitor_block_two_intervals_timeout() {
        let start = Instant::now();
        let mut block = MonitorBlock::new(
            start,
            INTERVAL_DURATION,
            TARGET_SENDING_RATE,
            MI_TIMEOUT,
            vec![TARGET_SENDING_RATE * (1.0 + EPSILON), TARGET_SENDING_RATE * (1.0 - EPSILON)],
        );

        assert_eq!(
            block.notify_current_time(us(start, 12.0)),
            TARGET_SENDING_RATE * (1.0 - EPSILON)
        );
        block.on_packets_feedback(&packet_results(&[us(start, 1.0), us(start, 11.0)]));

        assert!(!block.is_timeout_expired());
        assert!(!block.is_feedback_collecting_done());
        assert!(block.monitor_interval(0).unwrap().is_feedback_collecting_done());
        assert!(!block.monitor_interval(1).unwrap().is_feedback_collecting_done());
        assert_eq!(block.target_bitrate(), TARGET_SENDING_RATE * (1.0 - EPSILON));
        assert_eq!(block.size(), 2);

        block.notify_current_time(start + MI_TIMEOUT);
        assert!(!block.is_timeout_expired());
        assert!(!block.is_feedback_collecting_done());
        assert_eq!(block.target_bitrate(), TARGET_SENDING_RATE);

        block.notify_current_time(start + INTERVAL_DURATION + MI_TIMEOUT);
        assert!(!block.is_timeout_expired());

        // The second interval ends at 22us.
        block.notify_current_time(us(start, 22.0) + MI_TIMEOUT);
        assert!(block.is_timeout_expired());
        assert!(!block.is_feedback_collecting_done());
    }

    #[test]
    fn monitor_block_feedback_spanning_intervals() {
        let start = Instant::now();
        let mut block = MonitorBlock::new(
            start,
            INTERVAL_DURATION,
            TARGET_SENDING_RATE,
            MI_TIMEOUT,
            vec![TARGET_SENDING_RATE, TARGET_SENDING_RATE * 2.0],
        );
        block.notify_current_time(start + INTERVAL_DURATION);

        // One batch completes both intervals.
        let done = block.on_packets_feedback(&packet_results(&[
            us(start, 5.0),
            us(start, 15.0),
            us(start, 25.0),
        ]));
        assert!(done);
        assert_eq!(
            block.monitor_interval(0).unwrap().received_packets_sent_time(),
            &[us(start, 5.0)]
        );
        assert_eq!(
            block.monitor_interval(1).unwrap().received_packets_sent_time(),
            &[us(start, 15.0)]
        );
        assert!(!block.is_timeout_expired());
    }
}

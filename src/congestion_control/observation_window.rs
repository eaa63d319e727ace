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

//! A fixed size history of aggregated packet feedback.
//!
//! Feedback is accumulated until it spans at least a configured duration of
//! send time, then folded into one `Observation`. Observations are stored in a
//! ring indexed by `id % window_size`, so the oldest one is silently replaced
//! once the ring wraps.

use std::time::Duration;
use std::time::Instant;

use log::*;

use crate::network_types::PacketResult;
use crate::units::DataRate;
use crate::units::DataSize;

/// Loss statistics of one aggregation bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    /// Sequence number, increasing by one per observation.
    pub id: u64,

    pub number_of_packets: u64,

    pub number_of_lost_packets: u64,

    /// Always `number_of_packets - number_of_lost_packets`.
    pub number_of_received_packets: u64,

    /// Smoothed send rate of the bucket.
    pub sending_rate: DataRate,
}

/// Feedback seen since the last observation was emitted.
#[derive(Debug, Clone, Copy, Default)]
struct PartialObservation {
    number_of_packets: u64,

    number_of_lost_packets: u64,

    size: DataSize,
}

#[derive(Debug)]
pub struct PacketObservationWindow {
    /// Ring of observations, `None` for slots never written.
    observations: Vec<Option<Observation>>,

    partial: PartialObservation,

    /// Number of observations ever emitted. Also the next observation id.
    num_observations: u64,

    /// Latest send time covered by the previous observation.
    t_max_previous: Option<Instant>,

    /// Minimum send time span of one observation.
    duration_lower_bound: Duration,

    /// Weight of the previous observation's rate when smoothing.
    sending_rate_smoothing_factor: f64,
}

impl PacketObservationWindow {
    pub fn new(
        window_size: usize,
        duration_lower_bound: Duration,
        sending_rate_smoothing_factor: f64,
    ) -> Self {
        Self {
            observations: vec![None; window_size.max(1)],
            partial: PartialObservation::default(),
            num_observations: 0,
            t_max_previous: None,
            duration_lower_bound,
            sending_rate_smoothing_factor,
        }
    }

    /// Fold a batch of packet feedback into the window.
    ///
    /// Packets without a send record are ignored. Return true if a new
    /// observation was emitted.
    pub fn add_feedback(&mut self, packets: &[PacketResult]) -> bool {
        let mut batch = PartialObservation::default();
        let mut first_send_time: Option<Instant> = None;
        let mut last_send_time: Option<Instant> = None;

        for (sent, received) in packets
            .iter()
            .filter_map(|p| p.sent_packet.map(|s| (s, p.is_received())))
        {
            batch.number_of_packets += 1;
            if !received {
                batch.number_of_lost_packets += 1;
            }
            batch.size += sent.size;

            first_send_time =
                Some(first_send_time.map_or(sent.send_time, |t| t.min(sent.send_time)));
            last_send_time =
                Some(last_send_time.map_or(sent.send_time, |t| t.max(sent.send_time)));
        }

        let (first_send_time, last_send_time) = match (first_send_time, last_send_time) {
            (Some(first), Some(last)) => (first, last),
            _ => return false,
        };

        self.partial.number_of_packets += batch.number_of_packets;
        self.partial.number_of_lost_packets += batch.number_of_lost_packets;
        self.partial.size += batch.size;

        // The first report opens the first observation.
        let t_max_previous = *self.t_max_previous.get_or_insert(first_send_time);

        let dt = last_send_time.saturating_duration_since(t_max_previous);
        if dt < self.duration_lower_bound {
            trace!(
                "observation window: {:?} of feedback buffered, {} packets pending",
                dt,
                self.partial.number_of_packets
            );
            return false;
        }

        self.t_max_previous = Some(last_send_time);

        let instantaneous_sending_rate = self.partial.size / dt;
        let sending_rate = match self.most_recent() {
            Some(previous) => {
                self.smoothed_sending_rate(instantaneous_sending_rate, previous.sending_rate)
            }
            None => instantaneous_sending_rate,
        };

        let id = self.num_observations;
        self.num_observations += 1;

        let observation = Observation {
            id,
            number_of_packets: self.partial.number_of_packets,
            number_of_lost_packets: self.partial.number_of_lost_packets,
            number_of_received_packets: self.partial.number_of_packets
                - self.partial.number_of_lost_packets,
            sending_rate,
        };
        trace!("observation window: new {:?}", observation);

        let slot = self.slot(id);
        self.observations[slot] = Some(observation);
        self.partial = PartialObservation::default();

        true
    }

    fn smoothed_sending_rate(&self, instantaneous: DataRate, previous: DataRate) -> DataRate {
        previous * self.sending_rate_smoothing_factor
            + instantaneous * (1.0 - self.sending_rate_smoothing_factor)
    }

    fn slot(&self, id: u64) -> usize {
        (id % self.observations.len() as u64) as usize
    }

    /// The latest observation, if any.
    pub fn most_recent(&self) -> Option<&Observation> {
        if self.num_observations == 0 {
            return None;
        }
        self.observations[self.slot(self.num_observations - 1)].as_ref()
    }

    /// Iterate over the initialized observations in ring order.
    pub fn observations(&self) -> impl Iterator<Item = &Observation> {
        self.observations.iter().flatten()
    }

    pub fn num_observations(&self) -> u64 {
        self.num_observations
    }

    pub fn window_size(&self) -> usize {
        self.observations.len()
    }

    /// Packets buffered but not yet folded into an observation.
    pub fn pending_packets(&self) -> u64 {
        self.partial.number_of_packets
    }
}

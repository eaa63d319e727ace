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

//! Network controller driving the loss-based estimator and the probe
//! controller from transport events.

use std::time::Duration;
use std::time::Instant;

use log::*;

use crate::congestion_control::LossBasedBwe;
use crate::congestion_control::ProbeController;
use crate::network_types::NetworkAvailability;
use crate::network_types::NetworkControlUpdate;
use crate::network_types::NetworkEstimate;
use crate::network_types::PacerConfig;
use crate::network_types::ProbeClusterConfig;
use crate::network_types::ProcessInterval;
use crate::network_types::StreamsConfig;
use crate::network_types::TargetRateConstraints;
use crate::network_types::TargetTransferRate;
use crate::network_types::TransportPacketsFeedback;
use crate::units::DataRate;
use crate::Config;
use crate::PACER_TIME_WINDOW;

/// Period reported along with each estimate.
const BWE_PERIOD: Duration = Duration::from_secs(3);

/// Bandwidth controller for one transport.
///
/// Every handler takes the event time and returns the resulting
/// `NetworkControlUpdate`. An empty update means nothing changed.
#[derive(Debug)]
pub struct BandwidthController {
    loss_based_bwe: LossBasedBwe,

    probe_controller: ProbeController,

    min_bitrate: DataRate,

    /// `DataRate::INFINITY` if unlimited.
    max_bitrate: DataRate,

    pacing_factor: f64,

    /// Target rate last reported to the caller.
    last_target_rate: DataRate,

    last_round_trip_time: Duration,

    /// Loss ratio of the last feedback batch.
    last_loss_ratio: f64,

    /// Whether the initial target rate has been reported.
    initial_update_sent: bool,

    /// Probes requested before the first process interval.
    pending_probes: Vec<ProbeClusterConfig>,
}

impl BandwidthController {
    pub fn new(conf: &Config, now: Instant) -> Self {
        let mut loss_based_bwe = LossBasedBwe::new(conf.loss_based_bwe.clone());
        loss_based_bwe.set_bandwidth_estimate(conf.start_bitrate);

        let mut probe_controller = ProbeController::new(conf.probe_controller.clone(), now);
        let pending_probes = probe_controller.set_bitrates(
            conf.min_bitrate,
            conf.start_bitrate,
            probe_limit(conf.max_bitrate),
            now,
        );

        let mut controller = Self {
            loss_based_bwe,
            probe_controller,
            min_bitrate: conf.min_bitrate,
            max_bitrate: conf.max_bitrate,
            pacing_factor: conf.pacing_factor,
            last_target_rate: DataRate::ZERO,
            last_round_trip_time: Duration::ZERO,
            last_loss_ratio: 0.0,
            initial_update_sent: false,
            pending_probes,
        };
        controller.last_target_rate = controller.clamp(conf.start_bitrate);
        controller
    }

    /// Target rate last reported to the caller.
    pub fn target_rate(&self) -> DataRate {
        self.last_target_rate
    }

    pub fn loss_based_bwe(&self) -> &LossBasedBwe {
        &self.loss_based_bwe
    }

    pub fn probe_controller(&self) -> &ProbeController {
        &self.probe_controller
    }

    pub fn on_network_availability(&mut self, msg: NetworkAvailability) -> NetworkControlUpdate {
        debug!(
            "BWE_CONTROLLER network available {} at {:?}",
            msg.network_available, msg.at_time
        );
        let probes = self
            .probe_controller
            .on_network_availability(msg.network_available, msg.at_time);
        self.probes_update(probes)
    }

    /// New bitrate limits, and optionally a new start bitrate.
    pub fn on_target_rate_constraints(
        &mut self,
        msg: TargetRateConstraints,
    ) -> NetworkControlUpdate {
        if let Some(min) = msg.min_data_rate {
            self.min_bitrate = min;
        }
        if let Some(max) = msg.max_data_rate {
            self.max_bitrate = if max.is_zero() {
                DataRate::INFINITY
            } else {
                max
            };
        }
        if self.min_bitrate > self.max_bitrate {
            warn!(
                "BWE_CONTROLLER min bitrate {} above max bitrate {}",
                self.min_bitrate, self.max_bitrate
            );
            self.min_bitrate = self.max_bitrate;
        }

        let start_bitrate = match msg.starting_rate {
            Some(rate) if rate.is_finite() => {
                self.loss_based_bwe.set_bandwidth_estimate(rate);
                self.last_target_rate = rate;
                rate
            }
            _ => DataRate::ZERO,
        };

        let probes = self.probe_controller.set_bitrates(
            self.min_bitrate,
            start_bitrate,
            probe_limit(self.max_bitrate),
            msg.at_time,
        );

        let mut update = self.probes_update(probes);
        self.update_target_rate(&mut update, msg.at_time, true);
        update
    }

    pub fn on_streams_config(&mut self, msg: StreamsConfig) -> NetworkControlUpdate {
        let mut update = NetworkControlUpdate::default();

        if let Some(enable) = msg.requests_alr_probing {
            self.probe_controller.enable_periodic_alr_probing(enable);
        }

        if let Some(total) = msg.max_total_allocated_bitrate {
            update.probe_cluster_configs = self
                .probe_controller
                .on_max_total_allocated_bitrate(total, msg.at_time);
        }

        if let Some(pacing_factor) = msg.pacing_factor {
            if pacing_factor > 0.0
                && pacing_factor.is_finite()
                && pacing_factor != self.pacing_factor
            {
                self.pacing_factor = pacing_factor;
                update.pacer_config = Some(self.pacer_config(msg.at_time));
            }
        }

        update
    }

    /// Record the rate at which packets are being acknowledged.
    pub fn on_acknowledged_bitrate(&mut self, acknowledged_bitrate: DataRate) {
        self.loss_based_bwe.set_acknowledged_bitrate(acknowledged_bitrate);
    }

    /// The sender became application limited at `at_time`.
    pub fn on_alr_start(&mut self, at_time: Instant) {
        self.probe_controller.set_alr_start_time(Some(at_time));
    }

    /// The sender stopped being application limited at `at_time`.
    pub fn on_alr_end(&mut self, at_time: Instant) {
        self.probe_controller.set_alr_start_time(None);
        self.probe_controller.set_alr_ended_time(at_time);
    }

    /// Ask for a probe to recover from a recent large drop.
    pub fn request_probe(&mut self, at_time: Instant) -> NetworkControlUpdate {
        let probes = self.probe_controller.request_probe(at_time);
        self.probes_update(probes)
    }

    pub fn on_transport_packets_feedback(
        &mut self,
        msg: &TransportPacketsFeedback,
    ) -> NetworkControlUpdate {
        let packets = msg.packets_with_feedback();
        if packets.is_empty() {
            return NetworkControlUpdate::default();
        }

        let lost = packets.iter().filter(|p| !p.is_received()).count();
        self.last_loss_ratio = lost as f64 / packets.len() as f64;

        // The most recently sent packet gives the freshest RTT sample.
        if let Some(sent) = packets
            .iter()
            .filter(|p| p.is_received())
            .filter_map(|p| p.sent_packet)
            .max_by_key(|s| s.send_time)
        {
            self.last_round_trip_time = msg.feedback_time.saturating_duration_since(sent.send_time);
        }

        self.loss_based_bwe.update_estimate(&packets);

        let mut update = NetworkControlUpdate::default();
        self.update_target_rate(&mut update, msg.feedback_time, false);
        update.probe_cluster_configs = self
            .probe_controller
            .set_estimated_bitrate(self.last_target_rate, msg.feedback_time);
        update
    }

    /// Periodic work. The first call reports the initial target rate.
    pub fn on_process_interval(&mut self, msg: ProcessInterval) -> NetworkControlUpdate {
        let mut update = NetworkControlUpdate::default();

        if !self.initial_update_sent {
            self.initial_update_sent = true;
            update.probe_cluster_configs = std::mem::take(&mut self.pending_probes);
            self.update_target_rate(&mut update, msg.at_time, true);
        }

        update
            .probe_cluster_configs
            .extend(self.probe_controller.process(msg.at_time));
        update
    }

    fn probes_update(
        &self,
        probe_cluster_configs: Vec<ProbeClusterConfig>,
    ) -> NetworkControlUpdate {
        NetworkControlUpdate {
            probe_cluster_configs,
            ..Default::default()
        }
    }

    /// Recompute the target rate and report it if it changed or `force` is set.
    fn update_target_rate(&mut self, update: &mut NetworkControlUpdate, now: Instant, force: bool) {
        let estimate = self.loss_based_bwe.bandwidth_estimate();
        let target_rate = if estimate.is_finite() {
            self.clamp(estimate)
        } else {
            self.clamp(self.last_target_rate)
        };

        if target_rate == self.last_target_rate && !force {
            return;
        }

        trace!(
            "BWE_CONTROLLER target rate {} -> {}",
            self.last_target_rate,
            target_rate
        );
        self.last_target_rate = target_rate;

        update.target_rate = Some(TargetTransferRate {
            at_time: now,
            network_estimate: NetworkEstimate {
                at_time: now,
                bandwidth: target_rate,
                round_trip_time: self.last_round_trip_time,
                bwe_period: BWE_PERIOD,
                loss_rate_ratio: self.last_loss_ratio,
            },
            target_rate,
            stable_target_rate: target_rate,
            cwnd_reduce_ratio: 0.0,
        });
        update.pacer_config = Some(self.pacer_config(now));
    }

    fn pacer_config(&self, now: Instant) -> PacerConfig {
        let pacing_rate = self.last_target_rate * self.pacing_factor;
        PacerConfig {
            at_time: now,
            data_window: pacing_rate * PACER_TIME_WINDOW,
            time_window: PACER_TIME_WINDOW,
            pad_window: crate::units::DataSize::ZERO,
        }
    }

    fn clamp(&self, rate: DataRate) -> DataRate {
        rate.max(self.min_bitrate).min(self.max_bitrate)
    }
}

/// The probe controller uses zero for "no limit".
fn probe_limit(max_bitrate: DataRate) -> DataRate {
    if max_bitrate.is_finite() {
        max_bitrate
    } else {
        DataRate::ZERO
    }
}

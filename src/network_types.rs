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

//! Messages exchanged between the transport and the network controller.

use std::time::Duration;
use std::time::Instant;

use crate::units::DataRate;
use crate::units::DataSize;

/// Pacing metadata attached to a sent packet.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PacedPacketInfo {
    /// The pacing rate the packet was sent at.
    pub send_bitrate: DataRate,

    /// Probe cluster the packet belongs to. `None` if it is not a probe.
    pub probe_cluster_id: Option<i32>,

    /// Minimum number of probe packets of the cluster.
    pub probe_cluster_min_probes: u32,

    /// Minimum number of probe bytes of the cluster.
    pub probe_cluster_min_bytes: u64,
}

/// Metadata of a sent packet.
#[derive(Clone, Copy, PartialEq)]
pub struct SentPacket {
    /// The time the packet was sent.
    pub send_time: Instant,

    /// Size of the packet including overhead.
    pub size: DataSize,

    /// Pacing metadata of the packet.
    pub pacing_info: PacedPacketInfo,

    /// Transport wide sequence number.
    pub sequence_number: u64,
}

impl SentPacket {
    pub fn new(send_time: Instant, size: DataSize) -> Self {
        SentPacket {
            send_time,
            size,
            pacing_info: PacedPacketInfo::default(),
            sequence_number: 0,
        }
    }
}

impl std::fmt::Debug for SentPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "seq={:?}", self.sequence_number)?;
        write!(f, " size={}", self.size)?;
        if let Some(id) = self.pacing_info.probe_cluster_id {
            write!(f, " probe_cluster={}", id)?;
        }

        Ok(())
    }
}

/// Feedback about a single packet.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PacketResult {
    /// The send record. `None` if the feedback could not be correlated with a
    /// sent packet.
    pub sent_packet: Option<SentPacket>,

    /// The time the packet arrived. `None` if the packet was lost.
    pub receive_time: Option<Instant>,
}

impl PacketResult {
    /// Feedback for a packet that arrived at `receive_time`.
    pub fn received(sent_packet: SentPacket, receive_time: Instant) -> Self {
        PacketResult {
            sent_packet: Some(sent_packet),
            receive_time: Some(receive_time),
        }
    }

    /// Feedback for a packet that was declared lost.
    pub fn lost(sent_packet: SentPacket) -> Self {
        PacketResult {
            sent_packet: Some(sent_packet),
            receive_time: None,
        }
    }

    pub fn is_received(&self) -> bool {
        self.receive_time.is_some()
    }
}

/// A batch of packet feedback delivered by the transport.
#[derive(Clone, Debug)]
pub struct TransportPacketsFeedback {
    pub feedback_time: Instant,

    /// Bytes in flight after this feedback.
    pub data_in_flight: DataSize,

    /// Bytes in flight before this feedback.
    pub prior_in_flight: DataSize,

    pub packet_feedbacks: Vec<PacketResult>,
}

impl TransportPacketsFeedback {
    pub fn new(feedback_time: Instant, packet_feedbacks: Vec<PacketResult>) -> Self {
        TransportPacketsFeedback {
            feedback_time,
            data_in_flight: DataSize::ZERO,
            prior_in_flight: DataSize::ZERO,
            packet_feedbacks,
        }
    }

    /// Packets with a send record that arrived.
    pub fn received_with_send_info(&self) -> Vec<PacketResult> {
        self.packet_feedbacks
            .iter()
            .filter(|p| p.sent_packet.is_some() && p.is_received())
            .copied()
            .collect()
    }

    /// Packets with a send record that were lost.
    pub fn lost_with_send_info(&self) -> Vec<PacketResult> {
        self.packet_feedbacks
            .iter()
            .filter(|p| p.sent_packet.is_some() && !p.is_received())
            .copied()
            .collect()
    }

    /// All packets with a send record.
    pub fn packets_with_feedback(&self) -> Vec<PacketResult> {
        self.packet_feedbacks
            .iter()
            .filter(|p| p.sent_packet.is_some())
            .copied()
            .collect()
    }
}

/// A directive for the pacer to send a burst of probe packets.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProbeClusterConfig {
    pub at_time: Instant,

    pub target_data_rate: DataRate,

    /// Minimum duration of the probe.
    pub target_duration: Duration,

    /// Minimum number of probe packets.
    pub target_probe_count: u32,

    /// Cluster id echoed back in `PacedPacketInfo`.
    pub id: i32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NetworkEstimate {
    pub at_time: Instant,

    pub bandwidth: DataRate,

    pub round_trip_time: Duration,

    pub bwe_period: Duration,

    pub loss_rate_ratio: f64,
}

/// The rate the encoders should target.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TargetTransferRate {
    pub at_time: Instant,

    pub network_estimate: NetworkEstimate,

    pub target_rate: DataRate,

    pub stable_target_rate: DataRate,

    pub cwnd_reduce_ratio: f64,
}

/// Pacer budget: `data_window` may be sent per `time_window`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PacerConfig {
    pub at_time: Instant,

    pub data_window: DataSize,

    pub time_window: Duration,

    /// Padding allowed per `time_window`.
    pub pad_window: DataSize,
}

impl PacerConfig {
    pub fn data_rate(&self) -> DataRate {
        self.data_window / self.time_window
    }

    pub fn pad_rate(&self) -> DataRate {
        self.pad_window / self.time_window
    }
}

/// Output of the network controller. Unset fields mean "no change".
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NetworkControlUpdate {
    pub congestion_window: Option<DataSize>,

    pub pacer_config: Option<PacerConfig>,

    pub probe_cluster_configs: Vec<ProbeClusterConfig>,

    pub target_rate: Option<TargetTransferRate>,
}

impl NetworkControlUpdate {
    pub fn is_empty(&self) -> bool {
        self.congestion_window.is_none()
            && self.pacer_config.is_none()
            && self.probe_cluster_configs.is_empty()
            && self.target_rate.is_none()
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TargetRateConstraints {
    pub at_time: Instant,

    pub min_data_rate: Option<DataRate>,

    pub max_data_rate: Option<DataRate>,

    pub starting_rate: Option<DataRate>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NetworkAvailability {
    pub at_time: Instant,

    pub network_available: bool,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StreamsConfig {
    pub at_time: Instant,

    pub requests_alr_probing: Option<bool>,

    pub pacing_factor: Option<f64>,

    pub max_total_allocated_bitrate: Option<DataRate>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProcessInterval {
    pub at_time: Instant,

    pub pacer_queue: Option<DataSize>,
}

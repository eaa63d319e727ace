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

//! Loss-based bandwidth estimation.
//!
//! The estimator models the channel with two parameters: an inherent loss
//! rate, which is loss not caused by congestion, and a loss limited
//! bandwidth. Sending above that bandwidth adds congestion loss on top of
//! the inherent loss. On every new observation, a small set of candidate
//! bandwidths is scored by the log-likelihood of the losses seen over the
//! observation window. The inherent loss of each candidate is refined by a
//! few steps of Newton's method first. The best candidate becomes the new
//! estimate.
//!
//! The reported estimate is further capped by a TCP fairness bound derived
//! from the average reported loss ratio.

use std::cmp;
use std::time::Duration;

use log::*;
use serde::Deserialize;
use serde::Serialize;
use serde_with::serde_as;
use serde_with::DisplayFromStr;
use serde_with::DurationMilliSeconds;
use smallvec::smallvec;
use smallvec::SmallVec;

use super::observation_window::PacketObservationWindow;
use crate::network_types::PacketResult;
use crate::units::DataRate;
use crate::Error;
use crate::Result;

/// Loss-based estimator configurable parameters.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossBasedBweConfig {
    /// Whether the estimator should run at all.
    pub enabled: bool,

    /// Candidates are capped at this factor times the acknowledged bitrate,
    /// unless the current estimate is already higher.
    pub bw_rampup_upper_bound_factor: f64,

    /// Factors applied to the current estimate to build the candidates.
    pub candidate_factors: SmallVec<[f64; 3]>,

    /// Objective bonus per kbps and packet, favoring higher bandwidths.
    pub higher_bw_bias_factor: f64,

    pub inherent_loss_lower_bound: f64,

    /// The inherent loss upper bound is
    /// `inherent_loss_upper_bound_offset + balance / bandwidth`.
    #[serde_as(as = "DisplayFromStr")]
    pub inherent_loss_upper_bound_bw_balance: DataRate,

    pub inherent_loss_upper_bound_offset: f64,

    pub initial_inherent_loss_estimate: f64,

    pub newton_iterations: u32,

    pub newton_step_size: f64,

    /// Minimum send time span covered by one observation.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub observation_duration_lower_bound: Duration,

    pub observation_window_size: usize,

    /// Weight of the previous observation's sending rate.
    pub sending_rate_smoothing_factor: f64,

    /// Decay of older observations when averaging the loss ratio.
    pub tcp_fairness_temporal_weight_factor: f64,

    #[serde_as(as = "DisplayFromStr")]
    pub tcp_fairness_upper_bound_bw_balance: DataRate,

    pub tcp_fairness_upper_bound_loss_offset: f64,

    /// Decay of older observations in the objective function.
    pub temporal_weight_factor: f64,
}

impl Default for LossBasedBweConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bw_rampup_upper_bound_factor: 1.1,
            candidate_factors: smallvec![1.05, 1.0, 0.95],
            higher_bw_bias_factor: 0.00001,
            inherent_loss_lower_bound: 1.0e-3,
            inherent_loss_upper_bound_bw_balance: DataRate::from_kbps(15),
            inherent_loss_upper_bound_offset: 0.05,
            initial_inherent_loss_estimate: 0.01,
            newton_iterations: 1,
            newton_step_size: 0.5,
            observation_duration_lower_bound: Duration::from_secs(1),
            observation_window_size: 20,
            sending_rate_smoothing_factor: 0.0,
            tcp_fairness_temporal_weight_factor: 0.99,
            tcp_fairness_upper_bound_bw_balance: DataRate::from_kbps(15),
            tcp_fairness_upper_bound_loss_offset: 0.05,
            temporal_weight_factor: 0.99,
        }
    }
}

impl LossBasedBweConfig {
    /// Check every parameter.
    ///
    /// Each violation is logged. The returned error lists all of them.
    pub fn validate(&self) -> Result<()> {
        let mut reasons: Vec<String> = Vec::new();
        let mut check = |valid: bool, reason: String| {
            if !valid {
                warn!("{}. {}", NAME, reason);
                reasons.push(reason);
            }
        };

        // Comparisons are written so that NaN fails them.
        check(
            self.bw_rampup_upper_bound_factor > 1.0,
            format!(
                "bandwidth rampup upper bound factor must be greater than 1: {}",
                self.bw_rampup_upper_bound_factor
            ),
        );
        check(
            self.candidate_factors
                .iter()
                .all(|f| f.is_finite() && *f > 0.0),
            format!(
                "candidate factors must be finite and positive: {:?}",
                self.candidate_factors
            ),
        );
        check(
            self.higher_bw_bias_factor >= 0.0,
            format!(
                "higher bandwidth bias factor must be non-negative: {}",
                self.higher_bw_bias_factor
            ),
        );
        check(
            self.inherent_loss_lower_bound >= 0.0 && self.inherent_loss_lower_bound < 1.0,
            format!(
                "inherent loss lower bound must be in [0, 1): {}",
                self.inherent_loss_lower_bound
            ),
        );
        check(
            !self.inherent_loss_upper_bound_bw_balance.is_zero()
                && self.inherent_loss_upper_bound_bw_balance.is_finite(),
            format!(
                "inherent loss upper bound bandwidth balance must be positive: {}",
                self.inherent_loss_upper_bound_bw_balance
            ),
        );
        check(
            self.inherent_loss_upper_bound_offset >= self.inherent_loss_lower_bound
                && self.inherent_loss_upper_bound_offset < 1.0,
            format!(
                "inherent loss upper bound offset must be in [{}, 1): {}",
                self.inherent_loss_lower_bound, self.inherent_loss_upper_bound_offset
            ),
        );
        check(
            self.initial_inherent_loss_estimate >= 0.0
                && self.initial_inherent_loss_estimate < 1.0,
            format!(
                "initial inherent loss estimate must be in [0, 1): {}",
                self.initial_inherent_loss_estimate
            ),
        );
        check(
            self.newton_iterations > 0,
            format!(
                "number of Newton iterations must be positive: {}",
                self.newton_iterations
            ),
        );
        check(
            self.newton_step_size > 0.0,
            format!(
                "Newton step size must be positive: {}",
                self.newton_step_size
            ),
        );
        check(
            !self.observation_duration_lower_bound.is_zero(),
            format!(
                "observation duration lower bound must be positive: {:?}",
                self.observation_duration_lower_bound
            ),
        );
        check(
            self.observation_window_size >= 2,
            format!(
                "observation window size must be at least 2: {}",
                self.observation_window_size
            ),
        );
        check(
            self.sending_rate_smoothing_factor >= 0.0 && self.sending_rate_smoothing_factor < 1.0,
            format!(
                "sending rate smoothing factor must be in [0, 1): {}",
                self.sending_rate_smoothing_factor
            ),
        );
        check(
            self.tcp_fairness_temporal_weight_factor > 0.0
                && self.tcp_fairness_temporal_weight_factor <= 1.0,
            format!(
                "TCP fairness temporal weight factor must be in (0, 1]: {}",
                self.tcp_fairness_temporal_weight_factor
            ),
        );
        check(
            !self.tcp_fairness_upper_bound_bw_balance.is_zero()
                && self.tcp_fairness_upper_bound_bw_balance.is_finite(),
            format!(
                "TCP fairness upper bound bandwidth balance must be positive: {}",
                self.tcp_fairness_upper_bound_bw_balance
            ),
        );
        check(
            self.tcp_fairness_upper_bound_loss_offset >= 0.0
                && self.tcp_fairness_upper_bound_loss_offset < 1.0,
            format!(
                "TCP fairness upper bound loss offset must be in [0, 1): {}",
                self.tcp_fairness_upper_bound_loss_offset
            ),
        );
        check(
            self.temporal_weight_factor > 0.0 && self.temporal_weight_factor <= 1.0,
            format!(
                "temporal weight factor must be in (0, 1]: {}",
                self.temporal_weight_factor
            ),
        );

        if reasons.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidConfig(reasons.join("; ")))
        }
    }
}

const NAME: &str = "LOSS_BASED_BWE";

/// One hypothesis about the channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelParameters {
    pub inherent_loss: f64,

    /// `DataRate::INFINITY` until a bandwidth has been set.
    pub loss_limited_bandwidth: DataRate,
}

#[derive(Debug, Default, Clone, Copy)]
struct Derivatives {
    first: f64,
    second: f64,
}

/// Loss-based bandwidth estimator.
#[derive(Debug)]
pub struct LossBasedBwe {
    /// Configurable parameters. `enabled` is cleared if they are not valid.
    config: LossBasedBweConfig,

    acknowledged_bitrate: Option<DataRate>,

    current_estimate: ChannelParameters,

    window: PacketObservationWindow,

    /// `temporal_weight_factor ^ age`, indexed by observation age.
    temporal_weights: Vec<f64>,

    /// `tcp_fairness_temporal_weight_factor ^ age`, indexed by observation age.
    tcp_fairness_temporal_weights: Vec<f64>,
}

impl LossBasedBwe {
    pub fn new(mut config: LossBasedBweConfig) -> Self {
        if config.enabled {
            if let Err(e) = config.validate() {
                warn!(
                    "{}. disabled due to the configuration not being valid: {}",
                    NAME, e
                );
                config.enabled = false;
            }
        }

        let window = PacketObservationWindow::new(
            config.observation_window_size,
            config.observation_duration_lower_bound,
            config.sending_rate_smoothing_factor,
        );
        let window_size = window.window_size();
        let powers = |factor: f64| -> Vec<f64> {
            (0..window_size).map(|i| factor.powi(i as i32)).collect()
        };

        Self {
            current_estimate: ChannelParameters {
                inherent_loss: config.initial_inherent_loss_estimate,
                loss_limited_bandwidth: DataRate::INFINITY,
            },
            acknowledged_bitrate: None,
            temporal_weights: powers(config.temporal_weight_factor),
            tcp_fairness_temporal_weights: powers(config.tcp_fairness_temporal_weight_factor),
            window,
            config,
        }
    }

    pub fn name(&self) -> &str {
        NAME
    }

    pub fn config(&self) -> &LossBasedBweConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Whether an estimate can be reported.
    pub fn is_ready(&self) -> bool {
        self.is_enabled()
            && self.current_estimate.loss_limited_bandwidth.is_finite()
            && self.window.num_observations() > 0
    }

    /// Current estimate, capped by the TCP fairness bound.
    ///
    /// Return `DataRate::INFINITY` if no estimate has been made.
    pub fn bandwidth_estimate(&self) -> DataRate {
        if !self.is_ready() {
            debug!("{}. no bandwidth estimate has been made", NAME);
            return DataRate::INFINITY;
        }

        cmp::min(
            self.current_estimate.loss_limited_bandwidth,
            self.tcp_fairness_bw_upper_bound(),
        )
    }

    /// Current channel hypothesis before the fairness cap.
    pub fn channel_parameters(&self) -> ChannelParameters {
        self.current_estimate
    }

    /// Seed the estimate, e.g. with the output of another estimator.
    pub fn set_bandwidth_estimate(&mut self, bandwidth_estimate: DataRate) {
        if !self.is_enabled() {
            return;
        }
        if bandwidth_estimate.is_finite() {
            self.current_estimate.loss_limited_bandwidth = bandwidth_estimate;
        } else {
            warn!(
                "{}. the bandwidth estimate must be finite: {}",
                NAME, bandwidth_estimate
            );
        }
    }

    /// Record the latest delivery rate seen by the sender. It is used by the
    /// next update.
    pub fn set_acknowledged_bitrate(&mut self, acknowledged_bitrate: DataRate) {
        if !self.is_enabled() {
            return;
        }
        if acknowledged_bitrate.is_finite() {
            self.acknowledged_bitrate = Some(acknowledged_bitrate);
        } else {
            warn!(
                "{}. the acknowledged bitrate must be finite: {}",
                NAME, acknowledged_bitrate
            );
        }
    }

    /// Update the estimate with a batch of packet feedback.
    pub fn update_estimate(&mut self, packet_results: &[PacketResult]) {
        if !self.is_enabled() || packet_results.is_empty() {
            return;
        }

        if !self.window.add_feedback(packet_results) {
            return;
        }

        if !self.current_estimate.loss_limited_bandwidth.is_finite() {
            return;
        }

        let id = match self.window.most_recent() {
            Some(o) => o.id,
            None => return,
        };

        let mut best_candidate = self.current_estimate;
        let mut objective_max = f64::MIN;

        for mut candidate in self.candidates() {
            self.newtons_method_update(&mut candidate, id);

            let objective = self.objective(&candidate, id);
            trace!(
                "{}. candidate bw={} inherent_loss={:.5} objective={:.5}",
                NAME,
                candidate.loss_limited_bandwidth,
                candidate.inherent_loss,
                objective
            );

            // NaN never wins.
            if objective > objective_max {
                objective_max = objective;
                best_candidate = candidate;
            }
        }

        debug!(
            "{}. estimate {} -> {}, inherent_loss={:.5}",
            NAME,
            self.current_estimate.loss_limited_bandwidth,
            best_candidate.loss_limited_bandwidth,
            best_candidate.inherent_loss
        );
        self.current_estimate = best_candidate;
    }

    fn candidates(&self) -> SmallVec<[ChannelParameters; 4]> {
        let current = self.current_estimate.loss_limited_bandwidth;

        let mut bandwidths: SmallVec<[DataRate; 4]> = self
            .config
            .candidate_factors
            .iter()
            .map(|factor| current * *factor)
            .collect();
        if let Some(acknowledged_bitrate) = self.acknowledged_bitrate {
            bandwidths.push(acknowledged_bitrate);
        }

        let upper_bound = match self.acknowledged_bitrate {
            Some(acknowledged_bitrate) => {
                acknowledged_bitrate * self.config.bw_rampup_upper_bound_factor
            }
            None => DataRate::INFINITY,
        };
        let upper_bound = cmp::max(current, upper_bound);

        bandwidths
            .into_iter()
            .filter(|bandwidth| {
                if !bandwidth.is_finite() {
                    trace!("{} skip unbounded candidate", NAME);
                    return false;
                }
                true
            })
            .map(|bandwidth| {
                let mut candidate = self.current_estimate;
                candidate.loss_limited_bandwidth = cmp::min(bandwidth, upper_bound);
                candidate.inherent_loss = self.feasible_inherent_loss(&candidate);
                candidate
            })
            .collect()
    }

    fn inherent_loss_upper_bound(&self, bandwidth: DataRate) -> f64 {
        self.config.inherent_loss_upper_bound_offset
            + self.config.inherent_loss_upper_bound_bw_balance / bandwidth
    }

    fn feasible_inherent_loss(&self, channel: &ChannelParameters) -> f64 {
        channel
            .inherent_loss
            .max(self.config.inherent_loss_lower_bound)
            .min(self.inherent_loss_upper_bound(channel.loss_limited_bandwidth))
    }

    fn newtons_method_update(&self, channel: &mut ChannelParameters, id: u64) {
        for _ in 0..self.config.newton_iterations {
            let derivatives = self.derivatives(channel, id);
            let step = self.config.newton_step_size * derivatives.first / derivatives.second;
            if !step.is_finite() {
                trace!("{}. newton step is not finite, stop refining", NAME);
                break;
            }
            channel.inherent_loss -= step;
            channel.inherent_loss = self.feasible_inherent_loss(channel);
        }
    }

    /// First and second derivatives of the objective with respect to the
    /// inherent loss.
    fn derivatives(&self, channel: &ChannelParameters, id: u64) -> Derivatives {
        let mut derivatives = Derivatives::default();

        for observation in self.window.observations() {
            let p = loss_probability(
                channel.inherent_loss,
                channel.loss_limited_bandwidth,
                observation.sending_rate,
            );
            let weight = weight_at(&self.temporal_weights, id - observation.id);
            let lost = observation.number_of_lost_packets as f64;
            let received = observation.number_of_received_packets as f64;

            if observation.number_of_lost_packets > 0 {
                derivatives.first += weight * lost / p;
                derivatives.second -= weight * lost / p.powi(2);
            }
            if observation.number_of_received_packets > 0 {
                derivatives.first -= weight * received / (1.0 - p);
                derivatives.second -= weight * received / (1.0 - p).powi(2);
            }
        }

        derivatives
    }

    /// Log-likelihood of the window given `channel`, plus a bias towards
    /// higher bandwidths.
    fn objective(&self, channel: &ChannelParameters, id: u64) -> f64 {
        let mut objective = 0.0;

        for observation in self.window.observations() {
            let p = loss_probability(
                channel.inherent_loss,
                channel.loss_limited_bandwidth,
                observation.sending_rate,
            );
            let weight = weight_at(&self.temporal_weights, id - observation.id);

            // Terms with no packets are zero, skip them to avoid 0 * ln(0).
            if observation.number_of_lost_packets > 0 {
                objective += weight * observation.number_of_lost_packets as f64 * p.ln();
            }
            if observation.number_of_received_packets > 0 {
                objective +=
                    weight * observation.number_of_received_packets as f64 * (1.0 - p).ln();
            }
            objective += weight
                * self.config.higher_bw_bias_factor
                * channel.loss_limited_bandwidth.kbps()
                * observation.number_of_packets as f64;
        }

        objective
    }

    /// Packet weighted average loss ratio over the window.
    fn average_reported_loss_ratio(&self) -> f64 {
        let id = match self.window.most_recent() {
            Some(o) => o.id,
            None => return 0.0,
        };

        let mut number_of_packets = 0.0;
        let mut number_of_lost_packets = 0.0;
        for observation in self.window.observations() {
            let weight = weight_at(&self.tcp_fairness_temporal_weights, id - observation.id);
            number_of_packets += weight * observation.number_of_packets as f64;
            number_of_lost_packets += weight * observation.number_of_lost_packets as f64;
        }

        if number_of_packets <= 0.0 {
            return 0.0;
        }
        number_of_lost_packets / number_of_packets
    }

    fn tcp_fairness_bw_upper_bound(&self) -> DataRate {
        if self.window.num_observations() == 0 {
            return DataRate::INFINITY;
        }

        let average_loss_ratio = self.average_reported_loss_ratio();
        if average_loss_ratio <= self.config.tcp_fairness_upper_bound_loss_offset {
            return DataRate::INFINITY;
        }

        self.config.tcp_fairness_upper_bound_bw_balance
            / (average_loss_ratio - self.config.tcp_fairness_upper_bound_loss_offset)
    }
}

/// Loss probability when sending at `sending_rate` over a channel with the
/// given inherent loss and loss limited bandwidth.
fn loss_probability(inherent_loss: f64, bandwidth: DataRate, sending_rate: DataRate) -> f64 {
    let mut p = inherent_loss.clamp(0.0, 1.0);
    if sending_rate.is_finite() && bandwidth.is_finite() && sending_rate > bandwidth {
        p += (sending_rate - bandwidth) / sending_rate;
    }
    p.min(1.0)
}

fn weight_at(weights: &[f64], age: u64) -> f64 {
    weights.get(age as usize).copied().unwrap_or(0.0)
}

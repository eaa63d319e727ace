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

//! Probe scheduling.
//!
//! The probe controller decides when the pacer should send a burst of
//! packets above the current estimate to discover more bandwidth. It probes
//! exponentially at startup, whenever the configured maximum bitrate grows,
//! after a large estimate drop while application limited, and periodically
//! while application limited if asked to.

use std::time::Duration;
use std::time::Instant;

use log::*;
use serde::Deserialize;
use serde::Serialize;
use serde_with::serde_as;
use serde_with::DisplayFromStr;
use serde_with::DurationMilliSeconds;

use crate::network_types::ProbeClusterConfig;
use crate::units::DataRate;

const NAME: &str = "PROBE_CONTROLLER";

/// Probe controller configurable parameters.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeControllerConfig {
    /// Scale of the start bitrate for the first initial probe.
    pub first_exponential_probe_scale: f64,

    /// Scale of the start bitrate for the second initial probe.
    pub second_exponential_probe_scale: f64,

    /// Scale of the estimate for a further probe.
    pub further_exponential_probe_scale: f64,

    /// An estimate above this fraction of the last probe triggers a further
    /// probe.
    pub further_probe_threshold: f64,

    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_waiting_time_for_probing_result: Duration,

    /// An estimate below this fraction of the previous one is a large drop.
    pub bitrate_drop_threshold: f64,

    /// A large drop older than this is not probed for.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub bitrate_drop_timeout: Duration,

    /// Fraction of the bitrate before a large drop to probe at.
    pub probe_fraction_after_drop: f64,

    /// Relative error of a probe result.
    pub probe_uncertainty: f64,

    /// ALR ended less than this ago still counts for drop probing.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub alr_ended_timeout: Duration,

    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub min_time_between_alr_probes: Duration,

    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub alr_periodic_probing_interval: Duration,

    /// Scale of the estimate for a periodic ALR probe.
    pub alr_probe_scale: f64,

    /// Probe ceiling when no maximum bitrate is configured.
    #[serde_as(as = "DisplayFromStr")]
    pub default_max_probing_bitrate: DataRate,

    pub min_probe_packets_sent: u32,

    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub min_probe_duration: Duration,

    pub enable_periodic_alr_probing: bool,

    /// Probe when the total bitrate allocated to streams grows.
    pub probe_on_max_allocated_bitrate_change: bool,
}

impl Default for ProbeControllerConfig {
    fn default() -> Self {
        Self {
            first_exponential_probe_scale: 3.0,
            second_exponential_probe_scale: 6.0,
            further_exponential_probe_scale: 2.0,
            further_probe_threshold: 0.7,
            max_waiting_time_for_probing_result: Duration::from_secs(1),
            bitrate_drop_threshold: 0.66,
            bitrate_drop_timeout: Duration::from_secs(5),
            probe_fraction_after_drop: 0.85,
            probe_uncertainty: 0.05,
            alr_ended_timeout: Duration::from_secs(3),
            min_time_between_alr_probes: Duration::from_secs(5),
            alr_periodic_probing_interval: Duration::from_secs(5),
            alr_probe_scale: 2.0,
            default_max_probing_bitrate: DataRate::from_mbps(5),
            min_probe_packets_sent: 5,
            min_probe_duration: Duration::from_millis(15),
            enable_periodic_alr_probing: false,
            probe_on_max_allocated_bitrate_change: true,
        }
    }
}

/// Probe controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    /// No probe has been sent yet.
    Idle,

    /// Waiting for the result of a probe, which may trigger a further probe.
    ExponentialProbing,

    /// No further probe is pending.
    SteadyState,
}

/// Probe controller.
#[derive(Debug)]
pub struct ProbeController {
    config: ProbeControllerConfig,

    state: ProbeState,

    network_available: bool,

    /// A new estimate above this triggers a further probe.
    min_bitrate_to_probe_further: Option<DataRate>,

    time_last_probing_initiated: Option<Instant>,

    estimated_bitrate: DataRate,

    start_bitrate: DataRate,

    /// Zero if unlimited.
    max_bitrate: DataRate,

    last_bwe_drop_probing_time: Instant,

    alr_start_time: Option<Instant>,

    alr_end_time: Option<Instant>,

    enable_periodic_alr_probing: bool,

    time_of_last_large_drop: Instant,

    bitrate_before_last_large_drop: DataRate,

    max_total_allocated_bitrate: DataRate,

    next_probe_cluster_id: i32,
}

impl ProbeController {
    pub fn new(config: ProbeControllerConfig, now: Instant) -> Self {
        let enable_periodic_alr_probing = config.enable_periodic_alr_probing;
        let mut controller = Self {
            config,
            state: ProbeState::Idle,
            network_available: true,
            min_bitrate_to_probe_further: None,
            time_last_probing_initiated: None,
            estimated_bitrate: DataRate::ZERO,
            start_bitrate: DataRate::ZERO,
            max_bitrate: DataRate::ZERO,
            last_bwe_drop_probing_time: now,
            alr_start_time: None,
            alr_end_time: None,
            enable_periodic_alr_probing,
            time_of_last_large_drop: now,
            bitrate_before_last_large_drop: DataRate::ZERO,
            max_total_allocated_bitrate: DataRate::ZERO,
            next_probe_cluster_id: 1,
        };
        controller.reset(now);
        controller
    }

    pub fn state(&self) -> ProbeState {
        self.state
    }

    pub fn estimated_bitrate(&self) -> DataRate {
        self.estimated_bitrate
    }

    /// Update the bitrate limits.
    ///
    /// Starts exponential probing on the first call, and probes at the new
    /// maximum if it grew beyond the current estimate afterwards.
    pub fn set_bitrates(
        &mut self,
        min_bitrate: DataRate,
        start_bitrate: DataRate,
        max_bitrate: DataRate,
        now: Instant,
    ) -> Vec<ProbeClusterConfig> {
        if !start_bitrate.is_zero() {
            self.start_bitrate = start_bitrate;
            self.estimated_bitrate = start_bitrate;
        } else if self.start_bitrate.is_zero() {
            self.start_bitrate = min_bitrate;
        }

        let old_max_bitrate = self.max_bitrate;
        self.max_bitrate = max_bitrate;

        match self.state {
            ProbeState::Idle => {
                if self.network_available {
                    return self.initiate_exponential_probing(now);
                }
            }

            ProbeState::ExponentialProbing => {}

            ProbeState::SteadyState => {
                return self.probe_max_bitrate_increase(old_max_bitrate, now);
            }
        }

        Vec::new()
    }

    /// Update only the maximum bitrate.
    pub fn update_max_bitrate(
        &mut self,
        max_bitrate: DataRate,
        now: Instant,
    ) -> Vec<ProbeClusterConfig> {
        let old_max_bitrate = self.max_bitrate;
        self.max_bitrate = max_bitrate;

        if self.state == ProbeState::SteadyState {
            return self.probe_max_bitrate_increase(old_max_bitrate, now);
        }
        Vec::new()
    }

    /// The total bitrate allocated to the streams changed.
    pub fn on_max_total_allocated_bitrate(
        &mut self,
        max_total_allocated_bitrate: DataRate,
        now: Instant,
    ) -> Vec<ProbeClusterConfig> {
        let probe = self.config.probe_on_max_allocated_bitrate_change
            && self.state == ProbeState::SteadyState
            && max_total_allocated_bitrate != self.max_total_allocated_bitrate
            && !self.estimated_bitrate.is_zero()
            && (self.max_bitrate.is_zero() || self.estimated_bitrate < self.max_bitrate)
            && self.estimated_bitrate < max_total_allocated_bitrate;

        self.max_total_allocated_bitrate = max_total_allocated_bitrate;
        if !probe {
            return Vec::new();
        }

        debug!(
            "{} max total allocated bitrate increased to {}",
            NAME, max_total_allocated_bitrate
        );
        self.initiate_probing(now, &[max_total_allocated_bitrate], false)
    }

    pub fn on_network_availability(
        &mut self,
        network_available: bool,
        now: Instant,
    ) -> Vec<ProbeClusterConfig> {
        self.network_available = network_available;

        if network_available && self.state == ProbeState::Idle && !self.start_bitrate.is_zero() {
            return self.initiate_exponential_probing(now);
        }
        Vec::new()
    }

    /// Feed a new bandwidth estimate.
    pub fn set_estimated_bitrate(
        &mut self,
        bitrate: DataRate,
        now: Instant,
    ) -> Vec<ProbeClusterConfig> {
        let mut probes = Vec::new();

        if self.state == ProbeState::ExponentialProbing {
            trace!(
                "{} measured bitrate {} minimum to probe further {:?}",
                NAME,
                bitrate,
                self.min_bitrate_to_probe_further
            );

            if let Some(min_bitrate) = self.min_bitrate_to_probe_further {
                if bitrate > min_bitrate {
                    let scale = self.config.further_exponential_probe_scale;
                    probes = self.initiate_probing(now, &[bitrate * scale], true);
                }
            }
        }

        if bitrate < self.estimated_bitrate * self.config.bitrate_drop_threshold {
            debug!(
                "{} large drop from {} to {}",
                NAME, self.estimated_bitrate, bitrate
            );
            self.time_of_last_large_drop = now;
            self.bitrate_before_last_large_drop = self.estimated_bitrate;
        }
        self.estimated_bitrate = bitrate;

        probes
    }

    pub fn enable_periodic_alr_probing(&mut self, enable: bool) {
        self.enable_periodic_alr_probing = enable;
    }

    /// Set or clear the start of the current application limited region.
    pub fn set_alr_start_time(&mut self, alr_start_time: Option<Instant>) {
        self.alr_start_time = alr_start_time;
    }

    pub fn set_alr_ended_time(&mut self, alr_end_time: Instant) {
        self.alr_end_time = Some(alr_end_time);
    }

    /// Probe to recover from a recent large drop of the estimate.
    ///
    /// Only probes while application limited, or shortly after.
    pub fn request_probe(&mut self, now: Instant) -> Vec<ProbeClusterConfig> {
        let in_alr = self.alr_start_time.is_some();
        let alr_ended_recently = self.alr_end_time.map_or(false, |t| {
            now.saturating_duration_since(t) < self.config.alr_ended_timeout
        });
        if !(in_alr || alr_ended_recently) || self.state != ProbeState::SteadyState {
            return Vec::new();
        }

        let suggested_probe =
            self.bitrate_before_last_large_drop * self.config.probe_fraction_after_drop;
        let min_expected_probe_result = suggested_probe * (1.0 - self.config.probe_uncertainty);
        let time_since_drop = now.saturating_duration_since(self.time_of_last_large_drop);
        let time_since_probe = now.saturating_duration_since(self.last_bwe_drop_probing_time);

        if min_expected_probe_result > self.estimated_bitrate
            && time_since_drop < self.config.bitrate_drop_timeout
            && time_since_probe > self.config.min_time_between_alr_probes
        {
            debug!("{} probe after large drop at {}", NAME, suggested_probe);
            self.last_bwe_drop_probing_time = now;
            return self.initiate_probing(now, &[suggested_probe], false);
        }
        Vec::new()
    }

    /// Periodic work: time out a pending probe and send periodic ALR probes.
    pub fn process(&mut self, now: Instant) -> Vec<ProbeClusterConfig> {
        let waited_long_enough = self.time_last_probing_initiated.map_or(true, |t| {
            now.saturating_duration_since(t) > self.config.max_waiting_time_for_probing_result
        });
        if waited_long_enough && self.state == ProbeState::ExponentialProbing {
            debug!("{} no result of the last probe, stop probing", NAME);
            self.state = ProbeState::SteadyState;
            self.min_bitrate_to_probe_further = None;
        }

        if self.state != ProbeState::SteadyState || !self.enable_periodic_alr_probing {
            return Vec::new();
        }

        let alr_start_time = match self.alr_start_time {
            Some(t) if !self.estimated_bitrate.is_zero() => t,
            _ => return Vec::new(),
        };

        let last_probe = match self.time_last_probing_initiated {
            Some(t) => t.max(alr_start_time),
            None => alr_start_time,
        };
        match last_probe.checked_add(self.config.alr_periodic_probing_interval) {
            Some(next_probe_time) if now >= next_probe_time => {
                let target = self.estimated_bitrate * self.config.alr_probe_scale;
                self.initiate_probing(now, &[target], true)
            }
            _ => Vec::new(),
        }
    }

    /// Forget everything but the configuration and the ALR start time.
    pub fn reset(&mut self, now: Instant) {
        self.network_available = true;
        self.state = ProbeState::Idle;
        self.min_bitrate_to_probe_further = None;
        self.time_last_probing_initiated = None;
        self.estimated_bitrate = DataRate::ZERO;
        self.start_bitrate = DataRate::ZERO;
        self.max_bitrate = DataRate::ZERO;
        self.last_bwe_drop_probing_time = now;
        self.alr_end_time = None;
        self.time_of_last_large_drop = now;
        self.bitrate_before_last_large_drop = DataRate::ZERO;
        self.max_total_allocated_bitrate = DataRate::ZERO;
    }

    fn probe_max_bitrate_increase(
        &mut self,
        old_max_bitrate: DataRate,
        now: Instant,
    ) -> Vec<ProbeClusterConfig> {
        if !self.estimated_bitrate.is_zero()
            && old_max_bitrate < self.max_bitrate
            && self.estimated_bitrate < self.max_bitrate
        {
            debug!(
                "{} max bitrate increased from {} to {}",
                NAME, old_max_bitrate, self.max_bitrate
            );
            return self.initiate_probing(now, &[self.max_bitrate], false);
        }
        Vec::new()
    }

    fn initiate_exponential_probing(&mut self, now: Instant) -> Vec<ProbeClusterConfig> {
        let first = self.start_bitrate * self.config.first_exponential_probe_scale;
        let second = self.start_bitrate * self.config.second_exponential_probe_scale;
        self.initiate_probing(now, &[first, second], true)
    }

    fn initiate_probing(
        &mut self,
        now: Instant,
        bitrates_to_probe: &[DataRate],
        mut probe_further: bool,
    ) -> Vec<ProbeClusterConfig> {
        let max_probe_bitrate = if self.max_bitrate.is_zero() {
            self.config.default_max_probing_bitrate
        } else {
            self.max_bitrate
        };

        let mut probes = Vec::with_capacity(bitrates_to_probe.len());
        let mut last_bitrate = DataRate::ZERO;
        for &bitrate in bitrates_to_probe {
            let mut bitrate = bitrate;
            if bitrate > max_probe_bitrate {
                bitrate = max_probe_bitrate;
                probe_further = false;
            }
            last_bitrate = bitrate;

            let id = self.next_probe_cluster_id;
            self.next_probe_cluster_id = self.next_probe_cluster_id.wrapping_add(1).max(1);
            probes.push(ProbeClusterConfig {
                at_time: now,
                target_data_rate: bitrate,
                target_duration: self.config.min_probe_duration,
                target_probe_count: self.config.min_probe_packets_sent,
                id,
            });
        }
        trace!("{} initiate probing {:?}", NAME, probes);

        self.time_last_probing_initiated = Some(now);
        if probe_further {
            self.state = ProbeState::ExponentialProbing;
            self.min_bitrate_to_probe_further =
                Some(last_bitrate * self.config.further_probe_threshold);
        } else {
            self.state = ProbeState::SteadyState;
            self.min_bitrate_to_probe_further = None;
        }

        probes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN_BITRATE: DataRate = DataRate::from_bps(100);
    const START_BITRATE: DataRate = DataRate::from_bps(300);
    const MAX_BITRATE: DataRate = DataRate::from_bps(10000);

    const EXPONENTIAL_PROBING_TIMEOUT: Duration = Duration::from_secs(5);
    const ALR_PROBE_INTERVAL: Duration = Duration::from_secs(5);
    const ALR_ENDED_TIMEOUT: Duration = Duration::from_secs(3);
    const BITRATE_DROP_TIMEOUT: Duration = Duration::from_secs(5);

    fn new_controller(now: Instant) -> ProbeController {
        ProbeController::new(ProbeControllerConfig::default(), now)
    }

    fn bitrates(probes: &[ProbeClusterConfig]) -> Vec<DataRate> {
        probes.iter().map(|p| p.target_data_rate).collect()
    }

    #[test]
    fn initiate_probing_on_set_bitrates() {
        let now = Instant::now();
        let mut controller = new_controller(now);
        assert_eq!(controller.state(), ProbeState::Idle);

        let probes = controller.set_bitrates(MIN_BITRATE, START_BITRATE, MAX_BITRATE, now);
        assert_eq!(
            bitrates(&probes),
            vec![DataRate::from_bps(900), DataRate::from_bps(1800)]
        );
        assert_eq!(controller.state(), ProbeState::ExponentialProbing);

        for probe in &probes {
            assert_eq!(probe.at_time, now);
            assert_eq!(probe.target_duration, Duration::from_millis(15));
            assert_eq!(probe.target_probe_count, 5);
        }
        assert_ne!(probes[0].id, probes[1].id);
    }

    #[test]
    fn probe_only_when_network_is_up() {
        let mut now = Instant::now();
        let mut controller = new_controller(now);

        assert!(controller.on_network_availability(false, now).is_empty());
        assert!(controller
            .set_bitrates(MIN_BITRATE, START_BITRATE, MAX_BITRATE, now)
            .is_empty());
        assert_eq!(controller.state(), ProbeState::Idle);

        now += Duration::from_millis(100);
        let probes = controller.on_network_availability(true, now);
        assert_eq!(probes.len(), 2);
        assert_eq!(controller.state(), ProbeState::ExponentialProbing);
    }

    #[test]
    fn initiate_probing_on_max_bitrate_increase() {
        let mut now = Instant::now();
        let mut controller = new_controller(now);
        assert_eq!(
            controller
                .set_bitrates(MIN_BITRATE, START_BITRATE, MAX_BITRATE, now)
                .len(),
            2
        );

        // Long enough to time out exponential probing.
        now += EXPONENTIAL_PROBING_TIMEOUT;
        assert!(controller.set_estimated_bitrate(START_BITRATE, now).is_empty());
        assert!(controller.process(now).is_empty());
        assert_eq!(controller.state(), ProbeState::SteadyState);

        let new_max = MAX_BITRATE + DataRate::from_bps(100);
        let probes = controller.set_bitrates(MIN_BITRATE, START_BITRATE, new_max, now);
        assert_eq!(bitrates(&probes), vec![new_max]);
        assert_eq!(controller.state(), ProbeState::SteadyState);
    }

    #[test]
    fn initiate_probing_on_max_bitrate_increase_at_max_bitrate() {
        let mut now = Instant::now();
        let mut controller = new_controller(now);
        controller.set_bitrates(MIN_BITRATE, START_BITRATE, MAX_BITRATE, now);

        now += EXPONENTIAL_PROBING_TIMEOUT;
        controller.set_estimated_bitrate(START_BITRATE, now);
        controller.process(now);
        assert!(controller.set_estimated_bitrate(MAX_BITRATE, now).is_empty());

        let new_max = MAX_BITRATE + DataRate::from_bps(100);
        let probes = controller.set_bitrates(MIN_BITRATE, START_BITRATE, new_max, now);
        assert_eq!(bitrates(&probes), vec![new_max]);
    }

    #[test]
    fn update_max_bitrate_probes_in_steady_state() {
        let mut now = Instant::now();
        let mut controller = new_controller(now);

        // Nothing to probe before startup.
        assert!(controller.update_max_bitrate(MAX_BITRATE, now).is_empty());

        controller.set_bitrates(MIN_BITRATE, START_BITRATE, MAX_BITRATE, now);
        assert!(controller
            .update_max_bitrate(MAX_BITRATE * 2.0, now)
            .is_empty());

        now += EXPONENTIAL_PROBING_TIMEOUT;
        controller.process(now);
        assert!(controller.update_max_bitrate(MAX_BITRATE, now).is_empty());

        let probes = controller.update_max_bitrate(MAX_BITRATE * 3.0, now);
        assert_eq!(bitrates(&probes), vec![MAX_BITRATE * 3.0]);
    }

    #[test]
    fn exponential_probing() {
        let now = Instant::now();
        let mut controller = new_controller(now);
        assert_eq!(
            controller
                .set_bitrates(MIN_BITRATE, START_BITRATE, MAX_BITRATE, now)
                .len(),
            2
        );

        // A repeated probe is only sent once the estimate climbs above
        // 0.7 * 6 * START_BITRATE = 1260 bps.
        assert!(controller
            .set_estimated_bitrate(DataRate::from_bps(1000), now)
            .is_empty());

        let probes = controller.set_estimated_bitrate(DataRate::from_bps(1800), now);
        assert_eq!(bitrates(&probes), vec![DataRate::from_bps(3600)]);
        assert_eq!(controller.state(), ProbeState::ExponentialProbing);
    }

    #[test]
    fn exponential_probing_timeout() {
        let mut now = Instant::now();
        let mut controller = new_controller(now);
        controller.set_bitrates(MIN_BITRATE, START_BITRATE, MAX_BITRATE, now);

        // Advance far enough to cause a time out in waiting for probing result.
        now += EXPONENTIAL_PROBING_TIMEOUT;
        assert!(controller.process(now).is_empty());
        assert_eq!(controller.state(), ProbeState::SteadyState);

        assert!(controller
            .set_estimated_bitrate(DataRate::from_bps(1800), now)
            .is_empty());
    }

    #[test]
    fn exponential_probing_overflow() {
        let now = Instant::now();
        let mut controller = new_controller(now);
        controller.set_bitrates(
            MIN_BITRATE,
            DataRate::from_mbps(10),
            DataRate::from_mbps(100),
            now,
        );

        // The probe bitrate is capped at the max bitrate.
        let probes = controller.set_estimated_bitrate(DataRate::from_mbps(60), now);
        assert_eq!(bitrates(&probes), vec![DataRate::from_mbps(100)]);
        assert_eq!(controller.state(), ProbeState::SteadyState);

        // No repeated probes.
        assert!(controller
            .set_estimated_bitrate(DataRate::from_mbps(100), now)
            .is_empty());
    }

    #[test]
    fn default_max_probing_bitrate_without_max() {
        let now = Instant::now();
        let mut controller = new_controller(now);
        let probes = controller.set_bitrates(
            MIN_BITRATE,
            DataRate::from_mbps(1),
            DataRate::ZERO,
            now,
        );
        assert_eq!(
            bitrates(&probes),
            vec![DataRate::from_mbps(3), DataRate::from_mbps(5)]
        );
        assert_eq!(controller.state(), ProbeState::SteadyState);
    }

    #[test]
    fn request_probe_in_alr() {
        let mut now = Instant::now();
        let mut controller = new_controller(now);
        assert_eq!(
            controller
                .set_bitrates(MIN_BITRATE, START_BITRATE, MAX_BITRATE, now)
                .len(),
            2
        );
        assert!(controller
            .set_estimated_bitrate(DataRate::from_bps(500), now)
            .is_empty());

        controller.set_alr_start_time(Some(now));
        now += ALR_PROBE_INTERVAL + Duration::from_millis(1);
        assert!(controller.process(now).is_empty());
        assert!(controller
            .set_estimated_bitrate(DataRate::from_bps(250), now)
            .is_empty());

        let probes = controller.request_probe(now);
        assert_eq!(bitrates(&probes), vec![DataRate::from_bps(425)]);

        // Only one probe per drop.
        assert!(controller.request_probe(now).is_empty());
    }

    #[test]
    fn request_probe_when_alr_ended_recently() {
        let mut now = Instant::now();
        let mut controller = new_controller(now);
        controller.set_bitrates(MIN_BITRATE, START_BITRATE, MAX_BITRATE, now);
        controller.set_estimated_bitrate(DataRate::from_bps(500), now);

        controller.set_alr_start_time(None);
        now += ALR_PROBE_INTERVAL + Duration::from_millis(1);
        controller.process(now);
        controller.set_estimated_bitrate(DataRate::from_bps(250), now);
        controller.set_alr_ended_time(now);

        now += ALR_ENDED_TIMEOUT - Duration::from_millis(1);
        let probes = controller.request_probe(now);
        assert_eq!(bitrates(&probes), vec![DataRate::from_bps(425)]);
    }

    #[test]
    fn request_probe_when_alr_not_ended_recently() {
        let mut now = Instant::now();
        let mut controller = new_controller(now);
        controller.set_bitrates(MIN_BITRATE, START_BITRATE, MAX_BITRATE, now);
        controller.set_estimated_bitrate(DataRate::from_bps(500), now);

        controller.set_alr_start_time(None);
        now += ALR_PROBE_INTERVAL + Duration::from_millis(1);
        controller.process(now);
        controller.set_estimated_bitrate(DataRate::from_bps(250), now);
        controller.set_alr_ended_time(now);

        now += ALR_ENDED_TIMEOUT + Duration::from_millis(1);
        assert!(controller.request_probe(now).is_empty());
    }

    #[test]
    fn request_probe_when_bwe_drop_not_recent() {
        let mut now = Instant::now();
        let mut controller = new_controller(now);
        controller.set_bitrates(MIN_BITRATE, START_BITRATE, MAX_BITRATE, now);
        controller.set_estimated_bitrate(DataRate::from_bps(500), now);

        controller.set_alr_start_time(Some(now));
        now += ALR_PROBE_INTERVAL + Duration::from_millis(1);
        controller.process(now);
        controller.set_estimated_bitrate(DataRate::from_bps(250), now);

        now += BITRATE_DROP_TIMEOUT + Duration::from_millis(1);
        assert!(controller.request_probe(now).is_empty());
    }

    #[test]
    fn periodic_probing() {
        let mut now = Instant::now();
        let mut controller = new_controller(now);
        controller.enable_periodic_alr_probing(true);
        assert_eq!(
            controller
                .set_bitrates(MIN_BITRATE, START_BITRATE, MAX_BITRATE, now)
                .len(),
            2
        );
        assert!(controller
            .set_estimated_bitrate(DataRate::from_bps(500), now)
            .is_empty());

        let start_time = now;

        // A new probe is sent after 5s.
        controller.set_alr_start_time(Some(start_time));
        now += Duration::from_secs(5);
        let probes = controller.process(now);
        assert_eq!(bitrates(&probes), vec![DataRate::from_bps(1000)]);
        assert!(controller
            .set_estimated_bitrate(DataRate::from_bps(500), now)
            .is_empty());

        // The following probe is sent 10s into ALR.
        controller.set_alr_start_time(Some(start_time));
        now += Duration::from_secs(4);
        assert!(controller.process(now).is_empty());
        assert!(controller
            .set_estimated_bitrate(DataRate::from_bps(500), now)
            .is_empty());

        controller.set_alr_start_time(Some(start_time));
        now += Duration::from_secs(1);
        let probes = controller.process(now);
        assert_eq!(bitrates(&probes), vec![DataRate::from_bps(1000)]);
    }

    #[test]
    fn periodic_probing_after_reset() {
        let mut now = Instant::now();
        let mut config = ProbeControllerConfig::default();
        config.enable_periodic_alr_probing = true;
        let mut controller = ProbeController::new(config, now);

        controller.set_alr_start_time(Some(now));
        assert_eq!(
            controller
                .set_bitrates(MIN_BITRATE, START_BITRATE, MAX_BITRATE, now)
                .len(),
            2
        );
        controller.reset(now);
        assert_eq!(controller.state(), ProbeState::Idle);

        now += Duration::from_secs(10);
        assert!(controller.process(now).is_empty());

        assert_eq!(
            controller
                .set_bitrates(MIN_BITRATE, START_BITRATE, MAX_BITRATE, now)
                .len(),
            2
        );

        // The start bitrate is used as the estimate until a new estimate is
        // fed.
        now += Duration::from_secs(10);
        let probes = controller.process(now);
        assert_eq!(bitrates(&probes), vec![START_BITRATE * 2.0]);
    }

    #[test]
    fn probe_on_max_total_allocated_bitrate() {
        let mut now = Instant::now();
        let mut controller = new_controller(now);
        controller.set_bitrates(MIN_BITRATE, START_BITRATE, MAX_BITRATE, now);

        // Not in steady state yet.
        assert!(controller
            .on_max_total_allocated_bitrate(DataRate::from_bps(2000), now)
            .is_empty());

        now += EXPONENTIAL_PROBING_TIMEOUT;
        controller.process(now);

        // Unchanged allocation.
        assert!(controller
            .on_max_total_allocated_bitrate(DataRate::from_bps(2000), now)
            .is_empty());

        let probes = controller.on_max_total_allocated_bitrate(DataRate::from_bps(4000), now);
        assert_eq!(bitrates(&probes), vec![DataRate::from_bps(4000)]);

        // Allocation below the estimate.
        assert!(controller
            .on_max_total_allocated_bitrate(DataRate::from_bps(200), now)
            .is_empty());
    }

    #[test]
    fn probe_on_max_total_allocated_bitrate_disabled() {
        let mut now = Instant::now();
        let mut config = ProbeControllerConfig::default();
        config.probe_on_max_allocated_bitrate_change = false;
        let mut controller = ProbeController::new(config, now);
        controller.set_bitrates(MIN_BITRATE, START_BITRATE, MAX_BITRATE, now);

        now += EXPONENTIAL_PROBING_TIMEOUT;
        controller.process(now);
        assert!(controller
            .on_max_total_allocated_bitrate(DataRate::from_bps(4000), now)
            .is_empty());
    }

    #[test]
    fn probe_cluster_ids_are_unique() {
        let mut now = Instant::now();
        let mut controller = new_controller(now);
        let mut ids: Vec<i32> = controller
            .set_bitrates(MIN_BITRATE, START_BITRATE, MAX_BITRATE, now)
            .iter()
            .map(|p| p.id)
            .collect();
        ids.extend(
            controller
                .set_estimated_bitrate(DataRate::from_bps(1800), now)
                .iter()
                .map(|p| p.id),
        );
        now += EXPONENTIAL_PROBING_TIMEOUT;
        controller.process(now);
        ids.extend(
            controller
                .update_max_bitrate(MAX_BITRATE * 2.0, now)
                .iter()
                .map(|p| p.id),
        );

        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[test]
    fn config_from_json() {
        let json = r#"{
            "alr_probe_scale": 1.5,
            "min_probe_duration": 20,
            "default_max_probing_bitrate": "2mbps"
        }"#;
        let config: ProbeControllerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.alr_probe_scale, 1.5);
        assert_eq!(config.min_probe_duration, Duration::from_millis(20));
        assert_eq!(config.default_max_probing_bitrate, DataRate::from_mbps(2));
        assert_eq!(config.first_exponential_probe_scale, 3.0);
    }
}

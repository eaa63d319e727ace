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

//! TBWE is a sender side bandwidth estimation library for real-time media
//! transports.
//!
//! ## Features
//!
//! * **Loss-based estimation**: the estimator models the channel with an
//!   inherent loss rate and a loss limited bandwidth, and picks the most
//!   likely bandwidth given the packet losses observed over a sliding window.
//! * **TCP fairness**: the estimate is capped when the average loss ratio
//!   gets high, so competing loss-based flows are not starved.
//! * **Probing**: the probe controller schedules bursts above the estimate at
//!   startup, on max bitrate increases, after large drops and periodically
//!   while application limited.
//! * **Monitor intervals**: feedback can be attributed to the sending rate
//!   that was in effect when each packet was sent.
//!
//! The library does no I/O and never reads the clock. Every call takes the
//! current time, and every output is returned to the caller.
//!
//! ## Get started
//!
//! ```
//! use std::time::Instant;
//!
//! let mut conf = tbwe::Config::new();
//! conf.set_start_bitrate(500_000);
//!
//! let now = Instant::now();
//! let mut controller = tbwe::BandwidthController::new(&conf, now);
//! let update = controller.on_process_interval(tbwe::network_types::ProcessInterval {
//!     at_time: now,
//!     pacer_queue: None,
//! });
//! assert!(update.target_rate.is_some());
//! ```

use std::time::Duration;

use log::*;
use serde::Deserialize;
use serde::Serialize;
use serde_with::serde_as;
use serde_with::DisplayFromStr;

use crate::units::DataRate;

/// Default minimum bitrate.
const DEFAULT_MIN_BITRATE: DataRate = DataRate::from_kbps(5);

/// Default start bitrate.
const DEFAULT_START_BITRATE: DataRate = DataRate::from_kbps(300);

/// Default ratio between the pacing rate and the target rate.
const DEFAULT_PACING_FACTOR: f64 = 2.5;

/// Pacer budgets are given per this window.
const PACER_TIME_WINDOW: Duration = Duration::from_secs(1);

/// A specialized [`Result`] type for bandwidth estimation operations.
///
/// [`Result`]: https://doc.rust-lang.org/std/result/enum.Result.html
pub type Result<T> = std::result::Result<T, Error>;

/// Configurations about bandwidth estimation.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The target rate never goes below this.
    #[serde_as(as = "DisplayFromStr")]
    min_bitrate: DataRate,

    /// Rate used before any estimate is available.
    #[serde_as(as = "DisplayFromStr")]
    start_bitrate: DataRate,

    /// The target rate never goes above this. `+inf bps` if unlimited.
    #[serde_as(as = "DisplayFromStr")]
    max_bitrate: DataRate,

    /// Pacing rate divided by the target rate.
    pacing_factor: f64,

    /// Configurations about the loss-based estimator.
    loss_based_bwe: LossBasedBweConfig,

    /// Configurations about the probe controller.
    probe_controller: ProbeControllerConfig,
}

impl Config {
    /// Create default configuration.
    ///
    /// The configuration may be customized by calling related set methods.
    ///
    /// ## Examples:
    ///
    /// ```
    /// let mut conf = tbwe::Config::new();
    /// conf.set_min_bitrate(30_000);
    /// conf.set_start_bitrate(500_000);
    /// conf.set_max_bitrate(2_500_000);
    /// conf.set_pacing_factor(1.5);
    /// ```
    pub fn new() -> Self {
        Self {
            min_bitrate: DEFAULT_MIN_BITRATE,
            start_bitrate: DEFAULT_START_BITRATE,
            max_bitrate: DataRate::INFINITY,
            pacing_factor: DEFAULT_PACING_FACTOR,
            loss_based_bwe: LossBasedBweConfig::default(),
            probe_controller: ProbeControllerConfig::default(),
        }
    }

    /// Parse configuration from JSON. Missing fields take their default value.
    ///
    /// Data rates are strings such as `"300kbps"` or `"2.5Mbps"`, and
    /// durations are integers in milliseconds.
    ///
    /// ## Examples:
    ///
    /// ```
    /// let conf = tbwe::Config::from_json(r#"{
    ///     "start_bitrate": "1Mbps",
    ///     "loss_based_bwe": { "observation_window_size": 10 },
    ///     "probe_controller": { "enable_periodic_alr_probing": true }
    /// }"#)?;
    /// # Ok::<(), tbwe::Error>(())
    /// ```
    pub fn from_json(json: &str) -> Result<Self> {
        let conf: Config = serde_json::from_str(json)?;
        conf.validate()?;
        Ok(conf)
    }

    /// Check the bitrate limits and the pacing factor.
    ///
    /// The component configurations are checked by the components themselves.
    pub fn validate(&self) -> Result<()> {
        if self.min_bitrate > self.max_bitrate {
            return Err(Error::InvalidConfig(format!(
                "min bitrate {} is above max bitrate {}",
                self.min_bitrate, self.max_bitrate
            )));
        }
        if !self.start_bitrate.is_finite() {
            return Err(Error::InvalidConfig(format!(
                "start bitrate must be finite: {}",
                self.start_bitrate
            )));
        }
        if !(self.pacing_factor > 0.0 && self.pacing_factor.is_finite()) {
            return Err(Error::InvalidConfig(format!(
                "pacing factor must be positive: {}",
                self.pacing_factor
            )));
        }
        Ok(())
    }

    /// Set the minimum bitrate in bits per second.
    pub fn set_min_bitrate(&mut self, bps: u64) {
        self.min_bitrate = DataRate::from_bps(bps);
    }

    /// Set the start bitrate in bits per second.
    pub fn set_start_bitrate(&mut self, bps: u64) {
        self.start_bitrate = DataRate::from_bps(bps);
    }

    /// Set the maximum bitrate in bits per second. Zero means unlimited.
    pub fn set_max_bitrate(&mut self, bps: u64) {
        self.max_bitrate = if bps == 0 {
            DataRate::INFINITY
        } else {
            DataRate::from_bps(bps)
        };
    }

    /// Set the ratio between the pacing rate and the target rate. Values
    /// that are not positive are ignored.
    pub fn set_pacing_factor(&mut self, v: f64) {
        if v > 0.0 && v.is_finite() {
            self.pacing_factor = v;
        } else {
            warn!("pacing factor must be positive, ignore {}", v);
        }
    }

    /// Set configurations about the loss-based estimator.
    pub fn set_loss_based_bwe_config(&mut self, v: LossBasedBweConfig) {
        self.loss_based_bwe = v;
    }

    /// Set configurations about the probe controller.
    pub fn set_probe_controller_config(&mut self, v: ProbeControllerConfig) {
        self.probe_controller = v;
    }

    /// Enable or disable periodic probing while application limited.
    pub fn enable_periodic_alr_probing(&mut self, v: bool) {
        self.probe_controller.enable_periodic_alr_probing = v;
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}


pub use crate::congestion_control::ChannelParameters;
pub use crate::congestion_control::LossBasedBwe;
pub use crate::congestion_control::LossBasedBweConfig;
pub use crate::congestion_control::MonitorBlock;
pub use crate::congestion_control::MonitorInterval;
pub use crate::congestion_control::Observation;
pub use crate::congestion_control::PacketObservationWindow;
pub use crate::congestion_control::ProbeController;
pub use crate::congestion_control::ProbeControllerConfig;
pub use crate::congestion_control::ProbeState;
pub use crate::error::Error;
pub use crate::network_controller::BandwidthController;

#[path = "congestion_control/congestion_control.rs"]
mod congestion_control;

pub mod error;
mod network_controller;
pub mod network_types;
pub mod units;

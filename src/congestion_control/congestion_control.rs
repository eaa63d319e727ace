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

//! Bandwidth estimation and probing components.

pub use loss_based_bwe::ChannelParameters;
pub use loss_based_bwe::LossBasedBwe;
pub use loss_based_bwe::LossBasedBweConfig;
pub use monitor_interval::MonitorBlock;
pub use monitor_interval::MonitorInterval;
pub use observation_window::Observation;
pub use observation_window::PacketObservationWindow;
pub use probe_controller::ProbeController;
pub use probe_controller::ProbeControllerConfig;
pub use probe_controller::ProbeState;

mod loss_based_bwe;
mod monitor_interval;
mod observation_window;
mod probe_controller;

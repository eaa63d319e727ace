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

#![no_main]

use std::time::Instant;

use libfuzzer_sys::fuzz_target;

use tbwe::network_types::ProcessInterval;
use tbwe::BandwidthController;
use tbwe::Config;

fuzz_target!(|data: &[u8]| {
    let json = match std::str::from_utf8(data) {
        Ok(json) => json,
        Err(_) => return,
    };

    // Any configuration that parses must yield a working controller.
    if let Ok(conf) = Config::from_json(json) {
        let now = Instant::now();
        let mut controller = BandwidthController::new(&conf, now);
        controller.on_process_interval(ProcessInterval {
            at_time: now,
            pacer_queue: None,
        });
    }
});

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

use std::time::Duration;
use std::time::Instant;

use lazy_static::lazy_static;
use libfuzzer_sys::fuzz_target;

use tbwe::network_types::PacketResult;
use tbwe::network_types::ProcessInterval;
use tbwe::network_types::SentPacket;
use tbwe::network_types::TransportPacketsFeedback;
use tbwe::units::DataRate;
use tbwe::units::DataSize;
use tbwe::BandwidthController;
use tbwe::Config;
use tbwe::LossBasedBweConfig;

lazy_static! {
    static ref CONFIG: Config = {
        let mut conf = Config::new();
        conf.set_loss_based_bwe_config(LossBasedBweConfig {
            observation_duration_lower_bound: Duration::from_millis(20),
            observation_window_size: 8,
            ..LossBasedBweConfig::default()
        });
        conf.enable_periodic_alr_probing(true);
        conf
    };
}

// Each 8-byte record is one packet: send offset (ms, u16), receive delay (ms,
// u16, 0xffff for lost), size (bytes, u16) and a flags byte selecting extra
// controller events. The last byte of a record is unused.
fuzz_target!(|data: &[u8]| {
    let base = Instant::now();
    let mut controller = BandwidthController::new(&CONFIG, base);
    let mut now = base;
    let mut packets = Vec::new();

    for record in data.chunks_exact(8) {
        let send_offset = u16::from_le_bytes([record[0], record[1]]) as u64;
        let receive_delay = u16::from_le_bytes([record[2], record[3]]);
        let size = u16::from_le_bytes([record[4], record[5]]) as u64;
        let flags = record[6];

        now += Duration::from_millis(send_offset);
        let sent = SentPacket::new(now, DataSize::from_bytes(size));
        packets.push(if receive_delay == u16::MAX {
            PacketResult::lost(sent)
        } else {
            PacketResult::received(sent, now + Duration::from_millis(receive_delay as u64))
        });

        if flags & 0x01 != 0 {
            let msg = TransportPacketsFeedback::new(now, std::mem::take(&mut packets));
            controller.on_transport_packets_feedback(&msg);
        }
        if flags & 0x02 != 0 {
            controller.on_acknowledged_bitrate(DataRate::from_bps(size * 1000));
        }
        if flags & 0x04 != 0 {
            controller.on_alr_start(now);
        }
        if flags & 0x08 != 0 {
            controller.on_alr_end(now);
            controller.request_probe(now);
        }
        controller.on_process_interval(ProcessInterval {
            at_time: now,
            pacer_queue: None,
        });

        let target_rate = controller.target_rate();
        assert!(target_rate.is_finite());
        assert!(target_rate >= DataRate::from_kbps(5));
    }
});

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

//! Data rate and data size units.
//!
//! All arithmetic saturates instead of wrapping. `DataRate::INFINITY` is the
//! "unbounded / no estimate" sentinel and is absorbing for addition and for
//! scaling by a positive factor or division by a non-negative one.

use core::str::FromStr;
use std::cmp;
use std::fmt;
use std::ops::Add;
use std::ops::AddAssign;
use std::ops::Div;
use std::ops::Mul;
use std::ops::Sub;
use std::time::Duration;

use crate::Error;
use crate::Result;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// A data rate in bits per second.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DataRate {
    bps: u64,
}

impl DataRate {
    /// Zero rate.
    pub const ZERO: DataRate = DataRate { bps: 0 };

    /// Unbounded rate. Also used to report that no estimate is available.
    pub const INFINITY: DataRate = DataRate { bps: u64::MAX };

    pub const fn from_bps(bps: u64) -> Self {
        DataRate { bps }
    }

    pub const fn from_kbps(kbps: u64) -> Self {
        DataRate {
            bps: kbps.saturating_mul(1_000),
        }
    }

    pub const fn from_mbps(mbps: u64) -> Self {
        DataRate {
            bps: mbps.saturating_mul(1_000_000),
        }
    }

    pub const fn from_bytes_per_sec(bytes: u64) -> Self {
        DataRate {
            bps: bytes.saturating_mul(8),
        }
    }

    /// Build a rate from a floating point bits per second value.
    ///
    /// The value is rounded to the nearest integer. Positive infinity and
    /// values too large to represent map to `INFINITY`; NaN and non-positive
    /// values map to `ZERO`.
    pub fn from_bps_f64(bps: f64) -> Self {
        if bps.is_nan() || bps <= 0.0 {
            return DataRate::ZERO;
        }
        if bps >= u64::MAX as f64 {
            return DataRate::INFINITY;
        }
        DataRate {
            bps: bps.round() as u64,
        }
    }

    /// Bits per second. `u64::MAX` for `INFINITY`.
    pub fn bps(&self) -> u64 {
        self.bps
    }

    /// Bits per second as a float, `f64::INFINITY` for `INFINITY`.
    pub fn bps_f64(&self) -> f64 {
        if self.is_infinite() {
            return f64::INFINITY;
        }
        self.bps as f64
    }

    /// Kilobits per second as a float.
    pub fn kbps(&self) -> f64 {
        self.bps_f64() / 1000.0
    }

    pub fn bytes_per_sec(&self) -> u64 {
        if self.is_infinite() {
            return u64::MAX;
        }
        self.bps / 8
    }

    pub fn is_zero(&self) -> bool {
        self.bps == 0
    }

    pub fn is_finite(&self) -> bool {
        !self.is_infinite()
    }

    pub fn is_infinite(&self) -> bool {
        self.bps == u64::MAX
    }
}

impl Mul<f64> for DataRate {
    type Output = DataRate;

    fn mul(self, factor: f64) -> DataRate {
        if self.is_infinite() {
            return if factor > 0.0 {
                DataRate::INFINITY
            } else {
                DataRate::ZERO
            };
        }
        DataRate::from_bps_f64(self.bps as f64 * factor)
    }
}

impl Mul<DataRate> for f64 {
    type Output = DataRate;

    fn mul(self, rate: DataRate) -> DataRate {
        rate * self
    }
}

impl Mul<u64> for DataRate {
    type Output = DataRate;

    fn mul(self, factor: u64) -> DataRate {
        DataRate {
            bps: self.bps.saturating_mul(factor),
        }
    }
}

impl Div<f64> for DataRate {
    type Output = DataRate;

    fn div(self, divisor: f64) -> DataRate {
        if self.is_infinite() {
            return if divisor >= 0.0 {
                DataRate::INFINITY
            } else {
                DataRate::ZERO
            };
        }
        DataRate::from_bps_f64(self.bps as f64 / divisor)
    }
}

impl Div<DataRate> for DataRate {
    type Output = f64;

    fn div(self, other: DataRate) -> f64 {
        self.bps_f64() / other.bps_f64()
    }
}

impl Add for DataRate {
    type Output = DataRate;

    fn add(self, other: DataRate) -> DataRate {
        DataRate {
            bps: self.bps.saturating_add(other.bps),
        }
    }
}

impl Sub for DataRate {
    type Output = DataRate;

    fn sub(self, other: DataRate) -> DataRate {
        if self.is_infinite() {
            return DataRate::INFINITY;
        }
        DataRate {
            bps: self.bps.saturating_sub(other.bps),
        }
    }
}

impl Mul<Duration> for DataRate {
    type Output = DataSize;

    fn mul(self, duration: Duration) -> DataSize {
        let bits = self.bps as u128 * duration.as_nanos() / NANOS_PER_SEC;
        DataSize::from_bytes(cmp::min(bits / 8, u64::MAX as u128) as u64)
    }
}

impl fmt::Display for DataRate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_infinite() {
            write!(f, "+inf bps")
        } else if self.bps != 0 && self.bps % 1000 == 0 {
            write!(f, "{} kbps", self.bps / 1000)
        } else {
            write!(f, "{} bps", self.bps)
        }
    }
}

impl FromStr for DataRate {
    type Err = Error;

    /// Parse strings such as "15kbps", "1.5 Mbps", "300 bps" or "+inf bps".
    fn from_str(s: &str) -> Result<DataRate> {
        let s = s.trim().to_ascii_lowercase();
        if s == "+inf bps" || s == "inf" || s == "+inf" {
            return Ok(DataRate::INFINITY);
        }

        let split = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(s.len());
        let (value, unit) = s.split_at(split);
        let value: f64 = value
            .parse()
            .map_err(|_| Error::InvalidUnit(format!("bad data rate {:?}", s)))?;

        let multiplier = match unit.trim() {
            "" | "bps" => 1.0,
            "kbps" => 1e3,
            "mbps" => 1e6,
            _ => return Err(Error::InvalidUnit(format!("bad data rate unit {:?}", s))),
        };

        Ok(DataRate::from_bps_f64(value * multiplier))
    }
}

/// An amount of data in bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DataSize {
    bytes: u64,
}

impl DataSize {
    pub const ZERO: DataSize = DataSize { bytes: 0 };

    pub const fn from_bytes(bytes: u64) -> Self {
        DataSize { bytes }
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn is_zero(&self) -> bool {
        self.bytes == 0
    }
}

impl Add for DataSize {
    type Output = DataSize;

    fn add(self, other: DataSize) -> DataSize {
        DataSize {
            bytes: self.bytes.saturating_add(other.bytes),
        }
    }
}

impl AddAssign for DataSize {
    fn add_assign(&mut self, other: DataSize) {
        *self = *self + other;
    }
}

impl Sub for DataSize {
    type Output = DataSize;

    fn sub(self, other: DataSize) -> DataSize {
        DataSize {
            bytes: self.bytes.saturating_sub(other.bytes),
        }
    }
}

impl Mul<u64> for DataSize {
    type Output = DataSize;

    fn mul(self, factor: u64) -> DataSize {
        DataSize {
            bytes: self.bytes.saturating_mul(factor),
        }
    }
}

impl Div<Duration> for DataSize {
    type Output = DataRate;

    /// Average rate of sending `self` over `duration`. A zero duration yields
    /// `INFINITY` unless the size is zero too.
    fn div(self, duration: Duration) -> DataRate {
        if self.bytes == 0 {
            return DataRate::ZERO;
        }
        let nanos = duration.as_nanos();
        if nanos == 0 {
            return DataRate::INFINITY;
        }
        let bps = self.bytes as u128 * 8 * NANOS_PER_SEC / nanos;
        if bps >= u64::MAX as u128 {
            return DataRate::INFINITY;
        }
        DataRate::from_bps(bps as u64)
    }
}

impl Div<DataSize> for DataSize {
    type Output = f64;

    fn div(self, other: DataSize) -> f64 {
        self.bytes as f64 / other.bytes as f64
    }
}

impl fmt::Display for DataSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} bytes", self.bytes)
    }
}

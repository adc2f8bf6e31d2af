// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

const UNIT: u64 = 1;
const BINARY_DATA_MAGNITUDE: u64 = 1024;
pub const B: u64 = UNIT;
pub const KIB: u64 = B * BINARY_DATA_MAGNITUDE;
pub const MIB: u64 = KIB * BINARY_DATA_MAGNITUDE;
pub const GIB: u64 = MIB * BINARY_DATA_MAGNITUDE;
pub const TIB: u64 = GIB * BINARY_DATA_MAGNITUDE;
pub const PIB: u64 = TIB * BINARY_DATA_MAGNITUDE;

/// Human readable byte size, accepting forms like "64M", "1.5G" or "1024".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct ReadableSize(pub u64);

impl ReadableSize {
    pub const fn kb(count: u64) -> ReadableSize {
        ReadableSize(count * KIB)
    }

    pub const fn mb(count: u64) -> ReadableSize {
        ReadableSize(count * MIB)
    }

    pub const fn gb(count: u64) -> ReadableSize {
        ReadableSize(count * GIB)
    }

    pub fn as_bytes(&self) -> u64 {
        self.0
    }

    pub fn as_mb(&self) -> u64 {
        self.0 / MIB
    }
}

impl FromStr for ReadableSize {
    type Err = String;

    fn from_str(s: &str) -> Result<ReadableSize, String> {
        let size_str = s.trim();
        if size_str.is_empty() {
            return Err(format!("{:?} is not a valid size.", s));
        }

        if !size_str.is_ascii() {
            return Err(format!("ASCII string is expected, but got {:?}", s));
        }

        // split the string by the last digit or dot
        let mut chrs = size_str.chars();
        let mut number_str_len = size_str.len();
        while let Some(c) = chrs.next_back() {
            if c.is_ascii_digit() || c == '.' {
                break;
            }
            number_str_len -= 1;
        }

        let (number_str, unit_str) = size_str.split_at(number_str_len);
        let unit = match unit_str.trim() {
            "K" | "KB" | "KiB" => KIB,
            "M" | "MB" | "MiB" => MIB,
            "G" | "GB" | "GiB" => GIB,
            "T" | "TB" | "TiB" => TIB,
            "P" | "PB" | "PiB" => PIB,
            "B" | "" => B,
            _ => {
                return Err(format!(
                    "only B, KB, KiB, MB, MiB, GB, GiB, TB, TiB, PB, and PiB are supported: {:?}",
                    s
                ));
            }
        };

        match number_str.trim().parse::<f64>() {
            Ok(n) => Ok(ReadableSize((n * unit as f64) as u64)),
            Err(_) => Err(format!("invalid size string: {:?}", s)),
        }
    }
}

impl Display for ReadableSize {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let size = self.0;
        if size == 0 {
            write!(f, "{}KiB", size)
        } else if size % PIB == 0 {
            write!(f, "{}PiB", size / PIB)
        } else if size % TIB == 0 {
            write!(f, "{}TiB", size / TIB)
        } else if size % GIB == 0 {
            write!(f, "{}GiB", size / GIB)
        } else if size % MIB == 0 {
            write!(f, "{}MiB", size / MIB)
        } else if size % KIB == 0 {
            write!(f, "{}KiB", size / KIB)
        } else {
            write!(f, "{}B", size)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!(ReadableSize::from_str("1024").unwrap().as_bytes(), 1024);
        assert_eq!(ReadableSize::from_str("20B").unwrap().as_bytes(), 20);
        assert_eq!(ReadableSize::from_str("1K").unwrap().as_bytes(), KIB);
        assert_eq!(ReadableSize::from_str("64M").unwrap().as_bytes(), 64 * MIB);
        assert_eq!(ReadableSize::from_str("1.5G").unwrap().as_bytes(), (1.5 * GIB as f64) as u64);
        assert_eq!(ReadableSize::from_str("10GB").unwrap().as_bytes(), 10 * GIB);
        assert_eq!(ReadableSize::from_str(" 4M ").unwrap().as_bytes(), 4 * MIB);
    }

    #[test]
    fn test_parse_invalid() {
        assert!(ReadableSize::from_str("").is_err());
        assert!(ReadableSize::from_str("abc").is_err());
        assert!(ReadableSize::from_str("1Z").is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(ReadableSize::mb(64).to_string(), "64MiB");
        assert_eq!(ReadableSize(20).to_string(), "20B");
    }
}

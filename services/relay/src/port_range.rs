//! Allowed remote-port ranges for TCP tunnels.
//!
//! The grammar is a comma-separated list of ports and inclusive ranges,
//! for example `"1024-65535"` or `"8000-8999,9500"`.

use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use rand::Rng;

/// A non-empty set of inclusive port ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRanges(Vec<RangeInclusive<u16>>);

impl PortRanges {
    pub fn contains(&self, port: u16) -> bool {
        self.0.iter().any(|range| range.contains(&port))
    }

    /// Total number of ports covered.
    pub fn len(&self) -> u64 {
        self.0
            .iter()
            .map(|range| u64::from(*range.end()) - u64::from(*range.start()) + 1)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Pick a uniformly random port from the covered set.
    ///
    /// Says nothing about whether the port is actually bindable; callers
    /// probe for that themselves.
    pub fn pick(&self) -> u16 {
        let mut idx = rand::rng().random_range(0..self.len());
        for range in &self.0 {
            let span = u64::from(*range.end()) - u64::from(*range.start()) + 1;
            if idx < span {
                return range.start() + idx as u16;
            }
            idx -= span;
        }
        unreachable!("index {idx} outside covered ranges")
    }
}

impl FromStr for PortRanges {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut ranges = Vec::new();
        for piece in s.split(',') {
            let piece = piece.trim();
            if piece.is_empty() {
                return Err("empty port range".to_string());
            }
            let range = match piece.split_once('-') {
                Some((start, end)) => {
                    let start = parse_port(start.trim(), piece)?;
                    let end = parse_port(end.trim(), piece)?;
                    if start > end {
                        return Err(format!("invalid port range '{piece}': start exceeds end"));
                    }
                    start..=end
                }
                None => {
                    let port = parse_port(piece, piece)?;
                    port..=port
                }
            };
            ranges.push(range);
        }
        if ranges.is_empty() {
            return Err("empty port range".to_string());
        }
        Ok(Self(ranges))
    }
}

impl fmt::Display for PortRanges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, range) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            if range.start() == range.end() {
                write!(f, "{}", range.start())?;
            } else {
                write!(f, "{}-{}", range.start(), range.end())?;
            }
        }
        Ok(())
    }
}

fn parse_port(s: &str, piece: &str) -> Result<u16, String> {
    s.parse()
        .map_err(|_| format!("invalid port '{s}' in range '{piece}'"))
}

// Copyright (c) 2018 The rust-gpio-cdev Project Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Per-line configuration and the events reported for requested lines.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bitflags::bitflags;
use serde::Deserialize;

use crate::errors::{Error, ErrorKind};

bitflags! {
    /// Line flags as encoded by the v2 uAPI.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LineFlags: u64 {
        const USED = 1 << 0;
        const ACTIVE_LOW = 1 << 1;
        const INPUT = 1 << 2;
        const OUTPUT = 1 << 3;
        const EDGE_RISING = 1 << 4;
        const EDGE_FALLING = 1 << 5;
        const OPEN_DRAIN = 1 << 6;
        const OPEN_SOURCE = 1 << 7;
        const BIAS_PULL_UP = 1 << 8;
        const BIAS_PULL_DOWN = 1 << 9;
        const BIAS_DISABLED = 1 << 10;
        const EVENT_CLOCK_REALTIME = 1 << 11;
    }
}

/// Logical value of a line, after active-low inversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Value {
    #[default]
    Inactive,
    Active,
}

impl Value {
    pub fn is_active(self) -> bool {
        self == Value::Active
    }
}

impl From<bool> for Value {
    fn from(active: bool) -> Value {
        if active {
            Value::Active
        } else {
            Value::Inactive
        }
    }
}

impl std::ops::Not for Value {
    type Output = Value;

    fn not(self) -> Value {
        Value::from(!self.is_active())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum Bias {
    #[default]
    AsIs,
    PullUp,
    PullDown,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum Drive {
    #[default]
    PushPull,
    OpenDrain,
    OpenSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Edge {
    #[default]
    None,
    Rising,
    Falling,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventClock {
    #[default]
    Monotonic,
    Realtime,
}

impl FromStr for Bias {
    type Err = Error;

    fn from_str(s: &str) -> Result<Bias, Error> {
        match s {
            "UP" => Ok(Bias::PullUp),
            "DOWN" => Ok(Bias::PullDown),
            "DISABLED" => Ok(Bias::Disabled),
            "AS_IS" => Ok(Bias::AsIs),
            _ => Err(ErrorKind::InvalidSetting {
                field: "bias",
                value: s.to_owned(),
            }
            .into()),
        }
    }
}

impl TryFrom<String> for Bias {
    type Error = Error;

    fn try_from(s: String) -> Result<Bias, Error> {
        s.parse()
    }
}

impl FromStr for Drive {
    type Err = Error;

    fn from_str(s: &str) -> Result<Drive, Error> {
        match s {
            "OPEN_DRAIN" => Ok(Drive::OpenDrain),
            "OPEN_SOURCE" => Ok(Drive::OpenSource),
            "PUSH_PULL" => Ok(Drive::PushPull),
            _ => Err(ErrorKind::InvalidSetting {
                field: "drive",
                value: s.to_owned(),
            }
            .into()),
        }
    }
}

impl TryFrom<String> for Drive {
    type Error = Error;

    fn try_from(s: String) -> Result<Drive, Error> {
        s.parse()
    }
}

/// Settings for a single requested line.
///
/// Every field may be set regardless of direction, but only the ones that
/// make sense for the direction reach the kernel: drive and output value for
/// outputs, edge detection, debounce and event clock for inputs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LineSettings {
    pub direction: Direction,
    pub active_low: bool,
    pub bias: Bias,
    pub drive: Drive,
    pub edge_detection: Edge,
    pub debounce: Duration,
    pub event_clock: EventClock,
    pub output_value: Value,
}

impl LineSettings {
    pub fn output(value: Value) -> LineSettings {
        LineSettings {
            direction: Direction::Output,
            output_value: value,
            ..Default::default()
        }
    }

    pub fn input() -> LineSettings {
        LineSettings::default()
    }

    pub fn is_output(&self) -> bool {
        self.direction == Direction::Output
    }

    /// Edge detection is only meaningful on inputs.
    pub fn has_edge_detection(&self) -> bool {
        !self.is_output() && self.edge_detection != Edge::None
    }

    /// Debounce period applied by the kernel, zero for outputs.
    pub fn effective_debounce(&self) -> Duration {
        if self.is_output() {
            Duration::ZERO
        } else {
            self.debounce
        }
    }

    pub fn flags(&self) -> LineFlags {
        let mut flags = LineFlags::empty();

        if self.active_low {
            flags |= LineFlags::ACTIVE_LOW;
        }

        flags |= match self.bias {
            Bias::AsIs => LineFlags::empty(),
            Bias::PullUp => LineFlags::BIAS_PULL_UP,
            Bias::PullDown => LineFlags::BIAS_PULL_DOWN,
            Bias::Disabled => LineFlags::BIAS_DISABLED,
        };

        match self.direction {
            Direction::Output => {
                flags |= LineFlags::OUTPUT;
                flags |= match self.drive {
                    Drive::PushPull => LineFlags::empty(),
                    Drive::OpenDrain => LineFlags::OPEN_DRAIN,
                    Drive::OpenSource => LineFlags::OPEN_SOURCE,
                };
            }
            Direction::Input => {
                flags |= LineFlags::INPUT;
                flags |= match self.edge_detection {
                    Edge::None => LineFlags::empty(),
                    Edge::Rising => LineFlags::EDGE_RISING,
                    Edge::Falling => LineFlags::EDGE_FALLING,
                    Edge::Both => LineFlags::EDGE_RISING | LineFlags::EDGE_FALLING,
                };
                if self.edge_detection != Edge::None && self.event_clock == EventClock::Realtime {
                    flags |= LineFlags::EVENT_CLOCK_REALTIME;
                }
            }
        }

        flags
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Rising,
    Falling,
}

/// Edge event reported on a requested input line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeEvent {
    pub timestamp_ns: u64,
    pub kind: EdgeKind,
    pub offset: u32,
    pub seqno: u32,
    pub line_seqno: u32,
}

impl fmt::Display for EdgeEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:?} edge on line {} at {}ns (#{})",
            self.kind, self.offset, self.timestamp_ns, self.seqno
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_flags_ignore_input_only_fields() {
        let settings = LineSettings {
            direction: Direction::Output,
            drive: Drive::OpenDrain,
            edge_detection: Edge::Both,
            debounce: Duration::from_millis(50),
            event_clock: EventClock::Realtime,
            ..Default::default()
        };
        assert_eq!(settings.flags(), LineFlags::OUTPUT | LineFlags::OPEN_DRAIN);
        assert!(!settings.has_edge_detection());
        assert_eq!(settings.effective_debounce(), Duration::ZERO);
    }

    #[test]
    fn input_flags_ignore_drive() {
        let settings = LineSettings {
            direction: Direction::Input,
            active_low: true,
            bias: Bias::PullUp,
            drive: Drive::OpenSource,
            edge_detection: Edge::Both,
            event_clock: EventClock::Realtime,
            ..Default::default()
        };
        assert_eq!(
            settings.flags(),
            LineFlags::INPUT
                | LineFlags::ACTIVE_LOW
                | LineFlags::BIAS_PULL_UP
                | LineFlags::EDGE_RISING
                | LineFlags::EDGE_FALLING
                | LineFlags::EVENT_CLOCK_REALTIME
        );
    }

    #[test]
    fn parses_config_strings() {
        assert_eq!("UP".parse::<Bias>().unwrap(), Bias::PullUp);
        assert_eq!("AS_IS".parse::<Bias>().unwrap(), Bias::AsIs);
        assert_eq!("OPEN_SOURCE".parse::<Drive>().unwrap(), Drive::OpenSource);
        let err = "SIDEWAYS".parse::<Bias>().unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::InvalidSetting { field: "bias", .. }));
    }

    #[test]
    fn value_conversions() {
        assert_eq!(Value::from(true), Value::Active);
        assert_eq!(!Value::Active, Value::Inactive);
        assert!(!Value::default().is_active());
    }
}

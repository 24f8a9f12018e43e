// Copyright (c) 2018 The rust-gpio-cdev Project Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! TOML description of a hub and the lines registered with it.
//!
//! ```toml
//! path = "/dev/gpiochip0"
//!
//! [[switch]]
//! name = "heater"
//! port = 17
//! drive = "OPEN_DRAIN"
//!
//! [[sensor]]
//! name = "door"
//! port = 22
//! bias = "UP"
//! debounce_ms = 20
//!
//! [[cover]]
//! name = "garage"
//! relay_port = 5
//! state_port = 6
//! ```
//!
//! Bias is one of `UP`, `DOWN`, `DISABLED` or `AS_IS`; drive is one of
//! `OPEN_DRAIN`, `OPEN_SOURCE` or `PUSH_PULL`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use crate::errors::Result;
use crate::registry::Consumer;
use crate::{Bias, Drive, GpioChip, Hub};

fn default_true() -> bool {
    true
}

fn default_sensor_bias() -> Bias {
    Bias::PullUp
}

fn default_debounce_ms() -> u64 {
    50
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SwitchConfig {
    pub name: String,
    pub port: u32,
    #[serde(default)]
    pub active_low: bool,
    #[serde(default)]
    pub bias: Bias,
    #[serde(default)]
    pub drive: Drive,
    /// Restore the consumer's last state when the line is requested.
    #[serde(default = "default_true")]
    pub init_output_value: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SensorConfig {
    pub name: String,
    pub port: u32,
    #[serde(default)]
    pub active_low: bool,
    #[serde(default = "default_sensor_bias")]
    pub bias: Bias,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoverConfig {
    pub name: String,
    pub relay_port: u32,
    #[serde(default)]
    pub relay_active_low: bool,
    #[serde(default)]
    pub relay_bias: Bias,
    #[serde(default)]
    pub relay_drive: Drive,
    pub state_port: u32,
    #[serde(default = "default_sensor_bias")]
    pub state_bias: Bias,
    #[serde(default)]
    pub state_active_low: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HubConfig {
    /// Chip to use; probed when absent.
    pub path: Option<PathBuf>,
    #[serde(default, rename = "switch")]
    pub switches: Vec<SwitchConfig>,
    #[serde(default, rename = "sensor")]
    pub sensors: Vec<SensorConfig>,
    #[serde(default, rename = "cover")]
    pub covers: Vec<CoverConfig>,
}

impl HubConfig {
    pub fn from_toml_str(s: &str) -> Result<HubConfig> {
        Ok(toml::from_str(s)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<HubConfig> {
        let contents = fs::read_to_string(path)?;
        HubConfig::from_toml_str(&contents)
    }

    /// Open the configured chip, or probe for one.
    pub fn open_hub(&self) -> Result<Hub> {
        Hub::new(self.path.as_deref())
    }

    /// Register every configured line with `hub`.
    ///
    /// `make` builds the consumer for each named entity. The consumers are
    /// returned so the caller can keep them alive; the hub only holds weak
    /// references. Stops at the first line that fails to register.
    pub fn apply<C, F>(
        &self,
        hub: &mut Hub<C>,
        mut make: F,
    ) -> Result<Vec<(String, Arc<dyn Consumer>)>>
    where
        C: GpioChip,
        F: FnMut(&str) -> Arc<dyn Consumer>,
    {
        let mut consumers = Vec::new();

        for switch in &self.switches {
            let consumer = make(&switch.name);
            hub.add_switch(
                &consumer,
                switch.port,
                switch.active_low,
                switch.bias,
                switch.drive,
                switch.init_output_value,
            )?;
            consumers.push((switch.name.clone(), consumer));
        }

        for sensor in &self.sensors {
            let consumer = make(&sensor.name);
            hub.add_sensor(
                &consumer,
                sensor.port,
                sensor.active_low,
                sensor.bias,
                sensor.debounce_ms,
            )?;
            consumers.push((sensor.name.clone(), consumer));
        }

        for cover in &self.covers {
            let consumer = make(&cover.name);
            hub.add_cover(
                &consumer,
                cover.relay_port,
                cover.relay_active_low,
                cover.relay_bias,
                cover.relay_drive,
                cover.state_port,
                cover.state_bias,
                cover.state_active_low,
            )?;
            consumers.push((cover.name.clone(), consumer));
        }

        Ok(consumers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use std::io::Write;

    #[test]
    fn defaults_fill_in_missing_fields() {
        let config = HubConfig::from_toml_str(
            r#"
            [[switch]]
            name = "heater"
            port = 17

            [[sensor]]
            name = "door"
            port = 22

            [[cover]]
            name = "garage"
            relay_port = 5
            state_port = 6
            "#,
        )
        .unwrap();

        assert_eq!(config.path, None);
        assert_eq!(
            config.switches,
            vec![SwitchConfig {
                name: "heater".to_owned(),
                port: 17,
                active_low: false,
                bias: Bias::AsIs,
                drive: Drive::PushPull,
                init_output_value: true,
            }]
        );
        assert_eq!(config.sensors[0].bias, Bias::PullUp);
        assert_eq!(config.sensors[0].debounce_ms, 50);
        assert_eq!(config.covers[0].state_bias, Bias::PullUp);
    }

    #[test]
    fn setting_names_match_the_documented_strings() {
        let config = HubConfig::from_toml_str(
            r#"
            path = "/dev/gpiochip4"

            [[switch]]
            name = "valve"
            port = 3
            bias = "DOWN"
            drive = "OPEN_SOURCE"
            "#,
        )
        .unwrap();
        assert_eq!(config.path.as_deref(), Some(Path::new("/dev/gpiochip4")));
        assert_eq!(config.switches[0].bias, Bias::PullDown);
        assert_eq!(config.switches[0].drive, Drive::OpenSource);
    }

    #[test]
    fn unknown_bias_is_a_config_error() {
        let err = HubConfig::from_toml_str(
            r#"
            [[sensor]]
            name = "door"
            port = 22
            bias = "SIDEWAYS"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Config(_)));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[[sensor]]\nname = \"door\"\nport = 22").unwrap();
        let config = HubConfig::load(file.path()).unwrap();
        assert_eq!(config.sensors.len(), 1);
    }
}

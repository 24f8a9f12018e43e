// Copyright (c) 2018 The rust-gpio-cdev Project Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Finding the chip that drives the header pins.

use std::path::{Path, PathBuf};

use tracing::{debug, error};

use crate::errors::{ErrorKind, Result};
use crate::{Chip, GpioChip};

/// Chips probed when no path is configured, in order of preference.
///
/// The Raspberry Pi 3 and 4 expose the header on chip 0, the Pi 5 on chip 4.
pub const DEFAULT_CANDIDATES: [&str; 6] = [
    "/dev/gpiochip0",
    "/dev/gpiochip4",
    "/dev/gpiochip1",
    "/dev/gpiochip2",
    "/dev/gpiochip3",
    "/dev/gpiochip5",
];

/// Substring the chip label must contain.
pub const PINCTRL_LABEL: &str = "pinctrl";

/// Open `path` with `probe` and keep the chip only if it has pin control.
pub fn verify<C, F>(path: &Path, probe: &mut F) -> Option<C>
where
    C: GpioChip,
    F: FnMut(&Path) -> Result<C>,
{
    let chip = match probe(path) {
        Ok(chip) => chip,
        Err(e) => {
            debug!("verify_gpiochip: {} not a gpiochip device: {}", path.display(), e);
            return None;
        }
    };

    if !chip.label().contains(PINCTRL_LABEL) {
        debug!("verify_gpiochip: {} no pinctrl {}", path.display(), chip.label());
        return None;
    }

    debug!("verify_gpiochip: {} has pinctrl", path.display());
    Some(chip)
}

/// Validate `explicit`, or probe [`DEFAULT_CANDIDATES`] when it is `None`.
///
/// Returns the first chip that validates along with its path.
pub fn locate<C, F>(explicit: Option<&Path>, mut probe: F) -> Result<(PathBuf, C)>
where
    C: GpioChip,
    F: FnMut(&Path) -> Result<C>,
{
    let candidates: Vec<PathBuf> = match explicit {
        Some(path) => {
            debug!("trying to use configured device: {}", path.display());
            vec![path.to_path_buf()]
        }
        None => {
            debug!("auto discovering gpio device");
            DEFAULT_CANDIDATES.iter().map(PathBuf::from).collect()
        }
    };

    for path in &candidates {
        if let Some(chip) = verify(path, &mut probe) {
            debug!("using gpio_device: {}", path.display());
            return Ok((path.clone(), chip));
        }
    }

    error!("No gpio device detected, bailing out");
    Err(ErrorKind::DeviceNotFound { candidates }.into())
}

/// [`locate`] against the real character devices.
pub fn locate_chip(explicit: Option<&Path>) -> Result<(PathBuf, Chip)> {
    locate(explicit, |path| Chip::new(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::invalid_err;
    use crate::mock::MockChip;

    fn probe_with<'a>(
        chips: &'a [(&'a str, &'a str)],
    ) -> impl FnMut(&Path) -> Result<MockChip> + 'a {
        move |path: &Path| {
            chips
                .iter()
                .find(|(p, _)| Path::new(p) == path)
                .map(|(_, label)| MockChip::new(label, 32))
                .ok_or_else(|| invalid_err(format!("{} is not a gpiochip device", path.display())))
        }
    }

    #[test]
    fn prefers_chip_zero_then_four() {
        let chips = [
            ("/dev/gpiochip4", "pinctrl-rp1"),
            ("/dev/gpiochip0", "pinctrl-bcm2711"),
        ];
        let (path, chip) = locate(None, probe_with(&chips)).unwrap();
        assert_eq!(path, Path::new("/dev/gpiochip0"));
        assert_eq!(chip.label(), "pinctrl-bcm2711");
    }

    #[test]
    fn skips_chips_without_pinctrl() {
        let chips = [
            ("/dev/gpiochip0", "raspberrypi-exp-gpio"),
            ("/dev/gpiochip4", "pinctrl-rp1"),
        ];
        let (path, _) = locate(None, probe_with(&chips)).unwrap();
        assert_eq!(path, Path::new("/dev/gpiochip4"));
    }

    #[test]
    fn explicit_path_is_the_only_candidate() {
        let chips = [
            ("/dev/gpiochip0", "pinctrl-bcm2835"),
            ("/dev/gpiochip7", "gpio-mockup"),
        ];
        let err = locate(Some(Path::new("/dev/gpiochip7")), probe_with(&chips)).unwrap_err();
        match err.kind() {
            ErrorKind::DeviceNotFound { candidates } => {
                assert_eq!(candidates, &vec![PathBuf::from("/dev/gpiochip7")])
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn nothing_found_lists_every_candidate() {
        let err = locate(None, probe_with(&[])).unwrap_err();
        match err.kind() {
            ErrorKind::DeviceNotFound { candidates } => assert_eq!(candidates.len(), 6),
            other => panic!("unexpected error {:?}", other),
        }
    }
}

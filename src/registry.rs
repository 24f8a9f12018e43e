// Copyright (c) 2018 The rust-gpio-cdev Project Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use tracing::{debug, error};

use crate::errors::{ErrorKind, Result};
use crate::{GpioChip, LineConfig, LineSettings, CONSUMER};

/// The entity behind a registered line: a switch, a sensor or a cover.
///
/// The hub only keeps a weak reference, so consumers decide their own
/// lifetime. All methods take `&self`; implementors keep their state behind
/// interior mutability, and must be shareable with the thread that
/// delivers events.
pub trait Consumer: Send + Sync {
    /// Called once for every edge event on a line this consumer registered.
    fn handle_event(&self);

    /// Current logical state as the consumer sees it.
    fn is_on(&self) -> bool;

    /// Update the logical state, used to seed sensors from the hardware.
    fn set_on(&self, on: bool);
}

#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub settings: LineSettings,
    pub consumer: Weak<dyn Consumer>,
}

/// Offsets claimed by this hub, with their settings and owners.
#[derive(Debug, Default)]
pub struct LineRegistry {
    entries: BTreeMap<u32, RegistryEntry>,
}

impl LineRegistry {
    pub fn new() -> LineRegistry {
        LineRegistry::default()
    }

    /// Fail if `offset` is held by anyone but us.
    pub fn ensure_free<C: GpioChip>(&self, chip: &C, offset: u32) -> Result<()> {
        let info = chip.line_info(offset)?;
        debug!("port info before request: {:?}", info);

        match info.consumer() {
            Some(holder) if info.is_used() && holder != CONSUMER => {
                error!("Port {} already in use by {}", offset, holder);
                Err(ErrorKind::PortInUse {
                    offset,
                    consumer: holder.to_owned(),
                }
                .into())
            }
            _ => Ok(()),
        }
    }

    /// Claim `offset` for `consumer`, replacing any entry we already had.
    ///
    /// Only records the claim; the caller rebuilds the session. Returns the
    /// replaced entry so a failed rebuild can put it back.
    pub fn reserve<C: GpioChip>(
        &mut self,
        chip: &C,
        offset: u32,
        settings: LineSettings,
        consumer: &Arc<dyn Consumer>,
    ) -> Result<Option<RegistryEntry>> {
        self.ensure_free(chip, offset)?;
        Ok(self.entries.insert(
            offset,
            RegistryEntry {
                settings,
                consumer: Arc::downgrade(consumer),
            },
        ))
    }

    /// Undo a [`reserve`](Self::reserve).
    pub fn restore(&mut self, offset: u32, previous: Option<RegistryEntry>) {
        match previous {
            Some(entry) => {
                self.entries.insert(offset, entry);
            }
            None => {
                self.entries.remove(&offset);
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, offset: u32) -> bool {
        self.entries.contains_key(&offset)
    }

    pub fn get(&self, offset: u32) -> Option<&RegistryEntry> {
        self.entries.get(&offset)
    }

    /// Owner of `offset`, if registered and still alive.
    pub fn consumer(&self, offset: u32) -> Option<Arc<dyn Consumer>> {
        self.entries.get(&offset).and_then(|e| e.consumer.upgrade())
    }

    /// Settings for every registered line, as handed to the kernel.
    pub fn settings(&self) -> LineConfig {
        self.entries
            .iter()
            .map(|(offset, entry)| (*offset, entry.settings.clone()))
            .collect()
    }

    pub fn has_edge_detection(&self) -> bool {
        self.entries
            .values()
            .any(|e| e.settings.has_edge_detection())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockChip;
    use crate::{Edge, Value};
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct Lamp {
        on: AtomicBool,
    }

    impl Consumer for Lamp {
        fn handle_event(&self) {}

        fn is_on(&self) -> bool {
            self.on.load(Ordering::SeqCst)
        }

        fn set_on(&self, on: bool) {
            self.on.store(on, Ordering::SeqCst)
        }
    }

    fn lamp() -> Arc<dyn Consumer> {
        Arc::new(Lamp::default())
    }

    #[test]
    fn foreign_holder_is_rejected_without_mutation() {
        let chip = MockChip::new("pinctrl-bcm2711", 32);
        chip.hold(4, "w1-gpio");
        let mut registry = LineRegistry::new();

        let err = registry
            .reserve(&chip, 4, LineSettings::output(Value::Active), &lamp())
            .unwrap_err();
        match err.kind() {
            ErrorKind::PortInUse { offset, consumer } => {
                assert_eq!(*offset, 4);
                assert_eq!(consumer, "w1-gpio");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn our_own_lines_can_be_reclaimed() {
        let chip = MockChip::new("pinctrl-bcm2711", 32);
        let mut registry = LineRegistry::new();
        let owner = lamp();
        registry
            .reserve(&chip, 7, LineSettings::output(Value::Inactive), &owner)
            .unwrap();
        let _request = chip.request_lines(CONSUMER, &registry.settings()).unwrap();

        let previous = registry
            .reserve(&chip, 7, LineSettings::output(Value::Active), &owner)
            .unwrap();
        assert_eq!(
            previous.map(|e| e.settings.output_value),
            Some(Value::Inactive)
        );
        assert_eq!(registry.get(7).unwrap().settings.output_value, Value::Active);
    }

    #[test]
    fn restore_undoes_a_reservation() {
        let chip = MockChip::new("pinctrl-bcm2711", 32);
        let mut registry = LineRegistry::new();
        let previous = registry
            .reserve(&chip, 3, LineSettings::input(), &lamp())
            .unwrap();
        registry.restore(3, previous);
        assert!(!registry.contains(3));
    }

    #[test]
    fn dropped_consumers_are_not_upgraded() {
        let chip = MockChip::new("pinctrl-bcm2711", 32);
        let mut registry = LineRegistry::new();
        registry
            .reserve(&chip, 9, LineSettings::input(), &lamp())
            .unwrap();
        assert!(registry.contains(9));
        assert!(registry.consumer(9).is_none());
    }

    #[test]
    fn edge_detection_only_counts_inputs() {
        let chip = MockChip::new("pinctrl-bcm2711", 32);
        let mut registry = LineRegistry::new();
        let owner = lamp();
        let mut output = LineSettings::output(Value::Inactive);
        output.edge_detection = Edge::Both;
        registry.reserve(&chip, 1, output, &owner).unwrap();
        assert!(!registry.has_edge_detection());

        let mut input = LineSettings::input();
        input.edge_detection = Edge::Both;
        registry.reserve(&chip, 2, input, &owner).unwrap();
        assert!(registry.has_edge_detection());
        assert_eq!(registry.settings().keys().copied().collect::<Vec<_>>(), vec![1, 2]);
    }
}

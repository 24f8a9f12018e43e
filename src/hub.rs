// Copyright (c) 2018 The rust-gpio-cdev Project Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use crate::dispatch::Dispatcher;
use crate::errors::{ErrorKind, Result};
use crate::locator;
use crate::registry::{Consumer, LineRegistry};
use crate::session::SessionManager;
use crate::{
    Bias, Chip, Direction, Drive, Edge, EventClock, GpioChip, LineConfig, LineRequest,
    LineSettings, Value, CONSUMER,
};

/// Debounce applied to the state line of a cover.
pub const COVER_DEBOUNCE_MS: u64 = 50;

/// One GPIO chip and every line requested from it.
///
/// Lines registered before [`startup`](Hub::startup) are only recorded; the
/// first request is made at startup. Afterwards every registration rebuilds
/// the request straight away.
pub struct Hub<C: GpioChip = Chip> {
    path: PathBuf,
    chip: Option<C>,
    online: bool,
    started: bool,
    registry: LineRegistry,
    sessions: SessionManager<C::Request>,
    dispatcher: Dispatcher,
}

impl Hub<Chip> {
    /// Open the chip at `path`, or the first pin control chip found.
    pub fn new(path: Option<&Path>) -> Result<Hub<Chip>> {
        let (path, chip) = locator::locate_chip(path)?;
        Ok(Hub::with_chip(path, chip))
    }
}

impl<C: GpioChip> Hub<C> {
    /// Locate a chip through `probe`, see [`locator::locate`].
    pub fn locate<F>(path: Option<&Path>, probe: F) -> Result<Hub<C>>
    where
        F: FnMut(&Path) -> Result<C>,
    {
        let (path, chip) = locator::locate(path, probe)?;
        Ok(Hub::with_chip(path, chip))
    }

    /// Use an already opened and validated chip.
    pub fn with_chip<P: Into<PathBuf>>(path: P, chip: C) -> Hub<C> {
        Hub {
            path: path.into(),
            chip: Some(chip),
            online: true,
            started: false,
            registry: LineRegistry::new(),
            sessions: SessionManager::new(),
            dispatcher: Dispatcher::new(),
        }
    }

    pub fn hub_id(&self) -> &Path {
        &self.path
    }

    pub fn label(&self) -> Option<&str> {
        self.chip.as_ref().map(|chip| chip.label())
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn registry(&self) -> &LineRegistry {
        &self.registry
    }

    pub fn sessions(&self) -> &SessionManager<C::Request> {
        &self.sessions
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    fn online_chip(online: bool, chip: &Option<C>) -> Result<&C> {
        match chip {
            Some(chip) if online => Ok(chip),
            _ => {
                error!("No gpio device detected, bailing out");
                Err(ErrorKind::NotOnline.into())
            }
        }
    }

    pub fn verify_online(&self) -> Result<()> {
        Self::online_chip(self.online, &self.chip).map(|_| ())
    }

    /// The host has started: request every registered line.
    ///
    /// A failed request is logged and the hub carries on without a session.
    pub fn startup(&mut self) {
        debug!("startup hub {}", self.path.display());
        self.started = true;

        if !self.online {
            debug!("hub is not online");
            return;
        }
        if self.registry.is_empty() {
            debug!("gpio config is empty");
            return;
        }
        if let Err(e) = self.update_lines() {
            error!("Failed to update lines: {}", e);
        }
    }

    /// The host is stopping: release the lines, forget them, close the chip.
    ///
    /// Safe to call in any state and any number of times.
    pub fn cleanup(&mut self) {
        debug!("cleanup hub {}", self.path.display());
        self.dispatcher.disarm();
        self.sessions.release();
        self.registry.clear();
        self.chip = None;
        self.online = false;
        self.started = false;
    }

    /// Release the current request and request every registered line again.
    pub fn update_lines(&mut self) -> Result<()> {
        let chip = Self::online_chip(self.online, &self.chip)?;
        let result = self.sessions.rebuild(chip, &self.registry);
        self.dispatcher.arm(self.sessions.current());
        result
    }

    fn register(
        &mut self,
        offset: u32,
        settings: LineSettings,
        consumer: &Arc<dyn Consumer>,
    ) -> Result<()> {
        let chip = Self::online_chip(self.online, &self.chip)?;
        let previous = self.registry.reserve(chip, offset, settings, consumer)?;

        if !self.started {
            return Ok(());
        }
        if let Err(e) = self.update_lines() {
            self.registry.restore(offset, previous);
            return Err(e);
        }
        Ok(())
    }

    /// Register an output line.
    ///
    /// The line starts active only when `init_output_value` is set and the
    /// consumer is currently on.
    pub fn add_switch(
        &mut self,
        consumer: &Arc<dyn Consumer>,
        offset: u32,
        active_low: bool,
        bias: Bias,
        drive: Drive,
        init_output_value: bool,
    ) -> Result<()> {
        debug!("in add_switch {}", offset);
        let settings = LineSettings {
            direction: Direction::Output,
            active_low,
            bias,
            drive,
            output_value: Value::from(init_output_value && consumer.is_on()),
            ..Default::default()
        };
        self.register(offset, settings, consumer)
    }

    /// Register an input line reporting both edges.
    ///
    /// The consumer is seeded with the line's current state before the line
    /// joins the shared request.
    pub fn add_sensor(
        &mut self,
        consumer: &Arc<dyn Consumer>,
        offset: u32,
        active_low: bool,
        bias: Bias,
        debounce_ms: u64,
    ) -> Result<()> {
        debug!("in add_sensor {}", offset);
        let chip = Self::online_chip(self.online, &self.chip)?;
        self.registry.ensure_free(chip, offset)?;

        let physical = self.read_physical(chip, offset)?;
        consumer.set_on(physical ^ active_low);
        debug!("current value for port {}: {}", offset, consumer.is_on());

        let settings = LineSettings {
            direction: Direction::Input,
            active_low,
            bias,
            edge_detection: Edge::Both,
            debounce: Duration::from_millis(debounce_ms),
            event_clock: EventClock::Realtime,
            output_value: Value::from(consumer.is_on()),
            ..Default::default()
        };
        self.register(offset, settings, consumer)
    }

    /// Register a cover: a relay output and a debounced state input.
    #[allow(clippy::too_many_arguments)]
    pub fn add_cover(
        &mut self,
        consumer: &Arc<dyn Consumer>,
        relay_offset: u32,
        relay_active_low: bool,
        relay_bias: Bias,
        relay_drive: Drive,
        state_offset: u32,
        state_bias: Bias,
        state_active_low: bool,
    ) -> Result<()> {
        debug!("in add_cover {} {}", relay_offset, state_offset);
        self.add_switch(
            consumer,
            relay_offset,
            relay_active_low,
            relay_bias,
            relay_drive,
            false,
        )?;
        self.add_sensor(
            consumer,
            state_offset,
            state_active_low,
            state_bias,
            COVER_DEBOUNCE_MS,
        )
    }

    /// Electrical level of `offset`, read outside the shared request.
    fn read_physical(&self, chip: &C, offset: u32) -> Result<bool> {
        // A line we already hold cannot be requested twice.
        if let Some(session) = self.sessions.current().filter(|s| s.contains(offset)) {
            let active_low = self
                .registry
                .get(offset)
                .map(|e| e.settings.active_low)
                .unwrap_or(false);
            let logical = session.request().get_value(offset)?;
            return Ok(logical.is_active() ^ active_low);
        }

        let mut config = LineConfig::new();
        config.insert(offset, LineSettings::input());
        let request = chip.request_lines(CONSUMER, &config)?;
        let value = request.get_value(offset)?;
        Ok(value.is_active())
    }

    pub fn set_value(&self, offset: u32, value: Value) -> Result<()> {
        self.verify_online()?;
        self.sessions.set_value(offset, value)
    }

    pub fn get_value(&self, offset: u32) -> Result<Value> {
        self.verify_online()?;
        self.sessions.get_value(offset)
    }

    pub fn turn_on(&self, offset: u32) -> Result<()> {
        debug!("in turn_on {}", offset);
        self.set_value(offset, Value::Active)
    }

    pub fn turn_off(&self, offset: u32) -> Result<()> {
        debug!("in turn_off {}", offset);
        self.set_value(offset, Value::Inactive)
    }

    pub fn get_line_value(&self, offset: u32) -> Result<bool> {
        self.get_value(offset).map(Value::is_active)
    }

    /// Deliver every pending edge event to its line's consumer.
    ///
    /// Call when the session descriptor becomes readable.
    pub fn handle_events(&self) -> Result<usize> {
        match self.sessions.current() {
            Some(session) if self.dispatcher.is_armed() => {
                self.dispatcher.drain(session, &self.registry)
            }
            _ => Err(ErrorKind::NotArmed.into()),
        }
    }

    /// Wait for edge events, then deliver them.
    ///
    /// `None` waits indefinitely. Returns the number of events delivered,
    /// zero when the wait timed out.
    pub fn wait_events(&self, timeout: Option<Duration>) -> Result<usize> {
        if !self.dispatcher.wait(timeout)? {
            return Ok(0);
        }
        self.handle_events()
    }
}

impl<C: GpioChip> fmt::Debug for Hub<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Hub")
            .field("path", &self.path)
            .field("label", &self.label())
            .field("online", &self.online)
            .field("started", &self.started)
            .field("lines", &self.registry.len())
            .field("generation", &self.sessions.generation())
            .field("dispatch", &self.dispatcher.state())
            .finish()
    }
}

impl<C: GpioChip> Drop for Hub<C> {
    fn drop(&mut self) {
        self.cleanup();
    }
}

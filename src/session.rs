// Copyright (c) 2018 The rust-gpio-cdev Project Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The single line request shared by every registered line.
//!
//! The kernel grants and configures a group of lines in one request, and
//! lines cannot be added to a live request. Any change to the registry
//! therefore releases the current request and asks for a new one covering
//! everything. While that happens no line is held.

use std::os::unix::io::RawFd;

use tracing::{debug, error};

use crate::errors::{offset_err, rebuild_err, ErrorKind, Result};
use crate::registry::LineRegistry;
use crate::{GpioChip, LineRequest, Value, CONSUMER};

/// A live request together with the generation it was built in.
#[derive(Debug)]
pub struct Session<R> {
    request: R,
    generation: u64,
}

impl<R: LineRequest> Session<R> {
    pub fn offsets(&self) -> &[u32] {
        self.request.offsets()
    }

    pub fn contains(&self, offset: u32) -> bool {
        self.offsets().contains(&offset)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn event_fd(&self) -> Option<RawFd> {
        self.request.event_fd()
    }

    pub fn request(&self) -> &R {
        &self.request
    }
}

#[derive(Debug)]
pub struct SessionManager<R> {
    current: Option<Session<R>>,
    generation: u64,
}

impl<R> Default for SessionManager<R> {
    fn default() -> Self {
        SessionManager {
            current: None,
            generation: 0,
        }
    }
}

impl<R: LineRequest> SessionManager<R> {
    pub fn new() -> SessionManager<R> {
        SessionManager::default()
    }

    /// Release the current request and request every registered line anew.
    ///
    /// On failure no request is held. An empty registry leaves no session.
    pub fn rebuild<C>(&mut self, chip: &C, registry: &LineRegistry) -> Result<()>
    where
        C: GpioChip<Request = R>,
    {
        self.release();

        if registry.is_empty() {
            debug!("no lines registered, nothing to request");
            return Ok(());
        }

        let config = registry.settings();
        debug!("updating lines: {:?}", config);
        let request = chip.request_lines(CONSUMER, &config).map_err(|e| {
            error!("Failed to update lines: {}", e);
            rebuild_err(e)
        })?;

        self.generation += 1;
        debug!(
            "update_lines new lines: {:?} (generation {})",
            request.offsets(),
            self.generation
        );
        self.current = Some(Session {
            request,
            generation: self.generation,
        });
        Ok(())
    }

    /// Drop the current request, if any. Returns whether one was held.
    pub fn release(&mut self) -> bool {
        match self.current.take() {
            Some(session) => {
                debug!("releasing lines {:?}", session.offsets());
                true
            }
            None => false,
        }
    }

    pub fn current(&self) -> Option<&Session<R>> {
        self.current.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.current.is_some()
    }

    /// Generation of the most recent successful rebuild.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn event_fd(&self) -> Option<RawFd> {
        self.current.as_ref().and_then(Session::event_fd)
    }

    fn session_for(&self, offset: u32) -> Result<&Session<R>> {
        let session = self.current.as_ref().ok_or(ErrorKind::NoSession)?;
        if !session.contains(offset) {
            return Err(offset_err(offset));
        }
        Ok(session)
    }

    pub fn get_value(&self, offset: u32) -> Result<Value> {
        self.session_for(offset)?.request.get_value(offset)
    }

    pub fn set_value(&self, offset: u32, value: Value) -> Result<()> {
        self.session_for(offset)?.request.set_value(offset, value)
    }
}

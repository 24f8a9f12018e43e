// Copyright (c) 2018 The rust-gpio-cdev Project Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! In-memory chip for exercising a [`Hub`](crate::Hub) without hardware.
//!
//! A `MockChip` is a cheap handle onto shared state, so a test can keep one
//! clone to drive the simulated lines while the hub owns another. Requests
//! with edge detection get a real socket as their event descriptor, which
//! becomes readable whenever an event is injected.

use std::collections::{BTreeMap, VecDeque};
use std::io::{ErrorKind as IoErrorKind, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use nix::errno::Errno;

use crate::errors::{invalid_err, ioctl_err, offset_err, IoctlKind, Result};
use crate::{
    EdgeEvent, EdgeKind, GpioChip, LineConfig, LineFlags, LineInfo, LineRequest, LineSettings,
    Value,
};

#[derive(Debug, Default)]
struct MockLine {
    physical: bool,
    foreign: Option<String>,
    held_by: Option<u64>,
    settings: Option<LineSettings>,
    output: Value,
}

#[derive(Debug)]
struct ActiveRequest {
    consumer: String,
    pending: VecDeque<EdgeEvent>,
    signal: Option<UnixStream>,
}

#[derive(Debug)]
struct MockState {
    lines: Vec<MockLine>,
    active: BTreeMap<u64, ActiveRequest>,
    history: Vec<LineConfig>,
    failures: usize,
    next_id: u64,
    seqno: u32,
    timestamp_ns: u64,
}

impl MockState {
    fn line(&self, offset: u32) -> Result<&MockLine> {
        self.lines
            .get(offset as usize)
            .ok_or_else(|| invalid_err(format!("offset {} is out of range", offset)))
    }

    fn line_mut(&mut self, offset: u32) -> Result<&mut MockLine> {
        self.lines
            .get_mut(offset as usize)
            .ok_or_else(|| invalid_err(format!("offset {} is out of range", offset)))
    }
}

/// Simulated GPIO chip.
#[derive(Debug, Clone)]
pub struct MockChip {
    label: String,
    state: Arc<Mutex<MockState>>,
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockChip {
    pub fn new(label: &str, num_lines: u32) -> MockChip {
        MockChip {
            label: label.to_owned(),
            state: Arc::new(Mutex::new(MockState {
                lines: (0..num_lines).map(|_| MockLine::default()).collect(),
                active: BTreeMap::new(),
                history: Vec::new(),
                failures: 0,
                next_id: 0,
                seqno: 0,
                timestamp_ns: 0,
            })),
        }
    }

    /// Mark `offset` as held by another program.
    pub fn hold(&self, offset: u32, consumer: &str) {
        if let Ok(line) = lock(&self.state).line_mut(offset) {
            line.foreign = Some(consumer.to_owned());
        }
    }

    /// Set the electrical level seen on `offset`.
    pub fn set_physical(&self, offset: u32, high: bool) {
        if let Ok(line) = lock(&self.state).line_mut(offset) {
            line.physical = high;
        }
    }

    /// Make the next `count` line requests fail with `EBUSY`.
    pub fn fail_requests(&self, count: usize) {
        lock(&self.state).failures = count;
    }

    /// Every configuration requested so far, transient requests included.
    pub fn requests(&self) -> Vec<LineConfig> {
        lock(&self.state).history.clone()
    }

    pub fn active_requests(&self) -> usize {
        lock(&self.state).active.len()
    }

    /// Whether `offset` is part of a live request.
    pub fn is_held(&self, offset: u32) -> bool {
        lock(&self.state)
            .line(offset)
            .map(|line| line.held_by.is_some())
            .unwrap_or(false)
    }

    /// Logical value currently driven on an output line.
    pub fn output(&self, offset: u32) -> Option<Value> {
        let state = lock(&self.state);
        let line = state.line(offset).ok()?;
        match (&line.held_by, &line.settings) {
            (Some(_), Some(settings)) if settings.is_output() => Some(line.output),
            _ => None,
        }
    }

    /// Queue an edge event on the request holding `offset`.
    ///
    /// The physical level follows the edge. Returns `false` when no live
    /// request watches the line for edges.
    pub fn inject_event(&self, offset: u32, kind: EdgeKind) -> bool {
        let mut state = lock(&self.state);
        let id = match state.line(offset) {
            Ok(MockLine {
                held_by: Some(id),
                settings: Some(settings),
                ..
            }) if settings.has_edge_detection() => *id,
            _ => return false,
        };

        state.seqno += 1;
        state.timestamp_ns += 1_000;
        let event = EdgeEvent {
            timestamp_ns: state.timestamp_ns,
            kind,
            offset,
            seqno: state.seqno,
            line_seqno: state.seqno,
        };
        if let Ok(line) = state.line_mut(offset) {
            line.physical = kind == EdgeKind::Rising;
        }

        match state.active.get_mut(&id) {
            Some(request) => {
                request.pending.push_back(event);
                if let Some(signal) = request.signal.as_mut() {
                    let _ = signal.write_all(&[1]);
                }
                true
            }
            None => false,
        }
    }
}

impl GpioChip for MockChip {
    type Request = MockRequest;

    fn label(&self) -> &str {
        &self.label
    }

    fn line_info(&self, offset: u32) -> Result<LineInfo> {
        let state = lock(&self.state);
        let line = state.line(offset)?;

        let mut flags = line
            .settings
            .as_ref()
            .filter(|_| line.held_by.is_some())
            .map(LineSettings::flags)
            .unwrap_or(LineFlags::INPUT);
        let consumer = match (&line.foreign, line.held_by) {
            (Some(foreign), _) => Some(foreign.clone()),
            (None, Some(id)) => state.active.get(&id).map(|r| r.consumer.clone()),
            (None, None) => None,
        };
        if consumer.is_some() {
            flags |= LineFlags::USED;
        }

        Ok(LineInfo {
            offset,
            flags,
            name: None,
            consumer,
        })
    }

    fn request_lines(&self, consumer: &str, config: &LineConfig) -> Result<MockRequest> {
        let mut state = lock(&self.state);
        state.history.push(config.clone());

        if state.failures > 0 {
            state.failures -= 1;
            return Err(ioctl_err(IoctlKind::GetLine, Errno::EBUSY));
        }
        if config.is_empty() {
            return Err(invalid_err("no lines to request"));
        }
        for offset in config.keys() {
            let line = state.line(*offset)?;
            if line.foreign.is_some() || line.held_by.is_some() {
                return Err(ioctl_err(IoctlKind::GetLine, Errno::EBUSY));
            }
        }

        let edge_detection = config.values().any(LineSettings::has_edge_detection);
        let (signal, reader) = if edge_detection {
            let (signal, reader) = UnixStream::pair()?;
            reader.set_nonblocking(true)?;
            (Some(signal), Some(reader))
        } else {
            (None, None)
        };

        let id = state.next_id;
        state.next_id += 1;
        for (offset, settings) in config {
            let line = state.line_mut(*offset)?;
            line.held_by = Some(id);
            line.settings = Some(settings.clone());
            if settings.is_output() {
                line.output = settings.output_value;
            }
        }
        state.active.insert(
            id,
            ActiveRequest {
                consumer: consumer.to_owned(),
                pending: VecDeque::new(),
                signal,
            },
        );

        Ok(MockRequest {
            state: self.state.clone(),
            id,
            offsets: config.keys().copied().collect(),
            reader,
        })
    }
}

/// Lines granted by a [`MockChip`].
#[derive(Debug)]
pub struct MockRequest {
    state: Arc<Mutex<MockState>>,
    id: u64,
    offsets: Vec<u32>,
    reader: Option<UnixStream>,
}

impl MockRequest {
    fn settings(&self, state: &MockState, offset: u32) -> Result<LineSettings> {
        if !self.offsets.contains(&offset) {
            return Err(offset_err(offset));
        }
        state
            .line(offset)?
            .settings
            .clone()
            .ok_or_else(|| offset_err(offset))
    }
}

impl LineRequest for MockRequest {
    fn offsets(&self) -> &[u32] {
        &self.offsets
    }

    fn get_value(&self, offset: u32) -> Result<Value> {
        let state = lock(&self.state);
        let settings = self.settings(&state, offset)?;
        let line = state.line(offset)?;
        if settings.is_output() {
            Ok(line.output)
        } else {
            Ok(Value::from(line.physical ^ settings.active_low))
        }
    }

    fn set_value(&self, offset: u32, value: Value) -> Result<()> {
        let mut state = lock(&self.state);
        let settings = self.settings(&state, offset)?;
        if !settings.is_output() {
            return Err(ioctl_err(IoctlKind::SetValues, Errno::EPERM));
        }
        let line = state.line_mut(offset)?;
        line.output = value;
        line.physical = value.is_active() ^ settings.active_low;
        Ok(())
    }

    fn read_edge_events(&self) -> Result<Vec<EdgeEvent>> {
        if let Some(mut reader) = self.reader.as_ref() {
            let mut buf = [0u8; 64];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(_) => continue,
                    Err(e) if e.kind() == IoErrorKind::WouldBlock => break,
                    Err(e) => return Err(e.into()),
                }
            }
        }

        let mut state = lock(&self.state);
        Ok(state
            .active
            .get_mut(&self.id)
            .map(|request| request.pending.drain(..).collect())
            .unwrap_or_default())
    }

    fn event_fd(&self) -> Option<RawFd> {
        self.reader.as_ref().map(AsRawFd::as_raw_fd)
    }
}

impl Drop for MockRequest {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        state.active.remove(&self.id);
        for line in state.lines.iter_mut() {
            if line.held_by == Some(self.id) {
                line.held_by = None;
                line.settings = None;
            }
        }
    }
}

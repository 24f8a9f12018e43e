// Copyright (c) 2018 The rust-gpio-cdev Project Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Routing edge events from the session descriptor to line owners.

use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use tracing::{debug, warn};

use crate::errors::{event_err, ErrorKind, Result};
use crate::registry::LineRegistry;
use crate::session::Session;
use crate::LineRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    /// No requested line has edge detection.
    Disarmed,
    /// Watching the descriptor of the session built in `generation`.
    Armed { fd: RawFd, generation: u64 },
}

#[derive(Debug)]
pub struct Dispatcher {
    state: DispatchState,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Dispatcher {
            state: DispatchState::Disarmed,
        }
    }
}

impl Dispatcher {
    pub fn new() -> Dispatcher {
        Dispatcher::default()
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    pub fn is_armed(&self) -> bool {
        matches!(self.state, DispatchState::Armed { .. })
    }

    /// Watch the event descriptor of `session`.
    ///
    /// Every session has its own descriptor, so this runs after every
    /// rebuild. Disarms when there is no session or it has no edge lines.
    pub fn arm<R: LineRequest>(&mut self, session: Option<&Session<R>>) -> bool {
        let target = session.and_then(|s| s.event_fd().map(|fd| (fd, s.generation())));
        match target {
            Some((fd, generation)) => {
                let armed = DispatchState::Armed { fd, generation };
                if self.state != armed {
                    debug!("Start listener on fd {} (generation {})", fd, generation);
                    self.state = armed;
                }
                true
            }
            None => {
                self.disarm();
                false
            }
        }
    }

    pub fn disarm(&mut self) {
        if self.is_armed() {
            debug!("Stop listener");
        }
        self.state = DispatchState::Disarmed;
    }

    /// Read every pending event and hand each to the owner of its line.
    ///
    /// Events are delivered in kernel order. Events for lines without a live
    /// owner are logged and dropped. Returns the number delivered.
    pub fn drain<R: LineRequest>(
        &self,
        session: &Session<R>,
        registry: &LineRegistry,
    ) -> Result<usize> {
        let events = session.request().read_edge_events()?;
        let mut delivered = 0;

        for event in events {
            debug!("Event: {}", event);
            match registry.consumer(event.offset) {
                Some(consumer) => {
                    consumer.handle_event();
                    delivered += 1;
                }
                None => warn!("no consumer for line {}, dropping {}", event.offset, event),
            }
        }

        Ok(delivered)
    }

    /// Block until the armed descriptor is readable or `timeout` expires.
    ///
    /// `None` waits indefinitely. Returns whether the descriptor is ready; an
    /// interrupted wait reports not ready.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        let fd = match self.state {
            DispatchState::Armed { fd, .. } => fd,
            DispatchState::Disarmed => return Err(ErrorKind::NotArmed.into()),
        };

        // Round up so a sub-millisecond timeout still waits.
        let timeout_ms = timeout
            .map(|t| {
                let ms = (t.as_nanos() + 999_999) / 1_000_000;
                ms.min(libc::c_int::MAX as u128) as libc::c_int
            })
            .unwrap_or(-1);

        // The armed descriptor belongs to the current session and stays open
        // until the next rebuild, which disarms or re-arms first.
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        let mut pollfds = [PollFd::new(&fd, PollFlags::POLLIN | PollFlags::POLLPRI)];

        match poll(&mut pollfds, timeout_ms) {
            Ok(ready) => Ok(ready > 0),
            Err(Errno::EINTR) => Ok(false),
            Err(errno) => Err(event_err(errno)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockChip, MockRequest};
    use crate::registry::Consumer;
    use crate::session::SessionManager;
    use crate::{Edge, EdgeKind, GpioChip, LineSettings, Value};
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Consumer for Recorder {
        fn handle_event(&self) {
            self.log.lock().unwrap().push(self.name);
        }

        fn is_on(&self) -> bool {
            false
        }

        fn set_on(&self, _on: bool) {}
    }

    fn edge_input() -> LineSettings {
        LineSettings {
            edge_detection: Edge::Both,
            ..LineSettings::input()
        }
    }

    #[test]
    fn drains_in_delivery_order_and_routes_by_offset() {
        let chip = MockChip::new("pinctrl-bcm2711", 32);
        let log = Arc::new(Mutex::new(Vec::new()));
        let door: Arc<dyn Consumer> = Arc::new(Recorder {
            name: "door",
            log: log.clone(),
        });
        let window: Arc<dyn Consumer> = Arc::new(Recorder {
            name: "window",
            log: log.clone(),
        });

        let mut registry = LineRegistry::new();
        registry.reserve(&chip, 6, edge_input(), &door).unwrap();
        registry.reserve(&chip, 8, edge_input(), &window).unwrap();
        let mut sessions = SessionManager::<MockRequest>::new();
        sessions.rebuild(&chip, &registry).unwrap();

        let mut dispatcher = Dispatcher::new();
        assert!(dispatcher.arm(sessions.current()));

        assert!(chip.inject_event(8, EdgeKind::Rising));
        assert!(chip.inject_event(6, EdgeKind::Rising));
        assert!(chip.inject_event(8, EdgeKind::Falling));
        assert!(dispatcher.wait(Some(Duration::from_millis(100))).unwrap());

        let session = sessions.current().unwrap();
        assert_eq!(dispatcher.drain(session, &registry).unwrap(), 3);
        assert_eq!(*log.lock().unwrap(), vec!["window", "door", "window"]);

        assert!(!dispatcher.wait(Some(Duration::ZERO)).unwrap());
        assert_eq!(dispatcher.drain(session, &registry).unwrap(), 0);
    }

    #[test]
    fn events_for_dead_consumers_are_skipped() {
        let chip = MockChip::new("pinctrl-bcm2711", 32);
        let mut registry = LineRegistry::new();
        {
            let gone: Arc<dyn Consumer> = Arc::new(Recorder {
                name: "gone",
                log: Arc::default(),
            });
            registry.reserve(&chip, 6, edge_input(), &gone).unwrap();
        }
        let mut sessions = SessionManager::<MockRequest>::new();
        sessions.rebuild(&chip, &registry).unwrap();

        chip.inject_event(6, EdgeKind::Rising);
        let dispatcher = Dispatcher::new();
        let delivered = dispatcher
            .drain(sessions.current().unwrap(), &registry)
            .unwrap();
        assert_eq!(delivered, 0);
    }

    #[test]
    fn stays_disarmed_without_edge_lines() {
        let chip = MockChip::new("pinctrl-bcm2711", 32);
        let request = chip
            .request_lines("test", &[(3, LineSettings::output(Value::Active))].into_iter().collect())
            .unwrap();
        assert!(request.event_fd().is_none());

        let mut dispatcher = Dispatcher::new();
        assert!(!dispatcher.arm::<MockRequest>(None));
        let err = dispatcher.wait(None).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::NotArmed));
    }

    #[test]
    fn rearms_on_each_generation() {
        let chip = MockChip::new("pinctrl-bcm2711", 32);
        let owner: Arc<dyn Consumer> = Arc::new(Recorder {
            name: "door",
            log: Arc::default(),
        });
        let mut registry = LineRegistry::new();
        registry.reserve(&chip, 6, edge_input(), &owner).unwrap();
        let mut sessions = SessionManager::<MockRequest>::new();
        let mut dispatcher = Dispatcher::new();

        sessions.rebuild(&chip, &registry).unwrap();
        dispatcher.arm(sessions.current());
        let first = dispatcher.state();

        sessions.rebuild(&chip, &registry).unwrap();
        dispatcher.arm(sessions.current());
        match dispatcher.state() {
            DispatchState::Armed { generation, .. } => assert_eq!(generation, 2),
            other => panic!("unexpected state {:?}", other),
        }
        assert_ne!(first, dispatcher.state());
    }

    #[test]
    fn sub_millisecond_timeouts_still_wait() {
        let chip = MockChip::new("pinctrl-bcm2711", 32);
        let owner: Arc<dyn Consumer> = Arc::new(Recorder {
            name: "door",
            log: Arc::default(),
        });
        let mut registry = LineRegistry::new();
        registry.reserve(&chip, 6, edge_input(), &owner).unwrap();
        let mut sessions = SessionManager::<MockRequest>::new();
        sessions.rebuild(&chip, &registry).unwrap();
        let mut dispatcher = Dispatcher::new();
        dispatcher.arm(sessions.current());

        let started = Instant::now();
        assert!(!dispatcher.wait(Some(Duration::from_micros(900))).unwrap());
        assert!(started.elapsed() >= Duration::from_micros(900));
    }
}

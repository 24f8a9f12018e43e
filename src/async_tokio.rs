// Copyright (c) 2018 The rust-gpio-cdev Project Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Wrapper for asynchronous programming using Tokio.

use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tracing::debug;

use crate::dispatch::DispatchState;
use crate::errors::{ErrorKind, Result};
use crate::{Chip, GpioChip, Hub};

struct Watch {
    fd: AsyncFd<OwnedFd>,
    generation: u64,
}

/// A [`Hub`] whose edge events are awaited on the Tokio reactor.
///
/// Each rebuild of the line request produces a new descriptor, so the
/// reactor registration follows the session generation. The registration
/// holds a duplicate of the request descriptor; it is dropped before the hub
/// is handed out mutably, so a rebuild never waits on a stale request.
///
/// # Example
///
/// ```no_run
/// # use std::sync::Arc;
/// # use gpio_cdev_hub::{AsyncHub, Bias, Consumer, Hub, Result};
/// async fn watch(door: Arc<dyn Consumer>) -> Result<()> {
///     let mut hub = Hub::new(None)?;
///     hub.add_sensor(&door, 17, false, Bias::PullUp, 50)?;
///     hub.startup();
///
///     let mut hub = AsyncHub::new(hub);
///     loop {
///         hub.next_events().await?;
///     }
/// }
/// ```
pub struct AsyncHub<C: GpioChip = Chip> {
    // Declared first so the reactor registration goes before the descriptor.
    watch: Option<Watch>,
    hub: Hub<C>,
}

impl<C: GpioChip> AsyncHub<C> {
    pub fn new(hub: Hub<C>) -> AsyncHub<C> {
        AsyncHub { watch: None, hub }
    }

    pub fn hub(&self) -> &Hub<C> {
        &self.hub
    }

    /// Mutable access to the hub, for registering lines or cleaning up.
    ///
    /// Drops the reactor registration; it is renewed by the next
    /// [`next_events`](Self::next_events).
    pub fn hub_mut(&mut self) -> &mut Hub<C> {
        self.watch = None;
        &mut self.hub
    }

    pub fn into_inner(mut self) -> Hub<C> {
        self.watch = None;
        self.hub
    }

    fn refresh_watch(&mut self) -> Result<()> {
        let (fd, generation) = match self.hub.dispatcher().state() {
            DispatchState::Armed { fd, generation } => (fd, generation),
            DispatchState::Disarmed => {
                self.watch = None;
                return Err(ErrorKind::NotArmed.into());
            }
        };

        let stale = match &self.watch {
            Some(watch) => watch.generation != generation,
            None => true,
        };
        if stale {
            self.watch = None;
            debug!("registering fd {} for generation {}", fd, generation);
            // Watch a duplicate so the registration owns what it watches.
            let owned = unsafe { BorrowedFd::borrow_raw(fd) }.try_clone_to_owned()?;
            let fd = unsafe { AsyncFd::register_with_interest(owned, Interest::READABLE) }
                .map_err(io::Error::from)?;
            self.watch = Some(Watch { fd, generation });
        }

        Ok(())
    }

    /// Wait until the session descriptor is readable, then deliver every
    /// pending event. Returns the number of events delivered.
    pub async fn next_events(&mut self) -> Result<usize> {
        self.refresh_watch()?;
        let watch = match &self.watch {
            Some(watch) => watch,
            None => return Err(ErrorKind::NotArmed.into()),
        };

        let mut guard = watch.fd.readable().await?;
        let delivered = self.hub.handle_events()?;
        guard.clear_ready();
        Ok(delivered)
    }
}

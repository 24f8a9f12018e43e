// Copyright (c) 2018 The rust-gpio-cdev Project Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Multiplex many logical GPIO lines over one character device request.
//!
//! A [`Hub`] owns a single GPIO chip (`/dev/gpiochipN`) and a single line
//! request covering every line registered with it. Switches, sensors and
//! covers are registered against the hub; each registration rebuilds the
//! whole request, since the kernel grants a line group atomically. Edge
//! events for every input line arrive on the one request descriptor and
//! are routed back to the [`Consumer`] that registered the line.
//!
//! ```no_run
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use std::sync::Arc;
//! use gpio_cdev_hub::{Bias, Consumer, Hub};
//!
//! #[derive(Default)]
//! struct DoorSensor {
//!     open: AtomicBool,
//! }
//!
//! impl Consumer for DoorSensor {
//!     fn handle_event(&self) {
//!         println!("door changed");
//!     }
//!
//!     fn is_on(&self) -> bool {
//!         self.open.load(Ordering::SeqCst)
//!     }
//!
//!     fn set_on(&self, on: bool) {
//!         self.open.store(on, Ordering::SeqCst)
//!     }
//! }
//!
//! # fn main() -> gpio_cdev_hub::Result<()> {
//! let mut hub = Hub::new(None)?;
//! let door: Arc<dyn Consumer> = Arc::new(DoorSensor::default());
//! hub.add_sensor(&door, 17, false, Bias::PullUp, 50)?;
//! hub.startup();
//! loop {
//!     hub.wait_events(None)?;
//! }
//! # }
//! ```

use std::collections::BTreeMap;
use std::ffi::CStr;
use std::fs::{self, File, OpenOptions};
use std::mem;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::ptr;

use nix::sys::stat::{major, minor};
use tracing::warn;

pub mod config;
pub mod errors;
mod ffi;
pub mod locator;
#[cfg(any(test, feature = "mock"))]
pub mod mock;

mod dispatch;
mod hub;
mod registry;
mod session;
mod settings;

#[cfg(feature = "async-tokio")]
mod async_tokio;

#[cfg(feature = "async-tokio")]
pub use crate::async_tokio::AsyncHub;
pub use crate::dispatch::{DispatchState, Dispatcher};
pub use crate::errors::{Error, ErrorKind, IoctlKind, Result};
pub use crate::hub::{Hub, COVER_DEBOUNCE_MS};
pub use crate::registry::{Consumer, LineRegistry, RegistryEntry};
pub use crate::session::{Session, SessionManager};
pub use crate::settings::{
    Bias, Direction, Drive, Edge, EdgeEvent, EdgeKind, EventClock, LineFlags, LineSettings, Value,
};

use crate::errors::{event_err, invalid_err, ioctl_err, offset_err};

/// Consumer label this crate requests lines under.
///
/// Lines already held under this label are treated as our own.
pub const CONSUMER: &str = "rpi_gpio";

/// Requested settings keyed by line offset.
pub type LineConfig = BTreeMap<u32, LineSettings>;

/// Something lines can be requested from.
pub trait GpioChip {
    type Request: LineRequest;

    fn label(&self) -> &str;

    fn line_info(&self, offset: u32) -> Result<LineInfo>;

    /// Request every line in `config` as one group.
    fn request_lines(&self, consumer: &str, config: &LineConfig) -> Result<Self::Request>;
}

/// A granted group of lines. Dropping it releases the lines.
pub trait LineRequest {
    fn offsets(&self) -> &[u32];

    fn get_value(&self, offset: u32) -> Result<Value>;

    fn set_value(&self, offset: u32, value: Value) -> Result<()>;

    /// Read every buffered edge event without blocking.
    fn read_edge_events(&self) -> Result<Vec<EdgeEvent>>;

    /// Descriptor that becomes readable when edge events are pending.
    ///
    /// `None` unless at least one line was requested with edge detection.
    fn event_fd(&self) -> Option<RawFd>;
}

/// Check whether `path` is a GPIO chip character device.
///
/// Symlinks are followed; the device must belong to the `gpio` sysfs bus.
pub fn is_gpiochip_device<P: AsRef<Path>>(path: P) -> bool {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(_) => return false,
    };
    if !meta.file_type().is_char_device() {
        return false;
    }

    let rdev = meta.rdev();
    let subsystem = format!("/sys/dev/char/{}:{}/subsystem", major(rdev), minor(rdev));
    match fs::canonicalize(subsystem) {
        Ok(resolved) => resolved == Path::new("/sys/bus/gpio"),
        Err(_) => false,
    }
}

fn c_string(buf: &[libc::c_char]) -> String {
    unsafe { CStr::from_ptr(buf.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// An open GPIO chip (`/dev/gpiochipN`).
#[derive(Debug)]
pub struct Chip {
    file: File,
    path: PathBuf,
    name: String,
    label: String,
    lines: u32,
}

impl Chip {
    /// Open the GPIO chip at the provided path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Chip> {
        let path = path.as_ref();
        if !is_gpiochip_device(path) {
            return Err(invalid_err(format!(
                "{} is not a gpiochip device",
                path.display()
            )));
        }

        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut info: ffi::gpiochip_info = unsafe { mem::zeroed() };
        unsafe { ffi::gpio_get_chipinfo_ioctl(file.as_raw_fd(), &mut info) }
            .map_err(|e| ioctl_err(IoctlKind::ChipInfo, e))?;

        Ok(Chip {
            file,
            path: path.to_path_buf(),
            name: c_string(&info.name),
            label: c_string(&info.label),
            lines: info.lines,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_lines(&self) -> u32 {
        self.lines
    }
}

impl GpioChip for Chip {
    type Request = LineRequestHandle;

    fn label(&self) -> &str {
        &self.label
    }

    fn line_info(&self, offset: u32) -> Result<LineInfo> {
        if offset >= self.lines {
            return Err(invalid_err(format!(
                "offset {} is out of range for {} ({} lines)",
                offset, self.name, self.lines
            )));
        }

        let mut info: ffi::gpio_v2_line_info = unsafe { mem::zeroed() };
        info.offset = offset;
        unsafe { ffi::gpio_v2_get_lineinfo_ioctl(self.file.as_raw_fd(), &mut info) }
            .map_err(|e| ioctl_err(IoctlKind::LineInfo, e))?;

        Ok(LineInfo {
            offset,
            flags: LineFlags::from_bits_truncate(info.flags),
            name: non_empty(c_string(&info.name)),
            consumer: non_empty(c_string(&info.consumer)),
        })
    }

    fn request_lines(&self, consumer: &str, config: &LineConfig) -> Result<LineRequestHandle> {
        if config.is_empty() {
            return Err(invalid_err("no lines to request"));
        }
        if config.len() > ffi::GPIO_V2_LINES_MAX {
            return Err(invalid_err(format!(
                "{} lines requested but at most {} fit in one request",
                config.len(),
                ffi::GPIO_V2_LINES_MAX
            )));
        }

        let mut req: ffi::gpio_v2_line_request = unsafe { mem::zeroed() };
        for (slot, offset) in req.offsets.iter_mut().zip(config.keys()) {
            *slot = *offset;
        }
        for (slot, byte) in req
            .consumer
            .iter_mut()
            .zip(consumer.bytes().take(ffi::GPIO_MAX_NAME_SIZE - 1))
        {
            *slot = byte as libc::c_char;
        }
        req.num_lines = config.len() as u32;
        req.config = encode_config(config)?;

        unsafe { ffi::gpio_v2_get_line_ioctl(self.file.as_raw_fd(), &mut req) }
            .map_err(|e| ioctl_err(IoctlKind::GetLine, e))?;

        // Edge events are drained until EAGAIN, which needs a non-blocking descriptor.
        let file = unsafe { File::from_raw_fd(req.fd) };
        let fd = file.as_raw_fd();
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL, 0);
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }

        Ok(LineRequestHandle {
            file,
            offsets: config.keys().copied().collect(),
            edge_detection: config.values().any(LineSettings::has_edge_detection),
        })
    }
}

/// Encode per-line settings into a v2 line config.
///
/// The first distinct flag set becomes the default; every other flag set,
/// every distinct debounce period and the output values become attributes
/// masked by the line's index within the request.
fn encode_config(config: &LineConfig) -> Result<ffi::gpio_v2_line_config> {
    let mut flag_groups: Vec<(LineFlags, u64)> = Vec::new();
    let mut debounce_groups: Vec<(u32, u64)> = Vec::new();
    let mut output_mask = 0u64;
    let mut output_bits = 0u64;

    for (idx, settings) in config.values().enumerate() {
        let bit = 1u64 << idx;

        let flags = settings.flags();
        match flag_groups.iter_mut().find(|(f, _)| *f == flags) {
            Some((_, mask)) => *mask |= bit,
            None => flag_groups.push((flags, bit)),
        }

        let debounce_us = settings
            .effective_debounce()
            .as_micros()
            .min(u32::MAX as u128) as u32;
        if debounce_us > 0 {
            match debounce_groups.iter_mut().find(|(us, _)| *us == debounce_us) {
                Some((_, mask)) => *mask |= bit,
                None => debounce_groups.push((debounce_us, bit)),
            }
        }

        if settings.is_output() {
            output_mask |= bit;
            if settings.output_value.is_active() {
                output_bits |= bit;
            }
        }
    }

    let mut attrs = Vec::new();
    for (flags, mask) in flag_groups.iter().skip(1) {
        let value = ffi::gpio_v2_line_attribute_value {
            flags: flags.bits(),
        };
        attrs.push(config_attribute(ffi::GPIO_V2_LINE_ATTR_ID_FLAGS, value, *mask));
    }
    if output_mask != 0 {
        let value = ffi::gpio_v2_line_attribute_value {
            values: output_bits,
        };
        attrs.push(config_attribute(
            ffi::GPIO_V2_LINE_ATTR_ID_OUTPUT_VALUES,
            value,
            output_mask,
        ));
    }
    for (debounce_us, mask) in &debounce_groups {
        let mut value = ffi::gpio_v2_line_attribute_value { values: 0 };
        value.debounce_period_us = *debounce_us;
        attrs.push(config_attribute(ffi::GPIO_V2_LINE_ATTR_ID_DEBOUNCE, value, *mask));
    }

    if attrs.len() > ffi::GPIO_V2_LINE_NUM_ATTRS_MAX {
        return Err(invalid_err(format!(
            "line settings need {} attributes but a request holds at most {}",
            attrs.len(),
            ffi::GPIO_V2_LINE_NUM_ATTRS_MAX
        )));
    }

    let mut encoded: ffi::gpio_v2_line_config = unsafe { mem::zeroed() };
    encoded.flags = flag_groups.first().map(|(f, _)| f.bits()).unwrap_or(0);
    encoded.num_attrs = attrs.len() as u32;
    for (slot, attr) in encoded.attrs.iter_mut().zip(attrs) {
        *slot = attr;
    }
    Ok(encoded)
}

fn config_attribute(
    id: u32,
    value: ffi::gpio_v2_line_attribute_value,
    mask: u64,
) -> ffi::gpio_v2_line_config_attribute {
    ffi::gpio_v2_line_config_attribute {
        attr: ffi::gpio_v2_line_attribute {
            id,
            padding: 0,
            value,
        },
        mask,
    }
}

/// Information about a single line on a chip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineInfo {
    offset: u32,
    flags: LineFlags,
    name: Option<String>,
    consumer: Option<String>,
}

impl LineInfo {
    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn flags(&self) -> LineFlags {
        self.flags
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Label of whoever holds the line, if anyone does.
    pub fn consumer(&self) -> Option<&str> {
        self.consumer.as_deref()
    }

    pub fn is_used(&self) -> bool {
        self.flags.contains(LineFlags::USED)
    }
}

/// Lines granted by the kernel for one `GPIO_V2_GET_LINE_IOCTL` request.
#[derive(Debug)]
pub struct LineRequestHandle {
    file: File,
    offsets: Vec<u32>,
    edge_detection: bool,
}

impl LineRequestHandle {
    fn index_of(&self, offset: u32) -> Result<usize> {
        self.offsets
            .iter()
            .position(|o| *o == offset)
            .ok_or_else(|| offset_err(offset))
    }
}

const EVENT_SIZE: usize = mem::size_of::<ffi::gpio_v2_line_event>();
const EVENTS_PER_READ: usize = 16;

impl LineRequest for LineRequestHandle {
    fn offsets(&self) -> &[u32] {
        &self.offsets
    }

    fn get_value(&self, offset: u32) -> Result<Value> {
        let bit = 1u64 << self.index_of(offset)?;
        let mut values = ffi::gpio_v2_line_values { bits: 0, mask: bit };
        unsafe { ffi::gpio_v2_line_get_values_ioctl(self.file.as_raw_fd(), &mut values) }
            .map_err(|e| ioctl_err(IoctlKind::GetValues, e))?;
        Ok(Value::from(values.bits & bit != 0))
    }

    fn set_value(&self, offset: u32, value: Value) -> Result<()> {
        let bit = 1u64 << self.index_of(offset)?;
        let mut values = ffi::gpio_v2_line_values {
            bits: if value.is_active() { bit } else { 0 },
            mask: bit,
        };
        unsafe { ffi::gpio_v2_line_set_values_ioctl(self.file.as_raw_fd(), &mut values) }
            .map_err(|e| ioctl_err(IoctlKind::SetValues, e))?;
        Ok(())
    }

    fn read_edge_events(&self) -> Result<Vec<EdgeEvent>> {
        let mut events = Vec::new();
        let mut buf = [0u8; EVENT_SIZE * EVENTS_PER_READ];

        loop {
            let n = match nix::unistd::read(self.file.as_raw_fd(), &mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(nix::errno::Errno::EAGAIN) => break,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(event_err(e)),
            };
            if n % EVENT_SIZE != 0 {
                return Err(event_err(nix::errno::Errno::EIO));
            }

            for chunk in buf[..n].chunks_exact(EVENT_SIZE) {
                let raw: ffi::gpio_v2_line_event =
                    unsafe { ptr::read_unaligned(chunk.as_ptr() as *const ffi::gpio_v2_line_event) };
                let kind = match raw.id {
                    ffi::GPIO_V2_LINE_EVENT_RISING_EDGE => EdgeKind::Rising,
                    ffi::GPIO_V2_LINE_EVENT_FALLING_EDGE => EdgeKind::Falling,
                    id => {
                        warn!("unknown edge event id {} on line {}", id, raw.offset);
                        continue;
                    }
                };
                events.push(EdgeEvent {
                    timestamp_ns: raw.timestamp_ns,
                    kind,
                    offset: raw.offset,
                    seqno: raw.seqno,
                    line_seqno: raw.line_seqno,
                });
            }
        }

        Ok(events)
    }

    fn event_fd(&self) -> Option<RawFd> {
        if self.edge_detection {
            Some(self.file.as_raw_fd())
        } else {
            None
        }
    }
}

impl AsRawFd for LineRequestHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

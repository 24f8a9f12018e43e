// Copyright (c) 2018 The rust-gpio-cdev Project Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! GPIO character device uAPI v2 (`linux/gpio.h`, Linux 5.10+).

#![allow(non_camel_case_types)]

use nix::{ioctl_read, ioctl_readwrite};

pub const GPIO_MAX_NAME_SIZE: usize = 32;
pub const GPIO_V2_LINES_MAX: usize = 64;
pub const GPIO_V2_LINE_NUM_ATTRS_MAX: usize = 10;

pub const GPIO_V2_LINE_ATTR_ID_FLAGS: u32 = 1;
pub const GPIO_V2_LINE_ATTR_ID_OUTPUT_VALUES: u32 = 2;
pub const GPIO_V2_LINE_ATTR_ID_DEBOUNCE: u32 = 3;

pub const GPIO_V2_LINE_EVENT_RISING_EDGE: u32 = 1;
pub const GPIO_V2_LINE_EVENT_FALLING_EDGE: u32 = 2;

#[repr(C)]
pub struct gpiochip_info {
    pub name: [libc::c_char; GPIO_MAX_NAME_SIZE],
    pub label: [libc::c_char; GPIO_MAX_NAME_SIZE],
    pub lines: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union gpio_v2_line_attribute_value {
    pub flags: u64,
    pub values: u64,
    pub debounce_period_us: u32,
}

#[repr(C, align(8))]
#[derive(Clone, Copy)]
pub struct gpio_v2_line_attribute {
    pub id: u32,
    pub padding: u32,
    pub value: gpio_v2_line_attribute_value,
}

#[repr(C, align(8))]
#[derive(Clone, Copy)]
pub struct gpio_v2_line_config_attribute {
    pub attr: gpio_v2_line_attribute,
    pub mask: u64,
}

#[repr(C, align(8))]
pub struct gpio_v2_line_config {
    pub flags: u64,
    pub num_attrs: u32,
    pub padding: [u32; 5],
    pub attrs: [gpio_v2_line_config_attribute; GPIO_V2_LINE_NUM_ATTRS_MAX],
}

#[repr(C, align(8))]
pub struct gpio_v2_line_request {
    pub offsets: [u32; GPIO_V2_LINES_MAX],
    pub consumer: [libc::c_char; GPIO_MAX_NAME_SIZE],
    pub config: gpio_v2_line_config,
    pub num_lines: u32,
    pub event_buffer_size: u32,
    pub padding: [u32; 5],
    pub fd: i32,
}

#[repr(C, align(8))]
pub struct gpio_v2_line_info {
    pub name: [libc::c_char; GPIO_MAX_NAME_SIZE],
    pub consumer: [libc::c_char; GPIO_MAX_NAME_SIZE],
    pub offset: u32,
    pub num_attrs: u32,
    pub flags: u64,
    pub attrs: [gpio_v2_line_attribute; GPIO_V2_LINE_NUM_ATTRS_MAX],
    pub padding: [u32; 4],
}

#[repr(C, align(8))]
pub struct gpio_v2_line_values {
    pub bits: u64,
    pub mask: u64,
}

#[repr(C, align(8))]
#[derive(Clone, Copy)]
pub struct gpio_v2_line_event {
    pub timestamp_ns: u64,
    pub id: u32,
    pub offset: u32,
    pub seqno: u32,
    pub line_seqno: u32,
    pub padding: [u32; 6],
}

ioctl_read!(gpio_get_chipinfo_ioctl, 0xB4, 0x01, gpiochip_info);
ioctl_readwrite!(gpio_v2_get_lineinfo_ioctl, 0xB4, 0x05, gpio_v2_line_info);
ioctl_readwrite!(gpio_v2_get_line_ioctl, 0xB4, 0x07, gpio_v2_line_request);
ioctl_readwrite!(gpio_v2_line_get_values_ioctl, 0xB4, 0x0E, gpio_v2_line_values);
ioctl_readwrite!(gpio_v2_line_set_values_ioctl, 0xB4, 0x0F, gpio_v2_line_values);

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn struct_sizes_match_kernel_abi() {
        assert_eq!(size_of::<gpiochip_info>(), 68);
        assert_eq!(size_of::<gpio_v2_line_attribute>(), 16);
        assert_eq!(size_of::<gpio_v2_line_config_attribute>(), 24);
        assert_eq!(size_of::<gpio_v2_line_config>(), 272);
        assert_eq!(size_of::<gpio_v2_line_request>(), 592);
        assert_eq!(size_of::<gpio_v2_line_info>(), 256);
        assert_eq!(size_of::<gpio_v2_line_values>(), 16);
        assert_eq!(size_of::<gpio_v2_line_event>(), 48);
    }
}

//! A lightweight USB full-speed device stack for microcontrollers whose
//! USB peripheral exposes per-endpoint `EPnR` registers and a dedicated
//! packet memory area shared with the USB engine through a
//! buffer-descriptor table (STM32 F0/G4 class parts).
//!
//! The stack is deliberately small and opinionated: one configuration,
//! bulk and interrupt data endpoints, a complete endpoint-0 control
//! engine, and a single cooperative entry point. It owns the three
//! hardware disciplines that make this peripheral family tricky:
//!
//! - the packet-memory layout and the RX count encoding,
//! - the `EPnR` toggle-write rules (`STAT`/`DTOG` flip on 1, `CTR`
//!   flags clear on 0),
//! - the deferred SET_ADDRESS and multi-packet control-IN protocol.
//!
//! The application supplies descriptors and optional hooks through the
//! [`hil::Client`] trait and moves data with [`usbd::Usbd::ep_write`] and
//! [`usbd::Usbd::ep_read`]; everything else happens inside
//! [`usbd::Usbd::task`], which may be called from a polling loop or from
//! the USB interrupt handler (pick one; concurrent use is unsupported).
//!
//! Hardware access goes through the [`hil::UsbPeripheral`] trait;
//! [`registers::UsbFs`] implements it for the memory-mapped peripheral.

#![cfg_attr(not(test), no_std)]

pub mod descriptors;
pub mod hil;
pub mod registers;
pub mod usbd;

pub use crate::hil::{Client, UsbPeripheral};
pub use crate::registers::UsbFs;
pub use crate::usbd::{DeviceConfig, EndpointConfig, EndpointKind, Usbd, EP0_SIZE};

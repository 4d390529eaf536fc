//! Interfaces between the portable device stack, the peripheral it drives
//! and the application it serves.

use crate::descriptors::SetupPacket;

/// Raw access to a USB full-speed device peripheral of the `EPnR` /
/// packet-memory family.
///
/// The portable stack expresses every hardware interaction through this
/// trait: the 16-bit per-endpoint control registers (with their
/// toggle-on-write-1 `STAT`/`DTOG` bits and clear-on-write-0 `CTR` bits
/// applied by the hardware), the peripheral control/status/address
/// registers, and 16-bit word access to the packet memory area shared with
/// the USB engine. Register values travel as `u32` with the upper half
/// unused, matching the CPU view of the register file.
///
/// # Safety
///
/// Implementations promise that the accessors really reach one USB
/// peripheral and its packet memory, that the peripheral is clocked and out
/// of reset before [`Usbd::init`](crate::usbd::Usbd::init) runs, and that
/// nothing else touches the packet memory while the stack owns it.
pub unsafe trait UsbPeripheral {
    /// Read `EPnR`.
    fn epr(&self, ept: u8) -> u32;

    /// Write `EPnR`. The hardware applies the register's per-bit write
    /// semantics; callers go through the toggle-write helpers in the
    /// driver rather than calling this directly.
    fn set_epr(&self, ept: u8, value: u32);

    /// Read the interrupt status register.
    fn istr(&self) -> u32;

    /// Write the interrupt status register (event bits clear on write-0).
    fn set_istr(&self, value: u32);

    /// Read the control register.
    fn cntr(&self) -> u32;

    /// Write the control register.
    fn set_cntr(&self, value: u32);

    /// Write the device address register.
    fn set_daddr(&self, value: u32);

    /// Write the buffer-descriptor-table offset register.
    fn set_btable(&self, value: u32);

    /// Connect the internal D+ pull-up, signalling attachment to the host.
    fn enable_dp_pullup(&self);

    /// Read one 16-bit packet-memory word. `offset` is a byte offset from
    /// the start of the packet memory and must be even.
    fn pma_read(&self, offset: u16) -> u16;

    /// Write one 16-bit packet-memory word. `offset` as in
    /// [`pma_read`](Self::pma_read).
    fn pma_write(&self, offset: u16, value: u16);

    /// The factory-programmed 96-bit unique device identifier.
    fn device_uid(&self) -> [u8; 12];
}

/// Application callbacks consumed by the stack.
///
/// The descriptor getters are the required surface: they return complete
/// descriptor byte blobs (for the configuration descriptor, the full
/// configuration block including interface, class and endpoint
/// descriptors) or `None` for indices the application does not provide.
/// Everything else defaults to a no-op or "unhandled" so applications
/// implement only what they care about.
pub trait Client<'a> {
    /// The device descriptor.
    fn device_descriptor(&'a self) -> Option<&'a [u8]>;

    /// The full configuration block; `wTotalLength` is read from its
    /// bytes 2..4.
    fn configuration_descriptor(&'a self) -> Option<&'a [u8]>;

    /// The interface descriptor for the given interface number.
    fn interface_descriptor(&'a self, interface: u16) -> Option<&'a [u8]>;

    /// The string descriptor for the given language and index.
    fn string_descriptor(&'a self, lang_id: u16, index: u8) -> Option<&'a [u8]>;

    /// Invoked twice around bus-reset processing: with `before == true`
    /// before the endpoint registers are torn down, then with `false`
    /// after endpoint 0 has been re-armed.
    fn bus_reset(&'a self, _before: bool) {}

    /// A SET_ADDRESS request was accepted; `address` will be applied when
    /// the status stage completes.
    fn address_assigned(&'a self, _address: u8) {}

    /// The bus went idle and the peripheral entered suspend.
    fn suspend(&'a self) {}

    /// Bus activity resumed.
    fn resume(&'a self) {}

    /// An OUT transaction completed on a data endpoint. Call
    /// [`Usbd::ep_read`](crate::usbd::Usbd::ep_read) to drain the packet
    /// and re-arm reception.
    fn packet_out(&'a self, _endpoint: u8) {}

    /// The given IN endpoint is configured and idle; the application may
    /// queue data with [`Usbd::ep_write`](crate::usbd::Usbd::ep_write).
    /// Polled from start-of-frame, one endpoint per frame, only when
    /// [`DeviceConfig::poll_in_endpoints`](crate::usbd::DeviceConfig) is
    /// set.
    fn packet_in(&'a self, _endpoint: u8) {}

    /// Handle a class SETUP request. Return `true` if handled; a
    /// device-to-host request must arm its reply via
    /// [`Usbd::control_in`](crate::usbd::Usbd::control_in) before
    /// returning.
    fn ctrl_class_request(&'a self, _setup: &SetupPacket) -> bool {
        false
    }

    /// Handle a vendor SETUP request; semantics as
    /// [`ctrl_class_request`](Self::ctrl_class_request).
    fn ctrl_vendor_request(&'a self, _setup: &SetupPacket) -> bool {
        false
    }

    /// Handle GET_DESCRIPTOR with interface recipient (HID report
    /// descriptors and friends).
    fn ctrl_interface_descriptor(&'a self, _setup: &SetupPacket) -> bool {
        false
    }
}

//! USB full-speed device driver.
//!
//! A single driver object owns the packet-memory layout, the endpoint
//! table, the endpoint-0 control engine and the event loop. The stack is
//! single-threaded and cooperative: [`Usbd::task`] is the sole driver,
//! invoked either from a polling loop or from the USB interrupt (pick
//! one), processes at most one event per call and never blocks.
//!
//! Endpoint geometry is fixed at construction. [`Usbd::new`] is a
//! `const fn`, so instantiating the driver in a `static` turns an
//! endpoint configuration that does not fit the packet memory into a
//! build failure:
//!
//! ```ignore
//! static USB: UsbFs = UsbFs::new();
//! static mut USBD: Usbd<UsbFs> = Usbd::new(&USB, {
//!     let mut config = DeviceConfig::new();
//!     config.endpoints[0] = EndpointConfig::interrupt(8, 0); // EP1
//!     config.endpoints[1] = EndpointConfig::bulk(0, 64);     // EP2
//!     config
//! });
//! ```

use core::cell::{Cell, OnceCell};
use core::cmp::min;

use crate::descriptors::{
    self, get_u16, DescriptorType, Recipient, RequestKind, SetupPacket, StandardRequest,
    TransferDirection,
};
use crate::hil::{Client, UsbPeripheral};
use crate::registers::*;


macro_rules! usb_debug {
    [ $( $arg:expr ),+ ] => {{
        #[cfg(feature = "defmt")]
        defmt::debug!($( $arg ),+);
    }};
}

pub const N_ENDPOINTS: usize = 8;

/// Maximum packet size of the default control endpoint.
pub const EP0_SIZE: usize = 64;

/// Packet memory capacity in bytes.
pub const PMA_SIZE: u16 = 1024;

/// Bytes occupied by the buffer-descriptor table: 8 endpoints, one TX and
/// one RX (addr, count) entry each.
const BTABLE_BYTES: u16 = 64;

const SERIAL_DESCRIPTOR_LEN: usize = 2 + 24 * 2;

/// Transfer type of a data endpoint. Isochronous transfers are not
/// supported, so they cannot be configured.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EndpointKind {
    Bulk,
    Interrupt,
}

/// Geometry of one data endpoint. A zero size disables that direction.
#[derive(Copy, Clone)]
pub struct EndpointConfig {
    pub kind: EndpointKind,
    pub size_in: u16,
    pub size_out: u16,
}

impl EndpointConfig {
    pub const fn disabled() -> EndpointConfig {
        EndpointConfig {
            kind: EndpointKind::Bulk,
            size_in: 0,
            size_out: 0,
        }
    }

    pub const fn bulk(size_in: u16, size_out: u16) -> EndpointConfig {
        EndpointConfig {
            kind: EndpointKind::Bulk,
            size_in,
            size_out,
        }
    }

    pub const fn interrupt(size_in: u16, size_out: u16) -> EndpointConfig {
        EndpointConfig {
            kind: EndpointKind::Interrupt,
            size_in,
            size_out,
        }
    }
}

/// Device-level configuration, fixed at construction.
#[derive(Copy, Clone)]
pub struct DeviceConfig {
    /// Endpoints 1..=7. Endpoint 0 is always the 64/64 control endpoint.
    pub endpoints: [EndpointConfig; 7],
    /// Unmask start-of-frame interrupts and poll idle IN endpoints
    /// through [`Client::packet_in`], one endpoint per frame. Set this
    /// when the client implements that callback.
    pub poll_in_endpoints: bool,
}

impl DeviceConfig {
    pub const fn new() -> DeviceConfig {
        DeviceConfig {
            endpoints: [EndpointConfig::disabled(); 7],
            poll_in_endpoints: false,
        }
    }

    /// Packet memory the layout will consume, in bytes, including the
    /// buffer-descriptor table and both endpoint-0 buffers.
    pub const fn pma_bytes(&self) -> u16 {
        let mut total = BTABLE_BYTES + 2 * EP0_SIZE as u16;
        let mut i = 0;
        while i < self.endpoints.len() {
            total += self.endpoints[i].size_in + self.endpoints[i].size_out;
            i += 1;
        }
        total
    }

    /// Whether every size is representable in the peripheral's count
    /// format and the whole layout fits the packet memory.
    pub const fn is_valid(&self) -> bool {
        if self.pma_bytes() > PMA_SIZE {
            return false;
        }
        let mut i = 0;
        while i < self.endpoints.len() {
            let ep = self.endpoints[i];
            // Packet memory is addressed as 16-bit words.
            if ep.size_in % 2 != 0 {
                return false;
            }
            if !rx_size_encodable(ep.size_out) {
                return false;
            }
            i += 1;
        }
        true
    }
}

const fn rx_size_encodable(size: u16) -> bool {
    if size <= 62 {
        size % 2 == 0
    } else {
        size <= 992 && size % 32 == 0
    }
}

/// RX buffer-descriptor count word for a buffer of the given size:
/// 2-byte granularity up to 62 bytes, 32-byte blocks beyond.
const fn rx_count_for_size(size: u16) -> u16 {
    if size > 62 {
        COUNT_RX_BLSIZE | ((size / 32) << COUNT_RX_NUM_BLOCK_SHIFT)
    } else {
        (size / 2) << COUNT_RX_NUM_BLOCK_SHIFT
    }
}

// Byte offsets of an endpoint's buffer-descriptor entries inside the
// packet memory (BTABLE is programmed to 0).
const fn bd_tx_addr(ept: u8) -> u16 {
    ept as u16 * 8
}
const fn bd_tx_count(ept: u8) -> u16 {
    ept as u16 * 8 + 2
}
const fn bd_rx_addr(ept: u8) -> u16 {
    ept as u16 * 8 + 4
}
const fn bd_rx_count(ept: u8) -> u16 {
    ept as u16 * 8 + 6
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum TransferType {
    Control,
    Bulk,
    Interrupt,
}

impl TransferType {
    fn epr_bits(self) -> u32 {
        match self {
            TransferType::Control => EP_TYPE_CONTROL,
            TransferType::Bulk => EP_TYPE_BULK,
            TransferType::Interrupt => EP_TYPE_INTERRUPT,
        }
    }
}

#[derive(Copy, Clone)]
struct EndpointSlot {
    ttype: TransferType,
    size_in: u16,
    size_out: u16,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum DeviceState {
    Default,
    Address,
    Configured,
}

/// The USB device stack.
///
/// All mutable state lives in cells: the device state machine, the
/// pending-address latch, the control-IN continuation and the
/// start-of-frame cursor, each owned exclusively by [`Usbd::task`] and
/// its callees and reset on bus reset.
pub struct Usbd<'a, P: UsbPeripheral> {
    hw: &'a P,
    endpoints: [EndpointSlot; N_ENDPOINTS],
    poll_in_endpoints: bool,
    client: Cell<Option<&'a dyn Client<'a>>>,
    state: Cell<DeviceState>,
    pending_address: Cell<Option<u8>>,
    ctrl_in_rest: Cell<Option<&'a [u8]>>,
    sof_cursor: Cell<u8>,
    serial: OnceCell<[u8; SERIAL_DESCRIPTOR_LEN]>,
}

impl<'a, P: UsbPeripheral> Usbd<'a, P> {
    /// Build a driver for the given peripheral and endpoint geometry.
    ///
    /// Fails constant evaluation (a build error when the driver is
    /// instantiated in a `static`) if the configuration does not satisfy
    /// [`DeviceConfig::is_valid`].
    pub const fn new(hw: &'a P, config: DeviceConfig) -> Usbd<'a, P> {
        assert!(
            config.is_valid(),
            "endpoint configuration does not fit the packet memory"
        );
        let mut endpoints = [EndpointSlot {
            ttype: TransferType::Control,
            size_in: EP0_SIZE as u16,
            size_out: EP0_SIZE as u16,
        }; N_ENDPOINTS];
        let mut i = 0;
        while i < config.endpoints.len() {
            let ep = config.endpoints[i];
            endpoints[i + 1] = EndpointSlot {
                ttype: match ep.kind {
                    EndpointKind::Bulk => TransferType::Bulk,
                    EndpointKind::Interrupt => TransferType::Interrupt,
                },
                size_in: ep.size_in,
                size_out: ep.size_out,
            };
            i += 1;
        }
        Usbd {
            hw,
            endpoints,
            poll_in_endpoints: config.poll_in_endpoints,
            client: Cell::new(None),
            state: Cell::new(DeviceState::Default),
            pending_address: Cell::new(None),
            ctrl_in_rest: Cell::new(None),
            sof_cursor: Cell::new(1),
            serial: OnceCell::new(),
        }
    }

    /// Set the application client. Call before [`init`](Self::init).
    pub fn set_client(&self, client: &'a dyn Client<'a>) {
        self.client.set(Some(client));
    }

    /// One-shot bring-up: power the analog transceiver up, lay out the
    /// packet memory, clear stale events, unmask the interrupts the
    /// event loop consumes and connect the D+ pull-up. The peripheral
    /// must already be clocked and out of reset.
    pub fn init(&self) {
        self.hw.set_cntr(self.hw.cntr() & !CNTR_PDWN);

        self.pma_init();

        self.hw.set_istr(0);
        let mut cntr = CNTR_CTRM | CNTR_WKUPM | CNTR_SUSPM | CNTR_RESETM;
        if self.poll_in_endpoints {
            cntr |= CNTR_SOFM;
        }
        self.hw.set_cntr(cntr);
        self.hw.enable_dp_pullup();
    }

    /// One step of the event loop: read the interrupt status word and
    /// process at most one event class, in priority order wakeup >
    /// suspend > reset > start-of-frame > completed transfer.
    pub fn task(&self) {
        let istr = self.hw.istr();
        if istr & (ISTR_CTR | ISTR_WKUP | ISTR_SUSP | ISTR_RESET | ISTR_SOF) == 0 {
            return;
        }

        if istr & ISTR_WKUP != 0 {
            self.hw.set_istr(!(ISTR_SUSP | ISTR_WKUP));
            self.hw.set_cntr(self.hw.cntr() & !CNTR_FSUSP);
            usb_debug!("usb: resume");
            if let Some(client) = self.client.get() {
                client.resume();
            }
            return;
        }

        if istr & ISTR_SUSP != 0 {
            self.hw.set_istr(!ISTR_SUSP);
            self.hw.set_cntr(self.hw.cntr() | CNTR_FSUSP);
            usb_debug!("usb: suspend");
            if let Some(client) = self.client.get() {
                client.suspend();
            }
            return;
        }

        if istr & ISTR_RESET != 0 {
            self.hw.set_istr(!ISTR_RESET);
            self.handle_reset();
            return;
        }

        if self.poll_in_endpoints && istr & ISTR_SOF != 0 {
            self.hw.set_istr(!ISTR_SOF);
            self.handle_sof();
            return;
        }

        if istr & ISTR_CTR != 0 {
            self.handle_transfer((istr & ISTR_EP_ID) as u8);
        }
    }

    /// Queue a packet on an IN endpoint. Returns false for an endpoint
    /// index out of range, an unarmed buffer descriptor, or a packet
    /// larger than the configured IN size.
    pub fn ep_write(&self, ept: u8, buf: &[u8]) -> bool {
        if ept as usize >= N_ENDPOINTS {
            return false;
        }
        let addr = self.hw.pma_read(bd_tx_addr(ept));
        if addr == 0 {
            return false;
        }
        if buf.len() > self.endpoints[ept as usize].size_in as usize {
            return false;
        }

        self.pma_write_bytes(addr, buf);
        self.hw.pma_write(bd_tx_count(ept), buf.len() as u16);
        self.epr_toggle(ept, EP_TX_VALID, EPTX_STAT);
        true
    }

    /// Drain the most recent OUT packet into `buf` and re-arm reception.
    /// Returns the number of bytes copied; a packet longer than `buf` is
    /// silently truncated. Returns 0 for a disabled endpoint.
    pub fn ep_read(&self, ept: u8, buf: &mut [u8]) -> u16 {
        if ept as usize >= N_ENDPOINTS {
            return 0;
        }
        let addr = self.hw.pma_read(bd_rx_addr(ept));
        if addr == 0 {
            return 0;
        }

        let count = self.hw.pma_read(bd_rx_count(ept)) & COUNT_RX_MASK;
        let len = min(count as usize, buf.len());
        self.pma_read_bytes(addr, &mut buf[..len]);
        self.epr_toggle(ept, EP_RX_VALID, EPRX_STAT);
        len as u16
    }

    /// Arm a (possibly multi-packet) reply on endpoint 0. The first
    /// `min(reqlen, buf.len())` bytes are sent in 64-byte packets; the
    /// first goes out immediately, the rest as each IN transaction
    /// completes. An empty `buf` produces a zero-length packet.
    pub fn control_in(&self, buf: &'a [u8], reqlen: u16) {
        let total = min(reqlen as usize, buf.len());
        let first = min(total, EP0_SIZE);
        self.ep_write(0, &buf[..first]);
        self.ctrl_in_rest.set(if total > EP0_SIZE {
            Some(&buf[EP0_SIZE..total])
        } else {
            None
        });
    }

    /// The device serial number as a string descriptor: the factory
    /// 96-bit unique identifier rendered as 24 uppercase hex digits.
    /// Built on first use, then cached.
    pub fn serial_string_descriptor(&'a self) -> &'a [u8] {
        self.serial
            .get_or_init(|| {
                let uid = self.hw.device_uid();
                let mut bytes = [0u8; SERIAL_DESCRIPTOR_LEN];
                bytes[0] = SERIAL_DESCRIPTOR_LEN as u8;
                bytes[1] = DescriptorType::String as u8;
                let mut i = 2;
                for byte in uid {
                    for nibble in [byte >> 4, byte & 0xf] {
                        // UTF-16LE code units; the high byte stays zero.
                        bytes[i] = to_hex(nibble);
                        i += 2;
                    }
                }
                bytes
            })
            .as_slice()
    }

    // Packet memory.

    /// Lay the packet memory out: the buffer-descriptor table at offset
    /// 0, then every endpoint's IN and OUT buffers packed in index
    /// order. Zero-sized directions keep a descriptor pointing at the
    /// running watermark with a zero count; they are never armed.
    fn pma_init(&self) {
        let mut watermark = BTABLE_BYTES;
        for (i, ep) in self.endpoints.iter().enumerate() {
            let i = i as u8;
            self.hw.pma_write(bd_tx_addr(i), watermark);
            self.hw.pma_write(bd_tx_count(i), 0);
            watermark += ep.size_in;

            self.hw.pma_write(bd_rx_addr(i), watermark);
            self.hw.pma_write(bd_rx_count(i), rx_count_for_size(ep.size_out));
            watermark += ep.size_out;
        }
        self.hw.set_btable(0);
    }

    fn pma_write_bytes(&self, mut offset: u16, buf: &[u8]) {
        let mut chunks = buf.chunks_exact(2);
        for pair in chunks.by_ref() {
            self.hw
                .pma_write(offset, u16::from_le_bytes([pair[0], pair[1]]));
            offset += 2;
        }
        if let [last] = chunks.remainder() {
            self.hw.pma_write(offset, *last as u16);
        }
    }

    fn pma_read_bytes(&self, mut offset: u16, buf: &mut [u8]) {
        let mut chunks = buf.chunks_exact_mut(2);
        for pair in chunks.by_ref() {
            pair.copy_from_slice(&self.hw.pma_read(offset).to_le_bytes());
            offset += 2;
        }
        if let [last] = chunks.into_remainder() {
            *last = self.hw.pma_read(offset) as u8;
        }
    }

    // EPnR write discipline. STAT and DTOG bits flip when written as 1,
    // so a desired state is written as XOR of the current value, masked
    // to the bits being changed; everything in EPREG_MASK is written
    // back unchanged, which leaves the sticky CTR flags alone.

    fn epr_toggle(&self, ept: u8, target: u32, mask: u32) {
        let current = self.hw.epr(ept);
        self.hw.set_epr(ept, (current ^ target) & (EPREG_MASK | mask));
    }

    /// Zero the register: rw fields are written as 0, CTR flags cleared,
    /// and STAT/DTOG written back as themselves, which toggles them to 0.
    fn epr_clear(&self, ept: u8) {
        let current = self.hw.epr(ept);
        self.hw.set_epr(ept, current & !EPREG_MASK);
    }

    fn epr_clear_ctr_rx(&self, ept: u8) {
        let current = self.hw.epr(ept);
        self.hw.set_epr(ept, current & (EPREG_MASK ^ EP_CTR_RX));
    }

    fn epr_clear_ctr_tx(&self, ept: u8) {
        let current = self.hw.epr(ept);
        self.hw.set_epr(ept, current & (EPREG_MASK ^ EP_CTR_TX));
    }

    // Event handling.

    fn handle_reset(&self) {
        usb_debug!("usb: bus reset");
        if let Some(client) = self.client.get() {
            client.bus_reset(true);
        }

        for i in 0..N_ENDPOINTS as u8 {
            self.epr_clear(i);
        }

        self.state.set(DeviceState::Default);
        self.pending_address.set(None);
        self.ctrl_in_rest.set(None);
        self.sof_cursor.set(1);
        self.hw.set_daddr(DADDR_EF);

        self.hw
            .set_epr(0, self.hw.epr(0) | self.endpoints[0].ttype.epr_bits());
        self.epr_toggle(
            0,
            EP_RX_VALID | EP_TX_NAK,
            EPRX_STAT | EPTX_STAT | EP_DTOG_RX | EP_DTOG_TX,
        );

        if let Some(client) = self.client.get() {
            client.bus_reset(false);
        }
    }

    /// Bound the per-frame workload to a single candidate: advance the
    /// cursor over endpoints 1..7 and offer `packet_in` to that endpoint
    /// if its IN direction is configured, currently NAKing, and its
    /// address field matches.
    fn handle_sof(&self) {
        let ept = self.sof_cursor.get();
        self.sof_cursor.set(if ept + 1 >= N_ENDPOINTS as u8 {
            1
        } else {
            ept + 1
        });

        if self.endpoints[ept as usize].size_in != 0
            && self.hw.epr(ept) & (EPTX_STAT | EPADDR) == (EP_TX_NAK | ept as u32)
        {
            if let Some(client) = self.client.get() {
                client.packet_in(ept);
            }
        }
    }

    fn handle_transfer(&self, ept: u8) {
        if ept == 0 {
            self.handle_ep0();
            return;
        }
        if ept as usize >= N_ENDPOINTS {
            // The peripheral reported an endpoint this table never
            // configured; nothing to acknowledge.
            return;
        }

        if self.hw.epr(ept) & EP_CTR_RX != 0 {
            self.epr_clear_ctr_rx(ept);
            if let Some(client) = self.client.get() {
                client.packet_out(ept);
            }
        }
        if self.hw.epr(ept) & EP_CTR_TX != 0 {
            self.epr_clear_ctr_tx(ept);
        }
    }

    fn handle_ep0(&self) {
        let epr = self.hw.epr(0);

        if epr & EP_CTR_RX != 0 {
            let is_setup = epr & EP_SETUP != 0;
            self.epr_clear_ctr_rx(0);

            let mut packet = [0u8; 8];
            let len = self.ep_read(0, &mut packet);

            if !is_setup {
                // Status-stage OUT of a device-to-host transfer.
                return;
            }

            let handled = match SetupPacket::parse(&packet[..len as usize]) {
                Some(setup) => {
                    if self.handle_ctrl_setup(&setup) {
                        if setup.request_type.direction() == TransferDirection::HostToDevice {
                            // No data stage towards us: complete the
                            // status stage with a zero-length IN.
                            self.control_reply(&[], setup.length);
                        }
                        true
                    } else {
                        false
                    }
                }
                None => false,
            };

            if !handled {
                usb_debug!("usb: ep0 request rejected");
                self.epr_toggle(0, EP_TX_STALL, EPTX_STAT);
                self.epr_toggle(0, EP_RX_STALL, EPRX_STAT);
            }
            return;
        }

        if epr & EP_CTR_TX != 0 {
            self.epr_clear_ctr_tx(0);

            // An EP0 IN completed. A pending SET_ADDRESS takes effect
            // exactly now, after its status stage went out.
            if let Some(address) = self.pending_address.take() {
                self.hw.set_daddr(DADDR_EF | address as u32);
                self.state.set(DeviceState::Address);
                usb_debug!("usb: address {} applied", address);
            }

            self.control_in_resume();
        }
    }

    // Control engine.

    fn handle_ctrl_setup(&self, setup: &SetupPacket) -> bool {
        match setup.request_type.kind() {
            RequestKind::Class => {
                return self
                    .client
                    .get()
                    .map_or(false, |c| c.ctrl_class_request(setup));
            }
            RequestKind::Vendor => {
                return self
                    .client
                    .get()
                    .map_or(false, |c| c.ctrl_vendor_request(setup));
            }
            _ => {}
        }

        let request = match setup.standard_request() {
            Some(request) => request,
            None => return false,
        };

        match request {
            StandardRequest::GetStatus => self.get_status(setup),
            StandardRequest::ClearFeature => self.endpoint_feature(setup, false),
            StandardRequest::SetFeature => self.endpoint_feature(setup, true),
            StandardRequest::SetAddress => self.set_address(setup),
            StandardRequest::GetDescriptor => self.get_descriptor(setup),
            StandardRequest::GetConfiguration => self.get_configuration(setup),
            StandardRequest::SetConfiguration => self.set_configuration(setup),
            StandardRequest::GetInterface => self.get_interface(setup),
            StandardRequest::SetInterface => self.set_interface(setup),
            StandardRequest::SetDescriptor | StandardRequest::SynchFrame => false,
        }
    }

    /// Arm a short (single-packet) reply built on the caller's stack.
    fn control_reply(&self, buf: &[u8], reqlen: u16) {
        let total = min(reqlen as usize, buf.len());
        self.ep_write(0, &buf[..min(total, EP0_SIZE)]);
        self.ctrl_in_rest.set(None);
    }

    fn control_in_resume(&self) -> bool {
        let rest = match self.ctrl_in_rest.take() {
            Some(rest) => rest,
            None => return false,
        };
        let chunk = min(rest.len(), EP0_SIZE);
        self.ep_write(0, &rest[..chunk]);
        if rest.len() > EP0_SIZE {
            self.ctrl_in_rest.set(Some(&rest[EP0_SIZE..]));
        }
        true
    }

    fn config_descriptor(&self) -> Option<&'a [u8]> {
        self.client.get().and_then(|c| c.configuration_descriptor())
    }

    fn interface_descriptor(&self, interface: u16) -> Option<&'a [u8]> {
        self.client
            .get()
            .and_then(|c| c.interface_descriptor(interface))
    }

    fn configuration_value(&self) -> u8 {
        self.config_descriptor()
            .map_or(0, |cfg| if cfg.len() > 5 { cfg[5] } else { 0 })
    }

    fn get_status(&self, setup: &SetupPacket) -> bool {
        if setup.request_type.direction() != TransferDirection::DeviceToHost
            || self.state.get() != DeviceState::Configured
        {
            return false;
        }

        let mut status = [0u8; 2];
        match setup.request_type.recipient() {
            Recipient::Device => {
                if let Some(cfg) = self.config_descriptor() {
                    if cfg.len() > 7 && cfg[7] & descriptors::CONFIG_ATTR_SELF_POWERED != 0 {
                        status[0] |= 1 << 0;
                    }
                }
            }
            Recipient::Interface => {
                if self.interface_descriptor(setup.index).is_none() {
                    return false;
                }
            }
            Recipient::Endpoint => {
                let ept = (setup.index & 0x7) as u8;
                let slot = self.endpoints[ept as usize];
                if setup.index & descriptors::ENDPOINT_ADDRESS_DIR_IN != 0 {
                    if slot.size_in == 0 {
                        return false;
                    }
                    if self.hw.epr(ept) & EPTX_STAT == EP_TX_STALL {
                        status[0] |= 1 << 0;
                    }
                } else {
                    if slot.size_out == 0 {
                        return false;
                    }
                    if self.hw.epr(ept) & EPRX_STAT == EP_RX_STALL {
                        status[0] |= 1 << 0;
                    }
                }
            }
            _ => {}
        }

        self.control_reply(&status, setup.length);
        true
    }

    fn endpoint_feature(&self, setup: &SetupPacket, halt: bool) -> bool {
        if setup.request_type.direction() != TransferDirection::HostToDevice
            || setup.request_type.recipient() != Recipient::Endpoint
            || setup.value != descriptors::FEATURE_ENDPOINT_HALT
            || self.state.get() != DeviceState::Configured
        {
            return false;
        }

        let ept = (setup.index & 0x7) as u8;
        let slot = self.endpoints[ept as usize];
        if slot.ttype != TransferType::Bulk && slot.ttype != TransferType::Interrupt {
            return false;
        }

        if setup.index & descriptors::ENDPOINT_ADDRESS_DIR_IN != 0 {
            if slot.size_in == 0 {
                return false;
            }
            if halt {
                self.epr_toggle(ept, EP_TX_STALL, EPTX_STAT);
            } else {
                // Back to NAK with the data toggle reset to DATA0.
                self.epr_toggle(ept, EP_TX_NAK, EPTX_STAT | EP_DTOG_TX);
            }
        } else {
            if slot.size_out == 0 {
                return false;
            }
            if halt {
                self.epr_toggle(ept, EP_RX_STALL, EPRX_STAT);
            } else {
                self.epr_toggle(ept, EP_RX_VALID, EPRX_STAT | EP_DTOG_RX);
            }
        }
        true
    }

    fn set_address(&self, setup: &SetupPacket) -> bool {
        if setup.request_type.direction() != TransferDirection::HostToDevice
            || setup.request_type.recipient() != Recipient::Device
        {
            return false;
        }

        match self.state.get() {
            // Address 0 in the default state is a no-op, but still ACKed.
            DeviceState::Default if setup.value == 0 => {}
            DeviceState::Default | DeviceState::Address => {
                let address = (setup.value as u32 & DADDR_ADD) as u8;
                // The bus still runs on the old address until the status
                // stage completes; only latch it here.
                self.pending_address.set(Some(address));
                usb_debug!("usb: address {} latched", address);
                if let Some(client) = self.client.get() {
                    client.address_assigned(address);
                }
            }
            DeviceState::Configured => {}
        }
        true
    }

    fn get_descriptor(&self, setup: &SetupPacket) -> bool {
        if setup.request_type.direction() != TransferDirection::DeviceToHost {
            return false;
        }

        match setup.request_type.recipient() {
            Recipient::Device => match DescriptorType::from_byte((setup.value >> 8) as u8) {
                Some(DescriptorType::Device) => {
                    let desc = match self.client.get().and_then(|c| c.device_descriptor()) {
                        Some(desc) if !desc.is_empty() => desc,
                        _ => return false,
                    };
                    let len = min(desc[0] as usize, desc.len());
                    self.control_in(&desc[..len], setup.length);
                    true
                }
                Some(DescriptorType::Configuration) => {
                    let cfg = match self.config_descriptor() {
                        Some(cfg) if cfg.len() >= 4 => cfg,
                        _ => return false,
                    };
                    let total = get_u16(&cfg[2..4]).unwrap_or(0) as usize;
                    let len = min(total, cfg.len());
                    self.control_in(&cfg[..len], setup.length);
                    true
                }
                Some(DescriptorType::String) => {
                    let desc = match self
                        .client
                        .get()
                        .and_then(|c| c.string_descriptor(setup.index, setup.value as u8))
                    {
                        Some(desc) if !desc.is_empty() => desc,
                        _ => return false,
                    };
                    let len = min(desc[0] as usize, desc.len());
                    self.control_in(&desc[..len], setup.length);
                    true
                }
                _ => false,
            },
            Recipient::Interface => self
                .client
                .get()
                .map_or(false, |c| c.ctrl_interface_descriptor(setup)),
            _ => false,
        }
    }

    fn get_configuration(&self, setup: &SetupPacket) -> bool {
        if setup.request_type.direction() != TransferDirection::DeviceToHost
            || setup.request_type.recipient() != Recipient::Device
        {
            return false;
        }

        let value = if self.state.get() == DeviceState::Configured {
            self.configuration_value()
        } else {
            0
        };
        self.control_reply(&[value], setup.length);
        true
    }

    fn set_configuration(&self, setup: &SetupPacket) -> bool {
        if setup.request_type.direction() != TransferDirection::HostToDevice
            || setup.request_type.recipient() != Recipient::Device
            || self.state.get() == DeviceState::Default
        {
            return false;
        }

        if setup.value == 0 {
            self.state.set(DeviceState::Address);
            for i in 1..N_ENDPOINTS as u8 {
                self.epr_clear(i);
            }
        } else if setup.value as u8 == self.configuration_value() {
            usb_debug!("usb: configured");
            self.state.set(DeviceState::Configured);

            for i in 1..N_ENDPOINTS as u8 {
                let slot = self.endpoints[i as usize];
                if slot.size_in == 0 && slot.size_out == 0 {
                    continue;
                }

                self.epr_clear(i);
                self.hw
                    .set_epr(i, self.hw.epr(i) | slot.ttype.epr_bits() | i as u32);

                if slot.size_in != 0 {
                    self.epr_toggle(i, EP_TX_NAK, EPTX_STAT | EP_DTOG_TX);
                }
                if slot.size_out != 0 {
                    self.epr_toggle(i, EP_RX_VALID, EPRX_STAT | EP_DTOG_RX);
                }
            }
        } else {
            return false;
        }
        true
    }

    fn get_interface(&self, setup: &SetupPacket) -> bool {
        if setup.request_type.direction() != TransferDirection::DeviceToHost
            || setup.request_type.recipient() != Recipient::Interface
            || self.state.get() != DeviceState::Configured
        {
            return false;
        }

        let itf = match self.interface_descriptor(setup.index) {
            Some(itf) if itf.len() >= 4 => itf,
            _ => return false,
        };
        // bAlternateSetting, one byte.
        self.control_in(&itf[3..4], setup.length);
        true
    }

    fn set_interface(&self, setup: &SetupPacket) -> bool {
        if setup.request_type.direction() != TransferDirection::HostToDevice
            || setup.request_type.recipient() != Recipient::Interface
            || self.state.get() != DeviceState::Configured
        {
            return false;
        }

        // No alternate settings exist, but re-selecting the current one
        // is accepted.
        match self.interface_descriptor(setup.index) {
            Some(itf) if itf.len() >= 4 => itf[3] == setup.value as u8,
            _ => false,
        }
    }
}

fn to_hex(nibble: u8) -> u8 {
    if nibble > 9 {
        nibble - 10 + b'A'
    } else {
        nibble + b'0'
    }
}

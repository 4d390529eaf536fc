//! Register map of the STM32 full-speed device peripheral and its MMIO
//! binding.
//!
//! The register file is the classic `EPnR` layout: eight endpoint
//! control/status registers followed by the peripheral control, interrupt
//! status, frame number, device address and buffer-table registers, with
//! the packet memory area mapped as 16-bit words immediately after the
//! peripheral on G4-class parts.
//!
//! The `EPnR` registers mix three write disciplines in one word: plain
//! read-write fields (`EA`, `EP_TYPE`, `EP_KIND`), toggle-on-write-1 bits
//! (`STAT_TX/RX`, `DTOG_TX/RX`) and clear-on-write-0 flags
//! (`CTR_TX/RX`). The bit constants below carry the vendor header names
//! and feed the toggle-write helpers in [`crate::usbd`].

use core::marker::PhantomData;
use core::ops::Deref;

use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::register_structs;
use tock_registers::registers::{ReadOnly, ReadWrite};

use crate::hil::UsbPeripheral;

// EPnR bits.
pub const EP_CTR_RX: u32 = 1 << 15;
pub const EP_DTOG_RX: u32 = 1 << 14;
pub const EPRX_STAT: u32 = 0b11 << 12;
pub const EP_SETUP: u32 = 1 << 11;
pub const EP_TYPE: u32 = 0b11 << 9;
pub const EP_KIND: u32 = 1 << 8;
pub const EP_CTR_TX: u32 = 1 << 7;
pub const EP_DTOG_TX: u32 = 1 << 6;
pub const EPTX_STAT: u32 = 0b11 << 4;
pub const EPADDR: u32 = 0xf;

/// The bits that are *not* toggled by a write: everything a
/// read-modify-write must write back as-is (rw fields) or as 1 (the
/// sticky `CTR` flags) to leave them unchanged.
pub const EPREG_MASK: u32 = EP_CTR_RX | EP_SETUP | EP_TYPE | EP_KIND | EP_CTR_TX | EPADDR;

// STAT_TX / STAT_RX states, in field position.
pub const EP_TX_DISABLED: u32 = 0b00 << 4;
pub const EP_TX_STALL: u32 = 0b01 << 4;
pub const EP_TX_NAK: u32 = 0b10 << 4;
pub const EP_TX_VALID: u32 = 0b11 << 4;
pub const EP_RX_DISABLED: u32 = 0b00 << 12;
pub const EP_RX_STALL: u32 = 0b01 << 12;
pub const EP_RX_NAK: u32 = 0b10 << 12;
pub const EP_RX_VALID: u32 = 0b11 << 12;

// EP_TYPE values, in field position.
pub const EP_TYPE_BULK: u32 = 0b00 << 9;
pub const EP_TYPE_CONTROL: u32 = 0b01 << 9;
pub const EP_TYPE_INTERRUPT: u32 = 0b11 << 9;

// ISTR bits.
pub const ISTR_CTR: u32 = 1 << 15;
pub const ISTR_PMAOVR: u32 = 1 << 14;
pub const ISTR_ERR: u32 = 1 << 13;
pub const ISTR_WKUP: u32 = 1 << 12;
pub const ISTR_SUSP: u32 = 1 << 11;
pub const ISTR_RESET: u32 = 1 << 10;
pub const ISTR_SOF: u32 = 1 << 9;
pub const ISTR_DIR: u32 = 1 << 4;
pub const ISTR_EP_ID: u32 = 0xf;

// CNTR bits.
pub const CNTR_CTRM: u32 = 1 << 15;
pub const CNTR_WKUPM: u32 = 1 << 12;
pub const CNTR_SUSPM: u32 = 1 << 11;
pub const CNTR_RESETM: u32 = 1 << 10;
pub const CNTR_SOFM: u32 = 1 << 9;
pub const CNTR_RESUME: u32 = 1 << 4;
pub const CNTR_FSUSP: u32 = 1 << 3;
pub const CNTR_LPMODE: u32 = 1 << 2;
pub const CNTR_PDWN: u32 = 1 << 1;
pub const CNTR_FRES: u32 = 1 << 0;

// DADDR bits.
pub const DADDR_EF: u32 = 1 << 7;
pub const DADDR_ADD: u32 = 0x7f;

// BCDR bits.
pub const BCDR_DPPU: u32 = 1 << 15;

// RX buffer-descriptor count encoding.
pub const COUNT_RX_BLSIZE: u16 = 1 << 15;
pub const COUNT_RX_NUM_BLOCK_SHIFT: u16 = 10;
pub const COUNT_RX_MASK: u16 = 0x3ff;

register_structs! {
    /// The peripheral register file.
    pub UsbRegisters {
        (0x000 => pub epr: [ReadWrite<u32>; 8]),
        (0x020 => _reserved0),
        (0x040 => pub cntr: ReadWrite<u32>),
        (0x044 => pub istr: ReadWrite<u32>),
        (0x048 => pub fnr: ReadOnly<u32>),
        (0x04c => pub daddr: ReadWrite<u32>),
        (0x050 => pub btable: ReadWrite<u32>),
        (0x054 => pub lpmcsr: ReadWrite<u32>),
        (0x058 => pub bcdr: ReadWrite<u32>),
        (0x05c => @END),
    }
}

register_structs! {
    /// The 1 KiB packet memory area, viewed as 16-bit words.
    pub PacketMemory {
        (0x000 => pub words: [ReadWrite<u16>; 512]),
        (0x400 => @END),
    }
}

register_structs! {
    /// The factory-programmed 96-bit unique device identifier.
    pub UidRegisters {
        (0x00 => pub uid: [ReadOnly<u32>; 3]),
        (0x0c => @END),
    }
}

/// A pointer to statically allocated memory-mapped registers.
pub struct StaticRef<T> {
    ptr: *const T,
    _phantom: PhantomData<T>,
}

impl<T> StaticRef<T> {
    /// # Safety
    ///
    /// `ptr` must point to a live register block of type `T` for the
    /// program's entire lifetime.
    pub const unsafe fn new(ptr: *const T) -> StaticRef<T> {
        StaticRef {
            ptr,
            _phantom: PhantomData,
        }
    }
}

impl<T> Clone for StaticRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for StaticRef<T> {}

impl<T> Deref for StaticRef<T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.ptr }
    }
}

const USB_BASE: StaticRef<UsbRegisters> =
    unsafe { StaticRef::new(0x4000_5c00 as *const UsbRegisters) };
const USB_PMA_BASE: StaticRef<PacketMemory> =
    unsafe { StaticRef::new(0x4000_6000 as *const PacketMemory) };
const UID_BASE: StaticRef<UidRegisters> =
    unsafe { StaticRef::new(0x1fff_7590 as *const UidRegisters) };

/// The memory-mapped USB full-speed device peripheral.
///
/// Clocking and reset of the peripheral are the integrator's
/// responsibility and must happen before `Usbd::init`.
pub struct UsbFs {
    registers: StaticRef<UsbRegisters>,
    pma: StaticRef<PacketMemory>,
    uid: StaticRef<UidRegisters>,
}

impl UsbFs {
    /// The peripheral at its STM32G4 bus addresses.
    pub const fn new() -> UsbFs {
        UsbFs {
            registers: USB_BASE,
            pma: USB_PMA_BASE,
            uid: UID_BASE,
        }
    }
}

// Single-core targets; all register access is word-sized and volatile.
unsafe impl Sync for UsbFs {}

unsafe impl UsbPeripheral for UsbFs {
    fn epr(&self, ept: u8) -> u32 {
        self.registers.epr[ept as usize].get()
    }

    fn set_epr(&self, ept: u8, value: u32) {
        self.registers.epr[ept as usize].set(value);
    }

    fn istr(&self) -> u32 {
        self.registers.istr.get()
    }

    fn set_istr(&self, value: u32) {
        self.registers.istr.set(value);
    }

    fn cntr(&self) -> u32 {
        self.registers.cntr.get()
    }

    fn set_cntr(&self, value: u32) {
        self.registers.cntr.set(value);
    }

    fn set_daddr(&self, value: u32) {
        self.registers.daddr.set(value);
    }

    fn set_btable(&self, value: u32) {
        self.registers.btable.set(value);
    }

    fn enable_dp_pullup(&self) {
        self.registers.bcdr.set(self.registers.bcdr.get() | BCDR_DPPU);
    }

    fn pma_read(&self, offset: u16) -> u16 {
        self.pma.words[offset as usize / 2].get()
    }

    fn pma_write(&self, offset: u16, value: u16) {
        self.pma.words[offset as usize / 2].set(value);
    }

    fn device_uid(&self) -> [u8; 12] {
        let mut uid = [0; 12];
        for (i, word) in self.uid.uid.iter().enumerate() {
            uid[4 * i..4 * i + 4].copy_from_slice(&word.get().to_le_bytes());
        }
        uid
    }
}

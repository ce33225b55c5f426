use core::ptr;

use bitflags::bitflags;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Register {
    pub(crate) offset: usize,
}

// E1000 registers, as byte offsets into the register BAR.
// see section 13 of the 8254x family software developer's manual.

impl Register {
    /// Device Control (read/write)
    pub const CTL: Self = Self::new(0x00000);
    /// Interrupt Cause Read (read, write 1 to clear)
    pub const ICR: Self = Self::new(0x000c0);
    /// Interrupt Mask Set (read/write)
    pub const IMS: Self = Self::new(0x000d0);
    /// Receive Control (read/write)
    pub const RCTL: Self = Self::new(0x00100);
    /// Transmit Control (read/write)
    pub const TCTL: Self = Self::new(0x00400);
    /// Transmit Inter-Packet Gap (read/write)
    pub const TIPG: Self = Self::new(0x00410);
    /// Receive Descriptor Base Address Low
    pub const RDBAL: Self = Self::new(0x02800);
    /// Receive Descriptor Base Address High
    pub const RDBAH: Self = Self::new(0x02804);
    /// Receive Descriptor Length
    pub const RDLEN: Self = Self::new(0x02808);
    /// Receive Descriptor Head
    pub const RDH: Self = Self::new(0x02810);
    /// Receive Descriptor Tail
    pub const RDT: Self = Self::new(0x02818);
    /// Receive Delay Timer
    pub const RDTR: Self = Self::new(0x02820);
    /// Receive Interrupt Absolute Delay Timer
    pub const RADV: Self = Self::new(0x0282c);
    /// Transmit Descriptor Base Address Low
    pub const TDBAL: Self = Self::new(0x03800);
    /// Transmit Descriptor Base Address High
    pub const TDBAH: Self = Self::new(0x03804);
    /// Transmit Descriptor Length
    pub const TDLEN: Self = Self::new(0x03808);
    /// Transmit Descriptor Head
    pub const TDH: Self = Self::new(0x03810);
    /// Transmit Descriptor Tail
    pub const TDT: Self = Self::new(0x03818);
    /// Multicast Table Array, 128 entries
    pub const MTA: Self = Self::new(0x05200);
    /// Receive Address, pairs of low/high words
    pub const RA: Self = Self::new(0x05400);

    /// Number of 32-bit entries in the multicast table.
    pub const MTA_LEN: usize = 4096 / 32;

    const fn new(offset: usize) -> Self {
        Self { offset }
    }

    /// The `index`-th 32-bit register of an array starting at `self`.
    #[must_use]
    pub const fn at(self, index: usize) -> Self {
        Self::new(self.offset + index * 4)
    }

    #[must_use]
    pub const fn offset(self) -> usize {
        self.offset
    }
}

bitflags! {
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Control : u32 {
        /// full reset
        const RST = 0x0040_0000;
    }

    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TransmitControl : u32 {
        /// enable tx
        const EN = 0x0000_0002;
        /// pad short packets
        const PSP = 0x0000_0008;
        /// collision threshold of 16 retries
        const CT_16 = 0x0000_0100;
        /// collision distance of 64 byte times
        const COLD_64 = 0x0004_0000;
    }

    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ReceiveControl : u32 {
        /// enable
        const EN = 0x0000_0002;
        /// broadcast enable
        const BAM = 0x0000_8000;
        /// strip ethernet CRC
        const SECRC = 0x0400_0000;
    }

    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interrupt : u32 {
        /// transmit descriptor written back
        const TXDW = 1 << 0;
        /// receiver descriptor written back
        const RXDW = 1 << 7;
    }
}

impl ReceiveControl {
    /// 2048-byte receive buffers (`BSIZE` = 00, `BSEX` = 0).
    pub const SZ_2048: Self = Self::empty();
}

/// Address-valid bit of the high receive-address word.
pub const RA_AV: u32 = 1 << 31;

/// Access to the device's memory-mapped 32-bit registers.
pub trait RegisterBlock: Send {
    fn read(&self, reg: Register) -> u32;

    fn write(&mut self, reg: Register, value: u32);
}

/// Registers mapped at a fixed address.
#[derive(custom_debug_derive::Debug)]
pub struct Mmio {
    #[debug(format = "{:#x}")]
    base_addr: usize,
}

impl Mmio {
    /// # Safety
    ///
    /// `base_addr` must be the mapped, uncached address of an e1000 register
    /// BAR, and nothing else may access those registers.
    #[must_use]
    pub unsafe fn new(base_addr: usize) -> Self {
        Self { base_addr }
    }

    fn register_addr(&self, reg: Register) -> usize {
        self.base_addr + reg.offset
    }
}

impl RegisterBlock for Mmio {
    fn read(&self, reg: Register) -> u32 {
        let addr = self.register_addr(reg);
        unsafe { ptr::with_exposed_provenance::<u32>(addr).read_volatile() }
    }

    fn write(&mut self, reg: Register, value: u32) {
        let addr = self.register_addr(reg);
        unsafe {
            ptr::with_exposed_provenance_mut::<u32>(addr).write_volatile(value);
        }
    }
}

use alloc::boxed::Box;
use core::{mem, ptr::NonNull};

use bitflags::bitflags;

/// Legacy transmit descriptor.
///
/// See section 3.3.3 of the 8254x family software developer's manual.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxDesc {
    pub addr: u64,
    pub length: u16,
    pub cso: u8,
    pub cmd: u8,
    pub status: u8,
    pub css: u8,
    pub special: u16,
}

/// Receive descriptor.
///
/// See section 3.2.3 of the 8254x family software developer's manual.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxDesc {
    pub addr: u64,
    pub length: u16,
    pub csum: u16,
    pub status: u8,
    pub errors: u8,
    pub special: u16,
}

const _: () = assert!(mem::size_of::<TxDesc>() == 16);
const _: () = assert!(mem::size_of::<RxDesc>() == 16);

bitflags! {
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TxCommand : u8 {
        /// end of packet
        const EOP = 0x01;
        /// report status
        const RS = 0x08;
    }

    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TxStatus : u8 {
        /// descriptor done
        const DD = 0x01;
    }

    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RxStatus : u8 {
        /// descriptor done
        const DD = 0x01;
        /// end of packet
        const EOP = 0x02;
    }
}

/// Descriptor types that carry a one-byte status field written by the device.
pub(crate) trait Descriptor: Copy + Default {
    const STATUS_OFFSET: usize;
}

impl Descriptor for TxDesc {
    const STATUS_OFFSET: usize = mem::offset_of!(Self, status);
}

impl Descriptor for RxDesc {
    const STATUS_OFFSET: usize = mem::offset_of!(Self, status);
}

// The device requires 16-byte aligned rings whose length is a multiple of
// 128 bytes.
#[repr(C, align(128))]
struct RingMemory<D, const N: usize>([D; N]);

/// A descriptor ring shared with the device.
///
/// Every access is volatile since the device reads and writes the ring
/// behind the compiler's back.
pub(crate) struct DescRing<D, const N: usize> {
    ring: NonNull<RingMemory<D, N>>,
}

unsafe impl<D, const N: usize> Send for DescRing<D, N> where D: Send {}

impl<D, const N: usize> DescRing<D, N>
where
    D: Descriptor,
{
    const BYTE_LEN: usize = mem::size_of::<RingMemory<D, N>>();

    pub(crate) fn new() -> Self {
        const { assert!(Self::BYTE_LEN % 128 == 0) };
        let ring = Box::new(RingMemory([D::default(); N]));
        Self {
            ring: NonNull::from(Box::leak(ring)),
        }
    }

    /// Bus address of the first descriptor, exposed for the device to use.
    pub(crate) fn dma_addr(&self) -> u64 {
        self.ring.as_ptr().expose_provenance() as u64
    }

    #[expect(clippy::cast_possible_truncation)]
    pub(crate) fn byte_len() -> u32 {
        Self::BYTE_LEN as u32
    }

    fn slot(&self, index: usize) -> *mut D {
        assert!(index < N, "descriptor index out of range: {index}");
        unsafe { (&raw mut (*self.ring.as_ptr()).0).cast::<D>().add(index) }
    }

    pub(crate) fn read(&self, index: usize) -> D {
        unsafe { self.slot(index).read_volatile() }
    }

    pub(crate) fn write(&mut self, index: usize, desc: D) {
        unsafe { self.slot(index).write_volatile(desc) }
    }

    pub(crate) fn status(&self, index: usize) -> u8 {
        unsafe {
            self.slot(index)
                .cast::<u8>()
                .add(D::STATUS_OFFSET)
                .read_volatile()
        }
    }
}

impl<D, const N: usize> Drop for DescRing<D, N> {
    fn drop(&mut self) {
        drop(unsafe { Box::from_raw(self.ring.as_ptr()) });
    }
}

//! In-memory e1000 for host tests.
//!
//! [`SimDevice`] keeps the register file in atomics and plays the hardware
//! side of both rings through the DMA addresses the driver programmed.
//! [`TestNet`] is a bounded packet-buffer pool that records what the driver
//! frees and delivers.

extern crate std;

use alloc::{boxed::Box, vec::Vec};
use core::{
    ptr::{self, NonNull},
    slice,
    sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
};
use std::sync::Mutex;

use ksync::{Platform as _, testing::HostPlatform};

use crate::{
    Control, Interrupt, NetStack, PacketBuffer, RX_BUFFER_SIZE, RX_RING_SIZE, ReceiveControl,
    Register, RegisterBlock, RxDesc, RxStatus, TX_RING_SIZE, TxCommand, TxDesc, TxStatus,
};

const REG_WORDS: usize = 0x6000 / 4;

pub(crate) struct SimDevice {
    regs: Box<[AtomicU32]>,
    sent: Mutex<Vec<Vec<u8>>>,
    missed: AtomicUsize,
}

impl SimDevice {
    pub(crate) fn new() -> Self {
        Self {
            regs: (0..REG_WORDS).map(|_| AtomicU32::new(0)).collect(),
            sent: Mutex::new(Vec::new()),
            missed: AtomicUsize::new(0),
        }
    }

    fn word(&self, reg: Register) -> &AtomicU32 {
        &self.regs[reg.offset / 4]
    }

    pub(crate) fn reg(&self, reg: Register) -> u32 {
        self.word(reg).load(Ordering::SeqCst)
    }

    fn set_reg(&self, reg: Register, value: u32) {
        self.word(reg).store(value, Ordering::SeqCst);
    }

    fn raise(&self, cause: Interrupt) {
        self.word(Register::ICR)
            .fetch_or(cause.bits(), Ordering::SeqCst);
    }

    fn ring_base(&self, low: Register, high: Register) -> u64 {
        u64::from(self.reg(low)) | (u64::from(self.reg(high)) << 32)
    }

    fn tx_slot(&self, index: usize) -> *mut TxDesc {
        assert!(index < TX_RING_SIZE);
        let base = self.ring_base(Register::TDBAL, Register::TDBAH);
        assert_ne!(base, 0, "transmit ring not programmed");
        unsafe { ptr::with_exposed_provenance_mut::<TxDesc>(usize::try_from(base).unwrap()).add(index) }
    }

    fn rx_slot(&self, index: usize) -> *mut RxDesc {
        assert!(index < RX_RING_SIZE);
        let base = self.ring_base(Register::RDBAL, Register::RDBAH);
        assert_ne!(base, 0, "receive ring not programmed");
        unsafe { ptr::with_exposed_provenance_mut::<RxDesc>(usize::try_from(base).unwrap()).add(index) }
    }

    pub(crate) fn tx_desc(&self, index: usize) -> TxDesc {
        unsafe { self.tx_slot(index).read_volatile() }
    }

    pub(crate) fn rx_desc(&self, index: usize) -> RxDesc {
        unsafe { self.rx_slot(index).read_volatile() }
    }

    /// Sends every descriptor between the head and the tail.
    pub(crate) fn process_tx(&self) -> usize {
        let tail = self.reg(Register::TDT) as usize;
        let mut head = self.reg(Register::TDH) as usize;
        let mut count = 0;
        while head != tail {
            let slot = self.tx_slot(head);
            let mut desc = unsafe { slot.read_volatile() };
            let addr = usize::try_from(desc.addr).unwrap();
            let frame = unsafe {
                slice::from_raw_parts(
                    ptr::with_exposed_provenance::<u8>(addr),
                    usize::from(desc.length),
                )
            };
            self.sent.lock().unwrap().push(frame.to_vec());
            if TxCommand::from_bits_retain(desc.cmd).contains(TxCommand::RS) {
                desc.status |= TxStatus::DD.bits();
                unsafe { slot.write_volatile(desc); }
            }
            head = (head + 1) % TX_RING_SIZE;
            count += 1;
        }
        self.set_reg(Register::TDH, u32::try_from(head).unwrap());
        if count > 0 {
            self.raise(Interrupt::TXDW);
        }
        count
    }

    /// Receives `frame` into the slot at the head, or misses it if software
    /// has not handed back any slot.
    pub(crate) fn inject_rx(&self, frame: &[u8]) -> bool {
        let rctl = ReceiveControl::from_bits_retain(self.reg(Register::RCTL));
        if !rctl.contains(ReceiveControl::EN) || !self.rx_slot_available() {
            self.missed.fetch_add(1, Ordering::SeqCst);
            return false;
        }
        self.write_back_rx(frame, RxStatus::DD | RxStatus::EOP, 0);
        true
    }

    /// Marks the descriptor at the receive head as received with a CRC error.
    pub(crate) fn inject_rx_error(&self) -> bool {
        if !self.rx_slot_available() {
            return false;
        }
        self.write_back_rx(&[], RxStatus::DD | RxStatus::EOP, 0x01);
        true
    }

    /// Writes back the first fragment of a frame spanning several
    /// descriptors, so `EOP` is clear.
    pub(crate) fn inject_rx_fragment(&self, frame: &[u8]) -> bool {
        if !self.rx_slot_available() {
            return false;
        }
        self.write_back_rx(frame, RxStatus::DD, 0);
        true
    }

    fn rx_slot_available(&self) -> bool {
        self.reg(Register::RDH) != self.reg(Register::RDT)
    }

    fn write_back_rx(&self, frame: &[u8], status: RxStatus, errors: u8) {
        assert!(frame.len() <= RX_BUFFER_SIZE);
        let head = self.reg(Register::RDH) as usize;
        let slot = self.rx_slot(head);
        let mut desc = unsafe { slot.read_volatile() };
        let addr = usize::try_from(desc.addr).unwrap();
        unsafe {
            ptr::copy_nonoverlapping(
                frame.as_ptr(),
                ptr::with_exposed_provenance_mut::<u8>(addr),
                frame.len(),
            );
        }
        desc.length = u16::try_from(frame.len()).unwrap();
        desc.status = status.bits();
        desc.errors = errors;
        unsafe { slot.write_volatile(desc); }

        self.set_reg(
            Register::RDH,
            u32::try_from((head + 1) % RX_RING_SIZE).unwrap(),
        );
        if self.reg(Register::IMS) & Interrupt::RXDW.bits() != 0 {
            self.raise(Interrupt::RXDW);
        }
    }

    /// Clears `DD` on the transmit descriptor at `index`, as if the device
    /// were still working on it.
    pub(crate) fn clear_tx_done(&self, index: usize) {
        let slot = self.tx_slot(index);
        let mut desc = unsafe { slot.read_volatile() };
        desc.status &= !TxStatus::DD.bits();
        unsafe { slot.write_volatile(desc); }
    }

    pub(crate) fn missed(&self) -> usize {
        self.missed.load(Ordering::SeqCst)
    }

    pub(crate) fn take_sent(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }
}

impl RegisterBlock for &SimDevice {
    fn read(&self, reg: Register) -> u32 {
        SimDevice::reg(self, reg)
    }

    fn write(&mut self, reg: Register, value: u32) {
        if reg == Register::CTL {
            if value & Control::RST.bits() != 0 {
                for word in &self.regs {
                    word.store(0, Ordering::SeqCst);
                }
            }
            self.set_reg(reg, value & !Control::RST.bits());
        } else if reg == Register::ICR {
            self.word(reg).fetch_and(!value, Ordering::SeqCst);
        } else {
            self.set_reg(reg, value);
        }
    }
}

pub(crate) struct TestBuf {
    data: NonNull<[u8; RX_BUFFER_SIZE]>,
    len: usize,
    id: usize,
}

unsafe impl Send for TestBuf {}

impl TestBuf {
    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        unsafe { &self.data.as_ref()[..self.len] }
    }
}

impl Drop for TestBuf {
    fn drop(&mut self) {
        drop(unsafe { Box::from_raw(self.data.as_ptr()) });
    }
}

impl PacketBuffer for TestBuf {
    fn dma_addr(&self) -> u64 {
        self.data.as_ptr().expose_provenance() as u64
    }

    fn len(&self) -> usize {
        self.len
    }

    fn set_len(&mut self, len: usize) {
        assert!(len <= RX_BUFFER_SIZE);
        self.len = len;
    }
}

/// Packet-buffer pool of the tests.
#[derive(Default)]
pub(crate) struct TestNet {
    /// Buffers `alloc_buffer` may still hand out, unlimited if `None`.
    budget: Mutex<Option<usize>>,
    next_id: AtomicUsize,
    freed: Mutex<Vec<usize>>,
    delivered: Mutex<Vec<TestBuf>>,
    delivered_with_interrupts_off: AtomicBool,
}

impl TestNet {
    pub(crate) fn with_budget(budget: usize) -> Self {
        let net = Self::default();
        net.set_budget(Some(budget));
        net
    }

    pub(crate) fn set_budget(&self, budget: Option<usize>) {
        *self.budget.lock().unwrap() = budget;
    }

    fn new_buf(&self, len: usize) -> TestBuf {
        let data = Box::new([0; RX_BUFFER_SIZE]);
        TestBuf {
            data: NonNull::from(Box::leak(data)),
            len,
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
        }
    }

    /// A transmit buffer holding `bytes`, outside the budget.
    pub(crate) fn frame(&self, bytes: &[u8]) -> TestBuf {
        let mut buf = self.new_buf(bytes.len());
        unsafe { buf.data.as_mut()[..bytes.len()].copy_from_slice(bytes); }
        buf
    }

    /// A transmit buffer claiming more bytes than one descriptor can carry.
    /// Its contents must never be read.
    pub(crate) fn oversized_frame(&self) -> TestBuf {
        let mut buf = self.new_buf(0);
        buf.len = usize::from(u16::MAX) + 1;
        buf
    }

    pub(crate) fn allocated(&self) -> usize {
        self.next_id.load(Ordering::SeqCst)
    }

    pub(crate) fn freed(&self) -> Vec<usize> {
        self.freed.lock().unwrap().clone()
    }

    pub(crate) fn take_delivered(&self) -> Vec<TestBuf> {
        std::mem::take(&mut *self.delivered.lock().unwrap())
    }

    /// Whether any frame arrived while a spin lock was held.
    pub(crate) fn delivered_with_interrupts_off(&self) -> bool {
        self.delivered_with_interrupts_off.load(Ordering::SeqCst)
    }
}

impl NetStack for &TestNet {
    type Buffer = TestBuf;

    fn alloc_buffer(&self, headroom: usize) -> Option<Self::Buffer> {
        assert_eq!(headroom, 0);
        let mut budget = self.budget.lock().unwrap();
        if let Some(left) = budget.as_mut() {
            *left = left.checked_sub(1)?;
        }
        Some(self.new_buf(0))
    }

    fn free_buffer(&self, buf: Self::Buffer) {
        let mut freed = self.freed.lock().unwrap();
        assert!(!freed.contains(&buf.id), "buffer {} freed twice", buf.id);
        freed.push(buf.id);
    }

    fn deliver(&self, buf: Self::Buffer) {
        if !HostPlatform::interrupts_enabled() {
            self.delivered_with_interrupts_off
                .store(true, Ordering::SeqCst);
        }
        self.delivered.lock().unwrap().push(buf);
    }
}

//! Driver for the Intel 8254x (e1000) family of network controllers.
//!
//! The device moves frames through two descriptor rings in main memory, one
//! for transmit and one for receive. Each ring slot is either owned by
//! software or by the device, and ownership changes hands through the ring's
//! head and tail registers and the descriptor-done status bit:
//!
//! - Transmit: software fills the slot at the tail and advances the tail.
//!   The device sends every slot between head and tail and sets
//!   descriptor-done on each. A sent frame's buffer stays stashed in the
//!   slot until software reuses the slot, and is freed then.
//! - Receive: every slot holds an empty buffer. The device fills slots
//!   starting at its head and sets descriptor-done. The tail register points
//!   at the last slot software handed back; software takes filled slots
//!   after the tail, swaps in a fresh buffer and advances the tail.
//!
//! Both paths run under one [`SpinMutex`]. Received frames are delivered to
//! the [`NetStack`] after the lock is released, so the stack may transmit a
//! reply from inside [`NetStack::deliver`].

#![no_std]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

extern crate alloc;

use core::{
    array, fmt, mem,
    sync::atomic::{self, AtomicU64, Ordering},
};

use arrayvec::ArrayVec;
use ksync::{Platform, SpinMutex, error::Location};
use snafu::Snafu;

pub use self::{
    desc::{RxDesc, RxStatus, TxCommand, TxDesc, TxStatus},
    net::{MacAddress, NetStack, PacketBuffer},
    regs::{
        Control, Interrupt, Mmio, RA_AV, ReceiveControl, Register, RegisterBlock, TransmitControl,
    },
};
use self::desc::DescRing;

mod desc;
mod net;
mod regs;
#[cfg(test)]
mod sim;

/// Number of transmit descriptors.
pub const TX_RING_SIZE: usize = 16;
/// Number of receive descriptors.
pub const RX_RING_SIZE: usize = 16;
/// Size of the data area of each receive buffer, as programmed into `RCTL`.
pub const RX_BUFFER_SIZE: usize = 2048;

const _: () = assert!(RX_BUFFER_SIZE == 2048, "RCTL is programmed with SZ_2048");

/// Transmit inter-packet gap: IPGT 10, IPGR1 8, IPGR2 6.
const TX_IPG: u32 = 0x0060_200a;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Station address the receive filter accepts.
    pub mac: MacAddress,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mac: MacAddress([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]),
        }
    }
}

#[derive(Debug, Snafu)]
pub enum InitError {
    #[snafu(display("out of packet buffers while filling receive slot {slot}"))]
    RxBufferAlloc {
        slot: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitErrorKind {
    /// Every transmit slot is still owned by the device.
    RingFull,
    /// The frame does not fit in a single descriptor.
    TooLong { len: usize },
}

/// A failed [`E1000::transmit`].
///
/// The driver did not take the packet; the caller owns it again.
pub struct TransmitError<B> {
    kind: TransmitErrorKind,
    buffer: B,
}

impl<B> TransmitError<B> {
    #[must_use]
    pub fn kind(&self) -> TransmitErrorKind {
        self.kind
    }

    #[must_use]
    pub fn buffer(&self) -> &B {
        &self.buffer
    }

    #[must_use]
    pub fn into_buffer(self) -> B {
        self.buffer
    }
}

impl<B> fmt::Debug for TransmitError<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransmitError")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl<B> fmt::Display for TransmitError<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TransmitErrorKind::RingFull => f.write_str("transmit ring full"),
            TransmitErrorKind::TooLong { len } => write!(f, "frame too long: {len} bytes"),
        }
    }
}

impl<B> core::error::Error for TransmitError<B> {}

/// Frame counters since initialization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Frames handed to the device for sending.
    pub transmitted: u64,
    /// Frames delivered to the network stack.
    pub received: u64,
    /// Received frames discarded by the driver.
    pub dropped: u64,
    /// Transmit attempts rejected because the ring was full.
    pub tx_ring_full: u64,
}

#[derive(Debug, Default)]
struct Counters {
    transmitted: AtomicU64,
    received: AtomicU64,
    dropped: AtomicU64,
    tx_ring_full: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> Stats {
        Stats {
            transmitted: self.transmitted.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            tx_ring_full: self.tx_ring_full.load(Ordering::Relaxed),
        }
    }
}

struct Rings<R, B> {
    regs: R,
    tx_ring: DescRing<TxDesc, TX_RING_SIZE>,
    /// Buffers of frames handed to the device, freed when their slot is
    /// reused.
    tx_bufs: [Option<B>; TX_RING_SIZE],
    rx_ring: DescRing<RxDesc, RX_RING_SIZE>,
    /// Always one empty buffer per receive slot.
    rx_bufs: ArrayVec<B, RX_RING_SIZE>,
}

/// An initialized e1000 device.
pub struct E1000<R, N, P>
where
    R: RegisterBlock,
    N: NetStack,
    P: Platform,
{
    rings: SpinMutex<Rings<R, N::Buffer>, P>,
    net: N,
    mac: MacAddress,
    counters: Counters,
}

impl<R, N, P> fmt::Debug for E1000<R, N, P>
where
    R: RegisterBlock,
    N: NetStack,
    P: Platform,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("E1000")
            .field("mac", &self.mac)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl<R, N, P> E1000<R, N, P>
where
    R: RegisterBlock,
    N: NetStack,
    P: Platform,
{
    /// Resets the device and brings up both rings.
    ///
    /// On failure the device has not been touched and every buffer taken
    /// from `net` has been returned.
    pub fn new(mut regs: R, net: N, config: Config) -> Result<Self, InitError> {
        let mut rx_bufs = ArrayVec::<N::Buffer, RX_RING_SIZE>::new();
        for slot in 0..RX_RING_SIZE {
            let Some(buf) = net.alloc_buffer(0) else {
                for buf in rx_bufs {
                    net.free_buffer(buf);
                }
                return RxBufferAllocSnafu { slot }.fail();
            };
            rx_bufs.push(buf);
        }

        // reset the device
        regs.write(Register::IMS, 0); // disable interrupts
        let ctl = Control::from_bits_retain(regs.read(Register::CTL));
        regs.write(Register::CTL, (ctl | Control::RST).bits());
        regs.write(Register::IMS, 0); // redisable interrupts
        atomic::fence(Ordering::SeqCst);

        // [E1000 14.5] Transmit initialization
        let mut tx_ring = DescRing::<TxDesc, TX_RING_SIZE>::new();
        for slot in 0..TX_RING_SIZE {
            tx_ring.write(
                slot,
                TxDesc {
                    status: TxStatus::DD.bits(),
                    ..TxDesc::default()
                },
            );
        }
        let (low, high) = split_addr(tx_ring.dma_addr());
        regs.write(Register::TDBAL, low);
        regs.write(Register::TDBAH, high);
        regs.write(Register::TDLEN, DescRing::<TxDesc, TX_RING_SIZE>::byte_len());
        regs.write(Register::TDH, 0);
        regs.write(Register::TDT, 0);

        // [E1000 14.4] Receive initialization
        let mut rx_ring = DescRing::<RxDesc, RX_RING_SIZE>::new();
        for (slot, buf) in rx_bufs.iter().enumerate() {
            rx_ring.write(
                slot,
                RxDesc {
                    addr: buf.dma_addr(),
                    ..RxDesc::default()
                },
            );
        }
        let (low, high) = split_addr(rx_ring.dma_addr());
        regs.write(Register::RDBAL, low);
        regs.write(Register::RDBAH, high);
        regs.write(Register::RDH, 0);
        regs.write(Register::RDT, ring_index(RX_RING_SIZE - 1));
        regs.write(Register::RDLEN, DescRing::<RxDesc, RX_RING_SIZE>::byte_len());

        // filter by station address
        regs.write(Register::RA, config.mac.low_word());
        regs.write(Register::RA.at(1), config.mac.high_word() | RA_AV);
        // multicast table
        for i in 0..Register::MTA_LEN {
            regs.write(Register::MTA.at(i), 0);
        }

        // transmitter control bits
        let tctl = TransmitControl::EN
            | TransmitControl::PSP
            | TransmitControl::CT_16
            | TransmitControl::COLD_64;
        regs.write(Register::TCTL, tctl.bits());
        regs.write(Register::TIPG, TX_IPG); // inter-pkt gap

        // receiver control bits
        let rctl = ReceiveControl::EN // enable receiver
            | ReceiveControl::BAM // enable broadcast
            | ReceiveControl::SZ_2048
            | ReceiveControl::SECRC; // strip CRC
        regs.write(Register::RCTL, rctl.bits());

        // ask e1000 for receive interrupts
        regs.write(Register::RDTR, 0); // interrupt after every received packet (no timer)
        regs.write(Register::RADV, 0); // interrupt after every packet (no timer)
        regs.write(Register::IMS, Interrupt::RXDW.bits()); // RX descriptor write-back done

        log::info!(
            "e1000: mac {}, {TX_RING_SIZE} tx / {RX_RING_SIZE} rx descriptors",
            config.mac
        );

        Ok(Self {
            rings: SpinMutex::new(Rings {
                regs,
                tx_ring,
                tx_bufs: array::from_fn(|_| None),
                rx_ring,
                rx_bufs,
            }),
            net,
            mac: config.mac,
            counters: Counters::default(),
        })
    }

    #[must_use]
    pub fn mac(&self) -> MacAddress {
        self.mac
    }

    #[must_use]
    pub fn stats(&self) -> Stats {
        self.counters.snapshot()
    }

    /// Queues `buf` for sending.
    ///
    /// On success the driver owns `buf` and frees it once the device is done
    /// with it. On failure nothing changed and `buf` is handed back.
    pub fn transmit(&self, buf: N::Buffer) -> Result<(), TransmitError<N::Buffer>> {
        let Ok(length) = u16::try_from(buf.len()) else {
            let len = buf.len();
            return Err(TransmitError {
                kind: TransmitErrorKind::TooLong { len },
                buffer: buf,
            });
        };

        let mut rings = self.rings.lock();
        let Rings {
            regs,
            tx_ring,
            tx_bufs,
            ..
        } = &mut *rings;

        let index = regs.read(Register::TDT) as usize % TX_RING_SIZE;
        let head = regs.read(Register::TDH) as usize % TX_RING_SIZE;
        let next = (index + 1) % TX_RING_SIZE;
        let done = TxStatus::from_bits_retain(tx_ring.status(index)).contains(TxStatus::DD);
        if !done || next == head {
            drop(rings);
            Counters::bump(&self.counters.tx_ring_full);
            log::warn!("e1000: transmit ring full");
            return Err(TransmitError {
                kind: TransmitErrorKind::RingFull,
                buffer: buf,
            });
        }

        if let Some(sent) = tx_bufs[index].take() {
            self.net.free_buffer(sent);
        }

        tx_ring.write(
            index,
            TxDesc {
                addr: buf.dma_addr(),
                length,
                cmd: (TxCommand::EOP | TxCommand::RS).bits(),
                ..TxDesc::default()
            },
        );
        tx_bufs[index] = Some(buf);

        atomic::fence(Ordering::SeqCst);
        regs.write(Register::TDT, ring_index(next));
        drop(rings);

        Counters::bump(&self.counters.transmitted);
        log::trace!("e1000: tx slot {index}, {length} bytes");
        Ok(())
    }

    /// Acknowledges the device interrupt and drains the receive ring.
    pub fn handle_interrupt(&self) {
        // tell the e1000 we've seen this interrupt;
        // without this the e1000 won't raise any
        // further interrupts.
        self.rings.lock().regs.write(Register::ICR, 0xffff_ffff);

        self.receive();
    }

    /// Delivers every frame the device has written back.
    pub fn receive(&self) {
        loop {
            let batch = self.take_received();
            if batch.is_empty() {
                break;
            }
            for buf in batch {
                self.net.deliver(buf);
            }
        }
    }

    fn take_received(&self) -> ArrayVec<N::Buffer, RX_RING_SIZE> {
        let mut batch = ArrayVec::new();
        let mut rings = self.rings.lock();
        let Rings {
            regs,
            rx_ring,
            rx_bufs,
            ..
        } = &mut *rings;

        while !batch.is_full() {
            let index = (regs.read(Register::RDT) as usize + 1) % RX_RING_SIZE;
            let status = RxStatus::from_bits_retain(rx_ring.status(index));
            if !status.contains(RxStatus::DD) {
                break;
            }
            atomic::fence(Ordering::SeqCst);
            let desc = rx_ring.read(index);

            if !status.contains(RxStatus::EOP) || desc.errors != 0 {
                Counters::bump(&self.counters.dropped);
                log::debug!(
                    "e1000: rx slot {index} dropped, status {status:?}, errors {:#x}",
                    desc.errors
                );
            } else if let Some(fresh) = self.net.alloc_buffer(0) {
                let mut filled = mem::replace(&mut rx_bufs[index], fresh);
                filled.set_len(usize::from(desc.length));
                batch.push(filled);
                Counters::bump(&self.counters.received);
                log::trace!("e1000: rx slot {index}, {} bytes", desc.length);
            } else {
                Counters::bump(&self.counters.dropped);
                log::warn!("e1000: out of packet buffers, rx slot {index} dropped");
            }

            rx_ring.write(
                index,
                RxDesc {
                    addr: rx_bufs[index].dma_addr(),
                    ..RxDesc::default()
                },
            );
            atomic::fence(Ordering::SeqCst);
            regs.write(Register::RDT, ring_index(index));
        }

        batch
    }
}

impl<R, N, P> Drop for E1000<R, N, P>
where
    R: RegisterBlock,
    N: NetStack,
    P: Platform,
{
    fn drop(&mut self) {
        let rings = self.rings.get_mut();
        rings.regs.write(Register::IMS, 0);
        rings.regs.write(Register::RCTL, 0);
        rings.regs.write(Register::TCTL, 0);
        atomic::fence(Ordering::SeqCst);

        for buf in rings.tx_bufs.iter_mut().filter_map(Option::take) {
            self.net.free_buffer(buf);
        }
        for buf in rings.rx_bufs.drain(..) {
            self.net.free_buffer(buf);
        }
    }
}

#[expect(clippy::cast_possible_truncation)]
fn split_addr(addr: u64) -> (u32, u32) {
    (addr as u32, (addr >> 32) as u32)
}

#[expect(clippy::cast_possible_truncation)]
fn ring_index(index: usize) -> u32 {
    index as u32
}

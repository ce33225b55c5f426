use core::fmt;

/// A packet buffer owned by the network stack.
///
/// The driver hands the buffer's data area to the device by bus address, so
/// the area must stay put for as long as the driver holds the buffer.
pub trait PacketBuffer: Send {
    /// Bus address of the first byte of packet data.
    fn dma_addr(&self) -> u64;

    /// Length of the packet data in bytes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sets the length of the packet data after the device filled it.
    fn set_len(&mut self, len: usize);
}

/// The layer above the driver: buffer pool and receive path.
pub trait NetStack: Sync {
    type Buffer: PacketBuffer;

    /// Allocates a receive buffer with `headroom` bytes reserved in front of
    /// the data area, or returns `None` if the pool is exhausted.
    fn alloc_buffer(&self, headroom: usize) -> Option<Self::Buffer>;

    /// Returns a buffer the driver no longer needs to the pool.
    fn free_buffer(&self, buf: Self::Buffer);

    /// Passes a received frame up the stack.
    ///
    /// Called without any driver lock held, so the stack may transmit a
    /// reply from here.
    fn deliver(&self, buf: Self::Buffer);
}

/// An Ethernet hardware address.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// Low word of the receive-address register pair.
    pub(crate) fn low_word(self) -> u32 {
        let [a, b, c, d, _, _] = self.0;
        u32::from_le_bytes([a, b, c, d])
    }

    /// High word of the receive-address register pair, without the
    /// address-valid bit.
    pub(crate) fn high_word(self) -> u32 {
        let [_, _, _, _, e, f] = self.0;
        u32::from(u16::from_le_bytes([e, f]))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddress({self})")
    }
}

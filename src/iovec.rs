/// A stable index into the engine's buffer pool / parallel metadata array
/// (§3 "Packet Metadata Record", §9 "parallel metadata array"). Kept as a
/// plain newtype over `usize` rather than a pointer or `Vec<u8>` handle so
/// packet-number-space bookkeeping can reference in-flight buffers without
/// owning them or chasing a per-packet heap allocation on the hot path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IoVecId(pub usize);

/// One slot of the engine's fixed-size buffer pool (§4.6, §9). `data` is
/// reused across its lifetime rather than reallocated: `Vec::clear` keeps the
/// backing allocation, so borrowing a slot out of the free list and
/// returning it later does not touch the allocator on the hot path. Plain
/// `Vec<u8>` rather than `BytesMut` so a slot's contents can be handed
/// straight to `Connection::send_datagram`/`recv_datagram`, both of which
/// read or write a `&mut Vec<u8>`.
#[derive(Debug, Default)]
pub struct IoVec {
    pub data: Vec<u8>,
}

impl IoVec {
    pub fn with_capacity(cap: usize) -> Self {
        Self { data: Vec::with_capacity(cap) }
    }

    pub fn reset(&mut self) {
        self.data.clear();
    }
}

/// A parallel packet-metadata record (§3 "Packet Metadata Record", §9),
/// indexed identically to its `IoVec` in `BufferPool`. Distinct from
/// `pnspace::SentPacket` — that one is keyed by packet number inside a
/// single packet-number space and dropped once a packet leaves `sent`; this
/// one is keyed by buffer slot and lives for exactly as long as the slot is
/// lent out, regardless of which connection or space borrowed it.
#[derive(Debug, Clone, Default)]
pub struct PacketMeta {
    pub in_flight: bool,
    pub ack_eliciting: bool,
    pub acked: bool,
    pub lost: bool,
    pub txd: bool,
    pub protected_len: usize,
    pub tx_time_ms: u64,
    pub rx_time_ms: u64,
}

/// Fixed-size pool of reusable IO vectors plus their parallel metadata
/// records (§4.6, §9: "the buffer pool and metadata pool are the same
/// length"). Slots are handed out via `allocate` and must be returned via
/// `free`; there is no growth past `num_bufs` — exhaustion is a resource
/// limit the caller must treat as backpressure (§7), not an error to retry
/// past.
pub struct BufferPool {
    bufs: Vec<IoVec>,
    meta: Vec<PacketMeta>,
    free: Vec<IoVecId>,
}

impl BufferPool {
    pub fn new(num_bufs: usize, buf_capacity: usize) -> Self {
        let mut bufs = Vec::with_capacity(num_bufs);
        let mut meta = Vec::with_capacity(num_bufs);
        let mut free = Vec::with_capacity(num_bufs);
        for i in 0..num_bufs {
            bufs.push(IoVec::with_capacity(buf_capacity));
            meta.push(PacketMeta::default());
            free.push(IoVecId(i));
        }
        free.reverse();
        Self { bufs, meta, free }
    }

    /// §6 `allocate_iov(len)`. Returns `None` on exhaustion rather than
    /// growing the pool, signaling backpressure to the caller.
    pub fn allocate(&mut self) -> Option<IoVecId> {
        let id = self.free.pop()?;
        self.bufs[id.0].reset();
        self.meta[id.0] = PacketMeta::default();
        Some(id)
    }

    /// §6 `free(buffer)`.
    pub fn free(&mut self, id: IoVecId) {
        self.bufs[id.0].reset();
        self.meta[id.0] = PacketMeta::default();
        self.free.push(id);
    }

    pub fn get(&self, id: IoVecId) -> &IoVec {
        &self.bufs[id.0]
    }

    pub fn get_mut(&mut self, id: IoVecId) -> &mut IoVec {
        &mut self.bufs[id.0]
    }

    pub fn meta(&self, id: IoVecId) -> &PacketMeta {
        &self.meta[id.0]
    }

    pub fn meta_mut(&mut self, id: IoVecId) -> &mut PacketMeta {
        &mut self.meta[id.0]
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.bufs.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn allocate_and_free_recycles_slots() {
        let mut pool = BufferPool::new(2, 64);
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert!(pool.allocate().is_none());

        pool.free(a);
        let c = pool.allocate().unwrap();
        assert_eq!(c, a);
        let _ = b;
    }

    #[test]
    fn metadata_is_reset_on_allocate() {
        let mut pool = BufferPool::new(1, 16);
        let id = pool.allocate().unwrap();
        pool.meta_mut(id).acked = true;
        pool.free(id);
        let id2 = pool.allocate().unwrap();
        assert!(!pool.meta(id2).acked);
    }
}

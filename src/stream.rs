use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::pnspace::PnSet;
use crate::result::{require, QuicheResult, TransportError};

/// Stream-id bit layout (§4.4): bit 0 selects the initiating role, bit 1
/// selects bidirectional vs unidirectional.
const STREAM_ID_INITIATOR_SERVER: u64 = 0x1;
const STREAM_ID_UNI: u64 = 0x2;

pub fn is_client_initiated(id: u64) -> bool {
    id & STREAM_ID_INITIATOR_SERVER == 0
}

pub fn is_bidi(id: u64) -> bool {
    id & STREAM_ID_UNI == 0
}

/// One direction's lifecycle (§3: "idle → open → half-closed → closed; a
/// reset transitions directly to closed on the affected direction").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalfState {
    Open,
    Closed,
}

/// Outbound byte buffer for one stream. Bytes are kept from `base` (the
/// cumulative-acked offset) through whatever has been written, so a
/// retransmission can re-slice the exact bytes a lost packet carried without
/// re-running application logic. `acked` tracks out-of-order ACKs so `base`
/// can jump forward once a contiguous prefix is confirmed.
#[derive(Debug, Default)]
pub struct SendBuffer {
    base: u64,
    buf: VecDeque<u8>,
    sent: u64,
    fin_offset: Option<u64>,
    fin_sent: bool,
    fin_acked: bool,
    acked: PnSet,
}

impl SendBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_len(&self) -> u64 {
        self.base + self.buf.len() as u64
    }

    pub fn write(&mut self, data: &[u8]) -> QuicheResult<()> {
        require(self.fin_offset.is_none(), TransportError::StreamStateError, "write after stream closed")?;
        require(
            self.total_len().checked_add(data.len() as u64).map(|e| e < (1u64 << 62)).unwrap_or(false),
            TransportError::FinalSizeError,
            "stream send offset would exceed 2^62-1",
        )?;
        self.buf.extend(data.iter().copied());
        Ok(())
    }

    pub fn close(&mut self) {
        self.fin_offset.get_or_insert(self.total_len());
    }

    pub fn is_closed(&self) -> bool {
        self.fin_offset.is_some()
    }

    /// Whether there is anything new to transmit: unsent buffered bytes, or
    /// a pending FIN that hasn't been sent yet.
    pub fn has_pending(&self) -> bool {
        self.sent < self.total_len() || (self.fin_offset == Some(self.sent) && !self.fin_sent)
    }

    /// Takes up to `max_len` bytes starting at the send cursor, advancing it.
    /// Returns `None` if there is nothing new to send.
    pub fn pop_sendable(&mut self, max_len: usize) -> Option<(u64, Vec<u8>, bool)> {
        if !self.has_pending() {
            return None;
        }
        let offset = self.sent;
        let avail = (self.total_len() - offset) as usize;
        let take = avail.min(max_len);
        let data = self.slice(offset, offset + take as u64);
        self.sent += take as u64;
        let fin = self.fin_offset == Some(self.sent);
        if fin {
            self.fin_sent = true;
        }
        Some((offset, data, fin))
    }

    /// Re-reads the exact bytes in `[lo, hi)` for retransmission; both bounds
    /// must still be within `[base, total_len()]`.
    pub fn slice(&self, lo: u64, hi: u64) -> Vec<u8> {
        debug_assert!(lo >= self.base && hi <= self.total_len());
        let start = (lo - self.base) as usize;
        let end = (hi - self.base) as usize;
        self.buf.iter().skip(start).take(end - start).copied().collect()
    }

    /// Records that the peer acked `[offset, offset+len)`, and `fin` if that
    /// range's packet also carried the FIN bit. Advances `base`, evicting
    /// acked-and-now-unneeded bytes from the front of the buffer.
    pub fn on_ack(&mut self, offset: u64, len: usize, fin: bool) {
        if len > 0 {
            self.acked.insert_range(offset, offset + len as u64 - 1);
        }
        if fin && self.fin_offset == Some(offset + len as u64) {
            self.fin_acked = true;
        }
        while let Some(new_max) = self.acked.take_contiguous_from(self.base) {
            let advance = new_max + 1 - self.base;
            for _ in 0..advance {
                self.buf.pop_front();
            }
            self.base = new_max + 1;
        }
    }

    pub fn is_fully_acked(&self) -> bool {
        match self.fin_offset {
            Some(f) => self.base >= f && self.fin_acked,
            None => false,
        }
    }

    /// The send cursor: bytes in `[0, sent_offset)` have already left the
    /// wire at least once. Used by connection-level flow control to count
    /// newly-sent bytes without double-counting retransmissions (which
    /// re-slice already-sent bytes rather than advancing this cursor).
    pub fn sent_offset(&self) -> u64 {
        self.sent
    }

    /// Rewinds the send cursor back to the first not-yet-acknowledged byte,
    /// forcing every currently in-flight byte (and the FIN, if unacked) to
    /// go out again on the next `pop_sendable`. Used when a Retry forces the
    /// client to resend its first Initial flight under freshly-derived keys.
    pub fn force_retransmit(&mut self) {
        self.sent = self.base;
        self.fin_sent = self.fin_acked;
    }
}

/// Inbound reassembly buffer. Out-of-order STREAM frames are buffered keyed
/// by offset; `pop_contiguous` drains whatever forms an unbroken prefix
/// starting at the current read cursor, per §4.2's "deliver any contiguous
/// prefix at the current offset".
#[derive(Debug, Default)]
pub struct RecvBuffer {
    chunks: BTreeMap<u64, Vec<u8>>,
    read_offset: u64,
    fin_offset: Option<u64>,
}

impl RecvBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fin_offset(&self) -> Option<u64> {
        self.fin_offset
    }

    /// Inserts one STREAM frame's payload. Overlap with already-buffered or
    /// already-delivered bytes must be byte-identical; a mismatch is a
    /// PROTOCOL_VIOLATION per §4.2.
    pub fn insert(&mut self, offset: u64, data: &[u8], fin: bool) -> QuicheResult<()> {
        let end = offset + data.len() as u64;
        require(end < (1u64 << 62), TransportError::FrameEncodingError, "stream offset + length exceeds 2^62-1")?;

        if let Some(prev_fin) = self.fin_offset {
            require(
                !fin || end == prev_fin,
                TransportError::FinalSizeError,
                "stream FIN offset changed across frames",
            )?;
            require(end <= prev_fin, TransportError::FinalSizeError, "stream data sent beyond final size")?;
        }

        if end <= self.read_offset {
            return Ok(()); // fully-delivered duplicate
        }
        let start = offset.max(self.read_offset);
        let local_off = (start - offset) as usize;
        let new_data = &data[local_off..];
        let new_start = start;

        // Verify byte-identical overlap against any existing chunk.
        for (&cstart, cdata) in self.chunks.range(..new_start + new_data.len() as u64) {
            let cend = cstart + cdata.len() as u64;
            if cend <= new_start {
                continue;
            }
            let overlap_lo = cstart.max(new_start);
            let overlap_hi = cend.min(new_start + new_data.len() as u64);
            if overlap_lo >= overlap_hi {
                continue;
            }
            let a = &cdata[(overlap_lo - cstart) as usize..(overlap_hi - cstart) as usize];
            let b = &new_data[(overlap_lo - new_start) as usize..(overlap_hi - new_start) as usize];
            require(a == b, TransportError::ProtocolViolation, "overlapping stream data mismatch")?;
        }

        if !new_data.is_empty() {
            self.chunks.insert(new_start, new_data.to_vec());
        }
        if fin {
            self.fin_offset = Some(end);
        }
        Ok(())
    }

    /// Drains the contiguous prefix available starting at the read cursor.
    pub fn pop_contiguous(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let Some((&start, _)) = self.chunks.iter().next() else { break };
            if start > self.read_offset {
                break;
            }
            let (_, data) = self.chunks.remove(&start).map(|d| (start, d)).unwrap();
            let skip = (self.read_offset - start) as usize;
            out.extend_from_slice(&data[skip.min(data.len())..]);
            self.read_offset = start + data.len() as u64;
        }
        out
    }

    pub fn is_finished(&self) -> bool {
        self.fin_offset == Some(self.read_offset)
    }

    /// The highest byte offset seen so far (buffered or delivered),
    /// monotonically non-decreasing regardless of reordering or duplicate
    /// frames. Connection-level flow control sums the deltas of this value
    /// across streams so a retransmitted/overlapping frame is never counted
    /// twice (§4.2 "identical discipline against max-data aggregating all
    /// stream bytes").
    pub fn highest_offset(&self) -> u64 {
        let from_chunks = self.chunks.iter().map(|(&start, data)| start + data.len() as u64).max().unwrap_or(0);
        from_chunks.max(self.read_offset)
    }
}

/// One QUIC stream's full state (§3/§4.4): identity, both directions' byte
/// buffers, and the flow-control windows governing them. Stream lifecycle
/// transitions fall out of `send`/`recv`'s `HalfState`, not a separate
/// tracked enum, since each direction's state is fully determined by its
/// buffer (`SendBuffer::is_fully_acked`, `RecvBuffer::is_finished`) plus the
/// reset flags below.
pub struct Stream {
    pub id: u64,
    pub send: SendBuffer,
    pub recv: RecvBuffer,
    pub peer_max_stream_data: u64,
    pub local_max_stream_data: u64,
    local_max_stream_data_initial: u64,
    /// The value of `local_max_stream_data` last carried in a sent
    /// MAX_STREAM_DATA frame, so the connection layer can tell a due update
    /// from one already on the wire, and re-arm it after the frame carrying
    /// it is lost.
    pub max_stream_data_sent: u64,
    pub send_reset: bool,
    pub recv_reset: bool,
    pub stop_sending_requested: bool,
}

impl Stream {
    pub fn new(id: u64, peer_max_stream_data: u64, local_max_stream_data: u64) -> Self {
        Self {
            id,
            send: SendBuffer::new(),
            recv: RecvBuffer::new(),
            peer_max_stream_data,
            local_max_stream_data,
            local_max_stream_data_initial: local_max_stream_data,
            max_stream_data_sent: local_max_stream_data,
            send_reset: false,
            recv_reset: false,
            stop_sending_requested: false,
        }
    }

    pub fn send_state(&self) -> HalfState {
        if self.send_reset || self.send.is_fully_acked() {
            HalfState::Closed
        } else {
            HalfState::Open
        }
    }

    pub fn recv_state(&self) -> HalfState {
        if self.recv_reset || self.recv.is_finished() {
            HalfState::Closed
        } else {
            HalfState::Open
        }
    }

    pub fn is_closed(&self) -> bool {
        self.send_state() == HalfState::Closed && self.recv_state() == HalfState::Closed
    }

    /// Appends bytes to the send buffer, enforcing stream-level flow control
    /// (§4.2 "received bytes must not exceed advertised max-stream-data",
    /// applied symmetrically to what we're permitted to send).
    pub fn write(&mut self, data: &[u8], fin: bool) -> QuicheResult<()> {
        require(!self.send_reset, TransportError::StreamStateError, "write on reset stream")?;
        require(
            self.send.total_len() + data.len() as u64 <= self.peer_max_stream_data,
            TransportError::FlowControlError,
            "write exceeds peer-granted stream flow control window",
        )?;
        self.send.write(data)?;
        if fin {
            self.send.close();
        }
        Ok(())
    }

    /// Applies an inbound STREAM frame, returning the newly contiguous bytes
    /// ready for the application, if any.
    pub fn receive(&mut self, offset: u64, data: &[u8], fin: bool) -> QuicheResult<Vec<u8>> {
        require(!self.recv_reset, TransportError::StreamStateError, "data received on reset stream")?;
        require(
            offset + data.len() as u64 <= self.local_max_stream_data,
            TransportError::FlowControlError,
            "peer exceeded stream flow control window",
        )?;
        self.recv.insert(offset, data, fin)?;
        Ok(self.recv.pop_contiguous())
    }

    pub fn reset(&mut self) {
        self.send_reset = true;
    }

    pub fn on_peer_reset(&mut self) {
        self.recv_reset = true;
    }

    /// Bytes the peer is now permitted to have in flight on this stream that
    /// it has not yet consumed, used to decide whether a new
    /// MAX_STREAM_DATA is due.
    pub fn recv_window_remaining(&self) -> u64 {
        self.local_max_stream_data.saturating_sub(self.recv.read_offset)
    }

    /// Per §4.2: "a new MAX_STREAM_DATA is scheduled when the remaining
    /// window drops below half". Returns the new limit to advertise, if due.
    pub fn maybe_extend_recv_window(&mut self) -> Option<u64> {
        if self.recv_reset {
            return None;
        }
        if self.recv_window_remaining() * 2 < self.local_max_stream_data_initial {
            let new_limit = self.recv.read_offset + self.local_max_stream_data_initial;
            self.local_max_stream_data = new_limit;
            Some(new_limit)
        } else {
            None
        }
    }
}

/// Per-connection stream id allocator and storage (§4.4). Local stream ids
/// are handed out in strictly increasing order within each of the four
/// (bidi/uni) x (assigned-by-us) categories.
pub struct StreamTable {
    is_client: bool,
    streams: HashMap<u64, Stream>,
    next_bidi: u64,
    next_uni: u64,
    pub peer_initial_max_stream_data_bidi: u64,
    pub peer_initial_max_stream_data_uni: u64,
    pub local_initial_max_stream_data: u64,
    /// Stream-count limits (RFC 9000 §4.6), tracked as "number of streams",
    /// not as a raw stream id. `local_max_streams_*` is the limit we grant
    /// the peer (MAX_STREAMS we send); `peer_max_streams_*` is the limit the
    /// peer granted us (MAX_STREAMS we received).
    pub local_max_streams_bidi: u64,
    pub local_max_streams_uni: u64,
    pub peer_max_streams_bidi: u64,
    pub peer_max_streams_uni: u64,
}

impl StreamTable {
    pub fn new(is_client: bool, local_initial_max_stream_data: u64) -> Self {
        let initiator_bit = if is_client { 0 } else { STREAM_ID_INITIATOR_SERVER };
        Self {
            is_client,
            streams: HashMap::new(),
            next_bidi: initiator_bit,
            next_uni: initiator_bit | STREAM_ID_UNI,
            peer_initial_max_stream_data_bidi: 0,
            peer_initial_max_stream_data_uni: 0,
            local_initial_max_stream_data,
            local_max_streams_bidi: 0,
            local_max_streams_uni: 0,
            peer_max_streams_bidi: 0,
            peer_max_streams_uni: 0,
        }
    }

    fn is_locally_initiated(&self, id: u64) -> bool {
        is_client_initiated(id) == self.is_client
    }

    /// Opens a new locally-initiated stream of the requested directionality,
    /// returning its id, or a `StreamLimitError` if the peer hasn't granted
    /// enough MAX_STREAMS headroom yet.
    pub fn open(&mut self, bidi: bool) -> QuicheResult<u64> {
        let (next, limit) = if bidi {
            (self.next_bidi, self.peer_max_streams_bidi)
        } else {
            (self.next_uni, self.peer_max_streams_uni)
        };
        let ordinal = (next >> 2) + 1;
        require(ordinal <= limit, TransportError::StreamLimitError, "no MAX_STREAMS headroom to open a new stream")?;

        let id = next;
        if bidi {
            self.next_bidi += 4;
        } else {
            self.next_uni += 4;
        }
        let peer_window =
            if bidi { self.peer_initial_max_stream_data_bidi } else { self.peer_initial_max_stream_data_uni };
        self.streams.insert(id, Stream::new(id, peer_window, self.local_initial_max_stream_data));
        Ok(id)
    }

    /// Looks up a stream, implicitly creating it if `id` is peer-initiated
    /// and not yet seen (RFC 9000 §2.1's "create on first reference"),
    /// rejecting creation beyond the limit we've advertised via MAX_STREAMS.
    pub fn get_or_create(&mut self, id: u64) -> QuicheResult<&mut Stream> {
        if !self.streams.contains_key(&id) {
            if !self.is_locally_initiated(id) {
                let ordinal = (id >> 2) + 1;
                let limit = if is_bidi(id) { self.local_max_streams_bidi } else { self.local_max_streams_uni };
                require(ordinal <= limit, TransportError::StreamLimitError, "peer exceeded advertised MAX_STREAMS")?;
            }
            let peer_window = if is_bidi(id) {
                self.peer_initial_max_stream_data_bidi
            } else {
                self.peer_initial_max_stream_data_uni
            };
            self.streams.insert(id, Stream::new(id, peer_window, self.local_initial_max_stream_data));
        }
        Ok(self.streams.get_mut(&id).unwrap())
    }

    pub fn get(&self, id: u64) -> Option<&Stream> {
        self.streams.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Stream> {
        self.streams.values_mut()
    }

    /// Removes streams that are fully closed in both directions, for
    /// eventual garbage collection of connection-level bookkeeping.
    pub fn reap_closed(&mut self) {
        self.streams.retain(|_, s| !s.is_closed());
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stream_id_parity_decodes_role_and_direction() {
        assert!(is_client_initiated(0) && is_bidi(0));
        assert!(!is_client_initiated(1) && is_bidi(1));
        assert!(is_client_initiated(2) && !is_bidi(2));
        assert!(!is_client_initiated(3) && !is_bidi(3));
    }

    #[test]
    fn send_buffer_round_trips_and_tracks_acks() {
        let mut send = SendBuffer::new();
        send.write(b"hello world").unwrap();
        send.close();

        let (offset, data, fin) = send.pop_sendable(5).unwrap();
        assert_eq!((offset, data.as_slice(), fin), (0, b"hello".as_slice(), false));

        let (offset, data, fin) = send.pop_sendable(100).unwrap();
        assert_eq!((offset, data.as_slice(), fin), (5, b" world".as_slice(), true));

        assert!(send.pop_sendable(10).is_none());
        assert!(!send.is_fully_acked());

        send.on_ack(0, 5, false);
        send.on_ack(5, 6, true);
        assert!(send.is_fully_acked());
    }

    #[test]
    fn send_buffer_retransmits_exact_bytes_after_loss() {
        let mut send = SendBuffer::new();
        send.write(b"0123456789").unwrap();
        let (offset, data, _) = send.pop_sendable(10).unwrap();
        assert_eq!(offset, 0);
        // simulate loss: the frame carrying [3,6) never arrives acked.
        send.on_ack(0, 3, false);
        send.on_ack(6, 4, false);
        let resent = send.slice(3, 6);
        assert_eq!(resent, &data[3..6]);
    }

    #[test]
    fn force_retransmit_resends_everything_unacked() {
        let mut send = SendBuffer::new();
        send.write(b"client hello").unwrap();
        send.close();
        send.pop_sendable(100).unwrap();
        assert!(send.pop_sendable(100).is_none());

        send.force_retransmit();
        let (offset, data, fin) = send.pop_sendable(100).unwrap();
        assert_eq!(offset, 0);
        assert_eq!(data, b"client hello");
        assert!(fin);
    }

    #[test]
    fn recv_buffer_delivers_flow_control_scenario_bytes() {
        // §8 scenario 4: writes arrive in two windows, delivered contiguously.
        let mut recv = RecvBuffer::new();
        assert_eq!(recv.insert(0, &[1u8; 100], false), Ok(()));
        let first = recv.pop_contiguous();
        assert_eq!(first.len(), 100);

        assert_eq!(recv.insert(100, &[2u8; 200], true), Ok(()));
        let second = recv.pop_contiguous();
        assert_eq!(second.len(), 200);
        assert!(recv.is_finished());
    }

    #[test]
    fn recv_buffer_reorders_out_of_order_chunks() {
        let mut recv = RecvBuffer::new();
        recv.insert(5, b"world", true).unwrap();
        assert!(recv.pop_contiguous().is_empty());
        recv.insert(0, b"hello", false).unwrap();
        assert_eq!(recv.pop_contiguous(), b"helloworld");
        assert!(recv.is_finished());
    }

    #[test]
    fn recv_buffer_rejects_inconsistent_overlap() {
        let mut recv = RecvBuffer::new();
        recv.insert(0, b"hello", false).unwrap();
        assert!(recv.insert(2, b"xxx", false).is_err());
    }

    #[test]
    fn recv_buffer_duplicate_is_idempotent() {
        let mut recv = RecvBuffer::new();
        recv.insert(0, b"abc", false).unwrap();
        recv.pop_contiguous();
        assert_eq!(recv.insert(0, b"abc", false), Ok(()));
        assert!(recv.pop_contiguous().is_empty());
    }

    #[test]
    fn stream_flow_control_blocks_writes_beyond_window() {
        let mut stream = Stream::new(4, 100, 1000);
        assert!(stream.write(&[0u8; 100], false).is_ok());
        assert!(stream.write(&[0u8; 1], false).is_err());
    }

    #[test]
    fn stream_extends_recv_window_below_half() {
        let mut stream = Stream::new(4, 1000, 100);
        stream.receive(0, &[0u8; 60], false).unwrap();
        assert_eq!(stream.maybe_extend_recv_window(), Some(160));
    }

    #[test]
    fn stream_table_allocates_correct_parity() {
        let mut client = StreamTable::new(true, 1000);
        client.peer_max_streams_bidi = 10;
        client.peer_max_streams_uni = 10;
        assert_eq!(client.open(true).unwrap(), 0);
        assert_eq!(client.open(true).unwrap(), 4);
        assert_eq!(client.open(false).unwrap(), 2);

        let mut server = StreamTable::new(false, 1000);
        server.peer_max_streams_bidi = 10;
        server.peer_max_streams_uni = 10;
        assert_eq!(server.open(true).unwrap(), 1);
        assert_eq!(server.open(false).unwrap(), 3);
    }

    #[test]
    fn stream_table_enforces_limits() {
        let mut client = StreamTable::new(true, 1000);
        assert!(client.open(true).is_err());

        let mut server = StreamTable::new(false, 1000);
        server.local_max_streams_bidi = 1;
        assert!(server.get_or_create(0).is_ok()); // first client-initiated bidi stream
        assert!(server.get_or_create(4).is_err()); // second exceeds the limit of 1
    }

    #[test]
    fn highest_offset_ignores_reordering_and_duplicates() {
        let mut recv = RecvBuffer::new();
        recv.insert(10, b"world", false).unwrap();
        assert_eq!(recv.highest_offset(), 15);
        recv.insert(0, b"hello", false).unwrap();
        recv.pop_contiguous();
        // duplicate, already-delivered data must not move the high-water mark backward or double it
        recv.insert(0, b"hello", false).unwrap();
        assert_eq!(recv.highest_offset(), 15);
    }

    #[test]
    fn sent_offset_advances_only_on_new_bytes() {
        let mut send = SendBuffer::new();
        send.write(b"0123456789").unwrap();
        assert_eq!(send.sent_offset(), 0);
        send.pop_sendable(4);
        assert_eq!(send.sent_offset(), 4);
        // a retransmission re-slices already-sent bytes without moving the cursor
        let _ = send.slice(0, 4);
        assert_eq!(send.sent_offset(), 4);
    }
}

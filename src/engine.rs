use std::collections::{HashMap, VecDeque};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::{ConnectionConfig, EngineConfig};
use crate::connection::{ConnState, Connection};
use crate::crypto::token::TokenManager;
use crate::io::DatagramIo;
use crate::iovec::BufferPool;
use crate::packet::codec::MAX_DATAGRAM_SIZE;
use crate::packet::header::Header;
use crate::primitives::cid::ConnectionId;
use crate::result::{QuicheError, QuicheResult};
use crate::timer_wheel::TimerWheel;
use crate::transport_parameters::TransportParameters;

/// Opaque handle to one connection, stable for the connection's lifetime.
/// Mirrors the embedder-facing `conn_handle` of §6; kept as a bare `u64`
/// newtype rather than a pointer/index so the registry is free to reorder or
/// reap entries without invalidating handles an embedder is still holding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnHandle(pub u64);

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

fn local_tp_from_config(conf: &ConnectionConfig, engine: &EngineConfig) -> TransportParameters {
    TransportParameters {
        max_idle_timeout_ms: conf.idle_timeout_s * 1000,
        initial_max_data: conf.initial_max_data,
        initial_max_stream_data_bidi_local: conf.initial_max_stream_data,
        initial_max_stream_data_bidi_remote: conf.initial_max_stream_data,
        initial_max_stream_data_uni: conf.initial_max_stream_data,
        initial_max_streams_bidi: conf.max_streams_bidi,
        initial_max_streams_uni: conf.max_streams_uni,
        max_udp_payload_size: engine.max_datagram_size as u64,
        ..TransportParameters::default()
    }
}

/// One registered connection plus the bookkeeping the engine needs that
/// doesn't belong on `Connection` itself: the peer address bytes travel over
/// (Connection has no socket of its own, per §4.6's single-engine-owns-I/O
/// design), and whether `is_new_server_conn` has already been reported once.
struct ConnEntry {
    conn: Connection,
    peer: SocketAddr,
    reported: bool,
    is_server: bool,
}

/// The engine & registry (§4.6): owns the one UDP socket every connection is
/// multiplexed over, the shared buffer pool, the CID- and 4-tuple-indexed
/// connection registries, the accept queue, the timer wheel, and the token
/// manager used to validate Retry/NEW_TOKEN address-validation tokens. This
/// is the cooperative single-threaded loop described in §5: every public
/// method here either runs synchronously to quiescence or is an explicit
/// suspension point (`rx_ready`) that awaits new data with a deadline.
pub struct Engine {
    io: DatagramIo,
    config: EngineConfig,
    buffers: BufferPool,
    tokens: TokenManager,

    connections: HashMap<ConnHandle, ConnEntry>,
    by_cid: HashMap<ConnectionId, ConnHandle>,
    by_peer: HashMap<SocketAddr, ConnHandle>,
    accept_queue: VecDeque<ConnHandle>,
    timers: TimerWheel<ConnHandle>,
    next_handle: u64,

    recv_scratch: Vec<u8>,
}

impl Engine {
    /// §6 `engine_init`. Binds nothing yet; `bind` or `connect` perform the
    /// actual socket setup so a client-only embedder never opens a listening
    /// port.
    pub async fn engine_init(config: EngineConfig, local_addr: SocketAddr) -> QuicheResult<Self> {
        let io = DatagramIo::bind(local_addr).await?;
        let buffers = BufferPool::new(config.num_bufs, config.max_datagram_size);
        Ok(Self {
            io,
            config,
            buffers,
            tokens: TokenManager::new(),
            connections: HashMap::new(),
            by_cid: HashMap::new(),
            by_peer: HashMap::new(),
            accept_queue: VecDeque::new(),
            timers: TimerWheel::new(),
            next_handle: 0,
            recv_scratch: vec![0u8; 65535],
        })
    }

    /// §6 `engine_cleanup`. The socket and pool are dropped with `self`;
    /// this exists as an explicit, named lifecycle step for the embedder
    /// rather than relying on `Drop` ordering.
    pub fn engine_cleanup(self) {}

    fn alloc_handle(&mut self) -> ConnHandle {
        let h = ConnHandle(self.next_handle);
        self.next_handle += 1;
        h
    }

    /// §6 `bind(port)`. This engine's single socket already serves every
    /// connection, so `bind` only asserts a server is listening on the
    /// socket this engine was constructed with; it returns the address
    /// actually bound (useful when `port` was 0).
    pub fn bind(&self) -> QuicheResult<SocketAddr> {
        self.io.local_addr()
    }

    /// §6 `connect(host, port, conn_conf)`. Resolves `host:port`, creates a
    /// client `Connection`, and flushes its first Initial flight.
    pub async fn connect(&mut self, host: &str, port: u16, conn_conf: &ConnectionConfig) -> QuicheResult<ConnHandle> {
        let peer = (host, port)
            .to_socket_addrs()
            .map_err(QuicheError::from)?
            .next()
            .ok_or_else(|| QuicheError::Other(format!("could not resolve {host}:{port}")))?;

        let local_tp = local_tp_from_config(conn_conf, &self.config);
        let conn = Connection::new_client(self.config.local_cid_len, local_tp, conn_conf.idle_timeout_s * 1000)?;

        let handle = self.alloc_handle();
        self.by_cid.insert(conn.local_cid().clone(), handle);
        self.by_peer.insert(peer, handle);
        self.connections.insert(handle, ConnEntry { conn, peer, reported: true, is_server: false });

        self.flush(handle).await?;
        Ok(handle)
    }

    /// §6 `accept(conf)`. Pops the oldest established server connection
    /// that hasn't been handed to the embedder yet.
    pub fn accept(&mut self) -> Option<ConnHandle> {
        self.accept_queue.pop_front()
    }

    /// §6 `rx_ready(timeout_s)`. Awaits the socket for up to `timeout_s`,
    /// processes every inbound datagram that arrives within the deadline
    /// against its connection, and returns the handle of the last
    /// connection touched, or `None` on timeout.
    pub async fn rx_ready(&mut self, timeout_s: f64) -> QuicheResult<Option<ConnHandle>> {
        let deadline = tokio::time::sleep(std::time::Duration::from_secs_f64(timeout_s.max(0.0)));
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => return Ok(None),
                res = self.io.receive(&mut self.recv_scratch) => {
                    let (n, peer) = res?;

                    let Some(id) = self.buffers.allocate() else {
                        tracing::warn!("buffer pool exhausted, dropping inbound datagram");
                        continue;
                    };
                    let iov = self.buffers.get_mut(id);
                    iov.data.clear();
                    iov.data.extend_from_slice(&self.recv_scratch[..n]);

                    // Move the pool slot's backing allocation out for the
                    // duration of the call (`route_and_apply` needs `&mut
                    // self`, which the pool is part of) and put it back
                    // afterwards, so the slot's capacity survives for reuse
                    // rather than being reallocated per datagram.
                    let mut datagram = std::mem::take(&mut self.buffers.get_mut(id).data);
                    let result = self.route_and_apply(&datagram, peer).await;
                    datagram.clear();
                    self.buffers.get_mut(id).data = datagram;
                    self.buffers.free(id);

                    if let Some(handle) = result? {
                        return Ok(Some(handle));
                    }
                }
            }
        }
    }

    /// Peeks the inbound datagram's header to find (or create) the owning
    /// connection, applies the datagram, and flushes any reply it produces.
    async fn route_and_apply(&mut self, datagram: &[u8], peer: SocketAddr) -> QuicheResult<Option<ConnHandle>> {
        let handle = match self.lookup_or_accept(datagram, peer)? {
            Some(h) => h,
            None => return Ok(None),
        };

        let now = now_ms();
        if let Some(entry) = self.connections.get_mut(&handle) {
            entry.conn.recv_datagram(datagram, now)?;
            if entry.conn.is_established() && !entry.reported && entry.is_server {
                entry.reported = true;
                self.accept_queue.push_back(handle);
            }
        }
        self.flush(handle).await?;
        self.reap_if_closed(handle);
        Ok(Some(handle))
    }

    /// Routes an inbound datagram to its connection by destination CID
    /// (short-header packets) or by 4-tuple (long-header Initial packets,
    /// per §4.6). A previously-unseen Initial without a valid
    /// address-validation token gets a stateless Retry in reply instead of a
    /// `Connection` (RFC 9000 §8.1); one presenting a token this engine
    /// issued gets a fresh server connection.
    async fn lookup_or_accept(&mut self, datagram: &[u8], peer: SocketAddr) -> QuicheResult<Option<ConnHandle>> {
        let first = *datagram.first().ok_or_else(|| QuicheError::Other("empty datagram".into()))?;
        let is_long = first & 0x80 != 0;

        let header = if is_long {
            match Header::decode_long(datagram) {
                Ok((header, _, _)) => header,
                Err(_) => return Ok(None),
            }
        } else {
            match Header::decode_short(datagram, self.config.local_cid_len) {
                Ok((header, _)) => header,
                Err(_) => return Ok(None),
            }
        };
        let dcid = header.dcid().clone();

        if let Some(&handle) = self.by_cid.get(&dcid) {
            return Ok(Some(handle));
        }
        if let Some(&handle) = self.by_peer.get(&peer) {
            return Ok(Some(handle));
        }

        let Header::Initial { scid: client_scid, token, .. } = &header else {
            // Short header or any other long-header type from an address/CID
            // we've never seen: most likely a stray or post-close packet.
            return Ok(None);
        };

        if token.is_empty() {
            self.send_retry(&dcid, client_scid, peer).await?;
            return Ok(None);
        }
        if self.tokens.validate(token, crate::crypto::token::TokenKind::Retry, peer).is_err() {
            tracing::debug!(%peer, "dropping Initial with invalid address-validation token");
            return Ok(None);
        }

        let local_tp = local_tp_from_config(&ConnectionConfig::default(), &self.config);
        let conn = Connection::new_server(
            self.config.local_cid_len,
            &dcid,
            local_tp,
            ConnectionConfig::default().idle_timeout_s * 1000,
        )?;
        let handle = self.alloc_handle();
        self.by_cid.insert(conn.local_cid().clone(), handle);
        self.by_cid.insert(dcid, handle);
        self.by_peer.insert(peer, handle);
        self.connections.insert(handle, ConnEntry { conn, peer, reported: false, is_server: true });
        Ok(Some(handle))
    }

    /// Sends a stateless Retry (RFC 9000 §8.1, §17.2.5) in response to a
    /// first Initial that carried no address-validation token. `odcid` is
    /// the destination CID the client used (needed for the integrity tag);
    /// `client_scid` becomes the Retry's destination CID, per the RFC.
    async fn send_retry(&mut self, odcid: &ConnectionId, client_scid: &ConnectionId, peer: SocketAddr) -> QuicheResult<()> {
        let token = self.tokens.issue(crate::crypto::token::TokenKind::Retry, peer);
        let server_scid = ConnectionId::random(self.config.local_cid_len);
        let mut header = Header::Retry {
            version: crate::packet::types::QUIC_VERSION_1,
            dcid: client_scid.clone(),
            scid: server_scid,
            token,
            retry_tag: [0u8; crate::packet::header::RETRY_TAG_LEN],
        };
        let tag = crate::crypto::retry::compute_tag(&header, odcid)?;
        if let Header::Retry { retry_tag, .. } = &mut header {
            *retry_tag = tag;
        }
        let bytes = header.encode_retry()?;
        self.io.send(&bytes, peer).await?;
        Ok(())
    }

    /// Writes every pending datagram for `handle` to the wire, coalescing
    /// per `Connection::send_datagram`'s own epoch ordering. Each datagram is
    /// built into a borrowed buffer-pool slot rather than a fresh `Vec`, so a
    /// connection that flushes many datagrams in a row does not allocate one
    /// per datagram.
    async fn flush(&mut self, handle: ConnHandle) -> QuicheResult<()> {
        if !self.connections.contains_key(&handle) {
            return Ok(());
        }
        let peer = self.connections[&handle].peer;
        let now = now_ms();

        let Some(id) = self.buffers.allocate() else {
            tracing::warn!("buffer pool exhausted, deferring flush");
            return Ok(());
        };

        let result = self.flush_with_slot(handle, id, peer, now).await;
        self.buffers.free(id);
        result
    }

    async fn flush_with_slot(&mut self, handle: ConnHandle, id: crate::iovec::IoVecId, peer: SocketAddr, now: u64) -> QuicheResult<()> {
        loop {
            let mut out = std::mem::take(&mut self.buffers.get_mut(id).data);
            out.clear();
            if out.capacity() < MAX_DATAGRAM_SIZE {
                out.reserve(MAX_DATAGRAM_SIZE - out.capacity());
            }

            let Some(entry) = self.connections.get_mut(&handle) else {
                self.buffers.get_mut(id).data = out;
                return Ok(());
            };
            let n = entry.conn.send_datagram(&mut out, now)?;
            if n == 0 {
                self.buffers.get_mut(id).data = out;
                return Ok(());
            }

            let send_result = self.io.send(&out[..n], peer).await;
            self.buffers.get_mut(id).data = out;
            send_result?;
        }
    }

    fn reap_if_closed(&mut self, handle: ConnHandle) {
        let is_closed = self.connections.get(&handle).map(|e| e.conn.is_closed()).unwrap_or(false);
        if !is_closed {
            return;
        }
        if let Some(entry) = self.connections.remove(&handle) {
            self.by_peer.remove(&entry.peer);
            self.by_cid.retain(|_, h| *h != handle);
        }
        self.timers.cancel(handle);
    }

    /// Runs every connection's `on_timeout` whose deadline has passed,
    /// reaping any that terminate as a result. Embedders with their own
    /// clock/reactor can call this directly instead of going through
    /// `rx_ready`'s `select!`.
    pub fn run_timers(&mut self, now: u64) {
        for handle in self.timers.expire_due(now) {
            if let Some(entry) = self.connections.get_mut(&handle) {
                entry.conn.on_timeout(now);
            }
            self.reap_if_closed(handle);
        }
    }

    // ---- stream read/write ----

    /// §6 `read(conn, out_queue, blocking)`. This crate returns the
    /// readable stream id and its contiguous bytes directly rather than a
    /// separate stream handle the embedder must dereference again, since
    /// nothing here multiplexes streams across connections.
    pub fn read(&mut self, handle: ConnHandle) -> Option<(u64, Vec<u8>, bool)> {
        let entry = self.connections.get_mut(&handle)?;
        for stream in entry.conn.streams.iter_mut() {
            if stream.recv.highest_offset() > 0 || stream.recv.is_finished() {
                let data = stream.recv.pop_contiguous();
                let fin = stream.recv.is_finished();
                if !data.is_empty() || fin {
                    return Some((stream.id, data, fin));
                }
            }
        }
        None
    }

    /// §6 `write(stream, data, fin)`.
    pub async fn write(&mut self, handle: ConnHandle, stream_id: u64, data: &[u8], fin: bool) -> QuicheResult<()> {
        if let Some(entry) = self.connections.get_mut(&handle) {
            entry.conn.stream_write(stream_id, data, fin)?;
        }
        self.flush(handle).await
    }

    /// §6 `write_str(engine, stream, bytes, fin)`: a thin convenience over
    /// `write` for UTF-8 payloads, kept separate to mirror the embedder
    /// surface named in the spec rather than overloading one signature.
    pub async fn write_str(&mut self, handle: ConnHandle, stream_id: u64, s: &str, fin: bool) -> QuicheResult<()> {
        self.write(handle, stream_id, s.as_bytes(), fin).await
    }

    /// §6 `write_file(stream, fd, size, fin)`. This engine has no notion of
    /// a raw file descriptor (no `sendfile`-style zero-copy path); callers
    /// read the file themselves and hand us the bytes, which this forwards
    /// to the same stream-write path as `write`.
    pub async fn write_file(&mut self, handle: ConnHandle, stream_id: u64, contents: &[u8], fin: bool) -> QuicheResult<()> {
        self.write(handle, stream_id, contents, fin).await
    }

    pub fn close_stream(&mut self, handle: ConnHandle, stream_id: u64) -> QuicheResult<()> {
        let Some(entry) = self.connections.get_mut(&handle) else { return Ok(()) };
        entry.conn.stream_close(stream_id)
    }

    pub async fn close(&mut self, handle: ConnHandle, error_code: u64, reason: impl Into<String>) -> QuicheResult<()> {
        if let Some(entry) = self.connections.get_mut(&handle) {
            entry.conn.close(error_code, reason, true);
        }
        self.flush(handle).await?;
        self.reap_if_closed(handle);
        Ok(())
    }

    pub fn open_stream(&mut self, handle: ConnHandle, bidi: bool) -> QuicheResult<u64> {
        let entry = self.connections.get_mut(&handle).ok_or_else(|| QuicheError::Other("unknown connection".into()))?;
        entry.conn.open_stream(bidi)
    }

    // ---- query helpers (§6) ----

    pub fn cid_of(&self, handle: ConnHandle) -> Option<ConnectionId> {
        self.connections.get(&handle).map(|e| e.conn.local_cid().clone())
    }

    pub fn stream_id(&self, _handle: ConnHandle, stream_id: u64) -> u64 {
        stream_id
    }

    pub fn is_uni_stream(&self, stream_id: u64) -> bool {
        !crate::stream::is_bidi(stream_id)
    }

    pub fn peer_has_closed_stream(&self, handle: ConnHandle, stream_id: u64) -> bool {
        self.connections.get(&handle).map(|e| e.conn.peer_has_closed_stream(stream_id)).unwrap_or(false)
    }

    /// True exactly once per server connection: the first time it is
    /// observed to have reached `Established` and been placed on the accept
    /// queue. Subsequent calls for the same handle answer `false`.
    pub fn is_new_server_conn(&self, handle: ConnHandle) -> bool {
        self.connections
            .get(&handle)
            .map(|e| e.is_server && e.conn.state == ConnState::Established)
            .unwrap_or(false)
    }

    pub fn connection_state(&self, handle: ConnHandle) -> Option<ConnState> {
        self.connections.get(&handle).map(|e| e.conn.state)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn conf(num_bufs: usize) -> EngineConfig {
        EngineConfig { num_bufs, ..EngineConfig::default() }
    }

    #[tokio::test]
    async fn engine_init_binds_an_ephemeral_port() {
        let engine = Engine::engine_init(conf(16), "127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = engine.bind().unwrap();
        assert_eq!(addr.ip().to_string(), "127.0.0.1");
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn rx_ready_times_out_with_no_traffic() {
        let mut engine = Engine::engine_init(conf(16), "127.0.0.1:0".parse().unwrap()).await.unwrap();
        let result = engine.rx_ready(0.05).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn connect_registers_a_client_connection_and_sends_initial() {
        let mut client = Engine::engine_init(conf(64), "127.0.0.1:0".parse().unwrap()).await.unwrap();
        let mut server = Engine::engine_init(conf(64), "127.0.0.1:0".parse().unwrap()).await.unwrap();
        let server_addr = server.bind().unwrap();

        let handle = client
            .connect(&server_addr.ip().to_string(), server_addr.port(), &ConnectionConfig::default())
            .await
            .unwrap();
        assert!(client.connections.contains_key(&handle));
        assert_eq!(client.connection_state(handle), Some(ConnState::Handshake));

        let accepted = server.rx_ready(1.0).await.unwrap();
        assert!(accepted.is_some());
    }
}

//! The UDP bus node.
//!
//! One `BusNode` per process. A background receive task decodes datagrams,
//! answers acknowledgments and feeds decoded messages first to the waiter
//! table, then to an inbox that the owning process drains from its tick
//! loop via [`BusNode::poll`]. A second background task retransmits
//! unacknowledged reliable datagrams with exponential backoff.
//!
//! Datagram layout: a mode byte, then for reliable modes a `u32` sequence
//! number, then one message frame. Acks echo the mode and sequence.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::error::BusError;
use crate::messages::Message;
use crate::waiter::WaiterTable;
use crate::wire::{WireReader, WireWriter};

/// A bus peer, identified by its socket address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub SocketAddr);

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-message delivery guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Fire and forget.
    Unreliable,
    /// Acknowledged and retransmitted, arrival order not guaranteed.
    Reliable,
    /// Acknowledged, retransmitted, and released to the application in
    /// send order per peer.
    ReliableOrdered,
}

const MODE_UNRELIABLE: u8 = 0;
const MODE_RELIABLE: u8 = 1;
const MODE_ORDERED: u8 = 2;
const MODE_ACK: u8 = 3;

const MAX_RETRIES: u32 = 5;
const BASE_RTO: Duration = Duration::from_millis(500);
const RETRANSMIT_TICK: Duration = Duration::from_millis(100);
const MAX_DATAGRAM: usize = 64 * 1024;
const SEQ_BUFFER_MAX: usize = 1024;
const SEEN_WINDOW: usize = 4096;

/// Buffers out-of-order frames until the gap fills.
#[derive(Debug)]
struct SequenceBuffer {
    next_expected: u32,
    buffer: HashMap<u32, Vec<u8>>,
}

impl SequenceBuffer {
    fn new() -> Self {
        Self {
            next_expected: 0,
            buffer: HashMap::new(),
        }
    }

    /// Accepts one frame and returns every frame now deliverable in order.
    fn process_packet(&mut self, sequence: u32, data: Vec<u8>) -> Vec<Vec<u8>> {
        let mut deliverable = Vec::new();
        if sequence == self.next_expected {
            deliverable.push(data);
            self.next_expected = self.next_expected.wrapping_add(1);
            while let Some(buffered) = self.buffer.remove(&self.next_expected) {
                deliverable.push(buffered);
                self.next_expected = self.next_expected.wrapping_add(1);
            }
        } else if sequence > self.next_expected {
            if self.buffer.len() < SEQ_BUFFER_MAX {
                self.buffer.insert(sequence, data);
            } else {
                warn!(sequence, "ordered buffer full, dropping frame");
            }
        }
        // Frames below next_expected are retransmitted duplicates.
        deliverable
    }
}

#[derive(Debug)]
struct PeerState {
    last_seen: Instant,
    reliable_seq_out: u32,
    ordered_seq_out: u32,
    seen_reliable: HashSet<u32>,
    seen_high: u32,
    ordered_in: SequenceBuffer,
}

impl PeerState {
    fn new() -> Self {
        Self {
            last_seen: Instant::now(),
            reliable_seq_out: 0,
            ordered_seq_out: 0,
            seen_reliable: HashSet::new(),
            seen_high: 0,
            ordered_in: SequenceBuffer::new(),
        }
    }

    /// True the first time a reliable sequence number is seen.
    fn record_seen(&mut self, seq: u32) -> bool {
        if !self.seen_reliable.insert(seq) {
            return false;
        }
        self.seen_high = self.seen_high.max(seq);
        if self.seen_reliable.len() > SEEN_WINDOW {
            let low = self.seen_high.saturating_sub(SEEN_WINDOW as u32);
            self.seen_reliable.retain(|s| *s >= low);
        }
        true
    }
}

struct PendingFrame {
    datagram: Vec<u8>,
    target: SocketAddr,
    retries: u32,
    next_retry: Instant,
}

struct Inner {
    socket: UdpSocket,
    peers: DashMap<PeerId, PeerState>,
    /// Unacked reliable datagrams, keyed by (peer, mode, sequence).
    pending: DashMap<(PeerId, u8, u32), PendingFrame>,
    waiters: WaiterTable,
    inbox_tx: mpsc::UnboundedSender<(PeerId, Message)>,
    inbox_rx: Mutex<mpsc::UnboundedReceiver<(PeerId, Message)>>,
}

/// One endpoint on the message bus.
pub struct BusNode {
    inner: Arc<Inner>,
    shutdown: watch::Sender<bool>,
}

impl BusNode {
    /// Binds the socket and spawns the receive and retransmission tasks.
    pub async fn bind(addr: SocketAddr) -> Result<Self, BusError> {
        let socket = UdpSocket::bind(addr).await?;
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            socket,
            peers: DashMap::new(),
            pending: DashMap::new(),
            waiters: WaiterTable::new(),
            inbox_tx,
            inbox_rx: Mutex::new(inbox_rx),
        });
        let (shutdown, shutdown_rx) = watch::channel(false);

        tokio::spawn(recv_loop(inner.clone(), shutdown_rx.clone()));
        tokio::spawn(retransmit_loop(inner.clone(), shutdown_rx));

        Ok(Self { inner, shutdown })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, BusError> {
        Ok(self.inner.socket.local_addr()?)
    }

    /// Registers a peer so it takes part in broadcasts and silence tracking.
    pub fn connect(&self, addr: SocketAddr) -> PeerId {
        let peer = PeerId(addr);
        self.inner.peers.entry(peer).or_insert_with(PeerState::new);
        peer
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.inner.peers.iter().map(|e| *e.key()).collect()
    }

    /// Sends one message to one peer with the given delivery mode.
    pub async fn send(
        &self,
        peer: PeerId,
        msg: &Message,
        delivery: Delivery,
    ) -> Result<(), BusError> {
        let frame = msg.encode_frame();
        let (mode, seq) = match delivery {
            Delivery::Unreliable => (MODE_UNRELIABLE, 0),
            Delivery::Reliable | Delivery::ReliableOrdered => {
                let mode = if delivery == Delivery::Reliable {
                    MODE_RELIABLE
                } else {
                    MODE_ORDERED
                };
                let mut state = self.inner.peers.entry(peer).or_insert_with(PeerState::new);
                let seq = if mode == MODE_RELIABLE {
                    let s = state.reliable_seq_out;
                    state.reliable_seq_out = s.wrapping_add(1);
                    s
                } else {
                    let s = state.ordered_seq_out;
                    state.ordered_seq_out = s.wrapping_add(1);
                    s
                };
                (mode, seq)
            }
        };

        let mut w = WireWriter::new();
        w.put_u8(mode);
        if mode != MODE_UNRELIABLE {
            w.put_u32(seq);
        }
        w.put_raw(&frame);
        let datagram = w.into_bytes();

        self.inner.socket.send_to(&datagram, peer.0).await?;
        trace!(%peer, tag = msg.tag(), ?delivery, "sent message");

        if mode != MODE_UNRELIABLE {
            self.inner.pending.insert(
                (peer, mode, seq),
                PendingFrame {
                    datagram,
                    target: peer.0,
                    retries: 0,
                    next_retry: Instant::now() + BASE_RTO,
                },
            );
        }
        Ok(())
    }

    /// Sends to every known peer, optionally excluding one.
    pub async fn broadcast(
        &self,
        msg: &Message,
        delivery: Delivery,
        exclude: Option<PeerId>,
    ) -> Result<(), BusError> {
        for peer in self.peers() {
            if Some(peer) == exclude {
                continue;
            }
            self.send(peer, msg, delivery).await?;
        }
        Ok(())
    }

    /// Drains messages that arrived since the last poll. Never blocks.
    pub fn poll(&self) -> Vec<(PeerId, Message)> {
        let mut rx = self
            .inner
            .inbox_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            out.push(item);
        }
        out
    }

    /// Waits for the next message from `peer` with tag `tag` that satisfies
    /// `predicate`. Fails with [`BusError::Timeout`] on expiry.
    ///
    /// The waiter is registered before this returns, so a reply that races
    /// the call still resolves it.
    pub fn wait_for(
        &self,
        peer: PeerId,
        tag: u16,
        predicate: impl Fn(&Message) -> bool + Send + Sync + 'static,
        timeout: Duration,
    ) -> impl std::future::Future<Output = Result<Message, BusError>> + Send + 'static {
        let rx = self
            .inner
            .waiters
            .register(peer, tag, Some(Box::new(predicate)));
        async move {
            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(msg)) => Ok(msg),
                _ => Err(BusError::Timeout),
            }
        }
    }

    /// Peers that have not sent anything for at least `silence`.
    pub fn silent_peers(&self, silence: Duration) -> Vec<PeerId> {
        let now = Instant::now();
        self.inner
            .peers
            .iter()
            .filter(|e| now.duration_since(e.value().last_seen) >= silence)
            .map(|e| *e.key())
            .collect()
    }

    /// Drops all state for a departed peer.
    pub fn forget_peer(&self, peer: PeerId) {
        self.inner.peers.remove(&peer);
        self.inner.pending.retain(|(p, _, _), _| *p != peer);
    }

    /// Stops the background tasks.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

async fn recv_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            res = inner.socket.recv_from(&mut buf) => match res {
                Ok((n, addr)) => handle_datagram(&inner, &buf[..n], addr).await,
                Err(e) => {
                    warn!(error = %e, "bus receive error");
                }
            }
        }
    }
    debug!("bus receive loop stopped");
}

async fn retransmit_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(RETRANSMIT_TICK);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = interval.tick() => flush_retransmissions(&inner).await,
        }
    }
}

async fn flush_retransmissions(inner: &Arc<Inner>) {
    let now = Instant::now();
    let mut to_send: Vec<(Vec<u8>, SocketAddr)> = Vec::new();
    let mut to_drop = Vec::new();

    for mut entry in inner.pending.iter_mut() {
        let key = *entry.key();
        let pending = entry.value_mut();
        if now < pending.next_retry {
            continue;
        }
        if pending.retries >= MAX_RETRIES {
            warn!(peer = %key.0, seq = key.2, "datagram exceeded max retries, dropping");
            to_drop.push(key);
            continue;
        }
        pending.retries += 1;
        let backoff = 2_u32.pow(pending.retries.min(5));
        pending.next_retry = now + BASE_RTO * backoff;
        to_send.push((pending.datagram.clone(), pending.target));
    }
    for key in to_drop {
        inner.pending.remove(&key);
    }
    for (datagram, target) in to_send {
        if let Err(e) = inner.socket.send_to(&datagram, target).await {
            warn!(error = %e, %target, "retransmission failed");
        }
    }
}

async fn handle_datagram(inner: &Arc<Inner>, data: &[u8], addr: SocketAddr) {
    let peer = PeerId(addr);
    {
        let mut state = inner.peers.entry(peer).or_insert_with(PeerState::new);
        state.last_seen = Instant::now();
    }

    let mut r = WireReader::new(data);
    let mode = match r.u8() {
        Ok(m) => m,
        Err(_) => return,
    };

    match mode {
        MODE_ACK => {
            let (Ok(acked_mode), Ok(seq)) = (r.u8(), r.u32()) else {
                warn!(%peer, "garbled ack, dropping");
                return;
            };
            inner.pending.remove(&(peer, acked_mode, seq));
        }
        MODE_UNRELIABLE => {
            let rest = &data[1..];
            deliver_frame(inner, peer, rest);
        }
        MODE_RELIABLE => {
            let Ok(seq) = r.u32() else {
                warn!(%peer, "garbled reliable header, dropping");
                return;
            };
            send_ack(inner, addr, MODE_RELIABLE, seq).await;
            let fresh = {
                let mut state = inner.peers.entry(peer).or_insert_with(PeerState::new);
                state.record_seen(seq)
            };
            if fresh {
                deliver_frame(inner, peer, &data[5..]);
            } else {
                trace!(%peer, seq, "duplicate reliable datagram");
            }
        }
        MODE_ORDERED => {
            let Ok(seq) = r.u32() else {
                warn!(%peer, "garbled ordered header, dropping");
                return;
            };
            send_ack(inner, addr, MODE_ORDERED, seq).await;
            let deliverable = {
                let mut state = inner.peers.entry(peer).or_insert_with(PeerState::new);
                state.ordered_in.process_packet(seq, data[5..].to_vec())
            };
            for frame in deliverable {
                deliver_frame(inner, peer, &frame);
            }
        }
        other => {
            warn!(%peer, mode = other, "unknown datagram mode, dropping");
        }
    }
}

async fn send_ack(inner: &Arc<Inner>, addr: SocketAddr, mode: u8, seq: u32) {
    let mut w = WireWriter::new();
    w.put_u8(MODE_ACK);
    w.put_u8(mode);
    w.put_u32(seq);
    if let Err(e) = inner.socket.send_to(&w.into_bytes(), addr).await {
        warn!(error = %e, %addr, "failed to send ack");
    }
}

fn deliver_frame(inner: &Arc<Inner>, peer: PeerId, frame: &[u8]) {
    let mut r = WireReader::new(frame);
    match Message::decode_frame(&mut r) {
        Ok(msg) => {
            if inner.waiters.offer(peer, &msg) {
                trace!(%peer, tag = msg.tag(), "message resolved a waiter");
                return;
            }
            let _ = inner.inbox_tx.send((peer, msg));
        }
        Err(e) => {
            // Malformed frames are logged and dropped; the peer stays up.
            warn!(%peer, error = %e, "dropping malformed frame");
        }
    }
}

impl Drop for BusNode {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ScanShoot, ShipConnected, Struck, TAG_STRUCK};
    use starweave_spatial::geom::Vec2;

    async fn pair() -> (BusNode, BusNode) {
        let a = BusNode::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b = BusNode::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        (a, b)
    }

    async fn recv_one(node: &BusNode) -> (PeerId, Message) {
        for _ in 0..200 {
            if let Some(item) = node.poll().into_iter().next() {
                return item;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no message arrived in time");
    }

    fn connected(token: &str) -> Message {
        Message::ShipConnected(ShipConnected {
            token: token.into(),
        })
    }

    #[tokio::test]
    async fn unreliable_send_and_poll() {
        let (a, b) = pair().await;
        let b_peer = a.connect(b.local_addr().unwrap());
        a.send(b_peer, &connected("tok"), Delivery::Unreliable)
            .await
            .unwrap();
        let (from, msg) = recv_one(&b).await;
        assert_eq!(from.0.port(), a.local_addr().unwrap().port());
        assert_eq!(msg, connected("tok"));
    }

    #[tokio::test]
    async fn reliable_send_is_acked() {
        let (a, b) = pair().await;
        let b_peer = a.connect(b.local_addr().unwrap());
        a.send(b_peer, &connected("tok"), Delivery::Reliable)
            .await
            .unwrap();
        let (_, msg) = recv_one(&b).await;
        assert_eq!(msg, connected("tok"));

        // The ack eventually clears the pending table.
        for _ in 0..200 {
            if a.inner.pending.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("pending datagram never acked");
    }

    #[tokio::test]
    async fn ordered_messages_come_out_in_send_order() {
        let (a, b) = pair().await;
        let b_peer = a.connect(b.local_addr().unwrap());
        for i in 0..10 {
            a.send(b_peer, &connected(&format!("tok-{i}")), Delivery::ReliableOrdered)
                .await
                .unwrap();
        }
        let mut got = Vec::new();
        for _ in 0..200 {
            for (_, msg) in b.poll() {
                got.push(msg);
            }
            if got.len() >= 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let expected: Vec<Message> = (0..10).map(|i| connected(&format!("tok-{i}"))).collect();
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn wait_for_correlates_by_predicate() {
        let (a, b) = pair().await;
        let b_peer = a.connect(b.local_addr().unwrap());

        let waiting = {
            let scan = Message::ScanShoot(ScanShoot {
                originator: "orig".into(),
                origin: Vec2::ZERO,
                direction: 0.0,
                width: 0.1,
                radius: 10.0,
                scaled_energy: 0.0,
            });
            a.send(b_peer, &scan, Delivery::Unreliable).await.unwrap();
            a.wait_for(
                b_peer,
                TAG_STRUCK,
                |m| matches!(m, Message::Struck(s) if s.originator == "orig"),
                Duration::from_secs(2),
            )
        };

        // The "remote node" answers after a moment.
        let (from, _scan) = recv_one(&b).await;
        let reply = Message::Struck(Struck {
            originator: "orig".into(),
            ships_info: vec![],
        });
        b.send(from, &reply, Delivery::Unreliable).await.unwrap();

        match waiting.await.unwrap() {
            Message::Struck(s) => assert_eq!(s.originator, "orig"),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn wait_for_times_out_with_bus_error() {
        let (a, b) = pair().await;
        let b_peer = a.connect(b.local_addr().unwrap());
        let err = a
            .wait_for(b_peer, TAG_STRUCK, |_| true, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Timeout));
        drop(b);
    }

    #[tokio::test]
    async fn garbage_datagrams_do_not_kill_the_node() {
        let (a, b) = pair().await;
        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        raw.send_to(&[0u8, 1, 2, 3], b.local_addr().unwrap())
            .await
            .unwrap();
        raw.send_to(&[99u8; 40], b.local_addr().unwrap()).await.unwrap();

        // The node still works afterwards.
        let b_peer = a.connect(b.local_addr().unwrap());
        a.send(b_peer, &connected("still-alive"), Delivery::Unreliable)
            .await
            .unwrap();
        let (_, msg) = recv_one(&b).await;
        assert_eq!(msg, connected("still-alive"));
    }
}

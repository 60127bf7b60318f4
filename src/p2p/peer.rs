//! Peer state, the connected-peer registry, and connection loops.
//!
//! Each connection runs a read loop and a write loop; outbound messages go
//! through a bounded channel so a slow peer backpressures instead of
//! blocking the node. Misbehavior accumulates ban score; crossing the
//! threshold bans the peer's address and drops the connection.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::protocol::{
    self, check_handshake, decode_frame_header, decode_payload, encode_message, Hand, Message,
    PingInfo, Shake, PROTOCOL_VERSION,
};
use super::P2pError;
use crate::consensus;
use crate::core::block::{BlockHeader, FullBlock};
use crate::core::hash::Hash;
use crate::core::transaction::Transaction;

/// Deadline for peer request/response traffic.
pub const PEER_TIMEOUT: Duration = Duration::from_secs(30);
/// Interval between pings on an idle connection.
const PING_INTERVAL: Duration = Duration::from_secs(10);
/// Outbox depth per peer.
const OUTBOX_DEPTH: usize = 64;

/// Which side opened the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// A connected peer.
pub struct Peer {
    pub addr: SocketAddr,
    pub user_agent: String,
    pub version: u32,
    pub capabilities: u32,
    pub direction: Direction,
    total_difficulty: AtomicU64,
    height: AtomicU64,
    ban_score: AtomicU32,
    connected: AtomicBool,
    outbox: mpsc::Sender<Message>,
}

impl Peer {
    pub fn total_difficulty(&self) -> u64 {
        self.total_difficulty.load(Ordering::Relaxed)
    }

    pub fn height(&self) -> u64 {
        self.height.load(Ordering::Relaxed)
    }

    pub fn update_chain_state(&self, total_difficulty: u64, height: u64) {
        self.total_difficulty
            .store(total_difficulty, Ordering::Relaxed);
        self.height.store(height, Ordering::Relaxed);
    }

    pub fn ban_score(&self) -> u32 {
        self.ban_score.load(Ordering::Relaxed)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Queue a message for this peer. Fails if the outbox is full or the
    /// connection is gone.
    pub fn send(&self, msg: Message) -> Result<(), P2pError> {
        if !self.is_connected() {
            return Err(P2pError::ConnectionClosed);
        }
        self.outbox
            .try_send(msg)
            .map_err(|_| P2pError::ConnectionClosed)
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }
}

/// The registry of connected and banned peers.
pub struct Peers {
    connected: RwLock<HashMap<SocketAddr, Arc<Peer>>>,
    banned: Mutex<HashSet<IpAddr>>,
}

impl Default for Peers {
    fn default() -> Self {
        Peers {
            connected: RwLock::new(HashMap::new()),
            banned: Mutex::new(HashSet::new()),
        }
    }
}

impl Peers {
    pub fn new() -> Self {
        Peers::default()
    }

    pub fn add(&self, peer: Arc<Peer>) {
        self.connected
            .write()
            .expect("peers lock")
            .insert(peer.addr, peer);
    }

    pub fn remove(&self, addr: &SocketAddr) {
        if let Some(peer) = self.connected.write().expect("peers lock").remove(addr) {
            peer.mark_disconnected();
        }
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<Arc<Peer>> {
        self.connected.read().expect("peers lock").get(addr).cloned()
    }

    pub fn count(&self) -> usize {
        self.connected.read().expect("peers lock").len()
    }

    pub fn iter(&self) -> Vec<Arc<Peer>> {
        self.connected
            .read()
            .expect("peers lock")
            .values()
            .cloned()
            .collect()
    }

    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.connected
            .read()
            .expect("peers lock")
            .keys()
            .copied()
            .collect()
    }

    /// The connected peer advertising the most cumulative work.
    pub fn most_work_peer(&self) -> Option<Arc<Peer>> {
        self.iter()
            .into_iter()
            .max_by_key(|peer| peer.total_difficulty())
    }

    pub fn is_banned(&self, ip: IpAddr) -> bool {
        self.banned.lock().expect("ban lock").contains(&ip)
    }

    /// Ban an address outright and drop its connection.
    pub fn ban(&self, addr: &SocketAddr, reason: &str) {
        warn!(%addr, reason, "banning peer");
        self.banned.lock().expect("ban lock").insert(addr.ip());
        self.remove(addr);
    }

    /// Add ban score; bans the peer once the threshold is crossed.
    /// Returns the new score.
    pub fn report_misbehavior(&self, addr: &SocketAddr, score: u32, reason: &str) -> u32 {
        let Some(peer) = self.get(addr) else { return 0 };
        let new_score = peer.ban_score.fetch_add(score, Ordering::Relaxed) + score;
        debug!(%addr, new_score, reason, "peer misbehavior");
        if new_score >= consensus::BAN_THRESHOLD {
            self.ban(addr, reason);
        }
        new_score
    }
}

/// What the P2P layer needs from the node. Implemented by the node wiring;
/// kept as a trait so connection handling tests with a stub.
pub trait NodeAdapter: Send + Sync {
    fn chain_state(&self) -> PingInfo;
    fn get_block(&self, hash: &Hash) -> Option<FullBlock>;
    fn headers_for_locator(&self, locator: &protocol::Locator) -> Vec<BlockHeader>;
    fn build_archive(&self) -> Option<(u64, Hash, Vec<u8>)>;

    fn on_header(&self, header: BlockHeader, from: SocketAddr);
    fn on_headers(&self, headers: Vec<BlockHeader>, from: SocketAddr);
    fn on_block(&self, block: FullBlock, from: SocketAddr);
    fn on_transaction(&self, tx: Transaction, stem: bool, from: SocketAddr);
    fn on_archive(&self, height: u64, hash: Hash, bytes: Vec<u8>, from: SocketAddr);
    fn peer_addrs_to_share(&self) -> Vec<String>;
    fn on_peer_addrs(&self, addrs: Vec<String>);
}

/// Read one framed message.
pub async fn read_message(stream: &mut OwnedReadHalf) -> Result<Message, P2pError> {
    let mut header = [0u8; 10];
    stream
        .read_exact(&mut header)
        .await
        .map_err(|e| P2pError::Io(e.to_string()))?;
    let (msg_type, len) = decode_frame_header(&header)?;
    let mut payload = vec![0u8; len as usize];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|e| P2pError::Io(e.to_string()))?;
    Ok(decode_payload(msg_type, &payload)?)
}

async fn write_message(stream: &mut OwnedWriteHalf, msg: &Message) -> Result<(), P2pError> {
    stream
        .write_all(&encode_message(msg))
        .await
        .map_err(|e| P2pError::Io(e.to_string()))
}

/// Run the handshake and then the connection loops until disconnect.
///
/// Outbound: we send `Hand`, expect `Shake`. Inbound: we expect `Hand`,
/// answer `Shake`. A genesis mismatch disconnects immediately.
pub async fn run_peer(
    stream: TcpStream,
    direction: Direction,
    peers: Arc<Peers>,
    adapter: Arc<dyn NodeAdapter>,
    listen_port: u16,
) -> Result<(), P2pError> {
    let addr = stream
        .peer_addr()
        .map_err(|e| P2pError::Io(e.to_string()))?;
    if peers.is_banned(addr.ip()) {
        return Err(P2pError::PeerBanned);
    }
    let (mut read_half, mut write_half) = stream.into_split();

    let state = adapter.chain_state();
    let (peer_version, peer_caps, peer_diff, peer_agent) = match direction {
        Direction::Outbound => {
            let hand = protocol::local_hand(state.total_difficulty, listen_port, rand::random());
            write_message(&mut write_half, &Message::Hand(hand)).await?;
            let reply = tokio::time::timeout(PEER_TIMEOUT, read_message(&mut read_half))
                .await
                .map_err(|_| P2pError::PeerTimeout)??;
            match reply {
                Message::Shake(Shake {
                    version,
                    capabilities,
                    genesis,
                    total_difficulty,
                    user_agent,
                }) => {
                    check_handshake(&genesis, version)?;
                    (version, capabilities, total_difficulty, user_agent)
                }
                _ => return Err(P2pError::UnexpectedMessage),
            }
        }
        Direction::Inbound => {
            let first = tokio::time::timeout(PEER_TIMEOUT, read_message(&mut read_half))
                .await
                .map_err(|_| P2pError::PeerTimeout)??;
            match first {
                Message::Hand(Hand {
                    version,
                    capabilities,
                    genesis,
                    total_difficulty,
                    user_agent,
                    ..
                }) => {
                    check_handshake(&genesis, version)?;
                    let shake = Shake {
                        version: PROTOCOL_VERSION,
                        capabilities: protocol::CAP_FULL_NODE | protocol::CAP_ARCHIVE,
                        genesis: crate::core::block::genesis_hash(),
                        total_difficulty: state.total_difficulty,
                        user_agent: format!("mimble/{}", crate::NODE_VERSION),
                    };
                    write_message(&mut write_half, &Message::Shake(shake)).await?;
                    (version, capabilities, total_difficulty, user_agent)
                }
                _ => return Err(P2pError::UnexpectedMessage),
            }
        }
    };

    let (outbox_tx, mut outbox_rx) = mpsc::channel::<Message>(OUTBOX_DEPTH);
    let peer = Arc::new(Peer {
        addr,
        user_agent: peer_agent,
        version: peer_version,
        capabilities: peer_caps,
        direction,
        total_difficulty: AtomicU64::new(peer_diff),
        height: AtomicU64::new(0),
        ban_score: AtomicU32::new(0),
        connected: AtomicBool::new(true),
        outbox: outbox_tx,
    });
    peers.add(peer.clone());
    info!(%addr, ?direction, agent = %peer.user_agent, "peer connected");

    // Write loop: drain the outbox, ping on idle.
    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        loop {
            tokio::select! {
                queued = outbox_rx.recv() => match queued {
                    Some(msg) => {
                        if write_message(&mut write_half, &msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = ping.tick() => {
                    // The channel owner injects real chain state via Pong
                    // handling; the ping itself is a liveness probe.
                    let idle_ping = Message::Ping(PingInfo { total_difficulty: 0, height: 0 });
                    if write_message(&mut write_half, &idle_ping).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read loop: dispatch until the peer goes away or gets banned.
    let result = loop {
        let msg = match read_message(&mut read_half).await {
            Ok(msg) => msg,
            Err(e) => break Err(e),
        };
        if peers.get(&addr).is_none() {
            break Err(P2pError::PeerBanned);
        }
        dispatch(msg, &peer, &peers, adapter.as_ref());
    };

    writer.abort();
    peers.remove(&addr);
    info!(%addr, "peer disconnected");
    result
}

/// Handle one incoming message.
fn dispatch(msg: Message, peer: &Arc<Peer>, peers: &Arc<Peers>, adapter: &dyn NodeAdapter) {
    match msg {
        Message::Hand(_) | Message::Shake(_) => {
            peers.report_misbehavior(&peer.addr, 10, "handshake message mid-session");
        }
        Message::Ping(info) => {
            if info.total_difficulty > 0 {
                peer.update_chain_state(info.total_difficulty, info.height);
            }
            let state = adapter.chain_state();
            let _ = peer.send(Message::Pong(state));
        }
        Message::Pong(info) => {
            if info.total_difficulty > 0 {
                peer.update_chain_state(info.total_difficulty, info.height);
            }
        }
        Message::GetPeerAddrs => {
            let _ = peer.send(Message::PeerAddrs(adapter.peer_addrs_to_share()));
        }
        Message::PeerAddrs(addrs) => adapter.on_peer_addrs(addrs),
        Message::GetHeaders(locator) => {
            let headers = adapter.headers_for_locator(&locator);
            let _ = peer.send(Message::Headers(headers));
        }
        Message::Header(header) => adapter.on_header(*header, peer.addr),
        Message::Headers(headers) => adapter.on_headers(headers, peer.addr),
        Message::GetBlock(hash) => {
            if let Some(block) = adapter.get_block(&hash) {
                let _ = peer.send(Message::Block(Box::new(block)));
            }
        }
        Message::Block(block) => adapter.on_block(*block, peer.addr),
        Message::Transaction(tx) => adapter.on_transaction(*tx, false, peer.addr),
        Message::StemTransaction(tx) => adapter.on_transaction(*tx, true, peer.addr),
        Message::TxHashSetRequest { .. } => match adapter.build_archive() {
            Some((height, hash, bytes)) => {
                let _ = peer.send(Message::TxHashSetArchive {
                    height,
                    hash,
                    bytes,
                });
            }
            None => {
                debug!(addr = %peer.addr, "archive requested but unavailable");
            }
        },
        Message::TxHashSetArchive {
            height,
            hash,
            bytes,
        } => adapter.on_archive(height, hash, bytes, peer.addr),
    }
}

/// Build a registry-ready peer backed by a bare channel, with the receiver
/// returned so tests can observe what the node sends.
#[cfg(test)]
pub(crate) fn test_peer(
    addr: SocketAddr,
    total_difficulty: u64,
    height: u64,
) -> (Arc<Peer>, mpsc::Receiver<Message>) {
    let (tx, rx) = mpsc::channel(OUTBOX_DEPTH);
    let peer = Arc::new(Peer {
        addr,
        user_agent: "test".into(),
        version: 1,
        capabilities: 0,
        direction: Direction::Outbound,
        total_difficulty: AtomicU64::new(total_difficulty),
        height: AtomicU64::new(height),
        ban_score: AtomicU32::new(0),
        connected: AtomicBool::new(true),
        outbox: tx,
    });
    (peer, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_peer(addr: SocketAddr, difficulty: u64) -> Arc<Peer> {
        test_peer(addr, difficulty, 0).0
    }

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn most_work_peer_selection() {
        let peers = Peers::new();
        peers.add(dummy_peer(addr(1), 10));
        peers.add(dummy_peer(addr(2), 30));
        peers.add(dummy_peer(addr(3), 20));
        assert_eq!(peers.most_work_peer().unwrap().addr, addr(2));
    }

    #[test]
    fn ban_threshold_trips() {
        let peers = Peers::new();
        let peer = dummy_peer(addr(7), 1);
        peers.add(peer.clone());

        let score = peers.report_misbehavior(&addr(7), consensus::BAN_THRESHOLD - 1, "test");
        assert_eq!(score, consensus::BAN_THRESHOLD - 1);
        assert!(peers.get(&addr(7)).is_some());
        assert!(!peers.is_banned(addr(7).ip()));

        peers.report_misbehavior(&addr(7), 1, "test");
        assert!(peers.get(&addr(7)).is_none());
        assert!(peers.is_banned(addr(7).ip()));
        assert!(!peer.is_connected());
    }

    #[test]
    fn single_report_of_100_bans() {
        let peers = Peers::new();
        peers.add(dummy_peer(addr(9), 1));
        peers.report_misbehavior(&addr(9), 100, "invalid archive");
        assert!(peers.is_banned(addr(9).ip()));
    }

    #[test]
    fn removed_peer_is_disconnected() {
        let peers = Peers::new();
        let peer = dummy_peer(addr(4), 1);
        peers.add(peer.clone());
        peers.remove(&addr(4));
        assert!(!peer.is_connected());
        assert!(peer.send(Message::GetPeerAddrs).is_err());
    }
}
